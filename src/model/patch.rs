use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::prelude::{Backend, Tensor};

#[derive(Module, Debug)]
pub struct PatchEmbed<B: Backend> {
    projection: Conv2d<B>,
}

#[derive(Config, Debug)]
pub struct PatchEmbedConfig {
    pub embed_dim: usize,
    /// Kernel as `[frequency, time]`.
    pub shape: [usize; 2],
    pub stride: [usize; 2],
}

impl PatchEmbedConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> PatchEmbed<B> {
        PatchEmbed {
            projection: Conv2dConfig::new([1, self.embed_dim], self.shape)
                .with_stride(self.stride)
                .init(device),
        }
    }

    /// Patch grid of a `[frequency, time]` input.
    pub fn grid(&self, input: [usize; 2]) -> [usize; 2] {
        [0, 1].map(|axis| input[axis].saturating_sub(self.shape[axis]) / self.stride[axis] + 1)
    }
}

impl<B: Backend> PatchEmbed<B> {
    // images: B x 1 x T x F -> B x N x D, patches ordered frequency-major
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 3> {
        let images = images.swap_dims(2, 3);
        let patches = self.projection.forward(images);

        patches.flatten::<3>(2, 3).swap_dims(1, 2)
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::ndarray::NdArrayDevice;
    use burn::backend::NdArray;

    use super::*;

    #[test]
    fn overlapping_patches() {
        let config = PatchEmbedConfig::new(8, [4, 4], [2, 3]);
        // 12 mel bins, 20 frames
        assert_eq!(config.grid([12, 20]), [5, 6]);

        let embed = config.init::<NdArray>(&NdArrayDevice::Cpu);
        let images = Tensor::<NdArray, 4>::ones([2, 1, 20, 12], &NdArrayDevice::Cpu);
        assert_eq!(embed.forward(images).dims(), [2, 30, 8]);
    }
}
