use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv1d, Conv1dConfig};
use burn::nn::{Gelu, LayerNorm, LayerNormConfig, Linear, LinearConfig};
use burn::prelude::{Backend, Tensor};
use itertools::{izip, Itertools};

#[derive(Module, Debug)]
pub struct WaveformConvLayer<B: Backend> {
    conv: Conv1d<B>,
    norm: LayerNorm<B>,
    activation: Gelu,
}

#[derive(Config)]
pub struct WaveformConvLayerConfig {
    conv_dim_in: usize,
    conv_dim_out: usize,
    conv_kernel: usize,
    conv_stride: usize,
}

impl WaveformConvLayerConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> WaveformConvLayer<B> {
        WaveformConvLayer {
            conv: Conv1dConfig::new(self.conv_dim_in, self.conv_dim_out, self.conv_kernel)
                .with_stride(self.conv_stride)
                .init(device),
            norm: LayerNormConfig::new(self.conv_dim_out).init(device),
            activation: Gelu::new(),
        }
    }
}

impl<B: Backend> WaveformConvLayer<B> {
    pub fn forward(&self, hidden: Tensor<B, 3>) -> Tensor<B, 3> {
        let hidden = self.conv.forward(hidden);

        let hidden = hidden.swap_dims(1, 2);
        let hidden = self.norm.forward(hidden);
        let hidden = hidden.swap_dims(1, 2);

        self.activation.forward(hidden)
    }
}

/// Strided 1-D convolutions over raw audio, mean-pooled over time and
/// projected onto the transformer width.
#[derive(Config, Debug)]
pub struct WaveformEncoderConfig {
    #[config(default = "vec![1, 64, 64, 64, 64, 64]")]
    pub conv_dims: Vec<usize>,
    #[config(default = "vec![10, 5, 3, 3, 3]")]
    pub conv_kernels: Vec<usize>,
    #[config(default = "vec![5, 4, 2, 2, 2]")]
    pub conv_strides: Vec<usize>,
}

impl WaveformEncoderConfig {
    pub fn init<B: Backend>(&self, embed_dim: usize, device: &B::Device) -> WaveformEncoder<B> {
        let dim_windows = self.conv_dims.iter().tuple_windows::<(_, _)>();

        WaveformEncoder {
            conv_layers: izip!(dim_windows, &self.conv_kernels, &self.conv_strides)
                .map(|((dim_in, dim_out), kernel, stride)| {
                    WaveformConvLayerConfig::new(*dim_in, *dim_out, *kernel, *stride).init(device)
                })
                .collect_vec(),
            projection: LinearConfig::new(self.last_conv_dim(), embed_dim).init(device),
        }
    }

    pub fn last_conv_dim(&self) -> usize {
        self.conv_dims.last().copied().unwrap_or(1)
    }
}

#[derive(Module, Debug)]
pub struct WaveformEncoder<B: Backend> {
    conv_layers: Vec<WaveformConvLayer<B>>,
    projection: Linear<B>,
}

impl<B: Backend> WaveformEncoder<B> {
    // audio: B x L -> B x D
    pub fn forward(&self, audio: Tensor<B, 2>) -> Tensor<B, 2> {
        let mut hidden = audio.unsqueeze_dim(1);

        for layer in &self.conv_layers {
            hidden = layer.forward(hidden);
        }

        // B x C x T
        let pooled = hidden.mean_dim(2).squeeze::<2>(2);
        self.projection.forward(pooled)
    }
}
