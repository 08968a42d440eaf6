use burn::prelude::{Backend, Int, Tensor};
use burn::tensor::{Bool, TensorData};
use itertools::Itertools;
use rand::seq::index::sample;
use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::{Beta, Distribution};
use serde::{Deserialize, Serialize};

/// Patch-Mix augmentation: swaps a Beta-distributed share of patch tokens with
/// those of another example in the batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PatchMix {
    pub mix_beta: f64,
    /// Replace whole time columns of the patch grid instead of single patches.
    pub time_domain: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatchMixPlan {
    /// Share of tokens kept from the original example.
    pub lam: f32,
    /// Batch permutation the replacement tokens come from.
    pub index: Vec<usize>,
    /// Replaced token positions, one entry per patch.
    pub mask: Vec<bool>,
}

impl PatchMix {
    pub fn new(mix_beta: f64, time_domain: bool) -> Self {
        Self {
            mix_beta,
            time_domain,
        }
    }

    fn sample_lam<R: Rng>(&self, rng: &mut R) -> f64 {
        match Beta::new(self.mix_beta, self.mix_beta) {
            Ok(beta) => beta.sample(rng),
            Err(_) => 1.0,
        }
    }

    /// `grid` is the `[frequency, time]` layout of the patch tokens.
    pub fn plan<R: Rng>(&self, batch: usize, grid: [usize; 2], rng: &mut R) -> PatchMixPlan {
        let [f_dim, t_dim] = grid;
        let num_patches = f_dim * t_dim;
        let lam = self.sample_lam(rng);

        let mut mask = vec![false; num_patches];
        if self.time_domain {
            let num_columns = ((t_dim as f64 * (1.0 - lam)) as usize).min(t_dim);
            for column in sample(rng, t_dim, num_columns) {
                for row in 0..f_dim {
                    mask[row * t_dim + column] = true;
                }
            }
        } else {
            let num_mask = ((num_patches as f64 * (1.0 - lam)) as usize).min(num_patches);
            for patch in sample(rng, num_patches, num_mask) {
                mask[patch] = true;
            }
        }

        let mut index = (0..batch).collect_vec();
        index.shuffle(rng);

        let replaced = mask.iter().filter(|m| **m).count();
        let lam = if num_patches == 0 {
            1.0
        } else {
            1.0 - replaced as f32 / num_patches as f32
        };

        PatchMixPlan { lam, index, mask }
    }
}

impl PatchMixPlan {
    pub fn index_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 1, Int> {
        let index = self.index.iter().map(|i| *i as i32).collect_vec();
        Tensor::from_ints(index.as_slice(), device)
    }

    // patches: B x N x D
    pub fn apply<B: Backend>(&self, patches: Tensor<B, 3>) -> Tensor<B, 3> {
        let device = patches.device();
        let [batch, num_patches, dim] = patches.dims();

        let mask = Tensor::<B, 1, Bool>::from_bool(
            TensorData::new(self.mask.clone(), [num_patches]),
            &device,
        )
        .reshape([1, num_patches, 1])
        .expand([batch, num_patches, dim]);

        let shuffled = patches.clone().select(0, self.index_tensor(&device));

        patches.mask_where(mask, shuffled)
    }
}
