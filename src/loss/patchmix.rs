use burn::prelude::{Backend, Int, Tensor};
use burn::tensor::activation::log_softmax;

use crate::config::NegativePair;
use crate::loss::class_balanced::one_hot;
use crate::ops::l2_normalize;

/// Supervised loss of a Patch-Mix batch: the criterion against both label sets,
/// weighted by the share of patches each example contributed.
pub fn patch_mix_loss<B: Backend>(
    criterion: impl Fn(Tensor<B, 2>, Tensor<B, 1, Int>) -> Tensor<B, 1>,
    logits: Tensor<B, 2>,
    labels_a: Tensor<B, 1, Int>,
    labels_b: Tensor<B, 1, Int>,
    lam: f32,
) -> Tensor<B, 1> {
    criterion(logits.clone(), labels_a) * lam + criterion(logits, labels_b) * (1.0 - lam)
}

/// Contrastive loss between the projections of mixed and clean examples. Each mixed
/// row is pulled towards its own clean target with weight `lam` and towards the
/// target it borrowed patches from with weight `1 - lam`.
#[derive(Debug, Clone)]
pub struct PatchMixConLoss {
    pub temperature: f32,
    pub negative_pair: NegativePair,
}

impl PatchMixConLoss {
    pub fn new(temperature: f32, negative_pair: NegativePair) -> Self {
        Self {
            temperature,
            negative_pair,
        }
    }

    pub fn forward<B: Backend>(
        &self,
        mixed: Tensor<B, 2>,
        target: Tensor<B, 2>,
        labels: Tensor<B, 1, Int>,
        lam: f32,
        index: Tensor<B, 1, Int>,
    ) -> Tensor<B, 1> {
        let device = mixed.device();
        let [batch, _] = mixed.dims();

        let similarity = l2_normalize(mixed)
            .matmul(l2_normalize(target).transpose())
            .div_scalar(self.temperature);
        let similarity = similarity.clone() - similarity.max_dim(1).detach();

        let own = one_hot(Tensor::<B, 1, Int>::arange(0..batch as i64, &device), batch);
        let borrowed = one_hot(index, batch);
        let positives = own.clone() * lam + borrowed.clone() * (1.0 - lam);

        let log_prob = match self.negative_pair {
            NegativePair::All => log_softmax(similarity, 1),
            NegativePair::DiffLabel => {
                // negatives sharing the anchor's label are dropped, positives always kept
                let same_label = labels
                    .clone()
                    .reshape([batch, 1])
                    .expand([batch, batch])
                    .equal(labels.reshape([1, batch]).expand([batch, batch]))
                    .float();
                let keep = (same_label.neg().add_scalar(1.0) + own + borrowed).clamp_max(1.0);

                let normalizer = (similarity.clone().exp() * keep).sum_dim(1).log();
                similarity - normalizer
            }
        };

        (positives * log_prob).sum_dim(1).mean().neg()
    }
}
