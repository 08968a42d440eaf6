use burn::module::{Ignored, Module};
use burn::nn::loss::{CrossEntropyLoss, CrossEntropyLossConfig};
use burn::prelude::{Backend, Int, Tensor};

use crate::config::{ExperimentConfig, LossKind};
use crate::loss::class_balanced::{cb_loss, CbLossType};

pub mod class_balanced;
pub mod patchmix;

#[derive(Debug, Clone)]
pub struct ClassBalanced {
    pub samples_per_cls: Vec<usize>,
    pub loss_type: CbLossType,
    pub beta: f64,
    pub gamma: f32,
}

/// Supervised criterion on logits: plain or weighted cross entropy, or a
/// class-balanced loss driven by the training set's class counts.
#[derive(Module, Debug)]
pub struct Criterion<B: Backend> {
    cross_entropy: CrossEntropyLoss<B>,
    class_balanced: Ignored<Option<ClassBalanced>>,
}

/// Inverse class frequencies, normalized to sum to one.
pub fn inverse_frequency_weights(class_nums: &[usize]) -> Vec<f32> {
    let total = class_nums.iter().sum::<usize>().max(1) as f32;
    let inverse = class_nums
        .iter()
        .map(|n| total / (*n).max(1) as f32)
        .collect::<Vec<_>>();
    let norm = inverse.iter().sum::<f32>();

    inverse.iter().map(|w| w / norm).collect()
}

impl<B: Backend> Criterion<B> {
    pub fn new(config: &ExperimentConfig, class_nums: &[usize], device: &B::Device) -> Self {
        let args = &config.args;

        let weights = args
            .weighted_loss
            .then(|| inverse_frequency_weights(class_nums));
        let loss_type = match args.loss {
            LossKind::Ce => None,
            LossKind::CbSigmoid => Some(CbLossType::Sigmoid),
            LossKind::CbSoftmax => Some(CbLossType::Softmax),
            LossKind::CbFocal => Some(CbLossType::Focal),
        };

        Self {
            cross_entropy: CrossEntropyLossConfig::new().with_weights(weights).init(device),
            class_balanced: Ignored(loss_type.map(|loss_type| ClassBalanced {
                samples_per_cls: class_nums.to_vec(),
                loss_type,
                beta: args.cb_beta,
                gamma: args.cb_gamma,
            })),
        }
    }

    pub fn forward(&self, logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> Tensor<B, 1> {
        match &self.class_balanced.0 {
            Some(cb) => cb_loss(
                targets,
                logits,
                &cb.samples_per_cls,
                cb.loss_type,
                cb.beta,
                cb.gamma,
            ),
            None => self.cross_entropy.forward(logits, targets),
        }
    }
}
