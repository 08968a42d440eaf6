use burn::prelude::{Backend, Int, Tensor};
use burn::tensor::activation::softmax;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CbLossType {
    Sigmoid,
    Softmax,
    Focal,
}

/// `(1 - beta) / (1 - beta^n)` per class, rescaled to sum to the number of classes.
/// Empty classes are weighted as if they held a single sample.
pub fn class_balanced_weights(samples_per_cls: &[usize], beta: f64) -> Vec<f32> {
    let weights = samples_per_cls
        .iter()
        .map(|n| (1.0 - beta) / (1.0 - beta.powi((*n).max(1) as i32)))
        .collect::<Vec<_>>();
    let total = weights.iter().sum::<f64>();

    weights
        .iter()
        .map(|w| (w / total * samples_per_cls.len() as f64) as f32)
        .collect()
}

/// `log(1 + exp(x))` without overflow.
pub fn softplus<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    x.clone().clamp_min(0.0) + x.abs().neg().exp().log1p()
}

/// Element-wise binary cross entropy on logits.
pub fn bce_with_logits<B: Backend, const D: usize>(
    logits: Tensor<B, D>,
    targets: Tensor<B, D>,
) -> Tensor<B, D> {
    logits.clone().clamp_min(0.0) - logits.clone() * targets + logits.abs().neg().exp().log1p()
}

/// Focal loss `-alpha_t * (1 - p_t)^gamma * log(p_t)`, summed and normalized by the
/// number of positive labels.
pub fn focal_loss<B: Backend>(
    labels: Tensor<B, 2>,
    logits: Tensor<B, 2>,
    alpha: Tensor<B, 2>,
    gamma: f32,
) -> Tensor<B, 1> {
    let bce = bce_with_logits(logits.clone(), labels.clone());

    let loss = if gamma == 0.0 {
        bce
    } else {
        let modulator = (labels.clone() * logits.clone() * -gamma
            - softplus(logits.neg()) * gamma)
            .exp();
        modulator * bce
    };

    (alpha * loss).sum() / labels.sum()
}

/// `B x C` one-hot encoding of integer labels.
pub fn one_hot<B: Backend>(labels: Tensor<B, 1, Int>, n_cls: usize) -> Tensor<B, 2> {
    let [batch] = labels.dims();
    let classes = Tensor::<B, 1, Int>::arange(0..n_cls as i64, &labels.device())
        .reshape([1, n_cls])
        .expand([batch, n_cls]);

    labels
        .reshape([batch, 1])
        .expand([batch, n_cls])
        .equal(classes)
        .float()
}

/// Class-balanced loss of Cui et al.: the base loss reweighted per example by the
/// effective number of samples of its class.
pub fn cb_loss<B: Backend>(
    labels: Tensor<B, 1, Int>,
    logits: Tensor<B, 2>,
    samples_per_cls: &[usize],
    loss_type: CbLossType,
    beta: f64,
    gamma: f32,
) -> Tensor<B, 1> {
    let device = logits.device();
    let [batch, n_cls] = logits.dims();

    let labels = one_hot(labels, n_cls);
    let weights = class_balanced_weights(samples_per_cls, beta);
    let weights = Tensor::<B, 1>::from_floats(weights.as_slice(), &device)
        .reshape([1, n_cls])
        .expand([batch, n_cls]);
    let weights = (weights * labels.clone())
        .sum_dim(1)
        .expand([batch, n_cls]);

    match loss_type {
        CbLossType::Focal => focal_loss(labels, logits, weights, gamma),
        CbLossType::Sigmoid => (bce_with_logits(logits, labels) * weights).mean(),
        CbLossType::Softmax => {
            let pred = softmax(logits, 1);
            let positive = pred.clone().log().clamp_min(-100.0);
            let negative = pred.neg().add_scalar(1.0).log().clamp_min(-100.0);
            let bce = (labels.clone() * positive + labels.neg().add_scalar(1.0) * negative).neg();

            (bce * weights).mean()
        }
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::ndarray::NdArrayDevice;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    use super::*;

    type TestBackend = NdArray;

    fn scalar(tensor: Tensor<TestBackend, 1>) -> f32 {
        tensor.into_scalar()
    }

    #[test]
    fn weights_sum_to_class_count() {
        let weights = class_balanced_weights(&[2, 3, 1, 2, 2], 0.9999);
        assert!((weights.iter().sum::<f32>() - 5.0).abs() < 1e-4);
        // rarer classes weigh more
        assert!(weights[2] > weights[1]);

        let with_empty = class_balanced_weights(&[10, 0, 5], 0.99);
        assert!(with_empty.iter().all(|w| w.is_finite()));
    }

    #[test]
    fn every_variant_is_finite_and_non_negative() {
        let device = NdArrayDevice::Cpu;
        let logits = Tensor::<TestBackend, 2>::random([10, 5], Distribution::Normal(0.0, 3.0), &device);
        let labels = Tensor::<TestBackend, 1, Int>::from_ints([0, 1, 2, 3, 4, 0, 1, 1, 3, 4], &device);

        for loss_type in [CbLossType::Sigmoid, CbLossType::Softmax, CbLossType::Focal] {
            let loss = scalar(cb_loss(
                labels.clone(),
                logits.clone(),
                &[2, 3, 1, 2, 2],
                loss_type,
                0.9999,
                2.0,
            ));
            assert!(loss.is_finite() && loss >= 0.0, "{loss_type:?}: {loss}");
        }
    }

    #[test]
    fn focal_without_gamma_is_normalized_bce() {
        let device = NdArrayDevice::Cpu;
        let logits = Tensor::<TestBackend, 2>::from_floats([[2.0, -1.0, 0.5], [-0.3, 0.7, 1.5]], &device);
        let labels = one_hot(Tensor::<TestBackend, 1, Int>::from_ints([0, 2], &device), 3);
        let alpha = Tensor::<TestBackend, 2>::from_floats([[0.5; 3], [2.0; 3]], &device);

        let focal = scalar(focal_loss(labels.clone(), logits.clone(), alpha.clone(), 0.0));
        let expected = scalar((bce_with_logits(logits, labels) * alpha).sum()) / 2.0;

        assert!((focal - expected).abs() < 1e-5);
    }

    #[test]
    fn bce_matches_reference_values() {
        let device = NdArrayDevice::Cpu;
        let logits = Tensor::<TestBackend, 1>::from_floats([0.0, 100.0, -100.0], &device);
        let targets = Tensor::<TestBackend, 1>::from_floats([1.0, 1.0, 1.0], &device);
        let values = bce_with_logits(logits, targets).into_data().to_vec::<f32>().unwrap();

        assert!((values[0] - std::f32::consts::LN_2).abs() < 1e-6);
        assert!(values[1].abs() < 1e-6);
        assert!((values[2] - 100.0).abs() < 1e-3);
    }
}
