use std::f64::consts::PI;

use burn::lr_scheduler::LrScheduler;
use burn::prelude::{Backend, ElementConversion, Tensor};
use burn::tensor::Element;
use burn::LearningRate;

use crate::config::{ExperimentConfig, Warmup};

/// Scales every row of `tensor` to unit L2 norm.
pub fn l2_normalize<B: Backend>(tensor: Tensor<B, 2>) -> Tensor<B, 2> {
    let norm = (tensor.clone() * tensor.clone())
        .sum_dim(1)
        .sqrt()
        .clamp_min(1e-12);
    tensor / norm
}

pub trait ScalarExt {
    fn scalar<E: Element>(&self) -> E;
}

impl<B: Backend> ScalarExt for Tensor<B, 1> {
    fn scalar<E: Element>(&self) -> E {
        self.clone().into_scalar().elem()
    }
}

/// Per-iteration learning rate: optional linear warm-up, then cosine annealing or
/// step decay evaluated at the current (1-based) epoch.
#[derive(Debug, Clone)]
pub struct LungSoundLrSchedule {
    learning_rate: f64,
    decay_rate: f64,
    cosine: bool,
    milestones: Vec<usize>,
    epochs: usize,
    warmup: Option<Warmup>,
    steps_per_epoch: usize,
    step: usize,
}

impl LungSoundLrSchedule {
    pub fn new(config: &ExperimentConfig, steps_per_epoch: usize) -> Self {
        let args = &config.args;
        Self {
            learning_rate: args.learning_rate,
            decay_rate: args.lr_decay_rate,
            cosine: args.cosine,
            milestones: config.lr_decay_milestones.clone(),
            epochs: args.epochs.max(1),
            warmup: config.warmup,
            steps_per_epoch: steps_per_epoch.max(1),
            step: 0,
        }
    }

    /// Continues the schedule after `epochs_done` finished epochs.
    pub fn starting_after(mut self, epochs_done: usize) -> Self {
        self.step = epochs_done * self.steps_per_epoch;
        self
    }

    pub fn epoch_lr(&self, epoch: usize) -> f64 {
        let lr = self.learning_rate;
        if self.cosine {
            let eta_min = lr * self.decay_rate.powi(3);
            eta_min + (lr - eta_min) * (1.0 + (PI * epoch as f64 / self.epochs as f64).cos()) / 2.0
        } else {
            let passed = self.milestones.iter().filter(|m| epoch > **m).count();
            lr * self.decay_rate.powi(passed as i32)
        }
    }

    pub fn lr_at(&self, step: usize) -> f64 {
        let epoch = step / self.steps_per_epoch + 1;

        match self.warmup {
            Some(warmup) if epoch <= warmup.epochs => {
                let progress = step as f64 / (warmup.epochs * self.steps_per_epoch) as f64;
                warmup.from + progress * (warmup.to - warmup.from)
            }
            _ => self.epoch_lr(epoch),
        }
    }
}

impl<B: Backend> LrScheduler<B> for LungSoundLrSchedule {
    type Record = usize;

    fn step(&mut self) -> LearningRate {
        let lr = self.lr_at(self.step);
        self.step += 1;
        lr
    }

    fn to_record(&self) -> Self::Record {
        self.step
    }

    fn load_record(mut self, record: Self::Record) -> Self {
        self.step = record;
        self
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::ndarray::NdArrayDevice;
    use burn::backend::NdArray;
    use clap::Parser;

    use super::*;
    use crate::config::TrainArgs;

    fn schedule(extra: &[&str], steps_per_epoch: usize) -> LungSoundLrSchedule {
        let mut argv = vec!["lungsound"];
        argv.extend_from_slice(extra);
        let config = ExperimentConfig::resolve(TrainArgs::parse_from(argv)).unwrap();
        LungSoundLrSchedule::new(&config, steps_per_epoch)
    }

    #[test]
    fn normalizes_rows() {
        let device = NdArrayDevice::Cpu;
        let rows = Tensor::<NdArray, 2>::from_floats([[3.0, 4.0], [0.0, 0.0]], &device);
        let values = l2_normalize(rows).into_data().to_vec::<f32>().unwrap();

        for (value, expected) in values.iter().zip([0.6, 0.8, 0.0, 0.0]) {
            assert!((value - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn cosine_decays_towards_eta_min() {
        let schedule = schedule(&["--epochs", "10", "--learning_rate", "1.0"], 4);

        // epoch 1 is already one step into the curve
        assert!(schedule.lr_at(0) < 1.0);
        assert!((schedule.lr_at(0) - schedule.lr_at(3)).abs() < 1e-12);
        assert!(schedule.lr_at(4) < schedule.lr_at(3));
        assert!((schedule.epoch_lr(10) - 1e-3).abs() < 1e-9);
    }

    #[test]
    fn step_decay_counts_passed_milestones() {
        let schedule = schedule(
            &["--cosine", "false", "--learning_rate", "1.0", "--lr_decay_epochs", "2,4"],
            1,
        );

        assert_eq!(schedule.epoch_lr(2), 1.0);
        assert!((schedule.epoch_lr(3) - 0.1).abs() < 1e-12);
        assert!((schedule.epoch_lr(5) - 0.01).abs() < 1e-12);
    }

    #[test]
    fn warmup_ramps_linearly() {
        let mut schedule = schedule(&["--warm", "--epochs", "20", "--learning_rate", "1.0"], 2);
        let warmup = schedule.warmup.unwrap();

        let first = LrScheduler::<NdArray>::step(&mut schedule);
        assert!((first - warmup.from).abs() < 1e-12);

        let last = schedule.lr_at(19);
        assert!((last - (warmup.from + 19.0 / 20.0 * (warmup.to - warmup.from))).abs() < 1e-12);
        // after warm-up the cosine curve takes over at epoch 11
        assert!((schedule.lr_at(20) - schedule.epoch_lr(11)).abs() < 1e-12);
    }

    #[test]
    fn resumes_mid_schedule() {
        let schedule = schedule(&["--epochs", "10"], 5).starting_after(3);
        assert_eq!(schedule.step, 15);
        assert_eq!(schedule.lr_at(schedule.step), schedule.epoch_lr(4));
    }
}
