use std::marker::PhantomData;

use burn::prelude::{Backend, Int, Tensor};
use burn::train::metric::{Metric, MetricEntry, MetricMetadata, Numeric};
use serde::{Deserialize, Serialize};

/// Per-class hit and sample counts. Class 0 is the normal class.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IcbhiCounts {
    pub hits: Vec<usize>,
    pub counts: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IcbhiScore {
    pub specificity: f64,
    pub sensitivity: f64,
    pub score: f64,
}

impl IcbhiCounts {
    pub fn new(n_cls: usize) -> Self {
        Self {
            hits: vec![0; n_cls],
            counts: vec![0; n_cls],
        }
    }

    /// With `two_cls` any abnormal prediction on an abnormal example counts as a hit.
    pub fn record(&mut self, label: usize, prediction: usize, two_cls: bool) {
        if label >= self.counts.len() {
            self.hits.resize(label + 1, 0);
            self.counts.resize(label + 1, 0);
        }

        self.counts[label] += 1;

        let hit = if label == 0 {
            prediction == 0
        } else if two_cls {
            prediction != 0
        } else {
            prediction == label
        };
        if hit {
            self.hits[label] += 1;
        }
    }

    /// Specificity, sensitivity and their mean, in percent. Empty groups score 0.
    pub fn score(&self) -> IcbhiScore {
        let ratio = |hits: usize, counts: usize| {
            if counts == 0 {
                0.0
            } else {
                100.0 * hits as f64 / counts as f64
            }
        };

        let normal_hits = self.hits.first().copied().unwrap_or(0);
        let normal_counts = self.counts.first().copied().unwrap_or(0);
        let abnormal_hits = self.hits.iter().skip(1).sum();
        let abnormal_counts = self.counts.iter().skip(1).sum();

        let specificity = ratio(normal_hits, normal_counts);
        let sensitivity = ratio(abnormal_hits, abnormal_counts);

        IcbhiScore {
            specificity,
            sensitivity,
            score: (specificity + sensitivity) / 2.0,
        }
    }

    pub fn update<B: Backend>(&mut self, input: &IcbhiInput<B>, two_cls: bool) {
        let predictions = input.logits.clone().argmax(1).flatten::<1>(0, 1);
        let predictions = predictions.into_data();
        let labels = input.labels.clone().into_data();

        for (label, prediction) in labels.iter::<i64>().zip(predictions.iter::<i64>()) {
            self.record(label as usize, prediction as usize, two_cls);
        }
    }
}

pub struct IcbhiInput<B: Backend> {
    pub logits: Tensor<B, 2>,
    pub labels: Tensor<B, 1, Int>,
}

impl<B: Backend> IcbhiInput<B> {
    pub fn new(logits: Tensor<B, 2>, labels: Tensor<B, 1, Int>) -> Self {
        Self { logits, labels }
    }
}

pub trait IcbhiStat: Send + Sync {
    const NAME: &'static str;

    fn pick(score: &IcbhiScore) -> f64;
}

pub struct Specificity;
pub struct Sensitivity;
pub struct Score;

impl IcbhiStat for Specificity {
    const NAME: &'static str = "Specificity";

    fn pick(score: &IcbhiScore) -> f64 {
        score.specificity
    }
}

impl IcbhiStat for Sensitivity {
    const NAME: &'static str = "Sensitivity";

    fn pick(score: &IcbhiScore) -> f64 {
        score.sensitivity
    }
}

impl IcbhiStat for Score {
    const NAME: &'static str = "ICBHI Score";

    fn pick(score: &IcbhiScore) -> f64 {
        score.score
    }
}

/// Running ICBHI statistic over the epoch so far.
pub struct IcbhiMetric<B: Backend, S: IcbhiStat> {
    counts: IcbhiCounts,
    two_cls: bool,
    _phantom: PhantomData<(B, S)>,
}

pub type SpecificityMetric<B> = IcbhiMetric<B, Specificity>;
pub type SensitivityMetric<B> = IcbhiMetric<B, Sensitivity>;
pub type ScoreMetric<B> = IcbhiMetric<B, Score>;

impl<B: Backend, S: IcbhiStat> IcbhiMetric<B, S> {
    pub fn new(two_cls: bool) -> Self {
        Self {
            counts: IcbhiCounts::default(),
            two_cls,
            _phantom: PhantomData,
        }
    }
}

impl<B: Backend, S: IcbhiStat> Metric for IcbhiMetric<B, S> {
    const NAME: &'static str = S::NAME;
    type Input = IcbhiInput<B>;

    fn update(&mut self, item: &Self::Input, _metadata: &MetricMetadata) -> MetricEntry {
        self.counts.update(item, self.two_cls);
        let value = self.value();

        MetricEntry::new(
            Self::NAME.to_string(),
            format!("{}: {value:.2} %", Self::NAME),
            value.to_string(),
        )
    }

    fn clear(&mut self) {
        self.counts = IcbhiCounts::default();
    }
}

impl<B: Backend, S: IcbhiStat> Numeric for IcbhiMetric<B, S> {
    fn value(&self) -> f64 {
        S::pick(&self.counts.score())
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::ndarray::NdArrayDevice;
    use burn::backend::NdArray;
    use burn::data::dataloader::Progress;

    use super::*;

    #[test]
    fn scores_four_classes() {
        let mut counts = IcbhiCounts::new(4);
        // normal: 3 of 4 correct
        for prediction in [0, 0, 0, 2] {
            counts.record(0, prediction, false);
        }
        // abnormal: 1 of 4 correct
        for (label, prediction) in [(1, 1), (2, 1), (3, 0), (3, 2)] {
            counts.record(label, prediction, false);
        }

        let score = counts.score();
        assert_eq!(score.specificity, 75.0);
        assert_eq!(score.sensitivity, 25.0);
        assert_eq!(score.score, 50.0);
    }

    #[test]
    fn two_class_accepts_any_abnormal_prediction() {
        let mut counts = IcbhiCounts::new(4);
        for (label, prediction) in [(1, 1), (2, 1), (3, 0), (3, 2)] {
            counts.record(label, prediction, true);
        }

        assert_eq!(counts.score().sensitivity, 75.0);
        // no normal samples
        assert_eq!(counts.score().specificity, 0.0);
    }

    #[test]
    fn empty_counts_score_zero() {
        let score = IcbhiCounts::default().score();
        assert_eq!(score, IcbhiScore { specificity: 0.0, sensitivity: 0.0, score: 0.0 });
    }

    #[test]
    fn accumulates_until_cleared() {
        let device = NdArrayDevice::Cpu;
        let mut metric = ScoreMetric::<NdArray>::new(false);
        let metadata = MetricMetadata {
            progress: Progress {
                items_processed: 1,
                items_total: 1,
            },
            epoch: 1,
            epoch_total: 1,
            iteration: 1,
            lr: None,
        };

        let input = IcbhiInput::new(
            Tensor::from_floats([[2.0, 0.0], [0.0, 1.0], [0.0, 3.0]], &device),
            Tensor::from_ints([0, 1, 0], &device),
        );
        metric.update(&input, &metadata);
        // specificity 50, sensitivity 100
        assert_eq!(metric.value(), 75.0);

        metric.clear();
        assert_eq!(metric.value(), 0.0);
    }
}
