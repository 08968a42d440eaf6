use rand::Rng;

use crate::config::{ConfigError, MaskValue};
use crate::spectrogram::Spectrogram;

/// Frequency and time masking parameters for SpecAugment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecAugmentPolicy {
    pub freq_mask: usize,
    pub num_freq_masks: usize,
    pub time_mask: usize,
    pub num_time_masks: usize,
}

impl SpecAugmentPolicy {
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        match name {
            "icbhi_sup" => Ok(Self {
                freq_mask: 20,
                num_freq_masks: 2,
                time_mask: 50,
                num_time_masks: 2,
            }),
            "icbhi_ast_sup" => Ok(Self {
                freq_mask: 48,
                num_freq_masks: 2,
                time_mask: 160,
                num_time_masks: 2,
            }),
            other => Err(ConfigError::UnknownSpecAugPolicy(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpecAugment {
    pub policy: SpecAugmentPolicy,
    pub mask_value: MaskValue,
}

impl SpecAugment {
    pub fn new(policy: SpecAugmentPolicy, mask_value: MaskValue) -> Self {
        Self { policy, mask_value }
    }

    pub fn apply<R: Rng>(&self, mut spec: Spectrogram, rng: &mut R) -> Spectrogram {
        if spec.values.is_empty() {
            return spec;
        }

        let fill = match self.mask_value {
            MaskValue::Mean => spec.mean(),
            MaskValue::Zero => 0.0,
        };
        let Spectrogram {
            frames, n_mels, ..
        } = spec;

        for _ in 0..self.policy.num_freq_masks {
            let (start, width) = sample_band(self.policy.freq_mask, n_mels, rng);
            for frame in 0..frames {
                spec.values[frame * n_mels + start..frame * n_mels + start + width].fill(fill);
            }
        }

        for _ in 0..self.policy.num_time_masks {
            let (start, width) = sample_band(self.policy.time_mask, frames, rng);
            spec.values[start * n_mels..(start + width) * n_mels].fill(fill);
        }

        spec
    }
}

/// Picks a band of width in `[0, max_width]` that fits inside `len`.
fn sample_band<R: Rng>(max_width: usize, len: usize, rng: &mut R) -> (usize, usize) {
    let width = rng.gen_range(0..=max_width.min(len));
    let start = rng.gen_range(0..=len - width);
    (start, width)
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    fn ramp(frames: usize, n_mels: usize) -> Spectrogram {
        Spectrogram {
            values: (0..frames * n_mels).map(|v| v as f32 + 1.0).collect(),
            frames,
            n_mels,
        }
    }

    #[test]
    fn masks_stay_within_policy() {
        let policy = SpecAugmentPolicy {
            freq_mask: 3,
            num_freq_masks: 1,
            time_mask: 4,
            num_time_masks: 1,
        };
        let augment = SpecAugment::new(policy, MaskValue::Zero);
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..50 {
            let spec = augment.apply(ramp(20, 10), &mut rng);
            let zeros = spec.values.iter().filter(|v| **v == 0.0).count();
            // at most 3 full mel columns plus 4 full frames
            assert!(zeros <= 3 * 20 + 4 * 10);
            assert_eq!(spec.values.len(), 200);
        }
    }

    #[test]
    fn mean_mask_keeps_mean_value() {
        let policy = SpecAugmentPolicy {
            freq_mask: 5,
            num_freq_masks: 1,
            time_mask: 0,
            num_time_masks: 0,
        };
        let augment = SpecAugment::new(policy, MaskValue::Mean);
        let original = ramp(4, 5);
        let mean = original.mean();
        let spec = augment.apply(original.clone(), &mut StdRng::seed_from_u64(3));

        for (before, after) in original.values.iter().zip(&spec.values) {
            assert!(after == before || *after == mean);
        }
    }

    #[test]
    fn unknown_policy_is_rejected() {
        assert!(SpecAugmentPolicy::from_name("icbhi_ast_sup").is_ok());
        assert!(SpecAugmentPolicy::from_name("speech").is_err());
    }
}
