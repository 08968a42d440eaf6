use std::f32::consts::PI;

use itertools::Itertools;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

const FRAME_LENGTH_MS: f32 = 25.0;
const FRAME_SHIFT_MS: f32 = 10.0;
const PREEMPHASIS: f32 = 0.97;
const LOW_FREQ: f32 = 20.0;

// AudioSet statistics the transformer backbones were tuned with
const FBANK_MEAN: f32 = -4.2677393;
const FBANK_STD: f32 = 4.5689974;

/// A `[frames, n_mels]` row-major log-mel spectrogram.
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrogram {
    pub values: Vec<f32>,
    pub frames: usize,
    pub n_mels: usize,
}

impl Spectrogram {
    pub fn mean(&self) -> f32 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f32>() / self.values.len() as f32
    }
}

fn mel(freq: f32) -> f32 {
    1127.0 * (1.0 + freq / 700.0).ln()
}

#[derive(Debug, Clone)]
pub struct FbankExtractor {
    frame_length: usize,
    frame_shift: usize,
    nfft: usize,
    window: Vec<f32>,
    // n_mels x (nfft / 2)
    mel_banks: Vec<Vec<f32>>,
}

impl FbankExtractor {
    pub fn new(sample_rate: u32, nfft: usize, n_mels: usize) -> Self {
        let frame_length = (sample_rate as f32 * FRAME_LENGTH_MS / 1000.0) as usize;
        let frame_shift = (sample_rate as f32 * FRAME_SHIFT_MS / 1000.0) as usize;
        let nfft = nfft.max(frame_length).next_power_of_two();

        let window = (0..frame_length)
            .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / (frame_length - 1) as f32).cos())
            .collect_vec();

        Self {
            frame_length,
            frame_shift,
            nfft,
            window,
            mel_banks: mel_banks(n_mels, nfft, sample_rate as f32),
        }
    }

    pub fn num_frames(&self, num_samples: usize) -> usize {
        if num_samples < self.frame_length {
            0
        } else {
            1 + (num_samples - self.frame_length) / self.frame_shift
        }
    }

    pub fn extract(&self, samples: &[f32]) -> Spectrogram {
        let n_mels = self.mel_banks.len();
        let frames = self.num_frames(samples.len());
        let fft = FftPlanner::<f32>::new().plan_fft_forward(self.nfft);

        let mut values = Vec::with_capacity(frames * n_mels);
        let mut buffer = vec![Complex::new(0.0, 0.0); self.nfft];

        for frame_idx in 0..frames {
            let start = frame_idx * self.frame_shift;
            let mut frame = samples[start..start + self.frame_length].to_vec();

            let dc = frame.iter().sum::<f32>() / frame.len() as f32;
            frame.iter_mut().for_each(|x| *x -= dc);

            for i in (1..frame.len()).rev() {
                frame[i] -= PREEMPHASIS * frame[i - 1];
            }
            frame[0] -= PREEMPHASIS * frame[0];

            buffer.iter_mut().for_each(|c| *c = Complex::new(0.0, 0.0));
            for (slot, (x, w)) in buffer.iter_mut().zip(frame.iter().zip(&self.window)) {
                *slot = Complex::new(x * w, 0.0);
            }
            fft.process(&mut buffer);

            let power = buffer[..self.nfft / 2].iter().map(|c| c.norm_sqr()).collect_vec();

            for bank in &self.mel_banks {
                let energy = bank.iter().zip(&power).map(|(w, p)| w * p).sum::<f32>();
                let log_energy = energy.max(f32::EPSILON).ln();
                values.push((log_energy - FBANK_MEAN) / (FBANK_STD * 2.0));
            }
        }

        Spectrogram {
            values,
            frames,
            n_mels,
        }
    }
}

fn mel_banks(n_mels: usize, nfft: usize, sample_rate: f32) -> Vec<Vec<f32>> {
    let num_bins = nfft / 2;
    let fft_bin_width = sample_rate / nfft as f32;
    let mel_low = mel(LOW_FREQ);
    let mel_high = mel(sample_rate / 2.0);
    let mel_delta = (mel_high - mel_low) / (n_mels + 1) as f32;

    (0..n_mels)
        .map(|bank| {
            let left = mel_low + bank as f32 * mel_delta;
            let center = left + mel_delta;
            let right = center + mel_delta;

            (0..num_bins)
                .map(|bin| {
                    let m = mel(fft_bin_width * bin as f32);
                    if m > left && m < right {
                        if m <= center {
                            (m - left) / (center - left)
                        } else {
                            (right - m) / (right - center)
                        }
                    } else {
                        0.0
                    }
                })
                .collect_vec()
        })
        .collect_vec()
}
