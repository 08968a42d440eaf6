use std::path::Path;

use itertools::Itertools;
use rubato::{FftFixedIn, Resampler};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("failed to read wav: {0}")]
    Wav(#[from] wavers::WaversError),
    #[error("failed to build resampler: {0}")]
    ResamplerConstruction(#[from] rubato::ResamplerConstructionError),
    #[error("resampling failed: {0}")]
    Resample(#[from] rubato::ResampleError),
    #[error("wav file has no channels")]
    NoChannels,
}

const RESAMPLE_CHUNK: usize = 1024;

/// Reads a wav file as mono samples, averaging interleaved channels.
pub fn read_wav(path: impl AsRef<Path>) -> Result<(Vec<f32>, u32), AudioError> {
    let mut wav = wavers::Wav::<f32>::from_path(path.as_ref())?;
    let channels = wav.n_channels() as usize;
    let sr = wav.sample_rate() as u32;
    let samples = wav.read()?;

    if channels == 0 {
        return Err(AudioError::NoChannels);
    }

    let mono = if channels == 1 {
        samples.to_vec()
    } else {
        samples
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect_vec()
    };

    Ok((mono, sr))
}

pub fn resample(samples: Vec<f32>, from: u32, to: u32) -> Result<Vec<f32>, AudioError> {
    if from == to || samples.is_empty() {
        return Ok(samples);
    }

    let expected_len = (samples.len() as u64 * to as u64 / from as u64) as usize;
    let mut resampler = FftFixedIn::<f32>::new(from as usize, to as usize, RESAMPLE_CHUNK, 2, 1)?;
    let delay = resampler.output_delay();

    let mut resampled = Vec::with_capacity(expected_len + delay);
    let mut chunks = samples.chunks_exact(RESAMPLE_CHUNK);
    for chunk in &mut chunks {
        let out = resampler.process(&[chunk], None)?;
        resampled.extend_from_slice(&out[0]);
    }

    let remainder = chunks.remainder();
    if !remainder.is_empty() {
        let out = resampler.process_partial(Some(&[remainder]), None)?;
        resampled.extend_from_slice(&out[0]);
    }

    // flush until the delayed tail is out
    while resampled.len() < expected_len + delay {
        let out = resampler.process_partial::<&[f32]>(None, None)?;
        if out[0].is_empty() {
            break;
        }
        resampled.extend_from_slice(&out[0]);
    }

    let mut resampled = resampled.split_off(delay.min(resampled.len()));
    resampled.truncate(expected_len);

    debug!(from, to, input = samples.len(), output = resampled.len(), "resampled");

    Ok(resampled)
}
