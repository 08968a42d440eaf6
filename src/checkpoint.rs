use std::fs;
use std::path::{Path, PathBuf};

use burn::module::Module;
use burn::prelude::Backend;
use burn::record::{
    BinFileRecorder, CompactRecorder, FileRecorder, FullPrecisionSettings, Record, Recorder,
    RecorderError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint record {path}: {source}")]
    Record {
        path: PathBuf,
        #[source]
        source: RecorderError,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointMeta {
    pub epoch: usize,
}

/// Checkpoint files live next to each other: `{stem}.bin` holds the weights and
/// `{stem}.json` the epoch. `path` may be given with or without the `.bin` suffix.
fn stem(path: &Path) -> PathBuf {
    match path.extension() {
        Some(ext) if ext == "bin" => path.with_extension(""),
        _ => path.to_path_buf(),
    }
}

fn meta_path(stem: &Path) -> PathBuf {
    stem.with_extension("json")
}

// the recorder sets the same extension itself
fn weights_path(stem: &Path) -> PathBuf {
    stem.with_extension("bin")
}

/// Companion record of the checkpoint at `stem`, stored as `{stem}_{part}.bin`.
fn part_path(stem: &Path, part: &str) -> PathBuf {
    let name = stem
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    weights_path(&stem.with_file_name(format!("{name}_{part}")))
}

fn save_record<B: Backend, R: Record<B>>(record: R, path: PathBuf) -> Result<(), CheckpointError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    Recorder::<B>::record(&recorder, record, path.clone())
        .map_err(|source| CheckpointError::Record { path, source })
}

fn load_record<B: Backend, R: Record<B>, FR: FileRecorder<B>>(
    recorder: &FR,
    path: PathBuf,
    device: &B::Device,
) -> Result<Option<R>, CheckpointError> {
    if !path.with_extension(<FR as FileRecorder<B>>::file_extension()).exists() {
        return Ok(None);
    }

    Recorder::<B>::load(recorder, path.clone(), device)
        .map(Some)
        .map_err(|source| CheckpointError::Record { path, source })
}

/// Stores `module` next to the checkpoint at `path` under the name `part`.
pub fn save_part<B: Backend, M: Module<B>>(
    module: M,
    path: &Path,
    part: &str,
) -> Result<(), CheckpointError> {
    save_record::<B, _>(module.into_record(), part_path(&stem(path), part))
}

/// Loads the `part` record of the checkpoint at `path` into `module`, if it was saved.
pub fn load_part<B: Backend, M: Module<B>>(
    module: M,
    path: &Path,
    part: &str,
    device: &B::Device,
) -> Result<Option<M>, CheckpointError> {
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    let record = load_record::<B, M::Record, _>(&recorder, part_path(&stem(path), part), device)?;
    Ok(record.map(|record| module.load_record(record)))
}

pub fn save_optimizer<B: Backend, R: Record<B>>(record: R, path: &Path) -> Result<(), CheckpointError> {
    save_record::<B, R>(record, part_path(&stem(path), OPTIMIZER_PART))?;
    info!(path = %stem(path).display(), "saved optimizer state");
    Ok(())
}

pub fn load_optimizer<B: Backend, R: Record<B>>(
    path: &Path,
    device: &B::Device,
) -> Result<Option<R>, CheckpointError> {
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    load_record::<B, R, _>(&recorder, part_path(&stem(path), OPTIMIZER_PART), device)
}

/// Optimizer state the learner's file checkpointer wrote for `epoch` under `directory`.
pub fn learner_optimizer<B: Backend, R: Record<B>>(
    directory: &Path,
    epoch: usize,
    device: &B::Device,
) -> Result<Option<R>, CheckpointError> {
    let path = directory.join("checkpoint").join(format!("optim-{epoch}"));
    load_record::<B, R, _>(&CompactRecorder::new(), path, device)
}

const OPTIMIZER_PART: &str = "optimizer";

pub fn save_checkpoint<B: Backend, M: Module<B>>(
    model: M,
    path: &Path,
    epoch: usize,
) -> Result<(), CheckpointError> {
    let stem = stem(path);
    if let Some(parent) = stem.parent() {
        fs::create_dir_all(parent)?;
    }

    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    model
        .save_file(stem.clone(), &recorder)
        .map_err(|source| CheckpointError::Record {
            path: weights_path(&stem),
            source,
        })?;
    fs::write(meta_path(&stem), serde_json::to_string(&CheckpointMeta { epoch })?)?;

    info!(path = %stem.display(), epoch, "saved checkpoint");
    Ok(())
}

/// Loads weights and epoch into `model`. Returns `None` when no checkpoint exists at
/// `path`; a missing epoch sidecar reads as epoch 0.
pub fn load_checkpoint<B: Backend, M: Module<B>>(
    model: M,
    path: &Path,
    device: &B::Device,
) -> Result<Option<(M, usize)>, CheckpointError> {
    let stem = stem(path);
    let weights = weights_path(&stem);
    if !weights.exists() {
        return Ok(None);
    }

    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    let model = model
        .load_file(weights.clone(), &recorder, device)
        .map_err(|source| CheckpointError::Record {
            path: weights,
            source,
        })?;

    let meta = meta_path(&stem);
    let epoch = if meta.exists() {
        serde_json::from_str::<CheckpointMeta>(&fs::read_to_string(meta)?)?.epoch
    } else {
        0
    };

    info!(path = %stem.display(), epoch, "loaded checkpoint");
    Ok(Some((model, epoch)))
}
