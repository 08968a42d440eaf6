use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use burn::data::dataloader::DataLoader;
use burn::prelude::Backend;
use burn::record::{BinFileRecorder, FullPrecisionSettings, Recorder, RecorderError};
use thiserror::Error;
use tracing::{info, warn};

use crate::checkpoint::load_checkpoint;
use crate::config::ExperimentConfig;
use crate::data::{build_loaders, LungSoundBatch};
use crate::model::{SpectrogramTransformer, SpectrogramTransformerConfig};

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("failed to write {path}: {source}")]
    Record {
        path: PathBuf,
        #[source]
        source: RecorderError,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// `{root}/features_{split}/{patch_size}`
pub fn split_dir(root: &Path, split: &str, patch_size: usize) -> PathBuf {
    root.join(format!("features_{split}"))
        .join(patch_size.to_string())
}

/// Writes the pooled backbone features and labels of every batch as
/// `feature_{split}_{idx:05}` and `label_{split}_{idx:05}`. Returns the batch count.
pub fn export_split<B: Backend>(
    backbone: &SpectrogramTransformer<B>,
    loader: &Arc<dyn DataLoader<LungSoundBatch<B>>>,
    dir: &Path,
    split: &str,
) -> Result<usize, ExportError> {
    fs::create_dir_all(dir)?;
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();

    let mut batches = 0;
    for (idx, batch) in loader.iter().enumerate() {
        let features = backbone.forward(batch.images, batch.audio);

        let feature_path = dir.join(format!("feature_{split}_{idx:05}"));
        Recorder::<B>::record(&recorder, features, feature_path.clone())
            .map_err(|source| ExportError::Record {
                path: feature_path,
                source,
            })?;

        let label_path = dir.join(format!("label_{split}_{idx:05}"));
        Recorder::<B>::record(&recorder, batch.labels, label_path.clone())
            .map_err(|source| ExportError::Record {
                path: label_path,
                source,
            })?;

        batches += 1;
    }

    info!(split, batches, dir = %dir.display(), "exported features");
    Ok(batches)
}

/// Dumps backbone features of the train split, then of the test split.
pub fn run<B: Backend>(config: ExperimentConfig, device: B::Device) -> color_eyre::Result<()> {
    let args = &config.args;
    B::seed(args.seed);
    config.prepare()?;

    let loaders = build_loaders::<B, B>(&config, &device, &device)?;
    let mut backbone = SpectrogramTransformerConfig::from_experiment(&config).init::<B>(&device);

    if args.pretrained {
        match load_checkpoint(backbone.clone(), &args.pretrained_ckpt, &device)? {
            Some((loaded, _)) => backbone = loaded,
            None => warn!(
                path = %args.pretrained_ckpt.display(),
                "pretrained checkpoint not found, exporting untrained features"
            ),
        }
    }

    for (split, loader) in [("train", &loaders.train), ("test", &loaders.valid)] {
        let dir = split_dir(&args.export_dir, split, args.patch_size);
        export_split(&backbone, loader, &dir, split)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use burn::backend::ndarray::NdArrayDevice;
    use burn::backend::NdArray;
    use burn::data::dataloader::DataLoaderBuilder;
    use burn::data::dataset::InMemDataset;

    use super::*;
    use crate::data::{LungSoundBatcher, LungSoundItem};

    #[test]
    fn names_follow_split_and_patch_size() {
        assert_eq!(
            split_dir(Path::new("out"), "test", 16),
            PathBuf::from("out/features_test/16")
        );
    }

    #[test]
    fn writes_one_file_pair_per_batch() {
        let dir = tempfile::tempdir().unwrap();
        let device = NdArrayDevice::Cpu;

        let backbone = SpectrogramTransformerConfig::new(4, 16, 24)
            .with_embed_dim(8)
            .with_depth(1)
            .with_num_heads(2)
            .with_fshape(8)
            .with_tshape(8)
            .with_fstride(8)
            .with_tstride(8)
            .init::<NdArray>(&device);

        let items = (0..5)
            .map(|i| LungSoundItem {
                spectrogram: vec![0.1 * i as f32; 24 * 16],
                frames: 24,
                n_mels: 16,
                label: i % 4,
                audio: vec![0.0; 32],
            })
            .collect();
        let loader = DataLoaderBuilder::new(LungSoundBatcher::<NdArray>::new([24, 16], device))
            .batch_size(2)
            .build(InMemDataset::new(items));

        let out = split_dir(dir.path(), "train", 8);
        let batches = export_split(&backbone, &loader, &out, "train").unwrap();

        assert_eq!(batches, 3);
        for idx in 0..3 {
            assert!(out.join(format!("feature_train_{idx:05}.bin")).exists());
            assert!(out.join(format!("label_train_{idx:05}.bin")).exists());
        }
    }
}
