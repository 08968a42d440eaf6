use std::sync::Arc;

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataloader::{DataLoader, DataLoaderBuilder};
use burn::data::dataset::transform::PartialDataset;
use burn::data::dataset::Dataset;
use burn::prelude::{Backend, Int, Tensor};
use burn::tensor::module::interpolate;
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};
use thiserror::Error;
use tracing::info;
use unzip3::Unzip3;

use crate::augment::{SpecAugment, SpecAugmentPolicy};
use crate::config::{ConfigError, ExperimentConfig};
use crate::data::icbhi::{DatasetError, IcbhiDataset, IcbhiOptions};
use crate::data::sampler::{EpochShuffledDataset, WeightedSamplerDataset};

pub mod icbhi;
pub mod sampler;

/// One respiratory cycle: log-mel spectrogram, class label and padded raw audio.
#[derive(Debug, Clone)]
pub struct LungSoundItem {
    pub spectrogram: Vec<f32>,
    pub frames: usize,
    pub n_mels: usize,
    pub label: usize,
    pub audio: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct LungSoundBatch<B: Backend> {
    // B x 1 x H x W
    pub images: Tensor<B, 4>,
    pub labels: Tensor<B, 1, Int>,
    // B x L
    pub audio: Tensor<B, 2>,
}

#[derive(Clone, Debug)]
pub struct LungSoundBatcher<B: Backend> {
    image_dims: [usize; 2],
    device: B::Device,
}

impl<B: Backend> LungSoundBatcher<B> {
    pub fn new(image_dims: [usize; 2], device: B::Device) -> Self {
        Self { image_dims, device }
    }
}

impl<B: Backend> Batcher<LungSoundItem, LungSoundBatch<B>> for LungSoundBatcher<B> {
    fn batch(&self, items: Vec<LungSoundItem>) -> LungSoundBatch<B> {
        let (images, labels, audio): (Vec<_>, Vec<_>, Vec<_>) = items
            .into_iter()
            .map(|item| {
                let image = Tensor::<B, 1>::from_floats(item.spectrogram.as_slice(), &self.device)
                    .reshape([1, 1, item.frames, item.n_mels]);
                let label = Tensor::<B, 1, Int>::from_ints([item.label as i32], &self.device);
                let audio = Tensor::<B, 1>::from_floats(item.audio.as_slice(), &self.device)
                    .unsqueeze::<2>();

                (image, label, audio)
            })
            .unzip3();

        let images = Tensor::cat(images, 0);
        let [_, _, height, width] = images.dims();
        let images = if [height, width] == self.image_dims {
            images
        } else {
            interpolate(
                images,
                self.image_dims,
                InterpolateOptions::new(InterpolateMode::Bilinear),
            )
        };

        LungSoundBatch {
            images,
            labels: Tensor::cat(labels, 0),
            audio: Tensor::cat(audio, 0),
        }
    }
}

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("weighted sampler: {0}")]
    Sampler(#[from] rand::distributions::WeightedError),
}

pub struct Loaders<B: Backend, VB: Backend> {
    pub train: Arc<dyn DataLoader<LungSoundBatch<B>>>,
    pub valid: Arc<dyn DataLoader<LungSoundBatch<VB>>>,
    /// Full batches per training epoch.
    pub train_batches: usize,
    /// Per-class cycle counts of the training split.
    pub class_nums: Vec<usize>,
}

/// Largest worker count up to `num_workers` that splits `batches` evenly, so every
/// worker partition holds whole batches.
pub fn aligned_workers(batches: usize, num_workers: usize) -> usize {
    (1..=num_workers.max(1))
        .rev()
        .find(|workers| batches % workers == 0)
        .unwrap_or(1)
}

/// How the training loader orders its items.
pub enum TrainOrder {
    /// A fresh permutation every epoch.
    Shuffled { seed: u64 },
    /// The dataset picks its own items, as the weighted sampler does.
    Sampled,
}

/// Training loader that only ever yields full batches. The dataset is cut to a
/// multiple of `batch_size` and split over workers along batch boundaries.
pub fn train_loader<B, D>(
    dataset: D,
    batcher: LungSoundBatcher<B>,
    batch_size: usize,
    num_workers: usize,
    order: TrainOrder,
) -> (Arc<dyn DataLoader<LungSoundBatch<B>>>, usize)
where
    B: Backend,
    D: Dataset<LungSoundItem> + 'static,
{
    let batch_size = batch_size.max(1);
    let batches = dataset.len() / batch_size;
    let workers = aligned_workers(batches, num_workers);
    let builder = DataLoaderBuilder::new(batcher)
        .batch_size(batch_size)
        .num_workers(workers);

    let loader = match order {
        TrainOrder::Shuffled { seed } => {
            builder.build(EpochShuffledDataset::new(dataset, batches * batch_size, seed))
        }
        TrainOrder::Sampled => builder.build(PartialDataset::new(dataset, 0, batches * batch_size)),
    };

    (loader, batches)
}

/// Builds the ICBHI train and validation loaders. The train loader drops the
/// trailing partial batch and reshuffles every epoch unless weighted sampling is
/// enabled.
pub fn build_loaders<B: Backend, VB: Backend>(
    config: &ExperimentConfig,
    device: &B::Device,
    valid_device: &VB::Device,
) -> Result<Loaders<B, VB>, LoaderError> {
    let args = &config.args;
    let options = IcbhiOptions::from(config);
    let augment = SpecAugment::new(
        SpecAugmentPolicy::from_name(&args.specaug_policy)?,
        args.specaug_mask,
    );

    let train_dataset = IcbhiDataset::load(&options, true, Some(augment), args.seed)?;
    let valid_dataset = IcbhiDataset::load(&options, false, None, args.seed)?;
    let class_nums = train_dataset.class_nums.clone();

    let batch_size = args.batch_size.max(1);
    let image_dims = config.image_dims();

    let train_batcher = LungSoundBatcher::<B>::new(image_dims, device.clone());
    let valid_batcher = LungSoundBatcher::<VB>::new(image_dims, valid_device.clone());

    let (train, train_batches) = if args.weighted_sampler {
        let labels = train_dataset.labels();
        let ratio = train_dataset.class_ratio.clone();
        let sampled =
            WeightedSamplerDataset::inverse_class_ratio(train_dataset, &labels, &ratio, args.seed)?;
        info!("training with a weighted sampler");

        train_loader(sampled, train_batcher, batch_size, args.num_workers, TrainOrder::Sampled)
    } else {
        train_loader(
            train_dataset,
            train_batcher,
            batch_size,
            args.num_workers,
            TrainOrder::Shuffled { seed: args.seed },
        )
    };

    let valid = DataLoaderBuilder::new(valid_batcher)
        .batch_size(batch_size)
        .num_workers(args.num_workers)
        .build(valid_dataset);

    Ok(Loaders {
        train,
        valid,
        train_batches,
        class_nums,
    })
}
