use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use burn::data::dataloader::DataLoader;
use burn::module::{AutodiffModule, Ignored, Module};
use burn::optim::decay::WeightDecayConfig;
use burn::optim::momentum::MomentumConfig;
use burn::optim::{AdamConfig, Optimizer, SgdConfig};
use burn::prelude::{Backend, ElementConversion, Int, Tensor};
use burn::record::CompactRecorder;
use burn::tensor::backend::AutodiffBackend;
use burn::train::metric::{
    AccuracyInput, AccuracyMetric, Adaptor, LearningRateMetric, LossInput, LossMetric,
};
use burn::train::{LearnerBuilder, TrainOutput, TrainStep, ValidStep};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::checkpoint::{
    learner_optimizer, load_checkpoint, load_optimizer, load_part, save_checkpoint, save_optimizer,
    save_part, CheckpointError,
};
use crate::config::{ExperimentConfig, Method, OptimizerKind, TargetType};
use crate::data::{build_loaders, Loaders, LungSoundBatch};
use crate::loss::patchmix::{patch_mix_loss, PatchMixConLoss};
use crate::loss::Criterion;
use crate::metric::icbhi::{
    IcbhiCounts, IcbhiInput, IcbhiScore, ScoreMetric, SensitivityMetric, SpecificityMetric,
};
use crate::model::patchmix::{PatchMix, PatchMixPlan};
use crate::model::projection::{Projector, ProjectorConfig};
use crate::model::{SpectrogramTransformer, SpectrogramTransformerConfig};
use crate::ops::{LungSoundLrSchedule, ScalarExt};

const PROJECTOR_PART: &str = "projector";

#[derive(Debug, Clone)]
pub struct MethodConfig {
    pub method: Method,
    pub patch_mix: PatchMix,
    pub contrastive: PatchMixConLoss,
    pub alpha: f32,
    pub target_type: TargetType,
}

impl From<&ExperimentConfig> for MethodConfig {
    fn from(config: &ExperimentConfig) -> Self {
        let args = &config.args;
        Self {
            method: args.method,
            patch_mix: PatchMix::new(args.mix_beta, args.time_domain),
            contrastive: PatchMixConLoss::new(args.temperature, args.negative_pair),
            alpha: args.alpha,
            target_type: args.target_type,
        }
    }
}

/// Backbone, criterion and the training method that ties them together.
#[derive(Module, Debug)]
pub struct LungSoundModel<B: Backend> {
    pub backbone: SpectrogramTransformer<B>,
    pub projector: Option<Projector<B>>,
    pub criterion: Criterion<B>,
    method: Ignored<MethodConfig>,
    rng: Ignored<Arc<Mutex<StdRng>>>,
}

impl<B: Backend> LungSoundModel<B> {
    pub fn new(
        config: &ExperimentConfig,
        backbone: SpectrogramTransformer<B>,
        class_nums: &[usize],
        device: &B::Device,
    ) -> Self {
        let method = MethodConfig::from(config);
        let projector = (method.method == Method::PatchmixCl)
            .then(|| ProjectorConfig::new(backbone.embed_dim(), config.args.proj_dim).init(device));

        Self {
            backbone,
            projector,
            criterion: Criterion::new(config, class_nums, device),
            method: Ignored(method),
            rng: Ignored(Arc::new(Mutex::new(StdRng::seed_from_u64(config.args.seed)))),
        }
    }

    fn patch_mix_plan(&self, batch: usize) -> PatchMixPlan {
        let mut rng = match self.rng.0.lock() {
            Ok(rng) => rng,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.method
            .0
            .patch_mix
            .plan(batch, self.backbone.patch_grid(), &mut *rng)
    }

    pub fn forward_train(&self, batch: LungSoundBatch<B>) -> LungSoundOutput<B> {
        let LungSoundBatch {
            images,
            labels,
            audio,
        } = batch;
        let [batch_size, ..] = images.dims();
        let method = &self.method.0;

        let (logits, loss) = match method.method {
            Method::Ce => {
                let logits = self.backbone.classify(self.backbone.forward(images, audio));
                let loss = self.criterion.forward(logits.clone(), labels.clone());
                (logits, loss)
            }
            Method::Patchmix => {
                let plan = self.patch_mix_plan(batch_size);
                let features = self.backbone.forward_mixed(images, audio, &plan);
                let logits = self.backbone.classify(features);

                let labels_b = labels.clone().select(0, plan.index_tensor(&labels.device()));
                let loss = patch_mix_loss(
                    |logits, targets| self.criterion.forward(logits, targets),
                    logits.clone(),
                    labels.clone(),
                    labels_b,
                    plan.lam,
                );
                (logits, loss)
            }
            Method::PatchmixCl => {
                let features = self.backbone.forward(images.clone(), audio.clone());
                let logits = self.backbone.classify(features.clone());
                let loss = self.criterion.forward(logits.clone(), labels.clone());

                let loss = match &self.projector {
                    Some(projector) => {
                        let plan = self.patch_mix_plan(batch_size);
                        let mixed = self.backbone.forward_mixed(images, audio, &plan);

                        let target = if method.target_type.projects_target() {
                            projector.forward(features)
                        } else {
                            features
                        };
                        let target = if method.target_type.blocks_gradient() {
                            target.detach()
                        } else {
                            target
                        };

                        let contrastive = method.contrastive.forward(
                            projector.forward(mixed),
                            target,
                            labels.clone(),
                            plan.lam,
                            plan.index_tensor(&labels.device()),
                        );
                        loss + contrastive * method.alpha
                    }
                    None => loss,
                };
                (logits, loss)
            }
        };

        LungSoundOutput {
            loss,
            logits,
            targets: labels,
        }
    }

    /// Writes the backbone with `epoch` and, for Patch-Mix CL, the projector.
    pub fn save(&self, path: &Path, epoch: usize) -> Result<(), CheckpointError> {
        save_checkpoint(self.backbone.clone(), path, epoch)?;
        if let Some(projector) = &self.projector {
            save_part(projector.clone(), path, PROJECTOR_PART)?;
        }
        Ok(())
    }

    /// Restores what [`save`](Self::save) wrote. `None` when `path` holds no checkpoint;
    /// a checkpoint without a projector leaves the fresh one in place.
    pub fn load(
        self,
        path: &Path,
        device: &B::Device,
    ) -> Result<Option<(Self, usize)>, CheckpointError> {
        let Some((backbone, epoch)) = load_checkpoint(self.backbone.clone(), path, device)? else {
            return Ok(None);
        };

        let projector = match self.projector.clone() {
            Some(projector) => {
                match load_part(projector.clone(), path, PROJECTOR_PART, device)? {
                    Some(loaded) => Some(loaded),
                    None => {
                        info!(path = %path.display(), "checkpoint has no projector");
                        Some(projector)
                    }
                }
            }
            None => None,
        };

        Ok(Some((
            Self {
                backbone,
                projector,
                ..self
            },
            epoch,
        )))
    }

    pub fn forward_eval(&self, batch: LungSoundBatch<B>) -> LungSoundOutput<B> {
        let logits = self
            .backbone
            .classify(self.backbone.forward(batch.images, batch.audio));
        let loss = self.criterion.forward(logits.clone(), batch.labels.clone());

        LungSoundOutput {
            loss,
            logits,
            targets: batch.labels,
        }
    }
}

pub struct LungSoundOutput<B: Backend> {
    pub loss: Tensor<B, 1>,
    pub logits: Tensor<B, 2>,
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> Adaptor<LossInput<B>> for LungSoundOutput<B> {
    fn adapt(&self) -> LossInput<B> {
        LossInput::new(self.loss.clone())
    }
}

impl<B: Backend> Adaptor<AccuracyInput<B>> for LungSoundOutput<B> {
    fn adapt(&self) -> AccuracyInput<B> {
        AccuracyInput::new(self.logits.clone(), self.targets.clone())
    }
}

impl<B: Backend> Adaptor<IcbhiInput<B>> for LungSoundOutput<B> {
    fn adapt(&self) -> IcbhiInput<B> {
        IcbhiInput::new(self.logits.clone(), self.targets.clone())
    }
}

impl<B: AutodiffBackend> TrainStep<LungSoundBatch<B>, LungSoundOutput<B>> for LungSoundModel<B> {
    fn step(&self, item: LungSoundBatch<B>) -> TrainOutput<LungSoundOutput<B>> {
        let output = self.forward_train(item);
        let grads = output.loss.backward();

        TrainOutput::new(self, grads, output)
    }
}

impl<B: Backend> ValidStep<LungSoundBatch<B>, LungSoundOutput<B>> for LungSoundModel<B> {
    fn step(&self, item: LungSoundBatch<B>) -> LungSoundOutput<B> {
        self.forward_eval(item)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub loss: f64,
    pub accuracy: f64,
    #[serde(flatten)]
    pub score: IcbhiScore,
    pub counts: IcbhiCounts,
}

/// Runs the whole loader through the model and scores the predictions.
pub fn evaluate<B: Backend>(
    model: &LungSoundModel<B>,
    loader: &Arc<dyn DataLoader<LungSoundBatch<B>>>,
    n_cls: usize,
    two_cls: bool,
) -> Evaluation {
    let mut counts = IcbhiCounts::new(n_cls);
    let mut loss_sum = 0.0;
    let mut seen = 0;
    let mut correct = 0;

    for batch in loader.iter() {
        let [batch_size, ..] = batch.images.dims();
        let output = model.forward_eval(batch);

        loss_sum += output.loss.scalar::<f64>() * batch_size as f64;
        seen += batch_size;

        let predictions = output.logits.clone().argmax(1).flatten::<1>(0, 1);
        let hits = predictions
            .equal(output.targets.clone())
            .int()
            .sum()
            .into_scalar()
            .elem::<i64>();
        correct += hits as usize;

        counts.update(&IcbhiInput::new(output.logits, output.targets), two_cls);
    }

    let ratio = |value: f64| if seen == 0 { 0.0 } else { value / seen as f64 };

    Evaluation {
        loss: ratio(loss_sum),
        accuracy: 100.0 * ratio(correct as f64),
        score: counts.score(),
        counts,
    }
}

fn last_checkpoint(config: &ExperimentConfig) -> PathBuf {
    config.save_folder.join("last")
}

/// Runs the learner from `start_epoch` to the last epoch. The optimizer state is
/// restored from `resumed_from` when present, and the final state is stored next
/// to the `last` checkpoint.
fn fit<B, O>(
    config: &ExperimentConfig,
    model: LungSoundModel<B>,
    mut optimizer: O,
    loaders: &Loaders<B, B::InnerBackend>,
    device: &B::Device,
    start_epoch: usize,
    resumed_from: Option<&Path>,
) -> Result<LungSoundModel<B>, CheckpointError>
where
    B: AutodiffBackend,
    O: Optimizer<LungSoundModel<B>, B> + 'static,
{
    if let Some(path) = resumed_from {
        match load_optimizer::<B, O::Record>(path, device)? {
            Some(record) => optimizer = optimizer.load_record(record),
            None => warn!(path = %path.display(), "checkpoint has no optimizer state"),
        }
    }

    let args = &config.args;
    let steps_per_epoch = loaders.train_batches;
    let schedule =
        LungSoundLrSchedule::new(config, steps_per_epoch).starting_after(start_epoch - 1);
    let num_epochs = args.epochs + 1 - start_epoch;
    let two_cls = args.two_cls_eval;

    info!(start_epoch, num_epochs, steps_per_epoch, "training");

    let directory = config.save_folder.to_string_lossy();
    let learner = LearnerBuilder::new(&*directory)
        .metric_train_numeric(LossMetric::new())
        .metric_train_numeric(AccuracyMetric::new())
        .metric_train_numeric(LearningRateMetric::new())
        .metric_valid_numeric(LossMetric::new())
        .metric_valid_numeric(AccuracyMetric::new())
        .metric_valid_numeric(SpecificityMetric::<B::InnerBackend>::new(two_cls))
        .metric_valid_numeric(SensitivityMetric::<B::InnerBackend>::new(two_cls))
        .metric_valid_numeric(ScoreMetric::<B::InnerBackend>::new(two_cls))
        .with_file_checkpointer(CompactRecorder::new())
        .with_application_logger(None)
        .devices(vec![device.clone()])
        .num_epochs(num_epochs)
        .summary()
        .build(model, optimizer, schedule);

    let model = learner.fit(loaders.train.clone(), loaders.valid.clone());

    match learner_optimizer::<B, O::Record>(&config.save_folder, num_epochs, device)? {
        Some(record) => save_optimizer::<B, _>(record, &last_checkpoint(config))?,
        None => warn!(epoch = num_epochs, "learner left no optimizer checkpoint"),
    }

    Ok(model)
}

/// Trains (unless `--eval`) and evaluates one experiment, leaving `results.json`
/// and the `last` checkpoint in the experiment folder.
pub fn run<B: AutodiffBackend>(config: ExperimentConfig, device: B::Device) -> color_eyre::Result<()> {
    let args = &config.args;
    B::seed(args.seed);
    config.prepare()?;

    let loaders = build_loaders::<B, B::InnerBackend>(&config, &device, &device)?;

    let mut backbone = SpectrogramTransformerConfig::from_experiment(&config).init::<B>(&device);

    if args.pretrained {
        match load_checkpoint(backbone.clone(), &args.pretrained_ckpt, &device)? {
            Some((loaded, _)) => backbone = loaded,
            None => warn!(
                path = %args.pretrained_ckpt.display(),
                "pretrained checkpoint not found, starting from scratch"
            ),
        }
    }

    let model = LungSoundModel::new(&config, backbone, &loaders.class_nums, &device);

    let (model, start_epoch, resumed_from) = match &args.resume {
        Some(resume) => match model.clone().load(resume, &device)? {
            Some((loaded, epoch)) => (loaded, epoch + 1, Some(resume.as_path())),
            None => {
                warn!(path = %resume.display(), "no checkpoint to resume from");
                (model, 1, None)
            }
        },
        None => (model, 1, None),
    };

    let (model, last_epoch) = if args.eval || start_epoch > args.epochs {
        info!("skipping training");
        (model, start_epoch - 1)
    } else {
        let trained = match args.optimizer {
            OptimizerKind::Adam => {
                let optimizer = AdamConfig::new()
                    .with_weight_decay(Some(WeightDecayConfig::new(args.weight_decay)))
                    .init();
                fit(&config, model, optimizer, &loaders, &device, start_epoch, resumed_from)?
            }
            OptimizerKind::Sgd => {
                let optimizer = SgdConfig::new()
                    .with_weight_decay(Some(WeightDecayConfig::new(args.weight_decay)))
                    .with_momentum(Some(
                        MomentumConfig::new()
                            .with_momentum(args.momentum)
                            .with_dampening(0.0),
                    ))
                    .init();
                fit(&config, model, optimizer, &loaders, &device, start_epoch, resumed_from)?
            }
        };
        (trained, args.epochs)
    };

    let evaluation = evaluate(&model.valid(), &loaders.valid, config.n_cls(), args.two_cls_eval);
    info!(
        specificity = evaluation.score.specificity,
        sensitivity = evaluation.score.sensitivity,
        score = evaluation.score.score,
        accuracy = evaluation.accuracy,
        "evaluation"
    );

    let results = config.save_folder.join("results.json");
    fs::write(&results, serde_json::to_string_pretty(&evaluation)?)?;
    info!(path = %results.display(), "wrote results");

    model.save(&last_checkpoint(&config), last_epoch)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use burn::backend::ndarray::NdArrayDevice;
    use burn::backend::{Autodiff, NdArray};
    use burn::data::dataloader::DataLoaderBuilder;
    use burn::data::dataset::InMemDataset;
    use burn::optim::GradientsParams;
    use clap::Parser;

    use super::*;
    use crate::config::TrainArgs;
    use crate::data::icbhi::fixtures::synthetic_folder;
    use crate::data::{LungSoundBatcher, LungSoundItem};

    type TestBackend = Autodiff<NdArray>;

    fn tiny_config(method: &str) -> ExperimentConfig {
        ExperimentConfig::resolve(TrainArgs::parse_from([
            "lungsound",
            "--method",
            method,
            "--spec_height",
            "24",
            "--spec_width",
            "16",
            "--patch_size",
            "4",
            "--fstride",
            "4",
            "--tstride",
            "4",
            "--embed_dim",
            "8",
            "--depth",
            "1",
            "--num_heads",
            "2",
            "--proj_dim",
            "8",
        ]))
        .unwrap()
    }

    fn tiny_model(method: &str) -> LungSoundModel<TestBackend> {
        let device = NdArrayDevice::Cpu;
        let config = tiny_config(method);
        let backbone = SpectrogramTransformerConfig::from_experiment(&config).init(&device);
        LungSoundModel::new(&config, backbone, &[10, 5, 3, 2], &device)
    }

    fn batch(size: usize) -> LungSoundBatch<TestBackend> {
        let items = (0..size)
            .map(|i| LungSoundItem {
                spectrogram: (0..24 * 16).map(|v| ((v + i) % 7) as f32 / 7.0).collect(),
                frames: 24,
                n_mels: 16,
                label: i % 4,
                audio: vec![0.1; 64],
            })
            .collect();
        burn::data::dataloader::batcher::Batcher::batch(
            &LungSoundBatcher::<TestBackend>::new([24, 16], NdArrayDevice::Cpu),
            items,
        )
    }

    #[test]
    fn every_method_yields_a_finite_loss_with_gradients() {
        for method in ["ce", "patchmix", "patchmix_cl"] {
            let model = tiny_model(method);
            let output = model.forward_train(batch(4));

            assert_eq!(output.logits.dims(), [4, 4]);
            let loss: f32 = output.loss.scalar();
            assert!(loss.is_finite() && loss >= 0.0, "{method}: {loss}");

            let grads = output.loss.backward();
            assert!(!GradientsParams::from_grads(grads, &model).is_empty());
        }
    }

    #[test]
    fn projector_only_for_contrastive_method() {
        assert!(tiny_model("patchmix").projector.is_none());
        assert!(tiny_model("patchmix_cl").projector.is_some());
    }

    fn run_args(data: &Path, save: &Path, extra: &[&str]) -> ExperimentConfig {
        let mut argv = vec![
            "lungsound".to_string(),
            "--data_folder".to_string(),
            data.display().to_string(),
            "--save_dir".to_string(),
            save.display().to_string(),
        ];
        argv.extend(
            [
                "--desired_length", "1", "--nfft", "400", "--n_mels", "16",
                "--spec_height", "24", "--spec_width", "16", "--patch_size", "4",
                "--fstride", "4", "--tstride", "4", "--embed_dim", "8", "--depth", "1",
                "--num_heads", "2", "--proj_dim", "8", "--batch_size", "2",
                "--num_workers", "0", "--epochs", "2",
            ]
            .map(str::to_string),
        );
        argv.extend(extra.iter().map(|arg| arg.to_string()));

        ExperimentConfig::resolve(TrainArgs::parse_from(argv)).unwrap()
    }

    fn read_epoch(path: &Path) -> usize {
        let meta: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(path.with_extension("json")).unwrap()).unwrap();
        meta["epoch"].as_u64().unwrap() as usize
    }

    #[test]
    fn eval_only_writes_results_and_last_checkpoint() {
        let data = synthetic_folder();
        let save = tempfile::tempdir().unwrap();
        let config = run_args(data.path(), save.path(), &["--eval"]);
        let folder = config.save_folder.clone();

        run::<TestBackend>(config, NdArrayDevice::Cpu).unwrap();

        let evaluation: Evaluation =
            serde_json::from_str(&fs::read_to_string(folder.join("results.json")).unwrap()).unwrap();
        // the single test cycle is normal
        assert_eq!(evaluation.counts.counts, vec![1, 0, 0, 0]);
        assert!(folder.join("train_args.json").exists());
        assert!(folder.join("last.bin").exists());
        assert_eq!(read_epoch(&folder.join("last")), 0);
    }

    #[test]
    fn missing_resume_checkpoint_starts_over() {
        let data = synthetic_folder();
        let save = tempfile::tempdir().unwrap();
        let absent = save.path().join("absent");
        let config = run_args(
            data.path(),
            save.path(),
            &["--eval", "--resume", absent.to_str().unwrap()],
        );
        let folder = config.save_folder.clone();

        run::<TestBackend>(config, NdArrayDevice::Cpu).unwrap();
        assert_eq!(read_epoch(&folder.join("last")), 0);
    }

    #[test]
    fn resumes_backbone_projector_and_epoch() {
        let data = synthetic_folder();
        let save = tempfile::tempdir().unwrap();
        let device = NdArrayDevice::Cpu;
        let resume = save.path().join("resume").join("epoch2");

        let config = run_args(data.path(), save.path(), &["--method", "patchmix_cl"]);
        let backbone = SpectrogramTransformerConfig::from_experiment(&config).init(&device);
        let saved = LungSoundModel::<TestBackend>::new(&config, backbone, &[1, 1, 1, 1], &device);
        saved.save(&resume, 2).unwrap();

        // every epoch is done, so the run goes straight to evaluation
        let config = run_args(
            data.path(),
            save.path(),
            &["--method", "patchmix_cl", "--resume", resume.to_str().unwrap()],
        );
        let last = config.save_folder.join("last");
        run::<TestBackend>(config.clone(), device).unwrap();
        assert_eq!(read_epoch(&last), 2);

        let backbone = SpectrogramTransformerConfig::from_experiment(&config).init(&device);
        let fresh = LungSoundModel::<TestBackend>::new(&config, backbone, &[1, 1, 1, 1], &device);
        let (restored, epoch) = fresh.load(&last, &device).unwrap().unwrap();
        assert_eq!(epoch, 2);

        let features = Tensor::<TestBackend, 2>::ones([1, 8], &device);
        let project = |model: &LungSoundModel<TestBackend>| {
            model
                .projector
                .as_ref()
                .unwrap()
                .forward(features.clone())
                .into_data()
                .to_vec::<f32>()
                .unwrap()
        };
        assert_eq!(project(&restored), project(&saved));
    }

    #[test]
    fn evaluates_a_loader() {
        let device = NdArrayDevice::Cpu;
        let model = tiny_model("ce").valid();
        let items = (0..6)
            .map(|i| LungSoundItem {
                spectrogram: vec![0.5; 24 * 16],
                frames: 24,
                n_mels: 16,
                label: i % 2,
                audio: vec![0.0; 64],
            })
            .collect();
        let loader = DataLoaderBuilder::new(LungSoundBatcher::<NdArray>::new([24, 16], device))
            .batch_size(4)
            .build(InMemDataset::new(items));

        let evaluation = evaluate(&model, &loader, 4, false);

        assert_eq!(evaluation.counts.counts, vec![3, 3, 0, 0]);
        assert!(evaluation.loss.is_finite());
        assert!((0.0..=100.0).contains(&evaluation.score.score));
    }
}
