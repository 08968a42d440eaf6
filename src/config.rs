use std::f64::consts::PI;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

use clap::{ArgAction, Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::augment::SpecAugmentPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("dataset `{0}` is not supported")]
    UnsupportedDataset(String),
    #[error("class split `{split:?}` has no {n_cls}-way variant")]
    UnsupportedClassSplit { split: ClassSplit, n_cls: usize },
    #[error("invalid learning rate decay epoch `{0}`")]
    InvalidDecayEpoch(String),
    #[error("unknown SpecAugment policy `{0}`")]
    UnknownSpecAugPolicy(String),
    #[error("target type `{target:?}` compares raw features, which needs proj_dim == embed_dim ({proj_dim} != {embed_dim})")]
    ProjectionMismatch {
        target: TargetType,
        proj_dim: usize,
        embed_dim: usize,
    },
    #[error("invalid test fold `{0}`, expected `official` or 0-4")]
    InvalidTestFold(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(ValueEnum, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[value(rename_all = "snake_case")]
pub enum OptimizerKind {
    Adam,
    Sgd,
}

#[derive(ValueEnum, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[value(rename_all = "snake_case")]
pub enum ClassSplit {
    /// normal, crackles, wheezes, both
    Lungsound,
    /// healthy, chronic diseases, non-chronic diseases
    Diagnosis,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestFold {
    /// The official 60/40 challenge split.
    Official,
    /// One of the five patient folds, used as the test set.
    Fold(u8),
}

impl FromStr for TestFold {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "official" => Ok(TestFold::Official),
            fold => match fold.parse::<u8>() {
                Ok(k) if k < 5 => Ok(TestFold::Fold(k)),
                _ => Err(ConfigError::InvalidTestFold(fold.to_string())),
            },
        }
    }
}

#[derive(ValueEnum, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[value(rename_all = "snake_case")]
pub enum PadType {
    Zero,
    Repeat,
}

#[derive(ValueEnum, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[value(rename_all = "snake_case")]
pub enum MaskValue {
    Mean,
    Zero,
}

#[derive(ValueEnum, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[value(rename_all = "snake_case")]
pub enum ModelKind {
    Ast,
    Ssast,
}

#[derive(ValueEnum, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[value(rename_all = "snake_case")]
pub enum SsastTask {
    FtAvgtok,
    FtCls,
}

#[derive(ValueEnum, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[value(rename_all = "snake_case")]
pub enum Method {
    Ce,
    Patchmix,
    PatchmixCl,
}

impl Method {
    pub fn name(&self) -> &'static str {
        match self {
            Method::Ce => "ce",
            Method::Patchmix => "patchmix",
            Method::PatchmixCl => "patchmix_cl",
        }
    }
}

#[derive(ValueEnum, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[value(rename_all = "snake_case")]
pub enum LossKind {
    Ce,
    CbSigmoid,
    CbSoftmax,
    CbFocal,
}

#[derive(ValueEnum, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[value(rename_all = "snake_case")]
pub enum NegativePair {
    All,
    DiffLabel,
}

#[derive(ValueEnum, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[value(rename_all = "snake_case")]
pub enum TargetType {
    GradBlock,
    GradFlow,
    ProjectBlock,
    ProjectFlow,
}

impl TargetType {
    pub fn blocks_gradient(&self) -> bool {
        matches!(self, TargetType::GradBlock | TargetType::ProjectBlock)
    }

    pub fn projects_target(&self) -> bool {
        matches!(self, TargetType::ProjectBlock | TargetType::ProjectFlow)
    }
}

#[derive(ValueEnum, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[value(rename_all = "snake_case")]
pub enum BackendKind {
    Ndarray,
    Wgpu,
}

#[derive(Parser, Serialize, Deserialize, Debug, Clone)]
#[command(
    name = "lungsound",
    about = "Respiratory sound classification on ICBHI",
    rename_all = "snake_case"
)]
pub struct TrainArgs {
    #[arg(long, default_value_t = 1)]
    pub seed: u64,
    #[arg(long, default_value = "./save/my_split/")]
    pub save_dir: PathBuf,
    /// Tag for the experiment name.
    #[arg(long, default_value = "bs8_lr5e-5_ep50_seed1")]
    pub tag: String,
    /// Checkpoint to resume from.
    #[arg(long)]
    pub resume: Option<PathBuf>,
    /// Only evaluate the (pretrained) model.
    #[arg(long)]
    pub eval: bool,
    /// Evaluate normal vs abnormal only.
    #[arg(long)]
    pub two_cls_eval: bool,

    #[arg(long, value_enum, default_value_t = OptimizerKind::Adam)]
    pub optimizer: OptimizerKind,
    #[arg(long, default_value_t = 1)]
    pub epochs: usize,
    #[arg(long, default_value_t = 5e-5)]
    pub learning_rate: f64,
    #[arg(long, default_value = "120,160")]
    pub lr_decay_epochs: String,
    #[arg(long, default_value_t = 0.1)]
    pub lr_decay_rate: f64,
    #[arg(long, default_value_t = 1e-6)]
    pub weight_decay: f64,
    #[arg(long, default_value_t = 0.9)]
    pub momentum: f64,
    /// Cosine annealing instead of step decay.
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub cosine: bool,
    /// Warm-up for large batch training.
    #[arg(long)]
    pub warm: bool,
    #[arg(long, default_value_t = 0)]
    pub warm_epochs: usize,
    /// Cross entropy weighted by inverse class frequency.
    #[arg(long)]
    pub weighted_loss: bool,
    /// Patch-Mix interpolation coefficient.
    #[arg(long, default_value_t = 1.0)]
    pub mix_beta: f64,
    /// Patch-Mix over whole time columns.
    #[arg(long)]
    pub time_domain: bool,

    #[arg(long, default_value = "icbhi")]
    pub dataset: String,
    #[arg(long, default_value = "./data/icbhi_dataset/audio_test_data/")]
    pub data_folder: PathBuf,
    #[arg(long, default_value_t = 1)]
    pub batch_size: usize,
    #[arg(long, default_value_t = 8)]
    pub num_workers: usize,
    #[arg(long, value_enum, default_value_t = ClassSplit::Lungsound)]
    pub class_split: ClassSplit,
    #[arg(long, default_value_t = 4)]
    pub n_cls: usize,
    /// `official` 60-40 split, or a patient fold 0-4.
    #[arg(long, default_value = "official")]
    pub test_fold: TestFold,
    /// Sample inversely proportional to the class ratio.
    #[arg(long)]
    pub weighted_sampler: bool,
    /// Stethoscope device id, -1 keeps every device.
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    pub stetho_id: i32,
    #[arg(long, default_value_t = 16_000)]
    pub sample_rate: u32,
    /// Fixed cycle length in seconds.
    #[arg(long, default_value_t = 8)]
    pub desired_length: usize,
    #[arg(long, default_value_t = 1024)]
    pub nfft: usize,
    #[arg(long, default_value_t = 128)]
    pub n_mels: usize,
    #[arg(long, value_enum, default_value_t = PadType::Repeat)]
    pub pad_types: PadType,
    /// Resize scale of the mel spectrogram.
    #[arg(long, default_value_t = 1.0)]
    pub resz: f64,
    #[arg(long, default_value_t = 1024)]
    pub spec_height: usize,
    #[arg(long, default_value_t = 256)]
    pub spec_width: usize,
    #[arg(long, default_value = "icbhi_ast_sup")]
    pub specaug_policy: String,
    #[arg(long, value_enum, default_value_t = MaskValue::Mean)]
    pub specaug_mask: MaskValue,

    #[arg(long, value_enum, default_value_t = ModelKind::Ast)]
    pub model: ModelKind,
    #[arg(long)]
    pub pretrained: bool,
    #[arg(long, default_value = "./save/16/icbhi_ast_ce_bs8_lr5e-5_ep50_seed1/best")]
    pub pretrained_ckpt: PathBuf,
    #[arg(long, default_value_t = 16)]
    pub patch_size: usize,
    #[arg(long, value_enum, default_value_t = SsastTask::FtAvgtok)]
    pub ssast_task: SsastTask,
    #[arg(long, default_value_t = 16)]
    pub fshape: usize,
    #[arg(long, default_value_t = 16)]
    pub tshape: usize,
    #[arg(long, default_value_t = 10)]
    pub fstride: usize,
    #[arg(long, default_value_t = 10)]
    pub tstride: usize,
    #[arg(long, default_value_t = 768)]
    pub embed_dim: usize,
    #[arg(long, default_value_t = 12)]
    pub depth: usize,
    #[arg(long, default_value_t = 12)]
    pub num_heads: usize,
    /// Fuse a convolutional raw-audio encoder into the pooled feature.
    #[arg(long)]
    pub waveform_branch: bool,

    #[arg(long, value_enum, default_value_t = Method::Ce)]
    pub method: Method,
    #[arg(long, value_enum, default_value_t = LossKind::Ce)]
    pub loss: LossKind,
    #[arg(long, default_value_t = 0.9999)]
    pub cb_beta: f64,
    #[arg(long, default_value_t = 2.0)]
    pub cb_gamma: f32,

    #[arg(long, default_value_t = 768)]
    pub proj_dim: usize,
    #[arg(long, default_value_t = 0.06)]
    pub temperature: f32,
    #[arg(long, default_value_t = 1.0)]
    pub alpha: f32,
    #[arg(long, value_enum, default_value_t = NegativePair::All)]
    pub negative_pair: NegativePair,
    #[arg(long, value_enum, default_value_t = TargetType::GradBlock)]
    pub target_type: TargetType,

    /// Root directory of feature dumps.
    #[arg(long, default_value = ".")]
    pub export_dir: PathBuf,
    #[arg(long, value_enum, default_value_t = BackendKind::Wgpu)]
    pub backend: BackendKind,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Warmup {
    pub from: f64,
    pub to: f64,
    pub epochs: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ExperimentConfig {
    #[serde(flatten)]
    pub args: TrainArgs,
    pub lr_decay_milestones: Vec<usize>,
    pub model_name: String,
    pub save_folder: PathBuf,
    pub warmup: Option<Warmup>,
    pub cls_list: Vec<String>,
}

impl ExperimentConfig {
    /// Derives every dependent setting from the raw arguments. Touches no files.
    pub fn resolve(mut args: TrainArgs) -> Result<Self, ConfigError> {
        let lr_decay_milestones = args
            .lr_decay_epochs
            .split(',')
            .map(str::trim)
            .filter(|it| !it.is_empty())
            .map(|it| {
                it.parse::<usize>()
                    .map_err(|_| ConfigError::InvalidDecayEpoch(it.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut model_name = format!(
            "{}_{}_{}",
            args.dataset,
            model_label(args.model),
            args.method.name()
        );
        if !args.tag.is_empty() {
            model_name = format!("{model_name}_{}", args.tag);
        }
        let save_folder = args.save_dir.join(&model_name);

        SpecAugmentPolicy::from_name(&args.specaug_policy)?;

        let warmup = if args.warm {
            args.warm_epochs = 10;
            let from = args.learning_rate * 0.1;
            let to = if args.cosine {
                let eta_min = args.learning_rate * args.lr_decay_rate.powi(3);
                eta_min
                    + (args.learning_rate - eta_min)
                        * (1.0 + (PI * args.warm_epochs as f64 / args.epochs as f64).cos())
                        / 2.0
            } else {
                args.learning_rate
            };
            Some(Warmup {
                from,
                to,
                epochs: args.warm_epochs,
            })
        } else {
            None
        };

        if args.method == Method::PatchmixCl
            && !args.target_type.projects_target()
            && args.proj_dim != args.embed_dim
        {
            return Err(ConfigError::ProjectionMismatch {
                target: args.target_type,
                proj_dim: args.proj_dim,
                embed_dim: args.embed_dim,
            });
        }

        if args.dataset != "icbhi" {
            return Err(ConfigError::UnsupportedDataset(args.dataset));
        }

        let cls_list: &[&str] = match (args.class_split, args.n_cls) {
            (ClassSplit::Lungsound, 4) => &["normal", "crackle", "wheeze", "both"],
            (ClassSplit::Lungsound, 2) => &["normal", "abnormal"],
            (ClassSplit::Diagnosis, 3) => &["healthy", "chronic_diseases", "non-chronic_diseases"],
            (ClassSplit::Diagnosis, 2) => &["healthy", "unhealthy"],
            (split, n_cls) => return Err(ConfigError::UnsupportedClassSplit { split, n_cls }),
        };

        Ok(Self {
            args,
            lr_decay_milestones,
            model_name,
            save_folder,
            warmup,
            cls_list: cls_list.iter().map(|it| it.to_string()).collect(),
        })
    }

    /// Creates the experiment folder and records the resolved arguments in it.
    pub fn prepare(&self) -> Result<(), ConfigError> {
        fs::create_dir_all(&self.save_folder)?;
        let path = self.save_folder.join("train_args.json");
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        info!(path = %path.display(), "wrote experiment arguments");
        Ok(())
    }

    pub fn n_cls(&self) -> usize {
        self.args.n_cls
    }

    pub fn image_dims(&self) -> [usize; 2] {
        [
            (self.args.spec_height as f64 * self.args.resz) as usize,
            (self.args.spec_width as f64 * self.args.resz) as usize,
        ]
    }

    pub fn cycle_len(&self) -> usize {
        self.args.desired_length * self.args.sample_rate as usize
    }
}

fn model_label(model: ModelKind) -> &'static str {
    match model {
        ModelKind::Ast => "ast",
        ModelKind::Ssast => "ssast",
    }
}
