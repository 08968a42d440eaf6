use burn::config::Config;
use burn::module::{Ignored, Module, Param};
use burn::nn::transformer::{TransformerEncoder, TransformerEncoderConfig, TransformerEncoderInput};
use burn::nn::{Dropout, DropoutConfig, LayerNorm, LayerNormConfig, Linear, LinearConfig};
use burn::prelude::Backend;
use burn::tensor::{Distribution, Tensor};
use serde::{Deserialize, Serialize};

use crate::config::{ExperimentConfig, ModelKind, SsastTask};
use crate::model::extractor::{WaveformEncoder, WaveformEncoderConfig};
use crate::model::patch::{PatchEmbed, PatchEmbedConfig};
use crate::model::patchmix::PatchMixPlan;

pub mod extractor;
pub mod patch;
pub mod patchmix;
pub mod projection;

const TOKEN_INIT: Distribution = Distribution::Normal(0.0, 0.02);

/// How the encoder output is reduced to one feature vector.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenPooling {
    /// Mean of the class and distillation tokens.
    ClsDist,
    Cls,
    /// Mean over patch tokens.
    MeanPatch,
}

impl TokenPooling {
    pub fn prefix_tokens(&self) -> usize {
        match self {
            TokenPooling::ClsDist => 2,
            TokenPooling::Cls | TokenPooling::MeanPatch => 1,
        }
    }
}

#[derive(Config, Debug)]
pub struct SpectrogramTransformerConfig {
    pub n_cls: usize,
    /// Mel bins of the resized input image.
    pub input_fdim: usize,
    /// Frames of the resized input image.
    pub input_tdim: usize,
    #[config(default = 768)]
    pub embed_dim: usize,
    #[config(default = 12)]
    pub depth: usize,
    #[config(default = 12)]
    pub num_heads: usize,
    #[config(default = 4)]
    pub mlp_ratio: usize,
    #[config(default = 16)]
    pub fshape: usize,
    #[config(default = 16)]
    pub tshape: usize,
    #[config(default = 10)]
    pub fstride: usize,
    #[config(default = 10)]
    pub tstride: usize,
    #[config(default = "TokenPooling::ClsDist")]
    pub pooling: TokenPooling,
    #[config(default = 0.0)]
    pub dropout: f64,
    pub waveform: Option<WaveformEncoderConfig>,
}

impl SpectrogramTransformerConfig {
    pub fn from_experiment(config: &ExperimentConfig) -> Self {
        let args = &config.args;
        let [input_tdim, input_fdim] = config.image_dims();

        let (fshape, tshape, pooling) = match args.model {
            ModelKind::Ast => (args.patch_size, args.patch_size, TokenPooling::ClsDist),
            ModelKind::Ssast => (
                args.fshape,
                args.tshape,
                match args.ssast_task {
                    SsastTask::FtAvgtok => TokenPooling::MeanPatch,
                    SsastTask::FtCls => TokenPooling::Cls,
                },
            ),
        };

        Self::new(config.n_cls(), input_fdim, input_tdim)
            .with_embed_dim(args.embed_dim)
            .with_depth(args.depth)
            .with_num_heads(args.num_heads)
            .with_fshape(fshape)
            .with_tshape(tshape)
            .with_fstride(args.fstride)
            .with_tstride(args.tstride)
            .with_pooling(pooling)
            .with_waveform(args.waveform_branch.then(WaveformEncoderConfig::new))
    }

    fn patch_embed(&self) -> PatchEmbedConfig {
        PatchEmbedConfig::new(
            self.embed_dim,
            [self.fshape, self.tshape],
            [self.fstride, self.tstride],
        )
    }

    /// `[frequency, time]` layout of the patch tokens.
    pub fn patch_grid(&self) -> [usize; 2] {
        self.patch_embed().grid([self.input_fdim, self.input_tdim])
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> SpectrogramTransformer<B> {
        let [f_dim, t_dim] = self.patch_grid();
        let num_prefix = self.pooling.prefix_tokens();

        SpectrogramTransformer {
            patch_embed: self.patch_embed().init(device),
            prefix_tokens: Param::from_tensor(Tensor::random([1, num_prefix, self.embed_dim], TOKEN_INIT, device)),
            pos_embed: Param::from_tensor(Tensor::random(
                [1, num_prefix + f_dim * t_dim, self.embed_dim],
                TOKEN_INIT,
                device,
            )),
            pos_dropout: DropoutConfig::new(self.dropout).init(),
            encoder: TransformerEncoderConfig::new(
                self.embed_dim,
                self.embed_dim * self.mlp_ratio,
                self.num_heads,
                self.depth,
            )
            .with_dropout(self.dropout)
            .with_norm_first(true)
            .init(device),
            norm: LayerNormConfig::new(self.embed_dim).init(device),
            head_norm: LayerNormConfig::new(self.embed_dim).init(device),
            head: LinearConfig::new(self.embed_dim, self.n_cls).init(device),
            waveform: self
                .waveform
                .as_ref()
                .map(|waveform| waveform.init(self.embed_dim, device)),
            pooling: Ignored(self.pooling),
            grid: Ignored([f_dim, t_dim]),
        }
    }
}

/// Audio Spectrogram Transformer with an optional raw-audio branch.
#[derive(Module, Debug)]
pub struct SpectrogramTransformer<B: Backend> {
    patch_embed: PatchEmbed<B>,
    prefix_tokens: Param<Tensor<B, 3>>,
    pos_embed: Param<Tensor<B, 3>>,
    pos_dropout: Dropout,
    encoder: TransformerEncoder<B>,
    norm: LayerNorm<B>,
    head_norm: LayerNorm<B>,
    head: Linear<B>,
    waveform: Option<WaveformEncoder<B>>,
    pooling: Ignored<TokenPooling>,
    grid: Ignored<[usize; 2]>,
}

impl<B: Backend> SpectrogramTransformer<B> {
    pub fn patch_grid(&self) -> [usize; 2] {
        self.grid.0
    }

    pub fn embed_dim(&self) -> usize {
        self.prefix_tokens.dims()[2]
    }

    fn encode(&self, patches: Tensor<B, 3>) -> Tensor<B, 2> {
        let [batch, _, dim] = patches.dims();
        let num_prefix = self.pooling.0.prefix_tokens();

        let prefix = self.prefix_tokens.val().expand([batch, num_prefix, dim]);
        let tokens = Tensor::cat(vec![prefix, patches], 1) + self.pos_embed.val();
        let tokens = self.pos_dropout.forward(tokens);

        let hidden = self.encoder.forward(TransformerEncoderInput::new(tokens));
        let hidden = self.norm.forward(hidden);
        let [_, seq, _] = hidden.dims();

        match self.pooling.0 {
            TokenPooling::ClsDist => hidden.slice([0..batch, 0..2, 0..dim]).mean_dim(1),
            TokenPooling::Cls => hidden.slice([0..batch, 0..1, 0..dim]),
            TokenPooling::MeanPatch => hidden.slice([0..batch, num_prefix..seq, 0..dim]).mean_dim(1),
        }
        .squeeze::<2>(1)
    }

    /// Pooled features `B x D` of spectrogram images `B x 1 x T x F` and raw audio `B x L`.
    pub fn forward(&self, images: Tensor<B, 4>, audio: Tensor<B, 2>) -> Tensor<B, 2> {
        let features = self.encode(self.patch_embed.forward(images));

        match &self.waveform {
            Some(waveform) => features + waveform.forward(audio),
            None => features,
        }
    }

    /// Like [`forward`](Self::forward), with the patch tokens mixed according to `plan`.
    /// The waveform feature is interpolated with the same `lam`.
    pub fn forward_mixed(
        &self,
        images: Tensor<B, 4>,
        audio: Tensor<B, 2>,
        plan: &PatchMixPlan,
    ) -> Tensor<B, 2> {
        let patches = plan.apply(self.patch_embed.forward(images));
        let features = self.encode(patches);

        match &self.waveform {
            Some(waveform) => {
                let audio_features = waveform.forward(audio);
                let shuffled = audio_features
                    .clone()
                    .select(0, plan.index_tensor(&audio_features.device()));
                features + audio_features * plan.lam + shuffled * (1.0 - plan.lam)
            }
            None => features,
        }
    }

    pub fn classify(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        self.head.forward(self.head_norm.forward(features))
    }
}
