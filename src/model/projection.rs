use burn::config::Config;
use burn::module::Module;
use burn::nn::{Linear, LinearConfig, Relu};
use burn::prelude::Backend;
use burn::tensor::Tensor;

/// Contrastive head used by Patch-Mix CL.
#[derive(Module, Debug)]
pub struct Projector<B: Backend> {
    linear: Linear<B>,
    activation: Relu,
    projection: Linear<B>,
}

#[derive(Config)]
pub struct ProjectorConfig {
    pub input_dim: usize,
    pub proj_dim: usize,
}

impl ProjectorConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Projector<B> {
        Projector {
            linear: LinearConfig::new(self.input_dim, self.proj_dim).init(device),
            activation: Relu::new(),
            projection: LinearConfig::new(self.proj_dim, self.proj_dim).init(device),
        }
    }
}

impl<B: Backend> Projector<B> {
    pub fn forward(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        let hidden = self.linear.forward(features);
        let hidden = self.activation.forward(hidden);
        self.projection.forward(hidden)
    }
}
