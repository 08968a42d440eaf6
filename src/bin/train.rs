#![recursion_limit = "256"]

use burn::backend::ndarray::NdArrayDevice;
use burn::backend::wgpu::WgpuDevice;
use burn::backend::{Autodiff, NdArray, Wgpu};
use clap::Parser;

use lungsound::config::{BackendKind, ExperimentConfig, TrainArgs};

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    lungsound::install_tracing();

    let config = ExperimentConfig::resolve(TrainArgs::parse())?;

    match config.args.backend {
        BackendKind::Wgpu => lungsound::train::run::<Autodiff<Wgpu>>(config, WgpuDevice::default()),
        BackendKind::Ndarray => lungsound::train::run::<Autodiff<NdArray>>(config, NdArrayDevice::Cpu),
    }
}
