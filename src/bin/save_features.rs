#![recursion_limit = "256"]

use burn::backend::ndarray::NdArrayDevice;
use burn::backend::wgpu::WgpuDevice;
use burn::backend::{NdArray, Wgpu};
use clap::Parser;

use lungsound::config::{BackendKind, ExperimentConfig, TrainArgs};

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    lungsound::install_tracing();

    let config = ExperimentConfig::resolve(TrainArgs::parse())?;

    match config.args.backend {
        BackendKind::Wgpu => lungsound::export::run::<Wgpu>(config, WgpuDevice::default()),
        BackendKind::Ndarray => lungsound::export::run::<NdArray>(config, NdArrayDevice::Cpu),
    }
}
