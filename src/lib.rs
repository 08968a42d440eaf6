pub mod augment;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod export;
pub mod io;
pub mod loss;
pub mod metric;
pub mod model;
pub mod ops;
pub mod pad;
pub mod spectrogram;
pub mod train;

use tracing_subscriber::EnvFilter;

/// Installs the fmt subscriber used by the binaries, filtered by `RUST_LOG` or
/// `lungsound=info` when it is unset.
pub fn install_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lungsound=info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
