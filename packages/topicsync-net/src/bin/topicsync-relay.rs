//! Standalone relay.
//!
//! Usage: `topicsync-relay [config.toml]`. `TOPICSYNC_*` variables override
//! the file; `RUST_LOG` controls logging.

use std::path::PathBuf;
use std::process::ExitCode;

use topicsync_net::{RelayServer, SyncConfig};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = match SyncConfig::load(path.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!("{err}");
            return ExitCode::FAILURE;
        }
    };

    match RelayServer::new(&config).run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("relay stopped: {err}");
            ExitCode::FAILURE
        }
    }
}
