//! Standalone sync server.
//!
//! Configured entirely through the environment (see `logos_sync::config`);
//! logging through `RUST_LOG`.

use log::{error, info};
use logos_sync::{ServerConfig, SyncServer};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!("Starting Logos sync server...");
    let server = match SyncServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start: {e}");
            return ExitCode::FAILURE;
        }
    };
    let listener = match server.bind().await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {e}", server.config().bind_addr());
            return ExitCode::FAILURE;
        }
    };

    tokio::select! {
        result = server.serve(listener) => {
            if let Err(e) = result {
                error!("Server stopped: {e}");
                return ExitCode::FAILURE;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            server.flush().await;
        }
    }
    ExitCode::SUCCESS
}
