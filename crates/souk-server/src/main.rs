//! # Souk Server
//!
//! Worker process entry point: loads configuration, initializes tracing and
//! runs the dispatcher, health monitor, scheduler and HTTP surface until
//! Ctrl+C or SIGTERM.

use souk_config::ConfigLoader;
use souk_core::{init_telemetry, shutdown_telemetry, SoukResult};
use souk_server::{app::AppBuilder, startup::print_banner};
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(()) => 0,
        Err(e) => {
            error!("Application error: {}", e);
            eprintln!("{}", e);
            1
        }
    };
    shutdown_telemetry();
    std::process::exit(code);
}

async fn run() -> SoukResult<()> {
    let config_loader = ConfigLoader::from_default_location()?;
    let config = config_loader.get().await;

    init_telemetry(&config.telemetry_config())?;

    print_banner();
    info!("Starting Souk Server...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Environment: {}", config.app.environment);

    AppBuilder::new()
        .with_config(config)
        .run(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown...");
        }
    }
}
