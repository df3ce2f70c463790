use std::process::ExitCode;

use ledger_scan_ingester::config::Settings;
use ledger_scan_ingester::engine::Engine;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let settings = match Settings::load() {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("failed to load configuration: {:?}", e);
            return ExitCode::FAILURE;
        }
    };

    let engine = match Engine::new(settings) {
        Ok(e) => e,
        Err(e) => {
            tracing::error!("failed to construct engine: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    tokio::select! {
        result = engine.run() => {
            match result {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    tracing::error!("fatal error: {:#}", e);
                    if let Err(shutdown_err) = engine.shutdown().await {
                        tracing::error!("error during shutdown after fatal error: {:#}", shutdown_err);
                    }
                    ExitCode::FAILURE
                }
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("received shutdown signal, flushing and exiting gracefully");
            match engine.shutdown().await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    tracing::error!("error during graceful shutdown: {:#}", e);
                    ExitCode::FAILURE
                }
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
