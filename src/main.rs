// loglens server binary
//
// Two subcommands, one process each:
// - `loglens collector` receives log batches and writes them to PostgreSQL
// - `loglens analysis` answers natural-language questions over the store
//
// Both serve until Ctrl+C, then shut down gracefully so in-flight requests
// finish and the pool closes cleanly.

mod cli;

use anyhow::Result;
use clap::Parser;
use loglens::config::{AnalysisConfig, CollectorConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    // Precedence: RUST_LOG env var > built-in default
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "loglens=info,tower_http=info,axum=info".into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Graceful shutdown: Ctrl+C fires a oneshot the server is waiting on
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

    let mut server = match cli.command {
        cli::Command::Collector => {
            let config = CollectorConfig::from_env();
            tracing::info!("starting collector (bind: {})", config.bind_addr);
            tokio::spawn(async move { loglens::collector::run(config, shutdown_rx).await })
        }
        cli::Command::Analysis => {
            let config = AnalysisConfig::from_env();
            tracing::info!("starting analysis server (bind: {})", config.bind_addr);
            tokio::spawn(async move { loglens::analysis::run(config, shutdown_rx).await })
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            // If the send fails the server already exited on its own
            let _ = shutdown_tx.send(());
            server.await??;
        }
        // Startup failure (e.g. the pool never came up) must not leave the
        // process hanging on Ctrl+C
        result = &mut server => result??,
    }

    tracing::info!("shutdown complete");
    Ok(())
}
