//! tags-lsp - language server entry point

use std::fs::OpenOptions;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tags_lsp::config::{Cli, ServerConfig};
use tags_lsp::session::Session;
use tags_lsp::{methods, Engine, RunOutcome};

fn main() -> Result<()> {
    let config = ServerConfig::from(Cli::parse());

    init_logging(&config)?;
    tracing::info!("Starting tags-lsp v{}", env!("CARGO_PKG_VERSION"));

    // Handlers run on the dispatch queue's own threads; the I/O loop only
    // needs one.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start I/O runtime")?;

    let result = runtime.block_on(serve(&config));
    // A pending stdin read would block an orderly runtime drop
    runtime.shutdown_background();

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!("Fatal: {:#}", e);
            return Err(e);
        }
    };

    tracing::info!("tags-lsp exiting with code {}", outcome.exit_code());
    std::process::exit(outcome.exit_code());
}

async fn serve(config: &ServerConfig) -> Result<RunOutcome> {
    let connection = config
        .transport
        .connect_with_retry(config.connect_retries)
        .await?;

    let registry = methods::registry(Arc::new(Session::new()), config.index_command.clone());
    let engine = Engine::new(registry, config.engine.clone())?;

    let outcome = engine.run(connection.reader, connection.writer).await?;
    Ok(outcome)
}

/// Logs never go to stdout, which may be the protocol stream.
fn init_logging(config: &ServerConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "tags_lsp=info".into()),
    );

    let (file_layer, stderr_layer) = match &config.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            let layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(file));
            (Some(layer), None)
        }
        None => {
            let layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr);
            (None, Some(layer))
        }
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .init();
    Ok(())
}
