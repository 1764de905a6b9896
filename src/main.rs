mod app;
mod backend;
mod cli;
mod config;
mod model;
mod requester;
mod storage;
mod tier;
mod ui;
mod validate;
mod watcher;

use anyhow::Result;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Logs go to stderr so they never interleave with the countdown line.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "lightcat=warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    app::run().await
}
