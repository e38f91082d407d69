//! ragpipe CLI: permission-aware retrieval-augmented answering.
//!
//! Runs a query through a configurable RAG pipeline against the configured
//! search and generation services, and exposes the individual engines for
//! inspection.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
