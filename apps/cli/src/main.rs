//! Librarian CLI: operate the processing and enrichment queues, crawler
//! runs and schedules of a local knowledge library.

mod commands;
mod services;

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
