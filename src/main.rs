mod cli;
mod engine;
mod error;
mod model;
mod orchestrator;
mod presets;
mod protocol;
mod summary;
#[cfg(feature = "tui")]
mod tui;

use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let is_tui = args.uses_tui();
    cli::init_tracing(is_tui);
    tracing::debug!(?args, "starting");

    let succeeded = cli::run(args).await?;
    // The TUI exits normally whatever the last run did; scripted modes report it.
    if !is_tui && !succeeded {
        std::process::exit(1);
    }
    Ok(())
}
