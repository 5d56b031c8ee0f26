//! epgsync CLI — refresh EPG guides and publish them to git.
//!
//! Runs the external grabber once per configured region, commits changed
//! guides to the output repository, and starts the containerised setup.

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
