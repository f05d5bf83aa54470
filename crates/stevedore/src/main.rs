use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;

mod cli;
mod commands;
mod driver_utils;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments
    let parsed = cli::Cli::parse();

    // A build command's non-zero exit code is passed through, not an error
    parsed.dispatch().await
}
