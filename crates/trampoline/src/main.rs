//! In-container helper for work containers
//!
//! * `trampoline wait` idles as the container's main process until the engine
//!   stops the container.
//! * `trampoline cdexec <dir> <cmd...>` changes to `dir` and replaces itself
//!   with `cmd`, so exec'ed build steps get a working directory without
//!   relying on a shell in the image.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitCode};

#[derive(Parser, Debug)]
#[command(name = "trampoline", version, about = "Helper injected into build containers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Idle until terminated
    Wait,
    /// Run a command in a directory
    Cdexec {
        /// Working directory for the command
        dir: PathBuf,
        /// Program and its arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
}

fn main() -> Result<ExitCode> {
    match Cli::parse().command {
        Commands::Wait => {
            wait_for_termination()?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Cdexec { dir, command } => cdexec(&dir, &command),
    }
}

fn wait_for_termination() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start signal runtime")?;
    runtime.block_on(async {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        let mut interrupt = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = terminate.recv() => {}
            _ = interrupt.recv() => {}
        }
        Ok::<(), std::io::Error>(())
    })
    .context("Failed to install signal handlers")
}

/// Only returns when the exec itself failed; 127 when the program is missing
fn cdexec(dir: &Path, command: &[String]) -> Result<ExitCode> {
    if !dir.is_dir() {
        bail!("{} is not a directory", dir.display());
    }
    let Some((program, args)) = command.split_first() else {
        bail!("No command given");
    };

    let err = Command::new(program).args(args).current_dir(dir).exec();
    eprintln!("trampoline: cannot run {}: {}", program, err);
    Ok(ExitCode::from(match err.kind() {
        std::io::ErrorKind::NotFound => 127,
        _ => 126,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cdexec_keeps_hyphenated_arguments() {
        let cli = Cli::try_parse_from(["trampoline", "cdexec", "/src", "ls", "-la", "--color"])
            .unwrap();
        match cli.command {
            Commands::Cdexec { dir, command } => {
                assert_eq!(dir, PathBuf::from("/src"));
                assert_eq!(command, vec!["ls", "-la", "--color"]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_cdexec_requires_command() {
        assert!(Cli::try_parse_from(["trampoline", "cdexec", "/src"]).is_err());
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }
}
