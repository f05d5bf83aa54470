use crate::commands::run::RunArgs;
use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use stevedore_core::driver::DriverKind;
use stevedore_core::logging::LOG_FILTER_ENV;
use stevedore_core::settings::Settings;

/// Driver selection options
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq)]
pub enum DriverOption {
    /// Engine CLI subprocesses
    Cli,
    /// Engine API over the engine socket
    Native,
}

impl From<DriverOption> for DriverKind {
    fn from(driver: DriverOption) -> Self {
        match driver {
            DriverOption::Cli => DriverKind::Cli,
            DriverOption::Native => DriverKind::Native,
        }
    }
}

/// Log format options
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormat {
    /// Human-readable text format
    Text,
    /// JSON structured format
    Json,
}

/// Log level options
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogLevel {
    /// Error messages only
    Error,
    /// Warning and error messages
    Warn,
    /// Informational messages and above
    Info,
    /// Debug messages and above
    Debug,
    /// All messages including trace
    Trace,
}

impl LogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

/// Options shared by all subcommands once settings are loaded
#[derive(Debug, Clone)]
pub struct CliContext {
    /// Driver requested on the command line
    pub driver: Option<DriverKind>,
    pub settings: Settings,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check that the container engine answers
    Ping,
    /// Provision the containers of one build, run commands in them, then clean up
    ///
    /// Checkout commands run in the checkout container; the build command runs
    /// in the work container after its sidecars are up. The build command's
    /// exit code becomes stevedore's exit code.
    Run {
        /// Container-set specification file (TOML)
        #[arg(long, value_name = "PATH")]
        spec: PathBuf,

        /// Host directory Dockerfile build contexts are relative to
        #[arg(long, value_name = "PATH", default_value = ".")]
        workspace: PathBuf,

        /// Command run in the checkout container before the build phase (repeatable)
        #[arg(long = "checkout", value_name = "COMMAND")]
        checkout: Vec<String>,

        /// Environment variable for every command (KEY=VALUE, repeatable)
        #[arg(long = "env", short = 'e', value_name = "KEY=VALUE")]
        env: Vec<String>,

        /// Working directory inside the containers
        #[arg(long, value_name = "DIR")]
        workdir: Option<String>,

        /// File recording the agent container and volume reused by the next run
        #[arg(long, value_name = "PATH")]
        state: Option<PathBuf>,

        /// Build command and its arguments
        #[arg(trailing_var_arg = true, required = true, value_name = "COMMAND")]
        command: Vec<String>,
    },
}

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version,
    about = "Container provisioning for CI builds",
    long_about = "Container provisioning for CI builds\n\nRuns each build in a set of engine containers sharing one agent's workspace volume and network.",
    color = clap::ColorChoice::Auto
)]
pub struct Cli {
    /// Log format (text or json, defaults to text, can be set via STEVEDORE_LOG_FORMAT env var)
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Log level
    #[arg(long, global = true, value_enum, default_value = "info")]
    pub log_level: LogLevel,

    /// Engine driver (cli or native, can be set via STEVEDORE_DRIVER env var)
    #[arg(long, global = true, value_enum)]
    pub driver: Option<DriverOption>,

    /// Settings file path
    #[arg(long, global = true, value_name = "PATH")]
    pub settings: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    pub async fn dispatch(self) -> Result<ExitCode> {
        let log_format = self.log_format.map(|format| match format {
            LogFormat::Text => "text",
            LogFormat::Json => "json",
        });

        // Explicit filters in the environment win over --log-level
        let level = self.log_level.as_str();
        let filter = if std::env::var_os(LOG_FILTER_ENV).is_none()
            && std::env::var_os("RUST_LOG").is_none()
        {
            Some(format!("stevedore={},stevedore_core={}", level, level))
        } else {
            None
        };
        stevedore_core::logging::init(log_format, filter.as_deref())?;
        tracing::debug!("CLI initialized with log level: {}", level);

        let Some(command) = self.command else {
            Cli::command().print_help()?;
            return Ok(ExitCode::SUCCESS);
        };

        let context = CliContext {
            driver: self.driver.map(Into::into),
            settings: Settings::load(self.settings.as_deref())?,
        };

        match command {
            Commands::Ping => crate::commands::ping::execute(&context).await,
            Commands::Run {
                spec,
                workspace,
                checkout,
                env,
                workdir,
                state,
                command,
            } => {
                let args = RunArgs {
                    spec,
                    workspace,
                    checkout,
                    env,
                    workdir,
                    state,
                    command,
                };
                crate::commands::run::execute(&context, args).await
            }
        }
    }
}
