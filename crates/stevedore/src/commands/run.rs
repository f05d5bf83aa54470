//! One build end to end: provision, checkout, build, clean

use crate::cli::CliContext;
use crate::driver_utils::create_driver_from_context;
use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use stevedore_core::driver::Driver;
use stevedore_core::process::{AgentChannel, ProcStarter};
use stevedore_core::provisioner::Provisioner;
use stevedore_core::session::{CarryOver, SessionState};
use stevedore_core::spec::ContainerSetSpec;
use tracing::{debug, info, instrument, warn};

/// Arguments of `stevedore run`
#[derive(Debug, Clone)]
pub struct RunArgs {
    pub spec: PathBuf,
    pub workspace: PathBuf,
    pub checkout: Vec<String>,
    pub env: Vec<String>,
    pub workdir: Option<String>,
    pub state: Option<PathBuf>,
    pub command: Vec<String>,
}

/// Commands and environment prepared before any container exists
struct BuildPlan {
    checkout: Vec<Vec<String>>,
    command: Vec<String>,
    envs: Vec<(String, String)>,
    workdir: Option<String>,
}

#[instrument(skip_all, fields(spec = %args.spec.display()))]
pub async fn execute(context: &CliContext, args: RunArgs) -> Result<ExitCode> {
    let spec = ContainerSetSpec::from_file(&args.spec)?;
    let plan = BuildPlan {
        checkout: args
            .checkout
            .iter()
            .map(|line| {
                shell_words::split(line)
                    .with_context(|| format!("Invalid checkout command '{}'", line))
            })
            .collect::<Result<_>>()?,
        command: args.command.clone(),
        envs: parse_env_pairs(&args.env)?,
        workdir: args.workdir.clone(),
    };
    let carry_over = match &args.state {
        Some(path) => load_state(path)?,
        None => None,
    };

    let driver = create_driver_from_context(context)?;
    let mut provisioner = Provisioner::new(
        driver,
        spec,
        SessionState::new(carry_over),
        context.settings.clone(),
    )
    .await?
    .with_workspace(&args.workspace);

    let outcome = run_build(&mut provisioner, &plan).await;
    let cleaned = provisioner.clean().await;
    if let Some(path) = &args.state {
        save_state(path, &provisioner.session().carry_over())?;
    }

    match (outcome, cleaned) {
        (Ok(code), Ok(())) => Ok(ExitCode::from(exit_status(code))),
        (Ok(_), Err(cleanup)) => Err(cleanup.into()),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(cleanup)) => {
            warn!("Cleanup after the failed build also failed: {}", cleanup);
            Err(e)
        }
    }
}

/// Prepare and attach the agent, run checkout commands, then the build command
///
/// Returns the exit code of the first failing checkout command, or of the
/// build command.
async fn run_build<D: Driver>(provisioner: &mut Provisioner<D>, plan: &BuildPlan) -> Result<i32> {
    provisioner.prepare_agent().await?;
    let mut agent = provisioner
        .attach_agent(AgentChannel::new(Box::new(tokio::io::stderr())))
        .await?;

    let result = run_phases(provisioner, plan).await;

    if agent.kill() {
        debug!("Detaching from agent {}", agent.description());
    }
    match agent.wait().await {
        Ok(code) => debug!("Agent process ended with exit code {}", code),
        Err(e) => warn!("Agent process ended abnormally: {}", e),
    }
    result
}

async fn run_phases<D: Driver>(provisioner: &mut Provisioner<D>, plan: &BuildPlan) -> Result<i32> {
    for cmds in &plan.checkout {
        let code = run_command(provisioner, plan, cmds).await?;
        if code != 0 {
            warn!("Checkout command exited with {}; skipping the build", code);
            return Ok(code);
        }
    }
    provisioner.advance_phase();
    run_command(provisioner, plan, &plan.command).await
}

async fn run_command<D: Driver>(
    provisioner: &mut Provisioner<D>,
    plan: &BuildPlan,
    cmds: &[String],
) -> Result<i32> {
    let mut starter = ProcStarter::new(cmds.iter().cloned())
        .stdout(Box::new(tokio::io::stdout()))
        .stderr(Box::new(tokio::io::stderr()));
    for (key, value) in &plan.envs {
        starter = starter.env(key.clone(), value.clone());
    }
    if let Some(dir) = &plan.workdir {
        starter = starter.pwd(dir.clone());
    }

    info!("Running {} ({} phase)", cmds.join(" "), provisioner.session().phase());
    let handle = provisioner.run_process(starter).await?;
    let code = handle.wait().await?;
    debug!("{} exited with {}", cmds.join(" "), code);
    Ok(code)
}

fn parse_env_pairs(pairs: &[String]) -> Result<Vec<(String, String)>> {
    pairs
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => Err(anyhow!("Invalid environment variable '{}', expected KEY=VALUE", pair)),
        })
        .collect()
}

fn load_state(path: &Path) -> Result<Option<CarryOver>> {
    if !path.exists() {
        debug!("No state file at {}, starting fresh", path.display());
        return Ok(None);
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read state file {}", path.display()))?;
    let carry_over = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse state file {}", path.display()))?;
    Ok(Some(carry_over))
}

fn save_state(path: &Path, carry_over: &CarryOver) -> Result<()> {
    let text = serde_json::to_string_pretty(carry_over)?;
    std::fs::write(path, text)
        .with_context(|| format!("Failed to write state file {}", path.display()))
}

/// Exit codes outside 0..=255 (e.g. a killed exec) map to 1
fn exit_status(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}
