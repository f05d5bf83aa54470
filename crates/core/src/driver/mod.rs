//! Container engine drivers
//!
//! The [`Driver`] trait is the only way the provisioner talks to the container
//! engine. Two implementations are interchangeable behind it:
//!
//! * [`cli::CliDriver`] shells out to the engine CLI
//! * [`native::NativeDriver`] speaks the Engine API through `bollard`
//!
//! [`DriverImpl`] dispatches to whichever [`DriverKind`] was selected, and
//! [`mock::MockDriver`] is an in-memory engine for tests.

pub mod cli;
pub mod endpoint;
pub mod mock;
pub mod native;

use crate::container::ContainerHandle;
use crate::errors::{ConfigError, EngineResult};
use crate::process::{AgentChannel, ProcStarter, ProcessHandle, MASK_PLACEHOLDER};
use crate::settings::{AgentSettings, Settings};
use crate::spec::PlacementHints;
use tracing::debug;

pub use cli::CliDriver;
pub use native::NativeDriver;

/// Path of the trampoline helper inside work containers
pub const HELPER_PATH: &str = "/trampoline";

/// Account name builds run as inside work containers
pub const BUILD_USER: &str = "jenkins";

/// Container engine operations needed to provision a build
///
/// Not-found is never an error for the `has_*` probes or
/// [`check_image_exists`](Driver::check_image_exists); genuine communication
/// failures are.
#[allow(async_fn_in_trait)]
pub trait Driver {
    /// Engine server version; doubles as the connectivity probe
    async fn server_version(&self) -> EngineResult<String>;

    /// Whether a volume named `name` exists; empty names never do
    async fn has_volume(&self, name: &str) -> EngineResult<bool>;

    /// Create an engine-named volume and return its name
    async fn create_volume(&self) -> EngineResult<String>;

    async fn remove_volume(&self, name: &str) -> EngineResult<()>;

    /// Whether container `id` exists, running or stopped; empty ids never do
    async fn has_container(&self, id: &str) -> EngineResult<bool>;

    /// Create the agent container with `volume` at the workspace root and the
    /// agent payload copied in; the container is not started
    async fn launch_agent_container(&self, image: &str, volume: &str)
        -> EngineResult<ContainerHandle>;

    /// Start the agent container attached to `channel`
    async fn attach_agent(
        &self,
        agent: &ContainerHandle,
        channel: AgentChannel,
    ) -> EngineResult<ProcessHandle>;

    /// Create and start a work container sharing the agent's namespaces and
    /// workspace, with the build account and helper injected
    async fn launch_work_container(
        &self,
        image: &str,
        agent: &ContainerHandle,
        hints: &PlacementHints,
    ) -> EngineResult<ContainerHandle>;

    /// Create and start a sidecar sharing the agent's namespaces
    async fn launch_sidecar_container(
        &self,
        image: &str,
        agent: &ContainerHandle,
        hints: &PlacementHints,
    ) -> EngineResult<ContainerHandle>;

    /// Run a process inside a running container
    async fn exec_in_container(
        &self,
        container_id: &str,
        starter: ProcStarter,
    ) -> EngineResult<ProcessHandle>;

    /// Forcibly remove a container
    async fn remove_container(&self, handle: &ContainerHandle) -> EngineResult<()>;

    async fn pull_image(&self, image: &str) -> EngineResult<()>;

    async fn check_image_exists(&self, image: &str) -> EngineResult<bool>;

    /// Build `tag` from a tar archive of a build context
    async fn build_from_dockerfile(
        &self,
        context: Vec<u8>,
        tag: &str,
        force_pull: bool,
    ) -> EngineResult<()>;

    /// Release driver resources such as materialized key material
    async fn close(&mut self) -> EngineResult<()>;
}

/// Driver selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// Engine CLI subprocesses
    Cli,
    /// Engine API through `bollard`
    Native,
}

impl DriverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::Native => "native",
        }
    }
}

impl std::str::FromStr for DriverKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cli" => Ok(Self::Cli),
            "native" => Ok(Self::Native),
            _ => Err(ConfigError::Validation {
                message: format!("Unknown driver: {}. Supported drivers: cli, native", s),
            }),
        }
    }
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Driver factory
pub struct DriverFactory;

impl DriverFactory {
    /// Precedence: CLI flag > `STEVEDORE_DRIVER` > settings file > `cli`
    pub fn detect_driver(cli_driver: Option<DriverKind>, settings: &Settings) -> DriverKind {
        if let Some(kind) = cli_driver {
            return kind;
        }

        if let Ok(env_driver) = std::env::var(crate::settings::DRIVER_ENV) {
            if let Ok(kind) = env_driver.parse() {
                return kind;
            }
        }

        settings.driver.unwrap_or(DriverKind::Cli)
    }

    pub fn create_driver(kind: DriverKind, settings: &Settings) -> EngineResult<DriverImpl> {
        debug!("Creating {} driver", kind);
        match kind {
            DriverKind::Cli => Ok(DriverImpl::Cli(CliDriver::new(
                &settings.engine,
                &settings.agent,
            )?)),
            DriverKind::Native => Ok(DriverImpl::Native(NativeDriver::new(
                &settings.engine,
                &settings.agent,
            )?)),
        }
    }
}

/// Concrete driver selected at runtime
#[derive(Debug)]
pub enum DriverImpl {
    Cli(CliDriver),
    Native(NativeDriver),
}

impl DriverImpl {
    pub fn kind(&self) -> DriverKind {
        match self {
            Self::Cli(_) => DriverKind::Cli,
            Self::Native(_) => DriverKind::Native,
        }
    }
}

impl Driver for DriverImpl {
    async fn server_version(&self) -> EngineResult<String> {
        match self {
            Self::Cli(driver) => driver.server_version().await,
            Self::Native(driver) => driver.server_version().await,
        }
    }

    async fn has_volume(&self, name: &str) -> EngineResult<bool> {
        match self {
            Self::Cli(driver) => driver.has_volume(name).await,
            Self::Native(driver) => driver.has_volume(name).await,
        }
    }

    async fn create_volume(&self) -> EngineResult<String> {
        match self {
            Self::Cli(driver) => driver.create_volume().await,
            Self::Native(driver) => driver.create_volume().await,
        }
    }

    async fn remove_volume(&self, name: &str) -> EngineResult<()> {
        match self {
            Self::Cli(driver) => driver.remove_volume(name).await,
            Self::Native(driver) => driver.remove_volume(name).await,
        }
    }

    async fn has_container(&self, id: &str) -> EngineResult<bool> {
        match self {
            Self::Cli(driver) => driver.has_container(id).await,
            Self::Native(driver) => driver.has_container(id).await,
        }
    }

    async fn launch_agent_container(
        &self,
        image: &str,
        volume: &str,
    ) -> EngineResult<ContainerHandle> {
        match self {
            Self::Cli(driver) => driver.launch_agent_container(image, volume).await,
            Self::Native(driver) => driver.launch_agent_container(image, volume).await,
        }
    }

    async fn attach_agent(
        &self,
        agent: &ContainerHandle,
        channel: AgentChannel,
    ) -> EngineResult<ProcessHandle> {
        match self {
            Self::Cli(driver) => driver.attach_agent(agent, channel).await,
            Self::Native(driver) => driver.attach_agent(agent, channel).await,
        }
    }

    async fn launch_work_container(
        &self,
        image: &str,
        agent: &ContainerHandle,
        hints: &PlacementHints,
    ) -> EngineResult<ContainerHandle> {
        match self {
            Self::Cli(driver) => driver.launch_work_container(image, agent, hints).await,
            Self::Native(driver) => driver.launch_work_container(image, agent, hints).await,
        }
    }

    async fn launch_sidecar_container(
        &self,
        image: &str,
        agent: &ContainerHandle,
        hints: &PlacementHints,
    ) -> EngineResult<ContainerHandle> {
        match self {
            Self::Cli(driver) => driver.launch_sidecar_container(image, agent, hints).await,
            Self::Native(driver) => driver.launch_sidecar_container(image, agent, hints).await,
        }
    }

    async fn exec_in_container(
        &self,
        container_id: &str,
        starter: ProcStarter,
    ) -> EngineResult<ProcessHandle> {
        match self {
            Self::Cli(driver) => driver.exec_in_container(container_id, starter).await,
            Self::Native(driver) => driver.exec_in_container(container_id, starter).await,
        }
    }

    async fn remove_container(&self, handle: &ContainerHandle) -> EngineResult<()> {
        match self {
            Self::Cli(driver) => driver.remove_container(handle).await,
            Self::Native(driver) => driver.remove_container(handle).await,
        }
    }

    async fn pull_image(&self, image: &str) -> EngineResult<()> {
        match self {
            Self::Cli(driver) => driver.pull_image(image).await,
            Self::Native(driver) => driver.pull_image(image).await,
        }
    }

    async fn check_image_exists(&self, image: &str) -> EngineResult<bool> {
        match self {
            Self::Cli(driver) => driver.check_image_exists(image).await,
            Self::Native(driver) => driver.check_image_exists(image).await,
        }
    }

    async fn build_from_dockerfile(
        &self,
        context: Vec<u8>,
        tag: &str,
        force_pull: bool,
    ) -> EngineResult<()> {
        match self {
            Self::Cli(driver) => driver.build_from_dockerfile(context, tag, force_pull).await,
            Self::Native(driver) => driver.build_from_dockerfile(context, tag, force_pull).await,
        }
    }

    async fn close(&mut self) -> EngineResult<()> {
        match self {
            Self::Cli(driver) => driver.close().await,
            Self::Native(driver) => driver.close().await,
        }
    }
}

/// Argument vector run inside the container for `starter`
///
/// With the helper available the working directory is entered through
/// `/trampoline cdexec`; otherwise the caller passes it to the engine. The
/// environment is applied with `env K=V ...` ahead of the command. `redact`
/// hides masked arguments and every environment value.
pub(crate) fn process_argv(starter: &ProcStarter, use_helper: bool, redact: bool) -> Vec<String> {
    let mut argv = Vec::new();
    if use_helper {
        if let Some(pwd) = &starter.pwd {
            argv.extend([HELPER_PATH.to_string(), "cdexec".to_string(), pwd.clone()]);
        }
    }
    if !starter.envs.is_empty() {
        argv.push("env".to_string());
        argv.extend(starter.envs.iter().map(|(k, v)| {
            if redact {
                format!("{}={}", k, MASK_PLACEHOLDER)
            } else {
                format!("{}={}", k, v)
            }
        }));
    }
    if redact {
        argv.extend(starter.redacted_cmds());
    } else {
        argv.extend(starter.cmds.iter().cloned());
    }
    argv
}

/// Command a work container idles on until processes are exec'ed into it
pub(crate) fn idle_command(agent: &AgentSettings) -> Vec<String> {
    match agent.helper {
        Some(_) => vec![HELPER_PATH.to_string(), "wait".to_string()],
        None => vec!["sleep".to_string(), "infinity".to_string()],
    }
}

/// `/etc/group` line for the build account
pub(crate) fn group_entry(agent: &AgentSettings) -> String {
    let (_, gid) = agent.uid_gid().unwrap_or((10000, 10000));
    format!("{}:x:{}:\n", BUILD_USER, gid)
}

/// `/etc/passwd` line for the build account, home at the workspace root
pub(crate) fn passwd_entry(agent: &AgentSettings) -> String {
    let (uid, gid) = agent.uid_gid().unwrap_or((10000, 10000));
    format!(
        "{}:x:{}:{}::{}:/bin/false\n",
        BUILD_USER,
        uid,
        gid,
        agent.workspace_root.trim_end_matches('/')
    )
}
