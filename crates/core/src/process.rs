//! Process launch descriptions and handles
//!
//! [`ProcStarter`] describes a command to run inside a container: argument
//! vector with per-argument masking, environment, working directory and output
//! sinks. [`ProcessHandle`] is what a driver returns once the process has been
//! started; it can be awaited or killed independently of the call that
//! created it.

use crate::errors::{EngineError, EngineResult};
use std::future::Future;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Replacement text for masked arguments in log output
pub const MASK_PLACEHOLDER: &str = "****";

/// Destination for a process's output stream
pub type OutputSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Source for a process's input stream
pub type InputSource = Box<dyn AsyncRead + Send + Unpin>;

/// Description of a process to launch in a container
#[derive(Default)]
pub struct ProcStarter {
    /// Argument vector; the first entry is the program
    pub cmds: Vec<String>,
    /// Per-argument mask flags; missing entries are unmasked
    pub masks: Vec<bool>,
    /// Environment variables, applied in order
    pub envs: Vec<(String, String)>,
    /// Working directory inside the container
    pub pwd: Option<String>,
    /// Receives the process's standard output
    pub stdout: Option<OutputSink>,
    /// Receives the process's standard error; logged when absent
    pub stderr: Option<OutputSink>,
}

impl std::fmt::Debug for ProcStarter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcStarter")
            .field("cmds", &self.redacted_cmds())
            .field("envs", &self.envs.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .field("pwd", &self.pwd)
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

impl ProcStarter {
    pub fn new<I, S>(cmds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cmds: cmds.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Append an argument whose value must never appear in logs
    pub fn masked_arg(mut self, arg: impl Into<String>) -> Self {
        self.masks.resize(self.cmds.len(), false);
        self.cmds.push(arg.into());
        self.masks.push(true);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn pwd(mut self, pwd: impl Into<String>) -> Self {
        self.pwd = Some(pwd.into());
        self
    }

    pub fn stdout(mut self, sink: OutputSink) -> Self {
        self.stdout = Some(sink);
        self
    }

    pub fn stderr(mut self, sink: OutputSink) -> Self {
        self.stderr = Some(sink);
        self
    }

    pub fn is_masked(&self, index: usize) -> bool {
        self.masks.get(index).copied().unwrap_or(false)
    }

    /// Argument vector with masked entries replaced by [`MASK_PLACEHOLDER`]
    pub fn redacted_cmds(&self) -> Vec<String> {
        self.cmds
            .iter()
            .enumerate()
            .map(|(idx, arg)| {
                if self.is_masked(idx) {
                    MASK_PLACEHOLDER.to_string()
                } else {
                    arg.clone()
                }
            })
            .collect()
    }

    /// Whether `name` is already set in this starter's environment
    pub fn has_env(&self, name: &str) -> bool {
        self.envs.iter().any(|(k, _)| k == name)
    }
}

/// Bidirectional stream the agent container communicates over
pub struct AgentChannel {
    /// Receives the agent's standard output
    pub output: OutputSink,
    /// Fed to the agent's standard input
    pub input: Option<InputSource>,
}

impl AgentChannel {
    pub fn new(output: OutputSink) -> Self {
        Self {
            output,
            input: None,
        }
    }

    pub fn with_input(mut self, input: InputSource) -> Self {
        self.input = Some(input);
        self
    }
}

/// A started process that can be awaited or killed
#[derive(Debug)]
pub struct ProcessHandle {
    description: String,
    task: JoinHandle<EngineResult<i32>>,
    kill: Option<oneshot::Sender<()>>,
}

impl ProcessHandle {
    /// Drive `body` on its own task; `body` receives the kill signal receiver
    pub fn spawn<F, Fut>(description: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(oneshot::Receiver<()>) -> Fut,
        Fut: Future<Output = EngineResult<i32>> + Send + 'static,
    {
        let (kill_tx, kill_rx) = oneshot::channel();
        Self {
            description: description.into(),
            task: tokio::spawn(body(kill_rx)),
            kill: Some(kill_tx),
        }
    }

    /// Attach to a spawned engine CLI child, pumping its streams
    pub(crate) fn from_child(
        description: impl Into<String>,
        mut child: tokio::process::Child,
        stdout: Option<OutputSink>,
        stderr: Option<OutputSink>,
        stdin: Option<InputSource>,
    ) -> Self {
        let description = description.into();
        let log_name = description.clone();
        Self::spawn(description, move |mut kill_rx| async move {
            let out_pump = tokio::spawn(pump_output(child.stdout.take(), stdout));
            let err_pump = tokio::spawn(pump_errors(child.stderr.take(), stderr, log_name));
            let in_pump = match (stdin, child.stdin.take()) {
                (Some(input), Some(child_stdin)) => Some(tokio::spawn(pump_input(input, child_stdin))),
                _ => None,
            };

            let status = tokio::select! {
                status = child.wait() => status?,
                Ok(()) = &mut kill_rx => {
                    debug!("Killing engine process");
                    child.kill().await?;
                    child.wait().await?
                }
            };

            if let Some(in_pump) = in_pump {
                in_pump.abort();
            }
            join_pump(out_pump).await?;
            join_pump(err_pump).await?;

            Ok(status.code().unwrap_or(-1))
        })
    }

    /// What this process is, for log lines
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Request termination; returns false when already requested or finished
    pub fn kill(&mut self) -> bool {
        match self.kill.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the process to exit and return its exit code
    ///
    /// A non-zero exit code is a normal result, not an error.
    pub async fn wait(self) -> EngineResult<i32> {
        let ProcessHandle { task, kill, .. } = self;
        let result = task
            .await
            .map_err(|e| EngineError::TaskJoin(e.to_string()))?;
        drop(kill);
        result
    }
}

/// Stdio configuration for an engine CLI child whose streams we pump
pub(crate) fn piped_command(command: &mut tokio::process::Command, with_stdin: bool) {
    command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if with_stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .kill_on_drop(false);
}

async fn pump_output(
    source: Option<tokio::process::ChildStdout>,
    sink: Option<OutputSink>,
) -> std::io::Result<()> {
    let Some(mut source) = source else {
        return Ok(());
    };
    match sink {
        Some(mut sink) => {
            tokio::io::copy(&mut source, &mut sink).await?;
            sink.flush().await
        }
        None => {
            tokio::io::copy(&mut source, &mut tokio::io::sink()).await?;
            Ok(())
        }
    }
}

async fn pump_errors(
    source: Option<tokio::process::ChildStderr>,
    sink: Option<OutputSink>,
    description: String,
) -> std::io::Result<()> {
    let Some(mut source) = source else {
        return Ok(());
    };
    match sink {
        Some(mut sink) => {
            tokio::io::copy(&mut source, &mut sink).await?;
            sink.flush().await
        }
        None => {
            let mut lines = BufReader::new(source).lines();
            while let Some(line) = lines.next_line().await? {
                warn!(process = %description, "{}", line);
            }
            Ok(())
        }
    }
}

async fn pump_input(
    mut input: InputSource,
    mut stdin: tokio::process::ChildStdin,
) -> std::io::Result<()> {
    tokio::io::copy(&mut input, &mut stdin).await?;
    stdin.shutdown().await
}

async fn join_pump(pump: JoinHandle<std::io::Result<()>>) -> EngineResult<()> {
    pump.await
        .map_err(|e| EngineError::TaskJoin(e.to_string()))?
        .map_err(EngineError::from)
}
