//! Engine CLI driver
//!
//! Every operation is one or more invocations of the engine CLI binary. Short
//! commands run to completion on a blocking task; processes whose output is
//! streamed (exec, agent attach) are spawned with `tokio::process` and wrapped
//! in a [`ProcessHandle`].

use super::endpoint::EngineEndpoint;
use super::{group_entry, idle_command, passwd_entry, process_argv, Driver, HELPER_PATH};
use crate::archive;
use crate::container::ContainerHandle;
use crate::errors::{EngineError, EngineResult};
use crate::process::{piped_command, AgentChannel, ProcStarter, ProcessHandle};
use crate::settings::{AgentSettings, EngineSettings};
use crate::spec::PlacementHints;
use std::io::Write;
use std::process::{Command, Output, Stdio};
use tracing::{debug, instrument, warn};

/// Driver invoking the engine CLI
#[derive(Debug)]
pub struct CliDriver {
    docker_path: String,
    endpoint: EngineEndpoint,
    agent: AgentSettings,
}

impl CliDriver {
    pub fn new(engine: &EngineSettings, agent: &AgentSettings) -> EngineResult<Self> {
        Ok(Self {
            docker_path: engine.docker_path.clone(),
            endpoint: EngineEndpoint::from_settings(engine)?,
            agent: agent.clone(),
        })
    }

    pub fn docker_path(&self) -> &str {
        &self.docker_path
    }

    /// Global arguments preceding every subcommand
    fn global_args(&self) -> Vec<String> {
        match self.endpoint.host() {
            Some(host) => vec!["-H".to_string(), host.to_string()],
            None => Vec::new(),
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.docker_path);
        command.args(self.global_args());
        command.envs(self.endpoint.environment());
        command
    }

    fn async_command(&self) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.docker_path);
        command.args(self.global_args());
        command.envs(self.endpoint.environment());
        command
    }

    /// Run a CLI command to completion, optionally feeding `stdin`
    async fn output(&self, args: Vec<String>, stdin: Option<Vec<u8>>) -> EngineResult<Output> {
        let mut command = self.command();
        let docker_path = self.docker_path.clone();
        debug!("Running {} {}", docker_path, args.join(" "));

        tokio::task::spawn_blocking(move || -> EngineResult<Output> {
            command
                .args(&args)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .stdin(if stdin.is_some() {
                    Stdio::piped()
                } else {
                    Stdio::null()
                });

            let mut child = command.spawn().map_err(|e| {
                debug!("Failed to spawn {}: {}", docker_path, e);
                EngineError::NotInstalled {
                    path: docker_path.clone(),
                }
            })?;

            if let (Some(input), Some(mut child_stdin)) = (stdin, child.stdin.take()) {
                child_stdin.write_all(&input)?;
            }

            Ok(child.wait_with_output()?)
        })
        .await
        .map_err(|e| EngineError::TaskJoin(e.to_string()))?
    }

    /// Run a CLI command that must succeed; returns trimmed stdout
    async fn run(
        &self,
        operation: &str,
        args: Vec<String>,
        stdin: Option<Vec<u8>>,
    ) -> EngineResult<String> {
        let output = self.output(args, stdin).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::cli(operation, stderr.trim()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Run an inspect-style command; `None` when the object does not exist
    async fn probe(&self, operation: &str, args: Vec<String>) -> EngineResult<Option<String>> {
        let output = self.output(args, None).await?;
        if output.status.success() {
            return Ok(Some(
                String::from_utf8_lossy(&output.stdout).trim().to_string(),
            ));
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_not_found(&stderr) {
            debug!("{} found nothing: {}", operation, stderr.trim());
            Ok(None)
        } else {
            Err(EngineError::cli(operation, stderr.trim()))
        }
    }

    /// Copy a tar archive into `dir` of a container
    async fn copy_in(&self, id: &str, dir: &str, archive: Vec<u8>) -> EngineResult<()> {
        self.run(
            "cp",
            args(["cp", "-", &format!("{}:{}", id, dir)]),
            Some(archive),
        )
        .await
        .map(|_| ())
    }

    /// Read one file out of a container
    async fn copy_out(&self, id: &str, path: &str) -> EngineResult<Vec<u8>> {
        let output = self
            .output(args(["cp", &format!("{}:{}", id, path), "-"]), None)
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::cli("cp", stderr.trim()));
        }
        archive::first_file(&output.stdout).map_err(|e| EngineError::Archive(e.to_string()))
    }

    /// Append `line` to a text file inside a created container
    async fn append_to_file(&self, id: &str, path: &str, line: &str) -> EngineResult<()> {
        let contents = archive::append_line(self.copy_out(id, path).await?, line);
        let (dir, name) = split_path(path);
        let archive = archive::single_file(name, &contents, 0o644)
            .map_err(|e| EngineError::Archive(e.to_string()))?;
        self.copy_in(id, dir, archive).await
    }

    async fn inject_payload(&self, id: &str) -> EngineResult<()> {
        let (Some(payload), Some(name)) = (&self.agent.payload, self.agent.payload_name()) else {
            return Ok(());
        };
        let contents = tokio::fs::read(payload).await?;
        let archive = archive::single_file(&name, &contents, 0o644)
            .map_err(|e| EngineError::Archive(e.to_string()))?;
        self.copy_in(id, &self.agent.workspace_root, archive).await
    }

    async fn inject_build_account(&self, id: &str) -> EngineResult<()> {
        self.append_to_file(id, "/etc/group", &group_entry(&self.agent))
            .await?;
        self.append_to_file(id, "/etc/passwd", &passwd_entry(&self.agent))
            .await
    }

    async fn inject_helper(&self, id: &str) -> EngineResult<()> {
        let Some(helper) = &self.agent.helper else {
            return Ok(());
        };
        let contents = tokio::fs::read(helper).await?;
        let (dir, name) = split_path(HELPER_PATH);
        let archive = archive::single_file(name, &contents, 0o555)
            .map_err(|e| EngineError::Archive(e.to_string()))?;
        self.copy_in(id, dir, archive).await
    }

    /// `create` arguments shared by work containers and sidecars
    fn namespace_args(
        &self,
        agent: &ContainerHandle,
        hints: &PlacementHints,
    ) -> EngineResult<Vec<String>> {
        let mut create = args([
            "create",
            "--volumes-from",
            agent.id(),
            &format!("--net=container:{}", agent.id()),
            &format!("--ipc=container:{}", agent.id()),
        ]);
        if let Some(memory) = &hints.memory {
            create.extend(args(["-m", memory]));
        }
        for volume in &hints.volumes {
            create.extend(args(["-v", volume]));
        }
        create.extend(
            hints
                .raw_args()
                .map_err(|e| EngineError::cli("create", format!("invalid raw options: {}", e)))?,
        );
        Ok(create)
    }

    /// Remove a container that failed to finish setting up
    async fn discard(&self, id: &str, cause: EngineError) -> EngineError {
        if let Err(e) = self.run("rm", args(["rm", "-f", id]), None).await {
            warn!("Failed to remove half-built container {}: {}", id, e);
        }
        cause
    }
}

impl Driver for CliDriver {
    #[instrument(skip(self))]
    async fn server_version(&self) -> EngineResult<String> {
        let version = self
            .run(
                "version",
                args(["version", "--format", "{{.Server.Version}}"]),
                None,
            )
            .await?;
        debug!("Engine server version {}", version);
        Ok(version)
    }

    #[instrument(skip(self))]
    async fn has_volume(&self, name: &str) -> EngineResult<bool> {
        if name.is_empty() {
            return Ok(false);
        }
        Ok(self
            .probe("volume inspect", args(["volume", "inspect", name]))
            .await?
            .is_some())
    }

    #[instrument(skip(self))]
    async fn create_volume(&self) -> EngineResult<String> {
        let name = self
            .run("volume create", args(["volume", "create"]), None)
            .await?;
        if name.is_empty() {
            return Err(EngineError::cli("volume create", "engine returned no volume name"));
        }
        debug!("Created volume {}", name);
        Ok(name)
    }

    #[instrument(skip(self))]
    async fn remove_volume(&self, name: &str) -> EngineResult<()> {
        self.run("volume rm", args(["volume", "rm", name]), None)
            .await
            .map(|_| ())
    }

    #[instrument(skip(self))]
    async fn has_container(&self, id: &str) -> EngineResult<bool> {
        if id.is_empty() {
            return Ok(false);
        }
        let found = self
            .probe(
                "inspect",
                args(["inspect", "--type", "container", "--format", "{{.Id}}", id]),
            )
            .await?;
        Ok(found.is_some())
    }

    #[instrument(skip(self))]
    async fn launch_agent_container(
        &self,
        image: &str,
        volume: &str,
    ) -> EngineResult<ContainerHandle> {
        let mut create = args([
            "create",
            "--interactive",
            "--log-driver=none",
            "--env",
            &format!("TMPDIR={}", self.agent.tmp_dir()),
            "--user",
            &self.agent.user,
            "--volume",
            &format!("{}:{}", volume, self.agent.workspace_root),
            image,
        ]);
        create.extend(self.agent.command.iter().cloned());

        let id = self.run("create", create, None).await?;
        debug!("Created agent container {}", id);

        if let Err(e) = self.inject_payload(&id).await {
            return Err(self.discard(&id, e).await);
        }
        Ok(ContainerHandle::new(image, id))
    }

    #[instrument(skip(self, channel))]
    async fn attach_agent(
        &self,
        agent: &ContainerHandle,
        channel: AgentChannel,
    ) -> EngineResult<ProcessHandle> {
        let AgentChannel { output, input } = channel;
        let mut command = self.async_command();
        command.args(["start", "--interactive", "--attach", agent.id()]);
        piped_command(&mut command, input.is_some());

        let child = command.spawn().map_err(|_| EngineError::NotInstalled {
            path: self.docker_path.clone(),
        })?;
        debug!("Attached to agent container {}", agent);
        Ok(ProcessHandle::from_child(
            format!("agent {}", agent.short_id()),
            child,
            Some(output),
            None,
            input,
        ))
    }

    #[instrument(skip(self, hints))]
    async fn launch_work_container(
        &self,
        image: &str,
        agent: &ContainerHandle,
        hints: &PlacementHints,
    ) -> EngineResult<ContainerHandle> {
        let mut create = self.namespace_args(agent, hints)?;
        create.extend(args([
            "--env",
            &format!("TMPDIR={}", self.agent.tmp_dir()),
            "--workdir",
            &self.agent.workspace_root,
            "--user",
            &self.agent.user,
            image,
        ]));
        create.extend(idle_command(&self.agent));

        let id = self.run("create", create, None).await?;
        debug!("Created work container {}", id);

        let setup = async {
            self.inject_build_account(&id).await?;
            self.inject_helper(&id).await?;
            self.run("start", args(["start", &id]), None).await
        };
        if let Err(e) = setup.await {
            return Err(self.discard(&id, e).await);
        }
        Ok(ContainerHandle::new(image, id))
    }

    #[instrument(skip(self, hints))]
    async fn launch_sidecar_container(
        &self,
        image: &str,
        agent: &ContainerHandle,
        hints: &PlacementHints,
    ) -> EngineResult<ContainerHandle> {
        let mut create = self.namespace_args(agent, hints)?;
        create.push(image.to_string());

        let id = self.run("create", create, None).await?;
        if let Err(e) = self.run("start", args(["start", &id]), None).await {
            return Err(self.discard(&id, e).await);
        }
        debug!("Started sidecar container {}", id);
        Ok(ContainerHandle::new(image, id))
    }

    #[instrument(skip(self, starter))]
    async fn exec_in_container(
        &self,
        container_id: &str,
        starter: ProcStarter,
    ) -> EngineResult<ProcessHandle> {
        let use_helper = self.agent.helper.is_some();
        let mut exec = vec!["exec".to_string()];
        if !use_helper {
            if let Some(pwd) = &starter.pwd {
                exec.extend(args(["--workdir", pwd]));
            }
        }
        exec.push(container_id.to_string());

        let redacted = process_argv(&starter, use_helper, true);
        debug!("Running {} {} {}", self.docker_path, exec.join(" "), redacted.join(" "));
        exec.extend(process_argv(&starter, use_helper, false));

        let mut command = self.async_command();
        command.args(&exec);
        piped_command(&mut command, false);
        let child = command.spawn().map_err(|_| EngineError::NotInstalled {
            path: self.docker_path.clone(),
        })?;

        let ProcStarter { stdout, stderr, .. } = starter;
        Ok(ProcessHandle::from_child(
            redacted.join(" "),
            child,
            stdout,
            stderr,
            None,
        ))
    }

    #[instrument(skip(self))]
    async fn remove_container(&self, handle: &ContainerHandle) -> EngineResult<()> {
        self.run("rm", args(["rm", "-f", handle.id()]), None)
            .await
            .map(|_| ())
    }

    #[instrument(skip(self))]
    async fn pull_image(&self, image: &str) -> EngineResult<()> {
        self.run("pull", args(["pull", image]), None).await.map(|_| ())
    }

    #[instrument(skip(self))]
    async fn check_image_exists(&self, image: &str) -> EngineResult<bool> {
        Ok(self
            .probe(
                "image inspect",
                args(["image", "inspect", "--format", "{{.Id}}", image]),
            )
            .await?
            .is_some())
    }

    #[instrument(skip(self, context))]
    async fn build_from_dockerfile(
        &self,
        context: Vec<u8>,
        tag: &str,
        force_pull: bool,
    ) -> EngineResult<()> {
        self.run(
            "build",
            args([
                "build",
                &format!("--pull={}", force_pull),
                "-t",
                tag,
                "-",
            ]),
            Some(context),
        )
        .await
        .map(|_| ())
    }

    async fn close(&mut self) -> EngineResult<()> {
        self.endpoint.close()
    }
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Split a container path into parent directory and file name
fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => (".", path),
    }
}

fn is_not_found(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("no such") || lower.contains("not found")
}
