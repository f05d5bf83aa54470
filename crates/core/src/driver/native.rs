//! Engine API driver built on `bollard`
//!
//! Talks to the engine over its local socket or a plain TCP endpoint. TLS
//! endpoints are refused; the CLI driver handles those with materialized key
//! material.

use super::endpoint::EngineEndpoint;
use super::{group_entry, idle_command, passwd_entry, process_argv, Driver, HELPER_PATH};
use crate::archive;
use crate::container::ContainerHandle;
use crate::errors::{EngineError, EngineResult};
use crate::process::{AgentChannel, OutputSink, ProcStarter, ProcessHandle};
use crate::settings::{AgentSettings, EngineSettings};
use crate::spec::PlacementHints;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    DownloadFromContainerOptions, InspectContainerOptions, LogOutput, RemoveContainerOptions,
    UploadToContainerOptions, WaitContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{BuildImageOptions, CreateImageOptions};
use bollard::models::{HostConfig, HostConfigLogConfig};
use bollard::volume::CreateVolumeOptions;
use bollard::{Docker, API_DEFAULT_VERSION};
use bytes::Bytes;
use futures_util::{Stream, StreamExt, TryStreamExt};
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};

const CONNECT_TIMEOUT_SECS: u64 = 120;

/// Driver speaking the Engine API
pub struct NativeDriver {
    docker: Docker,
    endpoint: EngineEndpoint,
    agent: AgentSettings,
}

impl std::fmt::Debug for NativeDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeDriver")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl NativeDriver {
    pub fn new(engine: &EngineSettings, agent: &AgentSettings) -> EngineResult<Self> {
        if engine.tls_verify || engine.has_key_material() {
            return Err(EngineError::Config(
                "TLS endpoints are not supported by the native driver; use the cli driver"
                    .to_string(),
            ));
        }
        let endpoint = EngineEndpoint::from_settings(engine)?;
        let docker = connect(endpoint.host())?;
        Ok(Self {
            docker,
            endpoint,
            agent: agent.clone(),
        })
    }

    async fn create(&self, config: Config<String>) -> EngineResult<String> {
        let response = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await?;
        for warning in &response.warnings {
            warn!("Engine warning creating container: {}", warning);
        }
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> EngineResult<()> {
        self.docker.start_container::<String>(id, None).await?;
        Ok(())
    }

    async fn copy_in(&self, id: &str, dir: &str, archive: Vec<u8>) -> EngineResult<()> {
        let options = UploadToContainerOptions {
            path: dir.to_string(),
            ..Default::default()
        };
        self.docker
            .upload_to_container(id, Some(options), Bytes::from(archive))
            .await?;
        Ok(())
    }

    async fn copy_out(&self, id: &str, path: &str) -> EngineResult<Vec<u8>> {
        let chunks: Vec<Bytes> = self
            .docker
            .download_from_container(
                id,
                Some(DownloadFromContainerOptions {
                    path: path.to_string(),
                }),
            )
            .try_collect()
            .await?;
        archive::first_file(&chunks.concat()).map_err(|e| EngineError::Archive(e.to_string()))
    }

    async fn append_to_file(&self, id: &str, dir: &str, name: &str, line: &str) -> EngineResult<()> {
        let path = format!("{}/{}", dir, name);
        let contents = archive::append_line(self.copy_out(id, &path).await?, line);
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

    async fn setup_work_container(&self, id: &str) -> EngineResult<()> {
        self.append_to_file(id, "/etc", "group", &group_entry(&self.agent))
            .await?;
        self.append_to_file(id, "/etc", "passwd", &passwd_entry(&self.agent))
            .await?;
        if let Some(helper) = &self.agent.helper {
            let contents = tokio::fs::read(helper).await?;
            let archive =
                archive::single_file(HELPER_PATH.trim_start_matches('/'), &contents, 0o555)
                    .map_err(|e| EngineError::Archive(e.to_string()))?;
            self.copy_in(id, "/", archive).await?;
        }
        self.start(id).await
    }

    async fn discard(&self, id: &str, cause: EngineError) -> EngineError {
        if let Err(e) = self.docker.remove_container(id, Some(force_remove())).await {
            warn!("Failed to remove half-built container {}: {}", id, e);
        }
        cause
    }

    fn shared_host_config(
        &self,
        agent: &ContainerHandle,
        hints: &PlacementHints,
    ) -> EngineResult<HostConfig> {
        if hints.raw_options.as_deref().is_some_and(|raw| !raw.trim().is_empty()) {
            return Err(EngineError::Config(
                "raw engine options require the cli driver".to_string(),
            ));
        }
        let memory = hints
            .memory
            .as_deref()
            .map(|m| {
                parse_memory(m)
                    .ok_or_else(|| EngineError::Config(format!("invalid memory limit '{}'", m)))
            })
            .transpose()?;
        Ok(HostConfig {
            volumes_from: Some(vec![agent.id().to_string()]),
            network_mode: Some(format!("container:{}", agent.id())),
            ipc_mode: Some(format!("container:{}", agent.id())),
            memory,
            binds: if hints.volumes.is_empty() {
                None
            } else {
                Some(hints.volumes.clone())
            },
            ..Default::default()
        })
    }
}

impl Driver for NativeDriver {
    #[instrument(skip(self))]
    async fn server_version(&self) -> EngineResult<String> {
        let version = self.docker.version().await?;
        Ok(version.version.unwrap_or_else(|| "unknown".to_string()))
    }

    #[instrument(skip(self))]
    async fn has_volume(&self, name: &str) -> EngineResult<bool> {
        if name.is_empty() {
            return Ok(false);
        }
        not_found_as_false(self.docker.inspect_volume(name).await)
    }

    #[instrument(skip(self))]
    async fn create_volume(&self) -> EngineResult<String> {
        let volume = self
            .docker
            .create_volume(CreateVolumeOptions::<String>::default())
            .await?;
        debug!("Created volume {}", volume.name);
        Ok(volume.name)
    }

    #[instrument(skip(self))]
    async fn remove_volume(&self, name: &str) -> EngineResult<()> {
        self.docker.remove_volume(name, None).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn has_container(&self, id: &str) -> EngineResult<bool> {
        if id.is_empty() {
            return Ok(false);
        }
        not_found_as_false(
            self.docker
                .inspect_container(id, None::<InspectContainerOptions>)
                .await,
        )
    }

    #[instrument(skip(self))]
    async fn launch_agent_container(
        &self,
        image: &str,
        volume: &str,
    ) -> EngineResult<ContainerHandle> {
        let config = Config {
            image: Some(image.to_string()),
            cmd: Some(self.agent.command.clone()),
            env: Some(vec![format!("TMPDIR={}", self.agent.tmp_dir())]),
            user: Some(self.agent.user.clone()),
            open_stdin: Some(true),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(HostConfig {
                binds: Some(vec![format!("{}:{}", volume, self.agent.workspace_root)]),
                log_config: Some(HostConfigLogConfig {
                    typ: Some("none".to_string()),
                    config: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let id = self.create(config).await?;
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
        let AttachContainerResults { output, mut input } = self
            .docker
            .attach_container(
                agent.id(),
                Some(AttachContainerOptions::<String> {
                    stdin: Some(channel.input.is_some()),
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    logs: Some(false),
                    detach_keys: None,
                }),
            )
            .await?;
        self.start(agent.id()).await?;
        debug!("Attached to agent container {}", agent);

        let docker = self.docker.clone();
        let id = agent.id().to_string();
        let AgentChannel {
            output: sink,
            input: source,
        } = channel;

        Ok(ProcessHandle::spawn(
            format!("agent {}", agent.short_id()),
            move |mut kill_rx| async move {
                let in_pump = source.map(|mut source| {
                    tokio::spawn(async move {
                        tokio::io::copy(&mut source, &mut input).await?;
                        input.shutdown().await
                    })
                });

                let description = format!("agent {}", id);
                tokio::select! {
                    result = pump_log_output(output, Some(sink), None, &description) => result?,
                    Ok(()) = &mut kill_rx => {
                        debug!("Killing agent container {}", id);
                        docker.kill_container::<String>(&id, None).await?;
                    }
                }
                if let Some(in_pump) = in_pump {
                    in_pump.abort();
                }
                wait_for_exit(&docker, &id).await
            },
        ))
    }

    #[instrument(skip(self, hints))]
    async fn launch_work_container(
        &self,
        image: &str,
        agent: &ContainerHandle,
        hints: &PlacementHints,
    ) -> EngineResult<ContainerHandle> {
        let config = Config {
            image: Some(image.to_string()),
            cmd: Some(idle_command(&self.agent)),
            env: Some(vec![format!("TMPDIR={}", self.agent.tmp_dir())]),
            working_dir: Some(self.agent.workspace_root.clone()),
            user: Some(self.agent.user.clone()),
            host_config: Some(self.shared_host_config(agent, hints)?),
            ..Default::default()
        };
        let id = self.create(config).await?;
        debug!("Created work container {}", id);

        if let Err(e) = self.setup_work_container(&id).await {
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
        let config = Config {
            image: Some(image.to_string()),
            host_config: Some(self.shared_host_config(agent, hints)?),
            ..Default::default()
        };
        let id = self.create(config).await?;
        if let Err(e) = self.start(&id).await {
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
        let description = process_argv(&starter, use_helper, true).join(" ");
        debug!("Running in {}: {}", container_id, description);

        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(process_argv(&starter, use_helper, false)),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: if use_helper {
                        None
                    } else {
                        starter.pwd.clone()
                    },
                    ..Default::default()
                },
            )
            .await?;

        let output = match self.docker.start_exec(&exec.id, None).await? {
            StartExecResults::Attached { output, .. } => output,
            StartExecResults::Detached => {
                return Err(EngineError::Daemon {
                    operation: "exec".to_string(),
                    message: "engine started the process detached".to_string(),
                })
            }
        };

        let docker = self.docker.clone();
        let ProcStarter { stdout, stderr, .. } = starter;
        let log_name = description.clone();
        Ok(ProcessHandle::spawn(description, move |mut kill_rx| async move {
            tokio::select! {
                result = pump_log_output(output, stdout, stderr, &log_name) => result?,
                Ok(()) = &mut kill_rx => {
                    warn!("Detaching from {}; the engine API cannot signal exec'ed processes", log_name);
                    return Ok(-1);
                }
            }
            let inspect = docker.inspect_exec(&exec.id).await?;
            Ok(inspect.exit_code.unwrap_or(-1) as i32)
        }))
    }

    #[instrument(skip(self))]
    async fn remove_container(&self, handle: &ContainerHandle) -> EngineResult<()> {
        self.docker
            .remove_container(handle.id(), Some(force_remove()))
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn pull_image(&self, image: &str) -> EngineResult<()> {
        let (from_image, tag) = split_reference(image);
        let options = CreateImageOptions {
            from_image: from_image.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        };
        drain(
            "pull",
            self.docker.create_image(Some(options), None, None),
            |info| {
                if let Some(status) = info.status.as_deref() {
                    debug!("{}", status);
                }
                info.error.clone()
            },
        )
        .await
    }

    #[instrument(skip(self))]
    async fn check_image_exists(&self, image: &str) -> EngineResult<bool> {
        not_found_as_false(self.docker.inspect_image(image).await)
    }

    #[instrument(skip(self, context))]
    async fn build_from_dockerfile(
        &self,
        context: Vec<u8>,
        tag: &str,
        force_pull: bool,
    ) -> EngineResult<()> {
        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: tag.to_string(),
            pull: force_pull,
            rm: true,
            ..Default::default()
        };
        drain(
            "build",
            self.docker
                .build_image(options, None, Some(Bytes::from(context))),
            |info| {
                if let Some(line) = info.stream.as_deref() {
                    debug!("{}", line.trim_end());
                }
                info.error.clone()
            },
        )
        .await
    }

    async fn close(&mut self) -> EngineResult<()> {
        self.endpoint.close()
    }
}

fn connect(host: Option<&str>) -> EngineResult<Docker> {
    let docker = match host {
        None => Docker::connect_with_local_defaults()?,
        Some(host) if host.starts_with("unix://") => {
            Docker::connect_with_socket(host, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)?
        }
        Some(host) if host.starts_with("tcp://") || host.starts_with("http://") => {
            Docker::connect_with_http(host, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)?
        }
        Some(host) => {
            return Err(EngineError::Config(format!(
                "unsupported engine endpoint '{}' for the native driver",
                host
            )))
        }
    };
    Ok(docker)
}

fn force_remove() -> RemoveContainerOptions {
    RemoveContainerOptions {
        force: true,
        ..Default::default()
    }
}

fn is_not_found(error: &bollard::errors::Error) -> bool {
    matches!(
        error,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn not_found_as_false<T>(result: Result<T, bollard::errors::Error>) -> EngineResult<bool> {
    match result {
        Ok(_) => Ok(true),
        Err(e) if is_not_found(&e) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Consume a progress stream, failing on the first reported error
async fn drain<S, T, F>(operation: &str, stream: S, mut inspect: F) -> EngineResult<()>
where
    S: Stream<Item = Result<T, bollard::errors::Error>>,
    F: FnMut(&T) -> Option<String>,
{
    let mut stream = std::pin::pin!(stream);
    while let Some(item) = stream.next().await {
        if let Some(error) = inspect(&item?) {
            return Err(EngineError::Daemon {
                operation: operation.to_string(),
                message: error,
            });
        }
    }
    Ok(())
}

/// Container exit code once it stops
async fn wait_for_exit(docker: &Docker, id: &str) -> EngineResult<i32> {
    let mut stream = std::pin::pin!(docker.wait_container(id, None::<WaitContainerOptions<String>>));
    match stream.next().await {
        Some(Ok(response)) => Ok(response.status_code as i32),
        Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code as i32),
        Some(Err(e)) => Err(e.into()),
        None => Ok(-1),
    }
}

/// Route multiplexed engine output to the given sinks
async fn pump_log_output<S>(
    mut output: S,
    mut stdout: Option<OutputSink>,
    mut stderr: Option<OutputSink>,
    description: &str,
) -> EngineResult<()>
where
    S: Stream<Item = Result<LogOutput, bollard::errors::Error>> + Unpin,
{
    while let Some(chunk) = output.next().await {
        match chunk? {
            LogOutput::StdOut { message } | LogOutput::Console { message } => {
                if let Some(sink) = stdout.as_mut() {
                    sink.write_all(&message).await?;
                }
            }
            LogOutput::StdErr { message } => match stderr.as_mut() {
                Some(sink) => sink.write_all(&message).await?,
                None => {
                    for line in String::from_utf8_lossy(&message).lines() {
                        warn!(process = %description, "{}", line);
                    }
                }
            },
            LogOutput::StdIn { .. } => {}
        }
    }
    if let Some(sink) = stdout.as_mut() {
        sink.flush().await?;
    }
    if let Some(sink) = stderr.as_mut() {
        sink.flush().await?;
    }
    Ok(())
}

/// Split an image reference into the `fromImage` and `tag` pull parameters
fn split_reference(image: &str) -> (&str, &str) {
    if image.contains('@') {
        return (image, "");
    }
    let name_start = image.rfind('/').map(|idx| idx + 1).unwrap_or(0);
    match image[name_start..].rfind(':') {
        Some(idx) => (
            &image[..name_start + idx],
            &image[name_start + idx + 1..],
        ),
        None => (image, "latest"),
    }
}

/// Parse an engine memory limit such as `512m` or `2g` into bytes
fn parse_memory(raw: &str) -> Option<i64> {
    let raw = raw.trim().to_lowercase();
    let raw = raw.strip_suffix('b').unwrap_or(&raw);
    let (digits, multiplier) = match raw.chars().last()? {
        'k' => (&raw[..raw.len() - 1], 1024),
        'm' => (&raw[..raw.len() - 1], 1024 * 1024),
        'g' => (&raw[..raw.len() - 1], 1024 * 1024 * 1024),
        _ => (raw, 1),
    };
    digits.parse::<i64>().ok()?.checked_mul(multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_reference() {
        assert_eq!(split_reference("maven:3-jdk-8"), ("maven", "3-jdk-8"));
        assert_eq!(split_reference("alpine"), ("alpine", "latest"));
        assert_eq!(
            split_reference("registry:5000/team/tools"),
            ("registry:5000/team/tools", "latest")
        );
        assert_eq!(
            split_reference("registry:5000/team/tools:1"),
            ("registry:5000/team/tools", "1")
        );
        assert_eq!(
            split_reference("alpine@sha256:abcd"),
            ("alpine@sha256:abcd", "")
        );
    }

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_memory("512m"), Some(512 * 1024 * 1024));
        assert_eq!(parse_memory("2G"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_memory("64kb"), Some(64 * 1024));
        assert_eq!(parse_memory("1048576"), Some(1048576));
        assert_eq!(parse_memory("lots"), None);
        assert_eq!(parse_memory(""), None);
    }

    #[test]
    fn test_tls_is_rejected() {
        let engine = EngineSettings {
            host: Some("tcp://10.0.0.5:2376".to_string()),
            tls_verify: true,
            ..Default::default()
        };
        let err = NativeDriver::new(&engine, &AgentSettings::default()).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_unknown_scheme_is_rejected() {
        assert!(matches!(
            connect(Some("ssh://builder@host")),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn test_not_found_detection() {
        let err = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "No such image".to_string(),
        };
        assert!(matches!(not_found_as_false::<()>(Err(err)), Ok(false)));

        let err = bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: "boom".to_string(),
        };
        assert!(not_found_as_false::<()>(Err(err)).is_err());
    }
}
