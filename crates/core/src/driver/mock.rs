//! Mock driver for testing provisioning flows
//!
//! [`MockDriver`] keeps an in-memory engine (volumes, containers, images) and
//! records every driver call so tests can assert on exactly what reached the
//! engine. Clones share state, so a test can hand one clone to a provisioner
//! and inspect the other. Failures are injected per operation name.
//!
//! Exec'ed `echo` commands write their arguments to the starter's stdout sink,
//! which is enough to observe output routing end to end.

use super::{process_argv, Driver};
use crate::container::ContainerHandle;
use crate::errors::{EngineError, EngineResult};
use crate::process::{AgentChannel, ProcStarter, ProcessHandle};
use crate::spec::PlacementHints;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

/// Configuration for the mock engine
#[derive(Debug, Clone)]
pub struct MockDriverConfig {
    /// Every call fails as if the engine were unreachable
    pub daemon_unavailable: bool,
    /// Operations (trait method names) that fail when called
    pub fail_operations: Vec<String>,
    /// Exit code reported by exec'ed processes
    pub exec_exit_code: i32,
    /// Version reported by `server_version`
    pub server_version: String,
}

impl Default for MockDriverConfig {
    fn default() -> Self {
        Self {
            daemon_unavailable: false,
            fail_operations: Vec::new(),
            exec_exit_code: 0,
            server_version: "24.0.7".to_string(),
        }
    }
}

/// What a mock container was created as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockRole {
    Agent,
    Work,
    Sidecar,
}

/// A container in the mock engine
#[derive(Debug, Clone)]
pub struct MockContainer {
    pub id: String,
    pub image: String,
    pub role: MockRole,
    pub running: bool,
    /// Agent container the namespaces were shared with
    pub agent: Option<String>,
    pub hints: PlacementHints,
}

/// One driver call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    /// Trait method name
    pub operation: String,
    /// Primary argument: image, id or volume name
    pub target: String,
}

/// One exec'ed process
#[derive(Debug, Clone)]
pub struct MockExecCall {
    pub container_id: String,
    /// Argument vector as it would run, with masked arguments redacted
    pub argv: Vec<String>,
    pub envs: Vec<(String, String)>,
    pub pwd: Option<String>,
}

#[derive(Debug, Default)]
struct MockEngine {
    volumes: HashSet<String>,
    containers: HashMap<String, MockContainer>,
    images: HashSet<String>,
    built_tags: Vec<String>,
    next_id: u64,
    closed: bool,
}

impl MockEngine {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}{:04}", prefix, self.next_id)
    }
}

/// In-memory driver
#[derive(Debug, Clone, Default)]
pub struct MockDriver {
    config: Arc<Mutex<MockDriverConfig>>,
    engine: Arc<Mutex<MockEngine>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    exec_history: Arc<Mutex<Vec<MockExecCall>>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::with_config(MockDriverConfig::default())
    }

    pub fn with_config(config: MockDriverConfig) -> Self {
        Self {
            config: Arc::new(Mutex::new(config)),
            ..Default::default()
        }
    }

    pub fn update_config<F>(&self, f: F)
    where
        F: FnOnce(&mut MockDriverConfig),
    {
        let mut config = self.config.lock().unwrap();
        f(&mut config);
    }

    /// Make `operation` fail from now on
    pub fn fail_on(&self, operation: &str) {
        self.update_config(|c| c.fail_operations.push(operation.to_string()));
    }

    /// Stop failing `operation`
    pub fn succeed_on(&self, operation: &str) {
        self.update_config(|c| c.fail_operations.retain(|op| op != operation));
    }

    pub fn add_image(&self, image: &str) {
        self.engine.lock().unwrap().images.insert(image.to_string());
    }

    pub fn add_volume(&self, name: &str) {
        self.engine.lock().unwrap().volumes.insert(name.to_string());
    }

    /// Seed a running agent container, as left behind by an earlier build
    pub fn add_agent_container(&self, id: &str, image: &str) {
        self.engine.lock().unwrap().containers.insert(
            id.to_string(),
            MockContainer {
                id: id.to_string(),
                image: image.to_string(),
                role: MockRole::Agent,
                running: true,
                agent: None,
                hints: PlacementHints::default(),
            },
        );
    }

    /// Mark a container as exited
    pub fn stop_container(&self, id: &str) {
        if let Some(container) = self.engine.lock().unwrap().containers.get_mut(id) {
            container.running = false;
        }
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of calls to `operation`
    pub fn calls_named(&self, operation: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    /// Targets of every call to `operation`, in call order
    pub fn targets_of(&self, operation: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.operation == operation)
            .map(|c| c.target.clone())
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn get_exec_history(&self) -> Vec<MockExecCall> {
        self.exec_history.lock().unwrap().clone()
    }

    pub fn container(&self, id: &str) -> Option<MockContainer> {
        self.engine.lock().unwrap().containers.get(id).cloned()
    }

    /// Ids of containers currently in the engine
    pub fn container_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self
            .engine
            .lock()
            .unwrap()
            .containers
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn has_volume_named(&self, name: &str) -> bool {
        self.engine.lock().unwrap().volumes.contains(name)
    }

    pub fn built_tags(&self) -> Vec<String> {
        self.engine.lock().unwrap().built_tags.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.engine.lock().unwrap().closed
    }

    /// Record a call and apply configured failures
    fn enter(&self, operation: &str, target: &str) -> EngineResult<()> {
        debug!("MockDriver {} called for {}", operation, target);
        self.calls.lock().unwrap().push(MockCall {
            operation: operation.to_string(),
            target: target.to_string(),
        });

        let config = self.config.lock().unwrap();
        if config.daemon_unavailable {
            return Err(EngineError::NotInstalled {
                path: "mock".to_string(),
            });
        }
        if config.fail_operations.iter().any(|op| op == operation) {
            return Err(EngineError::cli(operation, "mock failure"));
        }
        Ok(())
    }

    fn create_container(
        &self,
        prefix: &str,
        image: &str,
        role: MockRole,
        agent: Option<&ContainerHandle>,
        hints: &PlacementHints,
    ) -> ContainerHandle {
        let mut engine = self.engine.lock().unwrap();
        let id = engine.next_id(prefix);
        engine.containers.insert(
            id.clone(),
            MockContainer {
                id: id.clone(),
                image: image.to_string(),
                role,
                running: role != MockRole::Agent,
                agent: agent.map(|a| a.id().to_string()),
                hints: hints.clone(),
            },
        );
        ContainerHandle::new(image, id)
    }
}

impl Driver for MockDriver {
    #[instrument(skip(self))]
    async fn server_version(&self) -> EngineResult<String> {
        self.enter("server_version", "")?;
        Ok(self.config.lock().unwrap().server_version.clone())
    }

    async fn has_volume(&self, name: &str) -> EngineResult<bool> {
        if name.is_empty() {
            return Ok(false);
        }
        self.enter("has_volume", name)?;
        Ok(self.engine.lock().unwrap().volumes.contains(name))
    }

    async fn create_volume(&self) -> EngineResult<String> {
        self.enter("create_volume", "")?;
        let mut engine = self.engine.lock().unwrap();
        let name = engine.next_id("vol");
        engine.volumes.insert(name.clone());
        Ok(name)
    }

    async fn remove_volume(&self, name: &str) -> EngineResult<()> {
        self.enter("remove_volume", name)?;
        if !self.engine.lock().unwrap().volumes.remove(name) {
            return Err(EngineError::cli("remove_volume", "no such volume"));
        }
        Ok(())
    }

    async fn has_container(&self, id: &str) -> EngineResult<bool> {
        if id.is_empty() {
            return Ok(false);
        }
        self.enter("has_container", id)?;
        Ok(self.engine.lock().unwrap().containers.contains_key(id))
    }

    async fn launch_agent_container(
        &self,
        image: &str,
        volume: &str,
    ) -> EngineResult<ContainerHandle> {
        self.enter("launch_agent_container", image)?;
        if !self.engine.lock().unwrap().volumes.contains(volume) {
            return Err(EngineError::cli("create", "no such volume"));
        }
        Ok(self.create_container("agent", image, MockRole::Agent, None, &PlacementHints::default()))
    }

    async fn attach_agent(
        &self,
        agent: &ContainerHandle,
        channel: AgentChannel,
    ) -> EngineResult<ProcessHandle> {
        self.enter("attach_agent", agent.id())?;
        if let Some(container) = self.engine.lock().unwrap().containers.get_mut(agent.id()) {
            container.running = true;
        }

        let AgentChannel { mut output, input } = channel;
        Ok(ProcessHandle::spawn(
            format!("agent {}", agent.short_id()),
            move |mut kill_rx| async move {
                let Some(mut input) = input else {
                    return Ok(0);
                };
                tokio::select! {
                    copied = tokio::io::copy(&mut input, &mut output) => {
                        copied?;
                        output.flush().await?;
                        Ok(0)
                    }
                    Ok(()) = &mut kill_rx => Ok(137),
                }
            },
        ))
    }

    async fn launch_work_container(
        &self,
        image: &str,
        agent: &ContainerHandle,
        hints: &PlacementHints,
    ) -> EngineResult<ContainerHandle> {
        self.enter("launch_work_container", image)?;
        Ok(self.create_container("work", image, MockRole::Work, Some(agent), hints))
    }

    async fn launch_sidecar_container(
        &self,
        image: &str,
        agent: &ContainerHandle,
        hints: &PlacementHints,
    ) -> EngineResult<ContainerHandle> {
        self.enter("launch_sidecar_container", image)?;
        Ok(self.create_container("side", image, MockRole::Sidecar, Some(agent), hints))
    }

    async fn exec_in_container(
        &self,
        container_id: &str,
        starter: ProcStarter,
    ) -> EngineResult<ProcessHandle> {
        self.enter("exec_in_container", container_id)?;
        if !self
            .engine
            .lock()
            .unwrap()
            .containers
            .get(container_id)
            .is_some_and(|c| c.running)
        {
            return Err(EngineError::cli("exec", "container is not running"));
        }

        self.exec_history.lock().unwrap().push(MockExecCall {
            container_id: container_id.to_string(),
            argv: process_argv(&starter, false, true),
            envs: starter.envs.clone(),
            pwd: starter.pwd.clone(),
        });

        let exit_code = self.config.lock().unwrap().exec_exit_code;
        let echoed = match starter.cmds.split_first() {
            Some((program, args)) if program == "echo" => Some(format!("{}\n", args.join(" "))),
            _ => None,
        };
        let description = starter.redacted_cmds().join(" ");
        let stdout = starter.stdout;

        Ok(ProcessHandle::spawn(description, move |_kill| async move {
            if let (Some(text), Some(mut sink)) = (echoed, stdout) {
                sink.write_all(text.as_bytes()).await?;
                sink.flush().await?;
            }
            Ok(exit_code)
        }))
    }

    async fn remove_container(&self, handle: &ContainerHandle) -> EngineResult<()> {
        self.enter("remove_container", handle.id())?;
        if self
            .engine
            .lock()
            .unwrap()
            .containers
            .remove(handle.id())
            .is_none()
        {
            return Err(EngineError::cli("rm", "no such container"));
        }
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> EngineResult<()> {
        self.enter("pull_image", image)?;
        self.engine.lock().unwrap().images.insert(image.to_string());
        Ok(())
    }

    async fn check_image_exists(&self, image: &str) -> EngineResult<bool> {
        self.enter("check_image_exists", image)?;
        Ok(self.engine.lock().unwrap().images.contains(image))
    }

    async fn build_from_dockerfile(
        &self,
        context: Vec<u8>,
        tag: &str,
        _force_pull: bool,
    ) -> EngineResult<()> {
        self.enter("build_from_dockerfile", tag)?;
        crate::archive::first_file(&context).map_err(|e| EngineError::Archive(e.to_string()))?;
        let mut engine = self.engine.lock().unwrap();
        engine.images.insert(tag.to_string());
        engine.built_tags.push(tag.to_string());
        Ok(())
    }

    async fn close(&mut self) -> EngineResult<()> {
        self.enter("close", "")?;
        self.engine.lock().unwrap().closed = true;
        Ok(())
    }
}
