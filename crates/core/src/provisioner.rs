//! Phase-aware container provisioning for one build
//!
//! A [`Provisioner`] owns the session state of a single build and drives the
//! driver through it: prepare the agent, dispatch processes to the container
//! of the current phase (creating it on first use), flip phase once checkout
//! completes, and tear everything down in `clean`.
//!
//! Every operation either completes or leaves the session exactly as it was,
//! so the caller can retry or abort and then `clean` without double removals.

use crate::container::ContainerHandle;
use crate::driver::Driver;
use crate::errors::{CleanupFailure, ProvisionError, ResourceKind, Result};
use crate::process::{AgentChannel, ProcStarter, ProcessHandle};
use crate::session::{CarryOver, Phase, SessionState};
use crate::settings::Settings;
use crate::spec::{ContainerSetSpec, ContainerSpec, ImageSpec, PlacementHints};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

/// Provisions and tears down the containers of one build
#[derive(Debug)]
pub struct Provisioner<D: Driver> {
    driver: D,
    spec: ContainerSetSpec,
    session: SessionState,
    settings: Settings,
    workspace: PathBuf,
    resolved_images: HashMap<ImageSpec, String>,
    sidecars_launched: bool,
}

impl<D: Driver> Provisioner<D> {
    /// Probe the engine and set up provisioning for a build
    ///
    /// Fails with [`ProvisionError::EngineUnreachable`] when the engine does
    /// not answer; no build can proceed in that case.
    #[instrument(skip_all)]
    pub async fn new(
        driver: D,
        spec: ContainerSetSpec,
        session: SessionState,
        settings: Settings,
    ) -> Result<Self> {
        let version = driver
            .server_version()
            .await
            .map_err(|source| ProvisionError::EngineUnreachable { source })?;
        info!("Connected to container engine {}", version);

        Ok(Self {
            driver,
            spec,
            session,
            settings,
            workspace: PathBuf::from("."),
            resolved_images: HashMap::new(),
            sidecars_launched: false,
        })
    }

    /// Host directory Dockerfile build contexts are relative to
    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = workspace.into();
        self
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn spec(&self) -> &ContainerSetSpec {
        &self.spec
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// What the next build of this job may reuse
    pub fn into_carry_over(self) -> CarryOver {
        self.session.carry_over()
    }

    /// Make sure an agent container and its workspace volume exist
    #[instrument(skip(self))]
    pub async fn prepare_agent(&mut self) -> Result<()> {
        if let Some(agent) = &self.session.agent_container {
            let exists = self.driver.has_container(agent.id()).await.map_err(|source| {
                ProvisionError::ExistenceCheckFailed {
                    resource: ResourceKind::AgentContainer,
                    target: agent.id().to_string(),
                    source,
                }
            })?;
            if exists {
                info!("Reusing agent container {}", agent);
                return Ok(());
            }
            info!("Agent container {} is gone, launching a new one", agent);
        }

        let (volume, created) = self.ensure_volume().await?;
        let image = self.settings.images.agent.clone();

        match self.driver.launch_agent_container(&image, &volume).await {
            Ok(agent) => {
                info!("Launched agent container {} on volume {}", agent, volume);
                self.session.workdir_volume = Some(volume);
                self.session.agent_container = Some(agent);
                Ok(())
            }
            Err(source) => {
                if created {
                    if let Err(e) = self.driver.remove_volume(&volume).await {
                        warn!("Failed to remove volume {} after agent launch failed: {}", volume, e);
                    }
                }
                Err(ProvisionError::ResourceCreationFailed {
                    resource: ResourceKind::AgentContainer,
                    target: image,
                    source,
                })
            }
        }
    }

    /// Existing workspace volume, or a fresh one; the flag tells which
    async fn ensure_volume(&self) -> Result<(String, bool)> {
        if let Some(volume) = &self.session.workdir_volume {
            let exists = self.driver.has_volume(volume).await.map_err(|source| {
                ProvisionError::ExistenceCheckFailed {
                    resource: ResourceKind::Volume,
                    target: volume.clone(),
                    source,
                }
            })?;
            if exists {
                debug!("Reusing workspace volume {}", volume);
                return Ok((volume.clone(), false));
            }
        }

        let volume = self.driver.create_volume().await.map_err(|source| {
            ProvisionError::ResourceCreationFailed {
                resource: ResourceKind::Volume,
                target: "agent workspace".to_string(),
                source,
            }
        })?;
        Ok((volume, true))
    }

    /// Start the agent attached to `channel` and hold until it exits
    ///
    /// Returns the agent process exit code.
    #[instrument(skip_all)]
    pub async fn launch_agent(&mut self, channel: AgentChannel) -> Result<i32> {
        let container = self
            .session
            .agent_container
            .as_ref()
            .map(|agent| agent.id().to_string())
            .ok_or(ProvisionError::AgentNotPrepared)?;
        let handle = self.attach_agent(channel).await?;
        handle
            .wait()
            .await
            .map_err(|source| ProvisionError::ProcessExecutionFailed { container, source })
    }

    /// Start the agent attached to `channel` without waiting for it
    #[instrument(skip_all)]
    pub async fn attach_agent(&mut self, channel: AgentChannel) -> Result<ProcessHandle> {
        let agent = self
            .session
            .agent_container
            .as_ref()
            .ok_or(ProvisionError::AgentNotPrepared)?;
        self.driver
            .attach_agent(agent, channel)
            .await
            .map_err(|source| ProvisionError::ProcessExecutionFailed {
                container: agent.id().to_string(),
                source,
            })
    }

    /// Run a process in the container of the current phase
    ///
    /// The target container is created on first use; later calls only exec.
    #[instrument(skip(self, starter), fields(phase = %self.session.phase))]
    pub async fn run_process(&mut self, mut starter: ProcStarter) -> Result<ProcessHandle> {
        let container = match self.session.phase {
            Phase::PreCheckout => self.ensure_checkout_container().await?,
            Phase::Build => {
                self.ensure_sidecars().await?;
                for (key, value) in self.spec.environment() {
                    if !starter.has_env(&key) {
                        starter.envs.push((key, value));
                    }
                }
                self.ensure_work_container().await?
            }
        };

        debug!("Running {:?} in {}", starter, container);
        self.driver
            .exec_in_container(container.id(), starter)
            .await
            .map_err(|source| ProvisionError::ProcessExecutionFailed {
                container: container.id().to_string(),
                source,
            })
    }

    /// Switch process dispatch from the checkout container to the work container
    pub fn advance_phase(&mut self) {
        if self.session.phase == Phase::PreCheckout {
            info!("Checkout complete, switching to {} phase", Phase::Build);
            self.session.phase = Phase::Build;
        }
    }

    async fn ensure_checkout_container(&mut self) -> Result<ContainerHandle> {
        if let Some(container) = &self.session.checkout_container {
            return Ok(container.clone());
        }
        let agent = self.agent()?;
        let image = self
            .resolve_image(ImageSpec::image_id(self.settings.images.checkout.clone()))
            .await?;

        let container = self
            .driver
            .launch_work_container(&image, &agent, &PlacementHints::default())
            .await
            .map_err(|source| ProvisionError::ResourceCreationFailed {
                resource: ResourceKind::CheckoutContainer,
                target: image.clone(),
                source,
            })?;
        info!("Launched checkout container {}", container);
        self.session.checkout_container = Some(container.clone());
        Ok(container)
    }

    async fn ensure_work_container(&mut self) -> Result<ContainerHandle> {
        if let Some(container) = &self.session.work_container {
            return Ok(container.clone());
        }
        let agent = self.agent()?;
        let work = self.spec.work.clone();
        let container = self
            .launch_from_spec(&work, &agent, ResourceKind::WorkContainer)
            .await?;
        info!("Launched work container {}", container);
        self.session.work_container = Some(container.clone());
        Ok(container)
    }

    /// Create every declared sidecar, once per build
    async fn ensure_sidecars(&mut self) -> Result<()> {
        if self.sidecars_launched || self.spec.sidecars.is_empty() {
            return Ok(());
        }
        let agent = self.agent()?;
        let sidecars = self.spec.sidecars.clone();

        let mut seen = HashSet::new();
        for sidecar in &sidecars {
            if !seen.insert(sidecar.name.as_str()) {
                return Err(ProvisionError::SidecarNameCollision {
                    name: sidecar.name.clone(),
                });
            }
            if self.session.sidecars.contains_key(&sidecar.name) {
                debug!("Sidecar {} already running", sidecar.name);
                continue;
            }
            let container = self
                .launch_from_spec(&sidecar.container, &agent, ResourceKind::SidecarContainer)
                .await?;
            info!("Launched sidecar {} as {}", sidecar.name, container);
            self.session
                .sidecars
                .insert(sidecar.name.clone(), container);
        }

        self.sidecars_launched = true;
        Ok(())
    }

    async fn launch_from_spec(
        &mut self,
        spec: &ContainerSpec,
        agent: &ContainerHandle,
        resource: ResourceKind,
    ) -> Result<ContainerHandle> {
        let image = self.resolve_image(spec.image.clone()).await?;
        let hints = spec.effective_hints();
        let launched = match resource {
            ResourceKind::SidecarContainer => {
                self.driver
                    .launch_sidecar_container(&image, agent, &hints)
                    .await
            }
            _ => self.driver.launch_work_container(&image, agent, &hints).await,
        };
        launched.map_err(|source| ProvisionError::ResourceCreationFailed {
            resource,
            target: image,
            source,
        })
    }

    /// Resolve an image descriptor at most once per build
    async fn resolve_image(&mut self, image: ImageSpec) -> Result<String> {
        if let Some(tag) = self.resolved_images.get(&image) {
            return Ok(tag.clone());
        }
        let tag = image
            .resolve(&self.driver, &self.workspace)
            .await
            .map_err(|source| ProvisionError::ImageResolutionFailed {
                image: image.describe(),
                source,
            })?;
        self.resolved_images.insert(image, tag.clone());
        Ok(tag)
    }

    fn agent(&self) -> Result<ContainerHandle> {
        self.session
            .agent_container
            .clone()
            .ok_or(ProvisionError::AgentNotPrepared)
    }

    /// Remove everything this build created and release driver resources
    ///
    /// Sidecars go first, then the work and checkout containers. The agent
    /// container and its volume are kept for the next build unless agent reuse
    /// is disabled. Every removal is attempted; failures are reported together.
    #[instrument(skip(self))]
    pub async fn clean(&mut self) -> Result<()> {
        let mut removals: Vec<(String, ContainerHandle)> = Vec::new();
        for sidecar in &self.spec.sidecars {
            if let Some(handle) = self.session.sidecars.remove(&sidecar.name) {
                removals.push((format!("sidecar {}", sidecar.name), handle));
            }
        }
        let mut leftover: Vec<_> = self.session.sidecars.drain().collect();
        leftover.sort_by(|a, b| a.0.cmp(&b.0));
        removals.extend(
            leftover
                .into_iter()
                .map(|(name, handle)| (format!("sidecar {}", name), handle)),
        );
        if let Some(handle) = self.session.work_container.take() {
            removals.push((ResourceKind::WorkContainer.to_string(), handle));
        }
        if let Some(handle) = self.session.checkout_container.take() {
            removals.push((ResourceKind::CheckoutContainer.to_string(), handle));
        }
        let discard_agent = !self.settings.agent.reuse;
        if discard_agent {
            if let Some(handle) = self.session.agent_container.take() {
                removals.push((ResourceKind::AgentContainer.to_string(), handle));
            }
        }

        let mut failures = Vec::new();
        for (resource, handle) in removals {
            debug!("Removing {} {}", resource, handle);
            if let Err(source) = self.driver.remove_container(&handle).await {
                warn!("Failed to remove {} {}: {}", resource, handle, source);
                failures.push(CleanupFailure {
                    resource,
                    target: handle.id().to_string(),
                    source,
                });
            }
        }

        if discard_agent {
            if let Some(volume) = self.session.workdir_volume.take() {
                if let Err(source) = self.driver.remove_volume(&volume).await {
                    warn!("Failed to remove volume {}: {}", volume, source);
                    failures.push(CleanupFailure {
                        resource: ResourceKind::Volume.to_string(),
                        target: volume,
                        source,
                    });
                }
            }
        }

        if let Err(source) = self.driver.close().await {
            warn!("Failed to release driver resources: {}", source);
            failures.push(CleanupFailure {
                resource: "driver".to_string(),
                target: "engine connection".to_string(),
                source,
            });
        }

        self.sidecars_launched = false;
        if failures.is_empty() {
            info!("Build containers removed");
            Ok(())
        } else {
            Err(ProvisionError::CleanupPartialFailure { failures })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::MockDriver;
    use crate::spec::SidecarSpec;

    fn spec(image: &str) -> ContainerSetSpec {
        ContainerSetSpec::new(ContainerSpec::new(ImageSpec::image_id(image)))
    }

    async fn provisioner(driver: &MockDriver, spec: ContainerSetSpec) -> Provisioner<MockDriver> {
        Provisioner::new(driver.clone(), spec, SessionState::new(None), Settings::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_unreachable_engine_fails_construction() {
        let driver = MockDriver::new();
        driver.fail_on("server_version");
        let err = Provisioner::new(driver, spec("alpine"), SessionState::new(None), Settings::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::EngineUnreachable { .. }));
    }

    #[tokio::test]
    async fn test_run_process_requires_agent() {
        let driver = MockDriver::new();
        let mut provisioner = provisioner(&driver, spec("alpine")).await;
        let err = provisioner
            .run_process(ProcStarter::new(["true"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::AgentNotPrepared));
        assert_eq!(driver.calls_named("launch_work_container"), 0);
    }

    #[tokio::test]
    async fn test_checkout_container_uses_checkout_image() {
        let driver = MockDriver::new();
        let mut provisioner = provisioner(&driver, spec("build-tools:1")).await;
        provisioner.prepare_agent().await.unwrap();
        provisioner
            .run_process(ProcStarter::new(["git", "fetch"]))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        let checkout = provisioner.session().checkout_container().unwrap();
        assert_eq!(checkout.image(), "buildpack-deps:scm");
        assert!(provisioner.session().work_container().is_none());
    }

    #[tokio::test]
    async fn test_collision_is_reported_before_creating_duplicate() {
        let driver = MockDriver::new();
        let spec = spec("maven")
            .with_sidecar(SidecarSpec::new("db", ContainerSpec::new(ImageSpec::image_id("postgres"))))
            .with_sidecar(SidecarSpec::new("db", ContainerSpec::new(ImageSpec::image_id("mysql"))));
        let mut provisioner = provisioner(&driver, spec).await;
        provisioner.prepare_agent().await.unwrap();
        provisioner.advance_phase();

        let err = provisioner
            .run_process(ProcStarter::new(["mvn"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::SidecarNameCollision { ref name } if name == "db"));
        assert_eq!(driver.targets_of("launch_sidecar_container"), vec!["postgres"]);
        assert_eq!(driver.calls_named("launch_work_container"), 0);
    }

    #[tokio::test]
    async fn test_build_environment_does_not_override_caller() {
        let driver = MockDriver::new();
        let spec = spec("maven").with_sidecar(SidecarSpec::new(
            "docker",
            ContainerSpec::new(ImageSpec::DockerSocket),
        ));
        let mut provisioner = provisioner(&driver, spec).await;
        provisioner.prepare_agent().await.unwrap();
        provisioner.advance_phase();

        provisioner
            .run_process(ProcStarter::new(["docker", "ps"]))
            .await
            .unwrap();
        provisioner
            .run_process(ProcStarter::new(["docker", "ps"]).env("DOCKER_HOST", "unix:///custom.sock"))
            .await
            .unwrap();

        let history = driver.get_exec_history();
        assert_eq!(
            history[0].envs,
            vec![("DOCKER_HOST".to_string(), "tcp://localhost:2375".to_string())]
        );
        assert_eq!(
            history[1].envs,
            vec![("DOCKER_HOST".to_string(), "unix:///custom.sock".to_string())]
        );
    }

    #[tokio::test]
    async fn test_failed_exec_is_process_execution_failure() {
        let driver = MockDriver::new();
        let mut provisioner = provisioner(&driver, spec("alpine")).await;
        provisioner.prepare_agent().await.unwrap();
        driver.fail_on("exec_in_container");
        let err = provisioner
            .run_process(ProcStarter::new(["true"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::ProcessExecutionFailed { .. }));
        assert!(provisioner.session().checkout_container().is_some());
    }
}
