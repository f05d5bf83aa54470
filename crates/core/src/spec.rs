//! Container-set specification
//!
//! A [`ContainerSetSpec`] declares the image builds run in, the sidecars that
//! accompany it and placement hints for each. It is produced by the job front
//! end, validated there, and handed to the provisioner read-only.
//!
//! Image descriptors ([`ImageSpec`]) all reduce to a concrete image tag through
//! [`ImageSpec::resolve`], which may inspect, pull or build through the driver.

use crate::driver::Driver;
use crate::errors::{ConfigError, ResolutionError};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

/// Image exposing the host engine's socket over TCP to the build
pub const DOCKER_SOCKET_IMAGE: &str = "dockins/dockersock";

const DOCKER_SOCKET_MOUNT: &str = "/var/run/docker.sock:/var/run/docker.sock";
const DOCKER_SOCKET_HOST: &str = "tcp://localhost:2375";

/// How to obtain the image a container runs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum ImageSpec {
    /// An image referenced by name or id, pulled when missing
    ImageId {
        image: String,
        #[serde(default)]
        force_pull: bool,
    },
    /// An image built from a Dockerfile inside the build workspace
    Dockerfile {
        /// Context directory, relative to the workspace
        context_path: PathBuf,
        /// Dockerfile, relative to the context directory
        #[serde(default = "default_dockerfile")]
        dockerfile: PathBuf,
        #[serde(default)]
        force_pull: bool,
    },
    /// Sidecar giving the build access to the host engine
    DockerSocket,
}

fn default_dockerfile() -> PathBuf {
    PathBuf::from("Dockerfile")
}

impl ImageSpec {
    pub fn image_id(image: impl Into<String>) -> Self {
        Self::ImageId {
            image: image.into(),
            force_pull: false,
        }
    }

    /// Short human description used in logs and error messages
    pub fn describe(&self) -> String {
        match self {
            Self::ImageId { image, .. } => image.clone(),
            Self::Dockerfile {
                context_path,
                dockerfile,
                ..
            } => format!("{}", context_path.join(dockerfile).display()),
            Self::DockerSocket => DOCKER_SOCKET_IMAGE.to_string(),
        }
    }

    /// Mounts the image needs regardless of placement hints
    pub fn implicit_mounts(&self) -> Vec<String> {
        match self {
            Self::DockerSocket => vec![DOCKER_SOCKET_MOUNT.to_string()],
            _ => Vec::new(),
        }
    }

    /// Environment the image contributes to build processes
    pub fn environment(&self) -> Vec<(String, String)> {
        match self {
            Self::DockerSocket => vec![("DOCKER_HOST".to_string(), DOCKER_SOCKET_HOST.to_string())],
            _ => Vec::new(),
        }
    }

    /// Turn this descriptor into an image tag the engine can create containers from
    ///
    /// `workspace` is the host directory Dockerfile contexts are relative to.
    #[instrument(skip(self, driver), fields(image = %self.describe()))]
    pub async fn resolve<D: Driver>(
        &self,
        driver: &D,
        workspace: &Path,
    ) -> Result<String, ResolutionError> {
        match self {
            Self::ImageId { image, force_pull } => {
                let exists = driver.check_image_exists(image).await?;
                if !exists || *force_pull {
                    info!("Pulling image {}", image);
                    driver.pull_image(image).await?;
                }
                Ok(image.clone())
            }
            Self::Dockerfile {
                context_path,
                dockerfile,
                force_pull,
            } => {
                let context = workspace.join(context_path);
                if !context.is_dir() {
                    return Err(ResolutionError::MissingContext {
                        path: context.display().to_string(),
                    });
                }
                let dockerfile = context.join(dockerfile);
                if !dockerfile.is_file() {
                    return Err(ResolutionError::MissingDockerfile {
                        path: dockerfile.display().to_string(),
                    });
                }

                let archive = tokio::task::spawn_blocking(move || {
                    crate::archive::pack_build_context(&context, &dockerfile)
                })
                .await
                .map_err(|e| {
                    ResolutionError::Packaging(std::io::Error::other(e.to_string()))
                })??;

                let tag = synthetic_tag();
                info!("Building image {} from {}", tag, self.describe());
                driver
                    .build_from_dockerfile(archive, &tag, *force_pull)
                    .await?;
                Ok(tag)
            }
            Self::DockerSocket => {
                debug!("Docker socket sidecar needs no resolution");
                Ok(DOCKER_SOCKET_IMAGE.to_string())
            }
        }
    }
}

/// Tag for images built from Dockerfiles; unique per build
fn synthetic_tag() -> String {
    format!("stevedore-{:016x}", fastrand::u64(..))
}

/// Resource and mount hints applied when a container is created
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlacementHints {
    /// Memory limit in engine syntax, e.g. `512m`
    pub memory: Option<String>,
    /// Extra volume mounts, `source:target[:mode]`
    pub volumes: Vec<String>,
    /// Raw engine options, split with shell quoting rules
    pub raw_options: Option<String>,
}

impl PlacementHints {
    /// Raw options as an argument vector
    pub fn raw_args(&self) -> Result<Vec<String>, shell_words::ParseError> {
        match &self.raw_options {
            Some(raw) => shell_words::split(raw),
            None => Ok(Vec::new()),
        }
    }
}

/// An image plus where and how to run it
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContainerSpec {
    pub image: ImageSpec,
    #[serde(default)]
    pub hints: PlacementHints,
}

impl ContainerSpec {
    pub fn new(image: ImageSpec) -> Self {
        Self {
            image,
            hints: PlacementHints::default(),
        }
    }

    pub fn with_hints(mut self, hints: PlacementHints) -> Self {
        self.hints = hints;
        self
    }

    /// Hints with the image's implicit mounts folded in
    pub fn effective_hints(&self) -> PlacementHints {
        let mut hints = self.hints.clone();
        for mount in self.image.implicit_mounts() {
            if !hints.volumes.contains(&mount) {
                hints.volumes.push(mount);
            }
        }
        hints
    }
}

/// A named auxiliary container
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SidecarSpec {
    pub name: String,
    #[serde(flatten)]
    pub container: ContainerSpec,
}

impl SidecarSpec {
    pub fn new(name: impl Into<String>, container: ContainerSpec) -> Self {
        Self {
            name: name.into(),
            container,
        }
    }
}

/// Everything a job declares about the containers hosting its builds
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContainerSetSpec {
    pub work: ContainerSpec,
    #[serde(default)]
    pub sidecars: Vec<SidecarSpec>,
}

impl ContainerSetSpec {
    pub fn new(work: ContainerSpec) -> Self {
        Self {
            work,
            sidecars: Vec::new(),
        }
    }

    pub fn with_sidecar(mut self, sidecar: SidecarSpec) -> Self {
        self.sidecars.push(sidecar);
        self
    }

    /// Environment contributed by the work image and every sidecar image
    pub fn environment(&self) -> Vec<(String, String)> {
        let mut env = self.work.image.environment();
        for sidecar in &self.sidecars {
            for (key, value) in sidecar.container.image.environment() {
                if !env.iter().any(|(k, _)| *k == key) {
                    env.push((key, value));
                }
            }
        }
        env
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: "<inline>".to_string(),
            message: e.to_string(),
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }
}
