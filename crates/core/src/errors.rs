//! Error types and handling
//!
//! The taxonomy is layered the same way the rest of the crate is: drivers
//! report [`EngineError`] (what went wrong talking to the container engine),
//! image descriptors report [`ResolutionError`], and the provisioner wraps
//! both into [`ProvisionError`] with the operation and resource that failed.
//! Settings and container-set file loading report [`ConfigError`].

use std::fmt;
use thiserror::Error;

/// Failures talking to the container engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// The engine CLI binary could not be spawned
    #[error("Container engine CLI is not installed or not accessible: {path}")]
    NotInstalled { path: String },

    /// An engine CLI invocation exited unsuccessfully
    #[error("Engine CLI error during {operation}: {message}")]
    Cli { operation: String, message: String },

    /// Native Engine API failure
    #[error("Engine API error: {0}")]
    Api(#[from] bollard::errors::Error),

    /// Local I/O failure while talking to the engine (pipes, temp files)
    #[error("Engine I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Building or reading a copy-in/copy-out tar archive failed
    #[error("Archive error: {0}")]
    Archive(String),

    /// A blocking engine call panicked or was cancelled
    #[error("Task join error: {0}")]
    TaskJoin(String),

    /// The engine reported a failure inside a streamed API response
    #[error("Engine reported an error during {operation}: {message}")]
    Daemon { operation: String, message: String },

    /// The driver cannot honour the requested engine configuration
    #[error("Unsupported engine configuration: {0}")]
    Config(String),
}

impl EngineError {
    pub(crate) fn cli(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Cli {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

/// Failures turning an image descriptor into a concrete image tag
#[derive(Error, Debug)]
pub enum ResolutionError {
    /// The Dockerfile build context directory is missing
    #[error("Build context {path} does not exist")]
    MissingContext { path: String },

    /// The Dockerfile is missing from the build context
    #[error("Dockerfile {path} does not exist")]
    MissingDockerfile { path: String },

    /// Packaging the build context failed
    #[error("Failed to package build context: {0}")]
    Packaging(#[from] std::io::Error),

    /// The engine rejected an inspect, pull or build call
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Kind of engine resource the provisioner creates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Volume,
    AgentContainer,
    CheckoutContainer,
    WorkContainer,
    SidecarContainer,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Volume => "volume",
            Self::AgentContainer => "agent container",
            Self::CheckoutContainer => "checkout container",
            Self::WorkContainer => "work container",
            Self::SidecarContainer => "sidecar container",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One removal that failed during cleanup
#[derive(Debug)]
pub struct CleanupFailure {
    /// Which resource was being removed (e.g. "sidecar db", "work container")
    pub resource: String,
    /// Container id or volume name
    pub target: String,
    pub source: EngineError,
}

impl fmt::Display for CleanupFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.resource, self.target, self.source)
    }
}

/// Provisioner-level errors, each carrying the failing operation's context
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// The initial connectivity probe failed; no build can proceed
    #[error("Container engine is unreachable: {source}")]
    EngineUnreachable {
        #[source]
        source: EngineError,
    },

    /// Checking whether a carried-over volume or container still exists failed
    #[error("Failed to check whether {resource} {target} exists: {source}")]
    ExistenceCheckFailed {
        resource: ResourceKind,
        target: String,
        #[source]
        source: EngineError,
    },

    /// Creating a volume or container failed
    #[error("Failed to create {resource} for {target}: {source}")]
    ResourceCreationFailed {
        resource: ResourceKind,
        target: String,
        #[source]
        source: EngineError,
    },

    /// Pull, build or inspect failed while resolving an image descriptor
    #[error("Failed to resolve image {image}: {source}")]
    ImageResolutionFailed {
        image: String,
        #[source]
        source: ResolutionError,
    },

    /// The exec call itself failed to start
    #[error("Failed to start process in container {container}: {source}")]
    ProcessExecutionFailed {
        container: String,
        #[source]
        source: EngineError,
    },

    /// One or more removals failed during cleanup; every removal was attempted
    #[error("Cleanup failed for {} resource(s): {}",
        failures.len(),
        failures.iter().map(|f| f.to_string()).collect::<Vec<_>>().join("; "))]
    CleanupPartialFailure { failures: Vec<CleanupFailure> },

    /// Two sidecars with the same name were about to be created
    #[error("Sidecar name collision: a sidecar named '{name}' already exists in this build")]
    SidecarNameCollision { name: String },

    /// An operation needing the agent container ran before `prepare_agent`
    #[error("Agent container has not been prepared")]
    AgentNotPrepared,
}

/// Settings and container-set file loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File I/O error
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error
    #[error("Failed to parse {path}: {message}")]
    Parse { path: String, message: String },

    /// Semantic validation error
    #[error("Configuration validation error: {message}")]
    Validation { message: String },
}

/// Convenience type alias for provisioner results
pub type Result<T> = std::result::Result<T, ProvisionError>;

/// Convenience type alias for driver results
pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_engine_error_display() {
        let error = EngineError::cli("volume create", "permission denied");
        assert_eq!(
            error.to_string(),
            "Engine CLI error during volume create: permission denied"
        );

        let error = EngineError::NotInstalled {
            path: "/usr/bin/docker".to_string(),
        };
        assert!(error.to_string().contains("/usr/bin/docker"));
    }

    #[test]
    fn test_resource_creation_display_names_resource_and_target() {
        let error = ProvisionError::ResourceCreationFailed {
            resource: ResourceKind::WorkContainer,
            target: "maven:3".to_string(),
            source: EngineError::cli("create", "no such image"),
        };
        let rendered = error.to_string();
        assert!(rendered.contains("work container"));
        assert!(rendered.contains("maven:3"));
        assert!(rendered.contains("no such image"));
    }

    #[test]
    fn test_cleanup_failure_aggregates_every_failure() {
        let error = ProvisionError::CleanupPartialFailure {
            failures: vec![
                CleanupFailure {
                    resource: "sidecar db".to_string(),
                    target: "abc".to_string(),
                    source: EngineError::cli("rm", "gone"),
                },
                CleanupFailure {
                    resource: "work container".to_string(),
                    target: "def".to_string(),
                    source: EngineError::cli("rm", "busy"),
                },
            ],
        };
        let rendered = error.to_string();
        assert!(rendered.starts_with("Cleanup failed for 2 resource(s)"));
        assert!(rendered.contains("sidecar db abc"));
        assert!(rendered.contains("work container def"));
    }

    #[test]
    fn test_resolution_error_source_chain() {
        let error = ProvisionError::ImageResolutionFailed {
            image: "build-tools:1".to_string(),
            source: ResolutionError::Engine(EngineError::cli("pull", "denied")),
        };
        assert!(error.source().is_some());
        assert!(error.to_string().contains("build-tools:1"));
    }

    #[test]
    fn test_anyhow_conversion() {
        let anyhow_error = anyhow::Error::from(ProvisionError::AgentNotPrepared);
        assert!(anyhow_error.to_string().contains("Agent container"));
    }
}
