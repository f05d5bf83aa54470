//! Provisioner settings
//!
//! Settings are read from an optional TOML file and then overridden from the
//! environment. Every field has a default so an empty or missing file yields a
//! usable configuration talking to the local engine through the `docker` CLI.
//!
//! ## Environment Variables
//!
//! * `STEVEDORE_DRIVER` - driver implementation (`cli` or `native`)
//! * `STEVEDORE_DOCKER_HOST` - engine endpoint, overrides `engine.host`
//! * `STEVEDORE_DOCKER_PATH` - CLI binary, overrides `engine.docker_path`

use crate::driver::DriverKind;
use crate::errors::ConfigError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const DRIVER_ENV: &str = "STEVEDORE_DRIVER";
pub const DOCKER_HOST_ENV: &str = "STEVEDORE_DOCKER_HOST";
pub const DOCKER_PATH_ENV: &str = "STEVEDORE_DOCKER_PATH";

/// Top-level settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Driver implementation used to reach the engine
    pub driver: Option<DriverKind>,
    pub engine: EngineSettings,
    pub images: ImageSettings,
    pub agent: AgentSettings,
}

/// How to reach the container engine
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineSettings {
    /// Engine endpoint (`unix://`, `tcp://`); local default when unset
    pub host: Option<String>,
    /// Verify the engine's TLS certificate
    pub tls_verify: bool,
    /// PEM-encoded CA certificate
    pub ca_pem: Option<String>,
    /// PEM-encoded client certificate
    pub cert_pem: Option<String>,
    /// PEM-encoded client key
    pub key_pem: Option<String>,
    /// Engine CLI binary used by the CLI driver
    pub docker_path: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            host: None,
            tls_verify: false,
            ca_pem: None,
            cert_pem: None,
            key_pem: None,
            docker_path: "docker".to_string(),
        }
    }
}

impl EngineSettings {
    /// Whether any TLS key material is configured
    pub fn has_key_material(&self) -> bool {
        self.ca_pem.is_some() || self.cert_pem.is_some() || self.key_pem.is_some()
    }
}

/// Images the provisioner uses on its own behalf
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImageSettings {
    /// Image hosting the agent process
    pub agent: String,
    /// Tooling image used before checkout completes
    pub checkout: String,
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            agent: "jenkinsci/slave".to_string(),
            checkout: "buildpack-deps:scm".to_string(),
        }
    }
}

/// Agent container and in-container helper configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentSettings {
    /// Host file copied into the agent container's workspace root
    pub payload: Option<PathBuf>,
    /// Agent process command line
    pub command: Vec<String>,
    /// Host path of the trampoline helper injected into work containers
    pub helper: Option<PathBuf>,
    /// Workspace mount point inside every container; absolute, ends with `/`
    pub workspace_root: String,
    /// `uid:gid` processes run as
    pub user: String,
    /// Keep the agent container after `clean` so the next build can reuse it
    pub reuse: bool,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            payload: None,
            command: vec![
                "java".to_string(),
                "-Djava.io.tmpdir=/home/jenkins/.tmp".to_string(),
                "-jar".to_string(),
                "/home/jenkins/slave.jar".to_string(),
            ],
            helper: None,
            workspace_root: "/home/jenkins/".to_string(),
            user: "10000:10000".to_string(),
            reuse: true,
        }
    }
}

impl AgentSettings {
    /// `TMPDIR` shared between containers through the workspace volume
    pub fn tmp_dir(&self) -> String {
        format!("{}.tmp", self.workspace_root)
    }

    /// File name of the payload inside the workspace root
    pub fn payload_name(&self) -> Option<String> {
        self.payload
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
    }

    /// Numeric uid and gid parsed from `user`
    pub fn uid_gid(&self) -> Option<(u32, u32)> {
        let (uid, gid) = self.user.split_once(':')?;
        Some((uid.parse().ok()?, gid.parse().ok()?))
    }
}

impl Settings {
    /// Load settings from `path` (when given and present), then apply env overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut settings = match path {
            Some(path) if path.exists() => Self::from_file(path)?,
            Some(path) => {
                debug!("Settings file {} not found, using defaults", path.display());
                Self::default()
            }
            None => Self::default(),
        };
        settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    /// Parse a settings file without env overrides
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text).map_err(|e| match e {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                message,
            },
            other => other,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: "<inline>".to_string(),
            message: e.to_string(),
        })
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(raw) = std::env::var(DRIVER_ENV) {
            match raw.parse() {
                Ok(kind) => self.driver = Some(kind),
                Err(e) => tracing::warn!("Ignoring {}: {}", DRIVER_ENV, e),
            }
        }
        if let Ok(host) = std::env::var(DOCKER_HOST_ENV) {
            if !host.is_empty() {
                self.engine.host = Some(host);
            }
        }
        if let Ok(path) = std::env::var(DOCKER_PATH_ENV) {
            if !path.is_empty() {
                self.engine.docker_path = path;
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let root = &self.agent.workspace_root;
        if !root.starts_with('/') || !root.ends_with('/') {
            return Err(ConfigError::Validation {
                message: format!(
                    "agent.workspace_root '{}' must be absolute and end with '/'",
                    root
                ),
            });
        }
        if self.agent.uid_gid().is_none() {
            return Err(ConfigError::Validation {
                message: format!("agent.user '{}' must be numeric uid:gid", self.agent.user),
            });
        }
        if self.agent.command.is_empty() {
            return Err(ConfigError::Validation {
                message: "agent.command must not be empty".to_string(),
            });
        }
        if self.images.agent.is_empty() || self.images.checkout.is_empty() {
            return Err(ConfigError::Validation {
                message: "images.agent and images.checkout must be set".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.agent.tmp_dir(), "/home/jenkins/.tmp");
        assert_eq!(settings.agent.uid_gid(), Some((10000, 10000)));
        assert!(settings.agent.reuse);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let settings = Settings::from_toml(
            r#"
driver = "native"

[images]
checkout = "alpine/git"

[agent]
payload = "/opt/agent.jar"
reuse = false
"#,
        )
        .unwrap();
        assert_eq!(settings.driver, Some(DriverKind::Native));
        assert_eq!(settings.images.checkout, "alpine/git");
        assert_eq!(settings.images.agent, "jenkinsci/slave");
        assert_eq!(settings.agent.payload_name().as_deref(), Some("agent.jar"));
        assert!(!settings.agent.reuse);
        assert_eq!(settings.engine.docker_path, "docker");
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let err = Settings::from_toml("[agent]\nworkdir = \"/x/\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_workspace_root_must_be_absolute_directory() {
        let mut settings = Settings::default();
        settings.agent.workspace_root = "home/jenkins".to_string();
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::Validation { .. })
        ));
    }

    #[test]
    fn test_user_must_be_numeric() {
        let mut settings = Settings::default();
        settings.agent.user = "jenkins".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_from_file_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::from_file(&dir.path().join("absent.toml"));
        assert!(matches!(settings, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_load_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(settings.images.checkout, "buildpack-deps:scm");
    }

    #[test]
    fn test_key_material_detection() {
        let mut engine = EngineSettings::default();
        assert!(!engine.has_key_material());
        engine.cert_pem = Some("-----BEGIN CERTIFICATE-----".to_string());
        assert!(engine.has_key_material());
    }
}
