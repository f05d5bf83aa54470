//! Engine endpoint and TLS key material
//!
//! PEM material configured inline is written to a private temporary directory
//! for the lifetime of the driver, the layout `DOCKER_CERT_PATH` expects
//! (`ca.pem`, `cert.pem`, `key.pem`). The directory is removed on
//! [`EngineEndpoint::close`] or when the endpoint is dropped.

use crate::errors::EngineResult;
use crate::settings::EngineSettings;
use std::path::Path;
use tempfile::TempDir;
use tracing::debug;

#[derive(Debug)]
pub struct EngineEndpoint {
    host: Option<String>,
    tls_verify: bool,
    cert_dir: Option<TempDir>,
}

impl EngineEndpoint {
    pub fn from_settings(engine: &EngineSettings) -> EngineResult<Self> {
        let cert_dir = if engine.has_key_material() {
            let dir = tempfile::Builder::new().prefix("stevedore-tls-").tempdir()?;
            for (name, pem) in [
                ("ca.pem", &engine.ca_pem),
                ("cert.pem", &engine.cert_pem),
                ("key.pem", &engine.key_pem),
            ] {
                if let Some(pem) = pem {
                    write_private(&dir.path().join(name), pem)?;
                }
            }
            debug!("Materialized engine key material in {}", dir.path().display());
            Some(dir)
        } else {
            None
        };

        Ok(Self {
            host: engine.host.clone().filter(|h| !h.is_empty()),
            tls_verify: engine.tls_verify,
            cert_dir,
        })
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn cert_path(&self) -> Option<&Path> {
        self.cert_dir.as_ref().map(|d| d.path())
    }

    /// Whether talking to this endpoint involves TLS
    pub fn is_tls(&self) -> bool {
        self.tls_verify || self.cert_dir.is_some()
    }

    /// Variables the engine CLI reads to reach this endpoint
    pub fn environment(&self) -> Vec<(String, String)> {
        let mut env = Vec::new();
        if let Some(host) = &self.host {
            env.push(("DOCKER_HOST".to_string(), host.clone()));
        }
        if self.tls_verify {
            env.push(("DOCKER_TLS_VERIFY".to_string(), "1".to_string()));
        }
        if let Some(path) = self.cert_path() {
            env.push((
                "DOCKER_CERT_PATH".to_string(),
                path.display().to_string(),
            ));
        }
        env
    }

    /// Delete materialized key material
    pub fn close(&mut self) -> EngineResult<()> {
        if let Some(dir) = self.cert_dir.take() {
            debug!("Removing engine key material in {}", dir.path().display());
            dir.close()?;
        }
        Ok(())
    }
}

fn write_private(path: &Path, contents: &str) -> std::io::Result<()> {
    std::fs::write(path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}
