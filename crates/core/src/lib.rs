//! Core library for stevedore
//!
//! Provisions the containers a CI build runs in: a long-lived agent container
//! anchoring the workspace volume, a checkout container used until sources
//! are in place, a work container built from the job's image, and optional
//! sidecars, all sharing the agent's network and IPC namespaces.

pub mod archive;
pub mod container;
pub mod driver;
pub mod errors;
pub mod logging;
pub mod process;
pub mod provisioner;
pub mod session;
pub mod settings;
pub mod spec;

/// Get the version of the core library
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        let version = version();
        assert!(!version.is_empty());
        assert!(version.contains('.'));
    }
}
