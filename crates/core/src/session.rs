//! Per-build session state
//!
//! [`SessionState`] records which volume and containers exist for one build.
//! It is owned by a single provisioner and mutated only through it; the only
//! value that crosses a build boundary is the explicit [`CarryOver`].

use crate::container::ContainerHandle;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Which container `run_process` targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    /// Before source checkout completed; processes run in the checkout container
    #[default]
    PreCheckout,
    /// After checkout; processes run in the work container
    Build,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreCheckout => "pre-checkout",
            Self::Build => "build",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State handed from one build of a job to the next
///
/// Only the agent container and its workspace volume may be reused; both are
/// re-validated against the engine before use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CarryOver {
    pub agent_container: Option<ContainerHandle>,
    pub workdir_volume: Option<String>,
}

/// What has been provisioned so far for one build
#[derive(Debug, Default)]
pub struct SessionState {
    pub(crate) agent_container: Option<ContainerHandle>,
    pub(crate) workdir_volume: Option<String>,
    pub(crate) checkout_container: Option<ContainerHandle>,
    pub(crate) work_container: Option<ContainerHandle>,
    pub(crate) sidecars: HashMap<String, ContainerHandle>,
    pub(crate) phase: Phase,
}

impl SessionState {
    /// Fresh state for a build, seeded with whatever the previous build left
    pub fn new(carry_over: Option<CarryOver>) -> Self {
        let carry_over = carry_over.unwrap_or_default();
        Self {
            agent_container: carry_over.agent_container,
            workdir_volume: carry_over.workdir_volume,
            ..Default::default()
        }
    }

    pub fn agent_container(&self) -> Option<&ContainerHandle> {
        self.agent_container.as_ref()
    }

    pub fn workdir_volume(&self) -> Option<&str> {
        self.workdir_volume.as_deref()
    }

    pub fn checkout_container(&self) -> Option<&ContainerHandle> {
        self.checkout_container.as_ref()
    }

    pub fn work_container(&self) -> Option<&ContainerHandle> {
        self.work_container.as_ref()
    }

    pub fn sidecars(&self) -> &HashMap<String, ContainerHandle> {
        &self.sidecars
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Container processes are dispatched to in the current phase, if created
    pub fn current_container(&self) -> Option<&ContainerHandle> {
        match self.phase {
            Phase::PreCheckout => self.checkout_container.as_ref(),
            Phase::Build => self.work_container.as_ref(),
        }
    }

    /// The reusable part of this session, for the next build of the same job
    pub fn carry_over(&self) -> CarryOver {
        CarryOver {
            agent_container: self.agent_container.clone(),
            workdir_volume: self.workdir_volume.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_starts_pre_checkout_and_empty() {
        let session = SessionState::new(None);
        assert_eq!(session.phase(), Phase::PreCheckout);
        assert!(session.agent_container().is_none());
        assert!(session.workdir_volume().is_none());
        assert!(session.sidecars().is_empty());
        assert!(session.current_container().is_none());
    }

    #[test]
    fn test_carry_over_seeds_only_agent_and_volume() {
        let carry_over = CarryOver {
            agent_container: Some(ContainerHandle::new("agent", "a1")),
            workdir_volume: Some("vol1".to_string()),
        };
        let session = SessionState::new(Some(carry_over.clone()));
        assert_eq!(session.agent_container().map(|c| c.id()), Some("a1"));
        assert_eq!(session.workdir_volume(), Some("vol1"));
        assert!(session.work_container().is_none());
        assert_eq!(session.carry_over(), carry_over);
    }

    #[test]
    fn test_carry_over_persists_as_json() {
        let carry_over = CarryOver {
            agent_container: Some(ContainerHandle::new("jenkinsci/slave", "a1")),
            workdir_volume: Some("vol1".to_string()),
        };
        let json = serde_json::to_string(&carry_over).unwrap();
        assert_eq!(serde_json::from_str::<CarryOver>(&json).unwrap(), carry_over);
        assert_eq!(serde_json::from_str::<CarryOver>("{}").unwrap(), CarryOver::default());
    }

    #[test]
    fn test_current_container_follows_phase() {
        let mut session = SessionState::new(None);
        session.checkout_container = Some(ContainerHandle::new("scm", "c1"));
        session.work_container = Some(ContainerHandle::new("maven", "w1"));
        assert_eq!(session.current_container().map(|c| c.id()), Some("c1"));
        session.phase = Phase::Build;
        assert_eq!(session.current_container().map(|c| c.id()), Some("w1"));
    }
}
