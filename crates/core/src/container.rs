//! Container handles

use serde::{Deserialize, Serialize};
use std::fmt;

/// One container created by the engine on behalf of a build
///
/// A handle only exists once the engine has assigned an id; code that needs
/// "not created yet" holds an `Option<ContainerHandle>` instead of a handle
/// with an empty id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerHandle {
    image: String,
    id: String,
}

impl ContainerHandle {
    pub fn new(image: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            id: id.into(),
        }
    }

    /// Image the container was created from
    pub fn image(&self) -> &str {
        &self.image
    }

    /// Engine-assigned container id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Abbreviated id for log lines
    pub fn short_id(&self) -> &str {
        let end = self
            .id
            .char_indices()
            .nth(12)
            .map(|(idx, _)| idx)
            .unwrap_or(self.id.len());
        &self.id[..end]
    }
}

impl fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.short_id(), self.image)
    }
}
