use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use warden_common::{ActionDescriptor, ActionTarget};

/// Emitted whenever the current version of an action changes. `version` is
/// `None` when the action was removed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEvent {
    pub action: String,
    pub version: Option<String>,
    pub previous_version: Option<String>,
    pub revision: u64,
}

pub type WatchStream = Pin<Box<dyn Stream<Item = RegistryEvent> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("action '{0}' is not registered")]
    NotFound(String),
    #[error("action '{action}' has no version '{version}'")]
    VersionNotFound { action: String, version: String },
    #[error("registry unavailable: {0}")]
    Unavailable(String),
}

/// Source of truth for which actions exist and how they run.
#[async_trait]
pub trait ActionRegistry: Send + Sync {
    /// Resolves a target to a concrete version. An unversioned target resolves
    /// to the action's current version.
    async fn resolve(&self, target: &ActionTarget) -> Result<ActionDescriptor, RegistryError>;

    /// Current descriptor of every registered action.
    async fn list(&self) -> Result<Vec<ActionDescriptor>, RegistryError>;

    /// Version-change notifications from now on.
    async fn watch(&self) -> Result<WatchStream, RegistryError>;
}
