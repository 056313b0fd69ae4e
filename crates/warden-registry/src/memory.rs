use std::{collections::BTreeMap, sync::Arc};

use tokio::sync::{broadcast, RwLock};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use warden_common::{ActionDescriptor, ActionTarget};

use crate::types::{ActionRegistry, RegistryError, RegistryEvent, WatchStream};

/// In-process registry seeded from configuration.
///
/// Every version ever upserted stays resolvable when pinned explicitly, so
/// callers pinned to an older release keep working after an upgrade.
#[derive(Debug, Clone)]
pub struct MemoryRegistry {
    inner: Arc<RwLock<Inner>>,
    tx: broadcast::Sender<RegistryEvent>,
    allow_unregistered: bool,
}

#[derive(Debug, Default)]
struct Inner {
    revision: u64,
    actions: BTreeMap<String, ActionEntry>,
}

#[derive(Debug)]
struct ActionEntry {
    current: String,
    versions: BTreeMap<String, ActionDescriptor>,
}

impl MemoryRegistry {
    pub fn new(allow_unregistered: bool) -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            tx,
            allow_unregistered,
        }
    }

    pub async fn with_actions(
        allow_unregistered: bool,
        actions: impl IntoIterator<Item = ActionDescriptor>,
    ) -> Self {
        let registry = Self::new(allow_unregistered);
        for descriptor in actions {
            registry.upsert(descriptor).await;
        }
        registry
    }

    fn next_revision(inner: &mut Inner) -> u64 {
        inner.revision = inner.revision.saturating_add(1);
        inner.revision
    }

    fn emit(&self, event: RegistryEvent) {
        let _ = self.tx.send(event);
    }

    /// Registers a descriptor and makes its version current. Emits an event
    /// only when the current version actually changed.
    pub async fn upsert(&self, descriptor: ActionDescriptor) -> u64 {
        let (rev, event) = {
            let mut inner = self.inner.write().await;
            let rev = Self::next_revision(&mut inner);
            let action = descriptor.action.clone();
            let version = descriptor.version.clone();

            let previous = match inner.actions.get_mut(&action) {
                Some(entry) => {
                    let previous = std::mem::replace(&mut entry.current, version.clone());
                    entry.versions.insert(version.clone(), descriptor);
                    Some(previous)
                }
                None => {
                    let mut versions = BTreeMap::new();
                    versions.insert(version.clone(), descriptor);
                    inner.actions.insert(
                        action.clone(),
                        ActionEntry {
                            current: version.clone(),
                            versions,
                        },
                    );
                    None
                }
            };

            let changed = previous.as_deref() != Some(version.as_str());
            let event = changed.then(|| RegistryEvent {
                action,
                version: Some(version),
                previous_version: previous,
                revision: rev,
            });
            (rev, event)
        };

        if let Some(event) = event {
            tracing::info!(
                action = %event.action,
                version = ?event.version,
                previous = ?event.previous_version,
                "action version changed"
            );
            self.emit(event);
        }
        rev
    }

    /// Drops an action and all its versions. Returns false if it was unknown.
    pub async fn remove(&self, action: &str) -> bool {
        let event = {
            let mut inner = self.inner.write().await;
            let Some(entry) = inner.actions.remove(action) else {
                return false;
            };
            let rev = Self::next_revision(&mut inner);
            RegistryEvent {
                action: action.to_string(),
                version: None,
                previous_version: Some(entry.current),
                revision: rev,
            }
        };
        self.emit(event);
        true
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new(false)
    }
}

#[async_trait::async_trait]
impl ActionRegistry for MemoryRegistry {
    async fn resolve(&self, target: &ActionTarget) -> Result<ActionDescriptor, RegistryError> {
        let inner = self.inner.read().await;
        match (inner.actions.get(&target.action), &target.version) {
            (Some(entry), None) => entry
                .versions
                .get(&entry.current)
                .cloned()
                .ok_or_else(|| RegistryError::NotFound(target.action.clone())),
            (Some(entry), Some(version)) => entry.versions.get(version).cloned().ok_or_else(|| {
                RegistryError::VersionNotFound {
                    action: target.action.clone(),
                    version: version.clone(),
                }
            }),
            (None, Some(version)) if self.allow_unregistered => {
                Ok(ActionDescriptor::new(target.action.clone(), version.clone()))
            }
            (None, _) => Err(RegistryError::NotFound(target.action.clone())),
        }
    }

    async fn list(&self) -> Result<Vec<ActionDescriptor>, RegistryError> {
        let inner = self.inner.read().await;
        Ok(inner
            .actions
            .values()
            .filter_map(|entry| entry.versions.get(&entry.current).cloned())
            .collect())
    }

    async fn watch(&self) -> Result<WatchStream, RegistryError> {
        let rx = self.tx.subscribe();
        let stream = BroadcastStream::new(rx).filter_map(|msg| match msg {
            Ok(ev) => Some(ev),
            Err(e) => {
                tracing::warn!(error=%e, "registry watch lagged, events dropped");
                None
            }
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(s: &str) -> ActionTarget {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_resolve_current_and_pinned_versions() {
        let reg = MemoryRegistry::with_actions(
            false,
            [ActionDescriptor::new("summarize", "v1")],
        )
        .await;
        reg.upsert(ActionDescriptor::new("summarize", "v2")).await;

        assert_eq!(reg.resolve(&target("summarize")).await.unwrap().version, "v2");
        assert_eq!(reg.resolve(&target("summarize@v1")).await.unwrap().version, "v1");
        assert_eq!(
            reg.resolve(&target("summarize@v9")).await,
            Err(RegistryError::VersionNotFound {
                action: "summarize".into(),
                version: "v9".into()
            })
        );
        assert_eq!(
            reg.resolve(&target("translate")).await,
            Err(RegistryError::NotFound("translate".into()))
        );
    }

    #[tokio::test]
    async fn test_allow_unregistered_requires_pinned_version() {
        let reg = MemoryRegistry::new(true);
        let d = reg.resolve(&target("adhoc@1.0")).await.unwrap();
        assert_eq!(d.action, "adhoc");
        assert_eq!(d.version, "1.0");
        assert!(reg.resolve(&target("adhoc")).await.is_err());
    }

    #[tokio::test]
    async fn test_watch_reports_version_changes_only() {
        let reg = MemoryRegistry::new(false);
        let mut stream = reg.watch().await.unwrap();

        reg.upsert(ActionDescriptor::new("summarize", "v1")).await;
        reg.upsert(ActionDescriptor::new("summarize", "v1")).await;
        reg.upsert(ActionDescriptor::new("summarize", "v2")).await;
        assert!(reg.remove("summarize").await);
        assert!(!reg.remove("summarize").await);

        let first = stream.next().await.unwrap();
        assert_eq!(first.version.as_deref(), Some("v1"));
        assert_eq!(first.previous_version, None);

        let second = stream.next().await.unwrap();
        assert_eq!(second.version.as_deref(), Some("v2"));
        assert_eq!(second.previous_version.as_deref(), Some("v1"));

        let third = stream.next().await.unwrap();
        assert_eq!(third.version, None);
        assert_eq!(third.previous_version.as_deref(), Some("v2"));
        assert!(third.revision > second.revision);
    }

    #[tokio::test]
    async fn test_list_returns_current_versions() {
        let reg = MemoryRegistry::with_actions(
            false,
            [
                ActionDescriptor::new("a", "1"),
                ActionDescriptor::new("b", "1"),
                ActionDescriptor::new("a", "2"),
            ],
        )
        .await;
        let listed: Vec<String> = reg.list().await.unwrap().iter().map(|d| d.target()).collect();
        assert_eq!(listed, vec!["a@2".to_string(), "b@1".to_string()]);
    }
}
