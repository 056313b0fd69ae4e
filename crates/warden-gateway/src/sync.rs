use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use warden_registry::{ActionRegistry, RegistryEvent};
use warden_runtime::Supervisor;

/// Drops every cached result of an action whose current version changed.
pub fn apply_registry_event(supervisor: &Supervisor, event: &RegistryEvent) -> usize {
    tracing::info!(
        action = %event.action,
        version = ?event.version,
        previous_version = ?event.previous_version,
        revision = event.revision,
        "action version changed"
    );
    supervisor.invalidate(&event.action, None)
}

pub async fn registry_sync_loop(
    registry: Arc<dyn ActionRegistry>,
    supervisor: Arc<Supervisor>,
) -> anyhow::Result<()> {
    loop {
        let mut stream = match registry.watch().await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error=%e, "failed to watch registry, will retry");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        while let Some(event) = stream.next().await {
            apply_registry_event(&supervisor, &event);
        }

        tracing::warn!("registry watch stream ended, reconnecting");
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

pub async fn maintenance_loop(supervisor: Arc<Supervisor>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let report = supervisor.maintenance();
        if !report.is_empty() {
            tracing::debug!(
                circuits = report.circuits_swept,
                expired = report.cache_expired,
                tenants = report.quota_swept,
                "maintenance sweep"
            );
        }
    }
}
