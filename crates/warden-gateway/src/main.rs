mod app;
mod args;
mod audit;
mod auth;
mod handlers;
mod metrics;
mod responses;
mod state;
mod sync;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use warden_common::telemetry::init_tracing;
use warden_registry::{ActionRegistry, MemoryRegistry};
use warden_runtime::{create_sandbox, EventSink, Supervisor, TracingEventSink};

use crate::app::build_app;
use crate::args::Args;
use crate::audit::AuditWriter;
use crate::auth::parse_auth_from_env;
use crate::state::AppState;
use crate::sync::{maintenance_loop, registry_sync_loop};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let otel_guard = init_tracing(
        "warden-gateway",
        args.otlp_endpoint.as_deref(),
        args.otlp_token.as_deref(),
        args.log_format,
    );

    let config = args.resolve_config().map_err(|e| {
        tracing::error!(error=%e, "invalid configuration");
        e
    })?;

    let registry: Arc<dyn ActionRegistry> = Arc::new(
        MemoryRegistry::with_actions(
            config.registry.allow_unregistered,
            config.registry.actions.clone(),
        )
        .await,
    );
    let sandbox = create_sandbox(&config.sandbox, &config.limits)?;
    let audit = AuditWriter::spawn(args.audit_url.as_deref(), args.audit_token.as_deref())?;
    let events: Arc<dyn EventSink> = match &audit {
        Some(writer) => writer.clone(),
        None => Arc::new(TracingEventSink),
    };

    tracing::info!(
        sandbox = sandbox.kind(),
        min_workers = config.pool.min_workers,
        max_workers = config.pool.max_workers,
        queue_depth = config.pool.queue_depth,
        actions = config.registry.actions.len(),
        "warden gateway starting"
    );

    let supervisor = Arc::new(Supervisor::new(&config, registry.clone(), sandbox, events));

    let supervisor_for_sync = supervisor.clone();
    tokio::spawn(async move {
        if let Err(e) = registry_sync_loop(registry, supervisor_for_sync).await {
            tracing::error!(error=%e, "registry sync loop exited");
        }
    });
    tokio::spawn(maintenance_loop(
        supervisor.clone(),
        Duration::from_millis(args.maintenance_interval_ms.max(1)),
    ));

    let app = build_app(
        AppState::new(supervisor.clone(), parse_auth_from_env()).with_audit(audit),
    );

    let listener = tokio::net::TcpListener::bind(&args.listen_addr).await?;
    tracing::info!(addr = %args.listen_addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down worker pool");
    supervisor.shutdown().await;

    if let Some(provider) = otel_guard {
        if let Err(e) = provider.shutdown() {
            eprintln!("failed to flush traces: {e}");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error=%e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
