use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use warden_common::ExecutionEvent;
use warden_runtime::EventSink;

const CHANNEL_CAPACITY: usize = 4096;
const MAX_BATCH: usize = 64;

/// Ships execution events to an ingest endpoint in batches.
///
/// `emit` never blocks the request path: when the channel is full the event
/// is dropped and counted.
pub struct AuditWriter {
    tx: mpsc::Sender<ExecutionEvent>,
    dropped: AtomicU64,
}

impl AuditWriter {
    /// Spawns the background writer. Returns `None` when no URL is configured.
    pub fn spawn(url: Option<&str>, token: Option<&str>) -> anyhow::Result<Option<Arc<Self>>> {
        let Some(url) = url.filter(|u| !u.is_empty()) else {
            return Ok(None);
        };

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        tokio::spawn(audit_worker(
            http,
            url.to_string(),
            token.filter(|t| !t.is_empty()).map(str::to_string),
            rx,
        ));

        tracing::info!(url, "audit writer enabled");
        Ok(Some(Arc::new(Self::from_sender(tx))))
    }

    pub(crate) fn from_sender(tx: mpsc::Sender<ExecutionEvent>) -> Self {
        Self {
            tx,
            dropped: AtomicU64::new(0),
        }
    }

    /// Events lost because the writer fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventSink for AuditWriter {
    fn emit(&self, event: ExecutionEvent) {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

async fn audit_worker(
    http: reqwest::Client,
    url: String,
    token: Option<String>,
    mut rx: mpsc::Receiver<ExecutionEvent>,
) {
    let mut buf: Vec<ExecutionEvent> = Vec::with_capacity(MAX_BATCH);

    while let Some(event) = rx.recv().await {
        buf.push(event);
        while buf.len() < MAX_BATCH {
            match rx.try_recv() {
                Ok(e) => buf.push(e),
                Err(_) => break,
            }
        }

        let body = serde_json::json!({ "events": buf });
        let mut req = http.post(&url).json(&body);
        if let Some(token) = &token {
            req = req.bearer_auth(token);
        }
        match req.send().await {
            Ok(resp) if !resp.status().is_success() => {
                tracing::warn!(status = %resp.status(), batch = buf.len(), "audit ingest rejected batch");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, batch = buf.len(), "failed to send audit batch"),
        }
        buf.clear();
    }
}
