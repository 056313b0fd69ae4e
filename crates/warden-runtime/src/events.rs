use warden_common::ExecutionEvent;

/// Receives one event per attempt. `emit` runs on the request path and must
/// not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ExecutionEvent);
}

/// Writes events to the log. Used when no audit collaborator is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: ExecutionEvent) {
        tracing::info!(
            target: "warden::audit",
            request_id = %event.request_id,
            tenant_id = %event.tenant_id,
            action = %event.action,
            version = %event.version,
            attempt = event.attempt,
            outcome = ?event.outcome,
            reason = ?event.reason,
            duration_ms = event.duration_ms,
            from_cache = event.from_cache,
            "execution event"
        );
    }
}

#[cfg(test)]
pub(crate) mod recording {
    use parking_lot::Mutex;

    use super::*;

    #[derive(Debug, Default)]
    pub struct RecordingSink {
        events: Mutex<Vec<ExecutionEvent>>,
    }

    impl RecordingSink {
        pub fn events(&self) -> Vec<ExecutionEvent> {
            self.events.lock().clone()
        }
    }

    impl EventSink for RecordingSink {
        fn emit(&self, event: ExecutionEvent) {
            self.events.lock().push(event);
        }
    }
}
