use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    body::Body,
    extract::State,
    http::{header, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use warden_runtime::Supervisor;

use crate::audit::AuditWriter;
use crate::state::AppState;

#[derive(Debug, Default)]
pub struct HttpMetrics {
    pub requests_total: AtomicU64,
    pub requests_inflight: AtomicU64,
    pub status_2xx: AtomicU64,
    pub status_4xx: AtomicU64,
    pub status_5xx: AtomicU64,
}

fn push_family<L: AsRef<str>>(
    body: &mut String,
    name: &str,
    kind: &str,
    help: &str,
    samples: impl IntoIterator<Item = (L, u64)>,
) {
    body.push_str(&format!("# HELP {name} {help}\n# TYPE {name} {kind}\n"));
    for (labels, value) in samples {
        let labels = labels.as_ref();
        if labels.is_empty() {
            body.push_str(&format!("{name} {value}\n"));
        } else {
            body.push_str(&format!("{name}{{{labels}}} {value}\n"));
        }
    }
}

fn single(value: u64) -> [(&'static str, u64); 1] {
    [("", value)]
}

pub fn render_metrics(
    http: &HttpMetrics,
    supervisor: &Supervisor,
    audit: Option<&AuditWriter>,
) -> String {
    let stats = supervisor.stats();
    let runtime = supervisor.metrics();
    let mut body = String::new();

    push_family(
        &mut body,
        "warden_executions_total",
        "counter",
        "Finished execute requests by outcome.",
        stats
            .outcomes
            .iter()
            .map(|o| (format!("outcome=\"{}\"", o.outcome), o.count)),
    );
    push_family(
        &mut body,
        "warden_attempts_total",
        "counter",
        "Dispatch attempts, including retries.",
        single(stats.attempts_total),
    );
    push_family(
        &mut body,
        "warden_retries_total",
        "counter",
        "Attempts re-dispatched after a worker failure.",
        single(stats.retries_total),
    );
    push_family(
        &mut body,
        "warden_execution_ms_sum",
        "counter",
        "Total sandbox execution time of completed attempts.",
        single(runtime.execution_ms_sum.load(Ordering::Relaxed)),
    );
    push_family(
        &mut body,
        "warden_execution_ms_count",
        "counter",
        "Completed attempts contributing to warden_execution_ms_sum.",
        single(runtime.execution_count.load(Ordering::Relaxed)),
    );

    push_family(
        &mut body,
        "warden_cache_hits_total",
        "counter",
        "Cache lookups that returned a result.",
        single(stats.cache.hits),
    );
    push_family(
        &mut body,
        "warden_cache_misses_total",
        "counter",
        "Cache lookups that found nothing usable.",
        single(stats.cache.misses),
    );
    push_family(
        &mut body,
        "warden_cache_evictions_total",
        "counter",
        "Entries evicted to respect the capacity bound.",
        single(stats.cache.evictions),
    );
    push_family(
        &mut body,
        "warden_cache_expirations_total",
        "counter",
        "Entries dropped after their TTL.",
        single(stats.cache.expirations),
    );
    push_family(
        &mut body,
        "warden_cache_invalidations_total",
        "counter",
        "Entries removed by explicit or version-change invalidation.",
        single(stats.cache.invalidations),
    );
    push_family(
        &mut body,
        "warden_cache_entries",
        "gauge",
        "Entries currently cached.",
        single(stats.cache.entries as u64),
    );

    push_family(
        &mut body,
        "warden_quota_admitted_total",
        "counter",
        "Requests admitted by the quota ledger.",
        stats
            .quota
            .iter()
            .map(|q| (format!("tier=\"{}\"", q.tier), q.admitted)),
    );
    push_family(
        &mut body,
        "warden_quota_rejected_total",
        "counter",
        "Requests rejected by the quota ledger.",
        stats.quota.iter().flat_map(|q| {
            [
                (format!("tier=\"{}\",scope=\"daily\"", q.tier), q.rejected_daily),
                (
                    format!("tier=\"{}\",scope=\"concurrent\"", q.tier),
                    q.rejected_concurrent,
                ),
            ]
        }),
    );

    let pool = &stats.pool;
    push_family(
        &mut body,
        "warden_pool_workers",
        "gauge",
        "Live sandbox workers by state.",
        [
            ("state=\"busy\"", pool.busy as u64),
            ("state=\"idle\"", pool.idle as u64),
        ],
    );
    push_family(
        &mut body,
        "warden_pool_queued",
        "gauge",
        "Tasks waiting for a worker.",
        single(pool.queued as u64),
    );
    push_family(
        &mut body,
        "warden_pool_events_total",
        "counter",
        "Worker lifecycle events.",
        [
            ("event=\"spawned\"", pool.spawned),
            ("event=\"crashed\"", pool.crashes),
            ("event=\"timed_out\"", pool.timeouts),
            ("event=\"violation\"", pool.violations),
            ("event=\"recycled\"", pool.recycles),
            ("event=\"cancelled\"", pool.cancelled),
            ("event=\"retired_idle\"", pool.retired_idle),
        ],
    );
    push_family(
        &mut body,
        "warden_pool_rejected_total",
        "counter",
        "Submissions rejected because the queue was full.",
        single(pool.rejected),
    );

    push_family(
        &mut body,
        "warden_circuits",
        "gauge",
        "Tracked circuits by state.",
        [
            ("state=\"closed\"", stats.circuit_counts.closed as u64),
            ("state=\"open\"", stats.circuit_counts.open as u64),
            ("state=\"half_open\"", stats.circuit_counts.half_open as u64),
        ],
    );
    push_family(
        &mut body,
        "warden_circuits_opened_total",
        "counter",
        "Transitions into the open state.",
        single(stats.circuits_opened_total),
    );
    push_family(
        &mut body,
        "warden_circuit_rejections_total",
        "counter",
        "Requests rejected by an open circuit.",
        single(stats.circuit_rejections_total),
    );

    push_family(
        &mut body,
        "warden_http_requests_total",
        "counter",
        "HTTP requests handled by the gateway.",
        single(http.requests_total.load(Ordering::Relaxed)),
    );
    push_family(
        &mut body,
        "warden_http_requests_inflight",
        "gauge",
        "HTTP requests currently in flight.",
        single(http.requests_inflight.load(Ordering::Relaxed)),
    );
    push_family(
        &mut body,
        "warden_http_responses_total",
        "counter",
        "HTTP responses by status class.",
        [
            ("class=\"2xx\"", http.status_2xx.load(Ordering::Relaxed)),
            ("class=\"4xx\"", http.status_4xx.load(Ordering::Relaxed)),
            ("class=\"5xx\"", http.status_5xx.load(Ordering::Relaxed)),
        ],
    );
    push_family(
        &mut body,
        "warden_audit_dropped_total",
        "counter",
        "Audit events dropped because the writer fell behind.",
        single(audit.map_or(0, AuditWriter::dropped)),
    );

    body
}

pub async fn metrics_handler(State(st): State<AppState>) -> impl IntoResponse {
    let body = render_metrics(&st.metrics, &st.supervisor, st.audit.as_deref());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

pub async fn track_requests(
    State(st): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, std::convert::Infallible> {
    st.metrics.requests_inflight.fetch_add(1, Ordering::Relaxed);
    let resp = next.run(req).await;
    st.metrics.requests_inflight.fetch_sub(1, Ordering::Relaxed);
    st.metrics.requests_total.fetch_add(1, Ordering::Relaxed);

    let status = resp.status().as_u16();
    if status >= 500 {
        st.metrics.status_5xx.fetch_add(1, Ordering::Relaxed);
    } else if status >= 400 {
        st.metrics.status_4xx.fetch_add(1, Ordering::Relaxed);
    } else if status >= 200 {
        st.metrics.status_2xx.fetch_add(1, Ordering::Relaxed);
    }

    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_family_formats_labels() {
        let mut body = String::new();
        push_family(&mut body, "x_total", "counter", "Help.", [("a=\"1\"", 2), ("", 3)]);
        assert_eq!(
            body,
            "# HELP x_total Help.\n# TYPE x_total counter\nx_total{a=\"1\"} 2\nx_total 3\n"
        );
    }
}
