use std::fmt::Write;

use serde_json::Value;

fn num(v: &Value, key: &str) -> u64 {
    v.get(key).and_then(Value::as_u64).unwrap_or(0)
}

fn text<'a>(v: &'a Value, key: &str) -> &'a str {
    v.get(key).and_then(Value::as_str).unwrap_or("-")
}

pub fn render_stats(stats: &Value) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "\n=== Warden Stats ===");

    let pool = &stats["pool"];
    let _ = writeln!(out, "\n[Pool]");
    let _ = writeln!(
        out,
        "  sandbox={}  workers={} ({}..{})  busy={}  idle={}  queued={}/{}",
        text(pool, "sandbox"),
        num(pool, "size"),
        num(pool, "minWorkers"),
        num(pool, "maxWorkers"),
        num(pool, "busy"),
        num(pool, "idle"),
        num(pool, "queued"),
        num(pool, "queueDepth"),
    );
    let _ = writeln!(
        out,
        "  spawned={}  crashes={}  timeouts={}  violations={}  recycles={}  rejected={}",
        num(pool, "spawned"),
        num(pool, "crashes"),
        num(pool, "timeouts"),
        num(pool, "violations"),
        num(pool, "recycles"),
        num(pool, "rejected"),
    );

    let cache = &stats["cache"];
    let _ = writeln!(out, "\n[Cache]");
    let _ = writeln!(
        out,
        "  entries={}/{}  hits={}  misses={}  evictions={}  invalidations={}  oldest={}ms",
        num(cache, "entries"),
        num(cache, "capacity"),
        num(cache, "hits"),
        num(cache, "misses"),
        num(cache, "evictions"),
        num(cache, "invalidations"),
        num(cache, "oldestEntryAgeMs"),
    );

    let _ = writeln!(out, "\n[Quota]");
    let _ = writeln!(
        out,
        "  {:<12} {:>10} {:>14} {:>18}",
        "Tier", "Admitted", "Daily Rejects", "Concurrent Rejects"
    );
    for tier in stats["quota"].as_array().into_iter().flatten() {
        let _ = writeln!(
            out,
            "  {:<12} {:>10} {:>14} {:>18}",
            text(tier, "tier"),
            num(tier, "admitted"),
            num(tier, "rejectedDaily"),
            num(tier, "rejectedConcurrent"),
        );
    }

    let _ = writeln!(out, "\n[Outcomes]");
    for o in stats["outcomes"].as_array().into_iter().flatten() {
        let _ = writeln!(out, "  {:<20} {:>10}", text(o, "outcome"), num(o, "count"));
    }
    let _ = writeln!(
        out,
        "  attempts={}  retries={}",
        num(stats, "attemptsTotal"),
        num(stats, "retriesTotal")
    );

    let _ = writeln!(out, "\n[Circuits]");
    let circuits: Vec<&Value> = stats["circuits"].as_array().into_iter().flatten().collect();
    if circuits.is_empty() {
        let _ = writeln!(out, "  (No tracked circuits)");
    } else {
        let _ = writeln!(
            out,
            "  {:<24} {:<28} {:<10} {:>8} {:>12}",
            "Tenant", "Target", "State", "Failures", "Cooldown ms"
        );
        for c in circuits {
            let _ = writeln!(
                out,
                "  {:<24} {:<28} {:<10} {:>8} {:>12}",
                text(c, "tenantId"),
                text(c, "target"),
                text(c, "state"),
                num(c, "failureCount"),
                num(c, "cooldownMs"),
            );
        }
    }
    out
}

pub fn print_stats(stats: &Value) {
    println!("{}", render_stats(stats));
}

pub fn print_execute(status: u16, body: &Value) {
    if body["success"].as_bool() == Some(true) {
        let cached = if body["fromCache"].as_bool() == Some(true) {
            " (cached)"
        } else {
            ""
        };
        println!(
            "✓ {} in {}ms{}",
            text(body, "requestId"),
            num(body, "executionTimeMs"),
            cached
        );
        println!(
            "{}",
            serde_json::to_string_pretty(&body["payload"]).unwrap_or_default()
        );
        return;
    }

    eprintln!(
        "✗ [{}] {}: {}",
        status,
        text(body, "errorKind"),
        text(body, "message")
    );
    if let Some(ms) = body.get("retryAfterMs").and_then(Value::as_u64) {
        eprintln!("  retry after {ms}ms");
    }
}
