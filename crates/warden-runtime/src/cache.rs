use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use warden_common::ExecutionResult;

/// Serializes a JSON value with object keys sorted at every depth, so that
/// semantically equal parameters produce identical text.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(v) = map.get(key) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// SHA-256 over tenant, action, version and canonical parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn compute(tenant_id: &str, action: &str, version: &str, parameters: &Value) -> Self {
        let canonical = canonical_json(parameters);
        let mut hasher = Sha256::new();
        // Length prefixes keep ("ab", "c") and ("a", "bc") apart.
        for part in [tenant_id, action, version, canonical.as_str()] {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    tenant_id: String,
    action: String,
    version: String,
    result: ExecutionResult,
    created_at: Instant,
    expires_at: Instant,
}

/// Identifies what a cached result belongs to.
#[derive(Debug, Clone, Copy)]
pub struct CacheScope<'a> {
    pub tenant_id: &'a str,
    pub action: &'a str,
    pub version: &'a str,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub invalidations: u64,
    /// Age of the oldest resident entry, expired or not.
    pub oldest_entry_age_ms: u64,
}

/// Bounded, TTL-expiring result cache. Only successful results go in.
pub struct ResultCache {
    entries: Mutex<LruCache<Fingerprint, CacheEntry>>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    invalidations: AtomicU64,
}

impl ResultCache {
    pub fn new(max_entries: usize, default_ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Returns the cached result (marked `from_cache`) if present and fresh.
    pub fn get(&self, key: &Fingerprint, tenant_id: &str) -> Option<ExecutionResult> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        let expired = match entries.peek(key) {
            Some(entry) if entry.tenant_id == tenant_id => entry.expires_at <= now,
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        if expired {
            entries.pop(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let found = entries.get(key).map(|entry| entry.result.as_cached());
        let counter = if found.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    pub fn put(
        &self,
        key: Fingerprint,
        scope: CacheScope<'_>,
        result: &ExecutionResult,
        ttl: Option<Duration>,
    ) {
        if !result.success {
            return;
        }
        let now = Instant::now();
        let ttl = ttl.unwrap_or(self.default_ttl);
        let entry = CacheEntry {
            tenant_id: scope.tenant_id.to_string(),
            action: scope.action.to_string(),
            version: scope.version.to_string(),
            result: ExecutionResult {
                from_cache: false,
                ..result.clone()
            },
            created_at: now,
            expires_at: now + ttl,
        };

        let mut entries = self.entries.lock();
        if let Some((old_key, _)) = entries.push(key.clone(), entry) {
            if old_key != key {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Removes every entry for `action`, or only those of `version` when given.
    pub fn invalidate(&self, action: &str, version: Option<&str>) -> usize {
        let mut entries = self.entries.lock();
        let doomed: Vec<Fingerprint> = entries
            .iter()
            .filter(|(_, e)| e.action == action && version.map_or(true, |v| e.version == v))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        self.invalidations
            .fetch_add(doomed.len() as u64, Ordering::Relaxed);
        doomed.len()
    }

    /// Drops expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let expired: Vec<Fingerprint> = entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        self.expirations
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let (entries, capacity, oldest) = {
            let guard = self.entries.lock();
            let oldest = guard
                .iter()
                .map(|(_, e)| now.saturating_duration_since(e.created_at))
                .max()
                .unwrap_or_default();
            (guard.len(), guard.cap().get(), oldest)
        };
        CacheStats {
            entries,
            capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            oldest_entry_age_ms: oldest.as_millis() as u64,
        }
    }
}
