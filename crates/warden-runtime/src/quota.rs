use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use dashmap::DashMap;
use serde::Serialize;
use warden_common::{QuotaConfig, QuotaScope, Tier, TierLimits};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaRejection {
    pub scope: QuotaScope,
    pub retry_after_ms: u64,
}

#[derive(Debug, Default)]
struct TenantUsage {
    day: Option<NaiveDate>,
    daily_count: u64,
    concurrent: u32,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    pub daily_count: u64,
    pub concurrent: u32,
}

#[derive(Debug, Default)]
struct TierCounters {
    admitted: AtomicU64,
    rejected_daily: AtomicU64,
    rejected_concurrent: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TierQuotaStats {
    pub tier: Tier,
    pub admitted: u64,
    pub rejected_daily: u64,
    pub rejected_concurrent: u64,
}

/// Per-tenant daily and concurrent usage. Check-and-increment of both
/// counters happens under one shard lock, so two racing admissions can never
/// both take the last slot.
#[derive(Debug)]
pub struct QuotaLedger {
    config: QuotaConfig,
    usage: DashMap<String, TenantUsage>,
    counters: [TierCounters; 3],
}

fn tier_index(tier: Tier) -> usize {
    match tier {
        Tier::Free => 0,
        Tier::Pro => 1,
        Tier::Enterprise => 2,
    }
}

fn millis_until_next_midnight(now: DateTime<Utc>) -> u64 {
    let tomorrow = now.date_naive() + ChronoDuration::days(1);
    let midnight = tomorrow
        .and_hms_opt(0, 0, 0)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .unwrap_or(now);
    (midnight - now).num_milliseconds().max(0) as u64
}

impl QuotaLedger {
    pub fn new(config: QuotaConfig) -> Self {
        Self {
            config,
            usage: DashMap::new(),
            counters: Default::default(),
        }
    }

    pub fn tier_for(&self, tenant_id: &str) -> Tier {
        self.config.tier_for(tenant_id)
    }

    pub fn limits_for(&self, tier: Tier) -> TierLimits {
        self.config.limits_for(tier)
    }

    pub fn try_admit(&self, tenant_id: &str, tier: Tier) -> Result<QuotaPermit<'_>, QuotaRejection> {
        self.try_admit_at(tenant_id, tier, Utc::now())
    }

    /// Admission against an explicit clock, so day rollover is testable.
    pub fn try_admit_at(
        &self,
        tenant_id: &str,
        tier: Tier,
        now: DateTime<Utc>,
    ) -> Result<QuotaPermit<'_>, QuotaRejection> {
        let limits = self.limits_for(tier);
        let counters = &self.counters[tier_index(tier)];
        let today = now.date_naive();

        let mut usage = self.usage.entry(tenant_id.to_string()).or_default();
        if usage.day != Some(today) {
            usage.day = Some(today);
            usage.daily_count = 0;
        }

        if let Some(limit) = limits.daily_limit {
            if usage.daily_count >= limit {
                counters.rejected_daily.fetch_add(1, Ordering::Relaxed);
                return Err(QuotaRejection {
                    scope: QuotaScope::Daily,
                    retry_after_ms: millis_until_next_midnight(now),
                });
            }
        }
        if usage.concurrent >= limits.concurrent_limit {
            counters.rejected_concurrent.fetch_add(1, Ordering::Relaxed);
            return Err(QuotaRejection {
                scope: QuotaScope::Concurrent,
                retry_after_ms: 0,
            });
        }

        usage.daily_count += 1;
        usage.concurrent += 1;
        drop(usage);
        counters.admitted.fetch_add(1, Ordering::Relaxed);

        Ok(QuotaPermit {
            ledger: self,
            tenant_id: tenant_id.to_string(),
        })
    }

    /// Decrements the concurrent counter only. Never goes below zero.
    pub fn release(&self, tenant_id: &str) {
        if let Some(mut usage) = self.usage.get_mut(tenant_id) {
            usage.concurrent = usage.concurrent.saturating_sub(1);
        }
    }

    pub fn usage(&self, tenant_id: &str) -> Option<UsageSnapshot> {
        self.usage.get(tenant_id).map(|u| UsageSnapshot {
            daily_count: if u.day == Some(Utc::now().date_naive()) {
                u.daily_count
            } else {
                0
            },
            concurrent: u.concurrent,
        })
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    /// Forgets tenants with nothing in flight and no usage on `now`'s UTC day.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let today = now.date_naive();
        let before = self.usage.len();
        self.usage
            .retain(|_, usage| usage.concurrent > 0 || usage.day == Some(today));
        before.saturating_sub(self.usage.len())
    }

    pub fn tenants(&self) -> usize {
        self.usage.len()
    }

    pub fn stats(&self) -> Vec<TierQuotaStats> {
        Tier::ALL
            .iter()
            .map(|&tier| {
                let c = &self.counters[tier_index(tier)];
                TierQuotaStats {
                    tier,
                    admitted: c.admitted.load(Ordering::Relaxed),
                    rejected_daily: c.rejected_daily.load(Ordering::Relaxed),
                    rejected_concurrent: c.rejected_concurrent.load(Ordering::Relaxed),
                }
            })
            .collect()
    }
}

/// Holds one concurrent slot for a tenant; the slot is returned on drop,
/// whichever way the execution ends.
#[derive(Debug)]
pub struct QuotaPermit<'a> {
    ledger: &'a QuotaLedger,
    tenant_id: String,
}

impl Drop for QuotaPermit<'_> {
    fn drop(&mut self) {
        self.ledger.release(&self.tenant_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_free_tier_daily_exhaustion() {
        let ledger = QuotaLedger::new(QuotaConfig::default());
        let now = at(2026, 3, 14, 18, 0);

        for _ in 0..100 {
            let permit = ledger.try_admit_at("t-free", Tier::Free, now).unwrap();
            drop(permit);
        }
        let rejection = ledger.try_admit_at("t-free", Tier::Free, now).unwrap_err();
        assert_eq!(rejection.scope, QuotaScope::Daily);
        assert_eq!(rejection.retry_after_ms, 6 * 3600 * 1000);

        // New UTC day resets the daily counter.
        let next_day = at(2026, 3, 15, 0, 1);
        assert!(ledger.try_admit_at("t-free", Tier::Free, next_day).is_ok());
    }

    #[test]
    fn test_concurrency_limit_and_release_on_drop() {
        let ledger = QuotaLedger::new(QuotaConfig::default());
        let now = at(2026, 1, 1, 12, 0);

        let permit = ledger.try_admit_at("t1", Tier::Free, now).unwrap();
        let rejection = ledger.try_admit_at("t1", Tier::Free, now).unwrap_err();
        assert_eq!(rejection.scope, QuotaScope::Concurrent);
        assert_eq!(rejection.retry_after_ms, 0);

        drop(permit);
        assert!(ledger.try_admit_at("t1", Tier::Free, now).is_ok());
    }

    #[test]
    fn test_rejection_does_not_consume_quota() {
        let ledger = QuotaLedger::new(QuotaConfig::default());
        let now = at(2026, 1, 1, 12, 0);
        let _held = ledger.try_admit_at("t1", Tier::Free, now).unwrap();
        for _ in 0..10 {
            assert!(ledger.try_admit_at("t1", Tier::Free, now).is_err());
        }
        assert_eq!(ledger.usage.get("t1").unwrap().daily_count, 1);
    }

    #[test]
    fn test_enterprise_has_no_daily_cap() {
        let ledger = QuotaLedger::new(QuotaConfig::default());
        let now = at(2026, 1, 1, 12, 0);
        for _ in 0..20_000 {
            drop(ledger.try_admit_at("big", Tier::Enterprise, now).unwrap());
        }
        let stats = ledger.stats();
        assert_eq!(stats[2].admitted, 20_000);
    }

    #[test]
    fn test_tenants_are_independent() {
        let ledger = QuotaLedger::new(QuotaConfig::default());
        let now = at(2026, 1, 1, 12, 0);
        let _a = ledger.try_admit_at("a", Tier::Free, now).unwrap();
        assert!(ledger.try_admit_at("b", Tier::Free, now).is_ok());
    }

    #[test]
    fn test_sweep_forgets_stale_idle_tenants() {
        let ledger = QuotaLedger::new(QuotaConfig::default());
        let yesterday = at(2026, 1, 1, 23, 0);
        let today = at(2026, 1, 2, 9, 0);

        drop(ledger.try_admit_at("stale", Tier::Free, yesterday).unwrap());
        let _running = ledger.try_admit_at("long-job", Tier::Pro, yesterday).unwrap();
        drop(ledger.try_admit_at("fresh", Tier::Free, today).unwrap());
        assert_eq!(ledger.tenants(), 3);

        assert_eq!(ledger.sweep_at(today), 1);
        assert_eq!(ledger.tenants(), 2);
        assert!(ledger.usage.get("stale").is_none());
        assert_eq!(ledger.usage.get("long-job").unwrap().concurrent, 1);

        // A swept tenant starts over with a full allowance.
        assert!(ledger.try_admit_at("stale", Tier::Free, today).is_ok());
    }

    #[test]
    fn test_release_never_underflows() {
        let ledger = QuotaLedger::new(QuotaConfig::default());
        ledger.release("ghost");
        drop(ledger.try_admit("t1", Tier::Pro).unwrap());
        ledger.release("t1");
        ledger.release("t1");
        assert_eq!(ledger.usage("t1").unwrap().concurrent, 0);
    }

    #[test]
    fn test_concurrent_admission_never_exceeds_limit() {
        let ledger = Arc::new(QuotaLedger::new(QuotaConfig::default()));
        let admitted = Arc::new(AtomicU64::new(0));
        let start = Arc::new(std::sync::Barrier::new(16));
        let tried = Arc::new(std::sync::Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let ledger = ledger.clone();
                let admitted = admitted.clone();
                let start = start.clone();
                let tried = tried.clone();
                std::thread::spawn(move || {
                    start.wait();
                    let permit = ledger.try_admit("pro-tenant", Tier::Pro);
                    if permit.is_ok() {
                        admitted.fetch_add(1, Ordering::SeqCst);
                    }
                    // Hold the slot until every thread has tried.
                    tried.wait();
                    drop(permit);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(admitted.load(Ordering::SeqCst), 5);
    }
}
