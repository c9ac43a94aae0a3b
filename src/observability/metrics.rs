//! Ledger metrics.
//!
//! Lock-free atomic counters kept in-process; export is left to the host
//! service, which can poll [`MetricsSummary::from_registry`].

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal_macros::dec;

/// Credits are tracked as integer micro-credits.
pub(crate) const MICRO_CREDITS: Decimal = dec!(1_000_000);

/// Thread-safe atomic counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Thread-safe atomic gauge.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Simple histogram using fixed buckets.
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    bucket_bounds: Vec<f64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(bucket_bounds: Vec<f64>) -> Self {
        let buckets = (0..=bucket_bounds.len())
            .map(|_| AtomicU64::new(0))
            .collect();
        Self {
            buckets,
            bucket_bounds,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Buckets tuned for single-row database transactions.
    pub fn default_latency() -> Self {
        Self::new(vec![
            1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0,
        ])
    }

    pub fn observe(&self, value: f64) {
        let bucket_idx = self
            .bucket_bounds
            .iter()
            .position(|&bound| value <= bound)
            .unwrap_or(self.bucket_bounds.len());

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        self.sum
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Observations at or below each bound, in bound order, then the overflow bucket.
    pub fn bucket_counts(&self) -> Vec<u64> {
        self.buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect()
    }

    /// The internal sum is stored scaled by 1000x to keep sub-millisecond precision.
    pub fn sum_ms(&self) -> f64 {
        self.sum.load(Ordering::Relaxed) as f64 / 1000.0
    }
}

fn to_micros(amount: Decimal) -> u64 {
    (amount * MICRO_CREDITS).trunc().to_u64().unwrap_or(0)
}

#[derive(Debug)]
pub struct LedgerMetrics {
    pub debits: Counter,
    pub refunds: Counter,
    pub grants: Counter,
    pub holds_created: Counter,
    pub holds_consumed: Counter,
    pub holds_released: Counter,
    pub holds_force_released: Counter,
    pub allocations_expired: Counter,
    pub allocations_purged: Counter,
    pub insufficient_balance: Counter,
    pub duplicate_source_ids: Counter,
    pub invariant_violations: Counter,
    pub quota_soft_warnings: Counter,
    pub quota_hard_blocks: Counter,
    pub quota_overrides: Counter,
    /// Quota reads that failed and were treated as blocked.
    pub quota_fail_closed: Counter,
    /// Balance reads that failed and were treated as allowed.
    pub balance_fail_open: Counter,
    pub audit_failures: Counter,
    pub retries: Counter,
    pub active_operations: Gauge,
    pub credits_debited_micros: Counter,
    pub credits_refunded_micros: Counter,
    pub credits_granted_micros: Counter,
    pub operation_latency_ms: Histogram,
}

impl LedgerMetrics {
    pub fn new() -> Self {
        Self {
            debits: Counter::new(),
            refunds: Counter::new(),
            grants: Counter::new(),
            holds_created: Counter::new(),
            holds_consumed: Counter::new(),
            holds_released: Counter::new(),
            holds_force_released: Counter::new(),
            allocations_expired: Counter::new(),
            allocations_purged: Counter::new(),
            insufficient_balance: Counter::new(),
            duplicate_source_ids: Counter::new(),
            invariant_violations: Counter::new(),
            quota_soft_warnings: Counter::new(),
            quota_hard_blocks: Counter::new(),
            quota_overrides: Counter::new(),
            quota_fail_closed: Counter::new(),
            balance_fail_open: Counter::new(),
            audit_failures: Counter::new(),
            retries: Counter::new(),
            active_operations: Gauge::new(),
            credits_debited_micros: Counter::new(),
            credits_refunded_micros: Counter::new(),
            credits_granted_micros: Counter::new(),
            operation_latency_ms: Histogram::default_latency(),
        }
    }

    pub fn record_operation_start(&self) {
        self.active_operations.inc();
    }

    pub fn record_operation_end(&self, latency_ms: f64) {
        self.active_operations.dec();
        self.operation_latency_ms.observe(latency_ms);
    }

    pub fn record_debit(&self, amount: Decimal) {
        self.debits.inc();
        self.credits_debited_micros.add(to_micros(amount));
    }

    pub fn record_refund(&self, amount: Decimal) {
        self.refunds.inc();
        self.credits_refunded_micros.add(to_micros(amount));
    }

    pub fn record_grant(&self, amount: Decimal) {
        self.grants.inc();
        self.credits_granted_micros.add(to_micros(amount));
    }

    pub fn credits_debited(&self) -> Decimal {
        Decimal::from(self.credits_debited_micros.get()) / MICRO_CREDITS
    }

    pub fn credits_refunded(&self) -> Decimal {
        Decimal::from(self.credits_refunded_micros.get()) / MICRO_CREDITS
    }

    pub fn credits_granted(&self) -> Decimal {
        Decimal::from(self.credits_granted_micros.get()) / MICRO_CREDITS
    }
}

impl Default for LedgerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of [`LedgerMetrics`].
#[derive(Debug, Clone, Default)]
pub struct MetricsSummary {
    pub debits: u64,
    pub refunds: u64,
    pub grants: u64,
    pub holds_created: u64,
    pub holds_consumed: u64,
    pub holds_released: u64,
    pub holds_force_released: u64,
    pub insufficient_balance: u64,
    pub duplicate_source_ids: u64,
    pub quota_hard_blocks: u64,
    pub quota_overrides: u64,
    pub balance_fail_open: u64,
    pub audit_failures: u64,
    pub credits_debited: Decimal,
    pub credits_refunded: Decimal,
    pub credits_granted: Decimal,
    pub avg_latency_ms: f64,
}

impl MetricsSummary {
    pub fn from_registry(registry: &LedgerMetrics) -> Self {
        let count = registry.operation_latency_ms.count();
        let avg_latency = if count > 0 {
            registry.operation_latency_ms.sum_ms() / count as f64
        } else {
            0.0
        };

        Self {
            debits: registry.debits.get(),
            refunds: registry.refunds.get(),
            grants: registry.grants.get(),
            holds_created: registry.holds_created.get(),
            holds_consumed: registry.holds_consumed.get(),
            holds_released: registry.holds_released.get(),
            holds_force_released: registry.holds_force_released.get(),
            insufficient_balance: registry.insufficient_balance.get(),
            duplicate_source_ids: registry.duplicate_source_ids.get(),
            quota_hard_blocks: registry.quota_hard_blocks.get(),
            quota_overrides: registry.quota_overrides.get(),
            balance_fail_open: registry.balance_fail_open.get(),
            audit_failures: registry.audit_failures.get(),
            credits_debited: registry.credits_debited(),
            credits_refunded: registry.credits_refunded(),
            credits_granted: registry.credits_granted(),
            avg_latency_ms: avg_latency,
        }
    }
}
