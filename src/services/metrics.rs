//! Metrics collection for settlement and reconciliation runs

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub cycles_run: u64,
    pub users_processed: u64,
    pub users_failed: u64,
    /// Records skipped because a marker already existed
    pub records_skipped: u64,
    pub records_stored: u64,
    pub records_posted: u64,
    pub sweep_records_resolved: u64,
    pub running_balance_postings: u64,
    pub contests_settled: u64,
    pub wagers_settled: u64,
    pub provider_calls_total: u64,
    pub provider_errors_total: u64,
}

/// Thread-safe metrics collector
#[derive(Debug, Clone, Default)]
pub struct SettlementMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    cycles_run: AtomicU64,
    users_processed: AtomicU64,
    users_failed: AtomicU64,
    records_skipped: AtomicU64,
    records_stored: AtomicU64,
    records_posted: AtomicU64,
    sweep_records_resolved: AtomicU64,
    running_balance_postings: AtomicU64,
    contests_settled: AtomicU64,
    wagers_settled: AtomicU64,
    provider_calls_total: AtomicU64,
    provider_errors_total: AtomicU64,
}

impl SettlementMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_cycles(&self) {
        self.inner.cycles_run.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_users_processed(&self) {
        self.inner.users_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_users_failed(&self) {
        self.inner.users_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_records_skipped(&self) {
        self.inner.records_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_records_stored(&self) {
        self.inner.records_stored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_records_posted(&self) {
        self.inner.records_posted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_sweep_resolved(&self, count: u64) {
        self.inner.sweep_records_resolved.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_running_balance_postings(&self) {
        self.inner.running_balance_postings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_contests_settled(&self) {
        self.inner.contests_settled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_wagers_settled(&self, count: u64) {
        self.inner.wagers_settled.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_provider_calls(&self) {
        self.inner.provider_calls_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_provider_errors(&self) {
        self.inner.provider_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cycles_run: self.inner.cycles_run.load(Ordering::Relaxed),
            users_processed: self.inner.users_processed.load(Ordering::Relaxed),
            users_failed: self.inner.users_failed.load(Ordering::Relaxed),
            records_skipped: self.inner.records_skipped.load(Ordering::Relaxed),
            records_stored: self.inner.records_stored.load(Ordering::Relaxed),
            records_posted: self.inner.records_posted.load(Ordering::Relaxed),
            sweep_records_resolved: self.inner.sweep_records_resolved.load(Ordering::Relaxed),
            running_balance_postings: self.inner.running_balance_postings.load(Ordering::Relaxed),
            contests_settled: self.inner.contests_settled.load(Ordering::Relaxed),
            wagers_settled: self.inner.wagers_settled.load(Ordering::Relaxed),
            provider_calls_total: self.inner.provider_calls_total.load(Ordering::Relaxed),
            provider_errors_total: self.inner.provider_errors_total.load(Ordering::Relaxed),
        }
    }
}
