//! Background services for external game reconciliation

pub mod markers;
pub mod metrics;
pub mod provider;
pub mod provider_errors;
pub mod reconciliation;
pub mod retry;
pub mod scheduler;

pub use markers::{marker_key, MarkerError, MarkerStage, MarkerStore, MemoryMarkerStore, SqliteMarkerStore};
pub use metrics::{MetricsSnapshot, SettlementMetrics};
pub use provider::{GameProvider, HttpGameProvider};
pub use provider_errors::ProviderError;
pub use reconciliation::{CycleReport, ReconciliationService, RunningBalanceReport, SweepReport};
pub use retry::{retry, RetryClass, RetryPolicy, Retryable};
pub use scheduler::RecurringTask;
