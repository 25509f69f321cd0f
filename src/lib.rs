//! Wager Settlement Library
//!
//! Settles head-to-head contests and external game records into a per-user
//! daily ledger, then splits each bettor's result up the agent hierarchy:
//!
//! 1. **Contest settlement**: every pending wager on a finished contest is
//!    resolved, paid out and posted in one transaction.
//!
//! 2. **Reconciliation**: bet records pulled from the game provider are
//!    stored once and posted once, guarded by settlement markers and by the
//!    stored rows themselves.

pub mod config;
pub mod db;
pub mod error;
pub mod ledger;
pub mod services;
pub mod settlement;
pub mod types;

pub use config::Config;
pub use db::Database;
pub use error::{SettlementError, SettlementResult};
pub use ledger::{CommissionCascade, HierarchyResolver};
pub use services::{HttpGameProvider, ReconciliationService, SettlementMetrics, SqliteMarkerStore};
pub use settlement::{SettlementFailure, SettlementOrchestrator, SettlementReport};
pub use types::{AgentChain, ContestResult, DailyStatistics, ExternalBet, Outcome, Wager, WagerKind};
