//! Contest settlement: wager resolution, payout and orchestration

pub mod orchestrator;
pub mod payout;
pub mod resolver;

pub use orchestrator::{SettlementFailure, SettlementOrchestrator, SettlementReport, SettlementState};
pub use payout::Payout;
pub use resolver::Resolution;
