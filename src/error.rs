//! Error taxonomy for settlement and reconciliation

use crate::services::markers::MarkerError;
use crate::services::provider_errors::ProviderError;
use crate::services::retry::{RetryClass, Retryable};
use crate::types::Pick;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettlementError {
    /// Ledger posting without an ancestor path (needed for the audit trail)
    #[error("user {user_id} has no ancestor path")]
    MissingAncestors { user_id: i64 },

    /// Every non-root user must carry a link identifier
    #[error("user {user_id} has no link identifier")]
    MissingLinkIdentifier { user_id: i64 },

    #[error("pick '{pick}' is not valid for {kind} wagers")]
    InvalidPick { kind: String, pick: Pick },

    #[error("wager {wager_id} is missing its {parameter}")]
    MissingParameter { wager_id: i64, parameter: &'static str },

    #[error("invalid {field}: {value:?}")]
    InvalidValue { field: &'static str, value: String },

    #[error("user {0} not found")]
    UserNotFound(i64),

    #[error("contest {0} not found")]
    ContestNotFound(i64),

    /// A guarded update touched no rows, someone else got there first
    #[error("conflicting update: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("marker store error: {0}")]
    Marker(#[from] MarkerError),
}

impl SettlementError {
    /// Bad input rather than an infrastructure failure
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SettlementError::MissingAncestors { .. }
                | SettlementError::MissingLinkIdentifier { .. }
                | SettlementError::InvalidPick { .. }
                | SettlementError::MissingParameter { .. }
                | SettlementError::InvalidValue { .. }
                | SettlementError::UserNotFound(_)
        )
    }

    /// Errors that abort a whole reconciliation cycle instead of one user
    pub fn is_catastrophic(&self) -> bool {
        matches!(self, SettlementError::Marker(_))
    }

    pub fn is_retryable(&self) -> bool {
        self.retry_class().is_some()
    }
}

pub type SettlementResult<T> = std::result::Result<T, SettlementError>;

/// SQLITE_BUSY, SQLITE_LOCKED and their extended codes (BUSY_SNAPSHOT is 517)
fn is_lock_conflict(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .map(|code| matches!(code & 0xff, 5 | 6))
            .unwrap_or(false),
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

impl Retryable for SettlementError {
    fn retry_class(&self) -> Option<RetryClass> {
        match self {
            SettlementError::Provider(err) => err.retry_class(),
            SettlementError::Database(err) if is_lock_conflict(err) => Some(RetryClass::LockConflict),
            SettlementError::Conflict(_) => Some(RetryClass::LockConflict),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_conflicts_are_retryable_and_validation_is_not() {
        let conflict = SettlementError::Conflict("wager 1 already settled".to_string());
        assert_eq!(conflict.retry_class(), Some(RetryClass::LockConflict));

        let missing = SettlementError::UserNotFound(7);
        assert!(missing.is_validation());
        assert!(!missing.is_retryable());

        let timeout = SettlementError::Provider(ProviderError::NetworkError("timed out".to_string()));
        assert_eq!(timeout.retry_class(), Some(RetryClass::Network));
        assert!(!SettlementError::Database(sqlx::Error::RowNotFound).is_retryable());
    }
}
