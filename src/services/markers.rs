//! Settlement markers - TTL-scoped idempotency keys
//!
//! A marker for `(stage, user, game, order)` is written only after the ledger
//! write it guards has committed. Its existence is the only thing that stops a
//! record from being posted again.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Error)]
pub enum MarkerError {
    #[error("marker store unavailable: {0}")]
    Unavailable(String),

    #[error("marker store database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Processing stage a marker records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerStage {
    /// Raw record stored locally
    Consumed,
    /// Commission posted for the record's settlement
    Settled,
}

impl MarkerStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarkerStage::Consumed => "consumed",
            MarkerStage::Settled => "settled",
        }
    }
}

/// Marker key for one external order
pub fn marker_key(stage: MarkerStage, user_id: i64, game_id: &str, order_id: &str) -> String {
    format!("settle:{}:{}:{}:{}", stage.as_str(), user_id, game_id, order_id)
}

#[async_trait]
pub trait MarkerStore: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool, MarkerError>;

    async fn set(&self, key: &str, ttl: Duration) -> Result<(), MarkerError>;

    /// Drop expired markers, returning how many were removed
    async fn purge_expired(&self) -> Result<u64, MarkerError>;
}

/// Markers persisted in the `settlement_markers` table
#[derive(Clone)]
pub struct SqliteMarkerStore {
    pool: SqlitePool,
}

impl SqliteMarkerStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MarkerStore for SqliteMarkerStore {
    async fn exists(&self, key: &str) -> Result<bool, MarkerError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM settlement_markers WHERE key = ? AND expires_at > ?")
                .bind(key)
                .bind(Utc::now().timestamp())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    async fn set(&self, key: &str, ttl: Duration) -> Result<(), MarkerError> {
        let expires_at = Utc::now().timestamp() + ttl.as_secs() as i64;
        sqlx::query(
            r#"
            INSERT INTO settlement_markers (key, expires_at) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, MarkerError> {
        let result = sqlx::query("DELETE FROM settlement_markers WHERE expires_at <= ?")
            .bind(Utc::now().timestamp())
            .execute(&self.pool)
            .await?;
        debug!("[Markers] Purged {} expired markers", result.rows_affected());
        Ok(result.rows_affected())
    }
}

/// Process-local marker store
#[derive(Clone, Default)]
pub struct MemoryMarkerStore {
    entries: Arc<RwLock<HashMap<String, Instant>>>,
}

impl MemoryMarkerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.read().await.values().filter(|exp| **exp > now).count()
    }
}

#[async_trait]
impl MarkerStore for MemoryMarkerStore {
    async fn exists(&self, key: &str) -> Result<bool, MarkerError> {
        let entries = self.entries.read().await;
        Ok(entries.get(key).map(|exp| *exp > Instant::now()).unwrap_or(false))
    }

    async fn set(&self, key: &str, ttl: Duration) -> Result<(), MarkerError> {
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), Instant::now() + ttl);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, MarkerError> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, exp| *exp > now);
        Ok((before - entries.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[test]
    fn test_marker_key_format() {
        assert_eq!(
            marker_key(MarkerStage::Settled, 12, "slots", "A-77"),
            "settle:settled:12:slots:A-77"
        );
    }

    #[tokio::test]
    async fn test_memory_store_expiry() {
        let store = MemoryMarkerStore::new();
        store.set("a", Duration::from_secs(60)).await.unwrap();
        store.set("b", Duration::ZERO).await.unwrap();

        assert!(store.exists("a").await.unwrap());
        assert!(!store.exists("b").await.unwrap());
        assert!(!store.exists("c").await.unwrap());
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_sqlite_store_set_and_purge() {
        let db = Database::in_memory().await.unwrap();
        let store = SqliteMarkerStore::new(db.pool().clone());

        let key = marker_key(MarkerStage::Consumed, 1, "g", "o");
        assert!(!store.exists(&key).await.unwrap());
        store.set(&key, Duration::from_secs(3600)).await.unwrap();
        assert!(store.exists(&key).await.unwrap());

        store.set("stale", Duration::ZERO).await.unwrap();
        assert!(!store.exists("stale").await.unwrap());
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert!(store.exists(&key).await.unwrap());
    }
}
