//! Hierarchy Resolver - materializes and caches agent chains
//!
//! A user's ancestor path ("1,5,9", root first) is parsed once, the agents on
//! it are loaded in one query and the resulting chain is cached for a multi-day
//! TTL. Hierarchy edits must call `invalidate` for the affected user.

use crate::db::{load_user_node, load_user_nodes};
use crate::error::{SettlementError, SettlementResult};
use crate::types::{parse_ancestor_path, AgentChain};
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

struct CachedChain {
    chain: AgentChain,
    loaded_at: Instant,
}

/// Cached lookup of agent chains
#[derive(Clone)]
pub struct HierarchyResolver {
    pool: SqlitePool,
    /// Keyed by member user id
    cache: Arc<RwLock<HashMap<i64, CachedChain>>>,
    ttl: Duration,
    /// Platform account; never part of a chain, it takes the remainder instead
    root_id: i64,
}

impl HierarchyResolver {
    pub fn new(pool: SqlitePool, ttl: Duration, root_id: i64) -> Self {
        Self {
            pool,
            cache: Arc::new(RwLock::new(HashMap::new())),
            ttl,
            root_id,
        }
    }

    pub fn root_id(&self) -> i64 {
        self.root_id
    }

    /// Resolve a chain on a fresh pooled connection
    pub async fn resolve(&self, user_id: i64) -> SettlementResult<AgentChain> {
        let mut conn = self.pool.acquire().await?;
        self.chain_for(&mut conn, user_id).await
    }

    /// Resolve a chain on the caller's connection (usually an open transaction)
    pub async fn chain_for(&self, conn: &mut SqliteConnection, user_id: i64) -> SettlementResult<AgentChain> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(&user_id) {
                if cached.loaded_at.elapsed() < self.ttl {
                    return Ok(cached.chain.clone());
                }
            }
        }

        let chain = self.load(conn, user_id).await?;

        let mut cache = self.cache.write().await;
        cache.insert(
            user_id,
            CachedChain {
                chain: chain.clone(),
                loaded_at: Instant::now(),
            },
        );
        Ok(chain)
    }

    async fn load(&self, conn: &mut SqliteConnection, user_id: i64) -> SettlementResult<AgentChain> {
        let member = load_user_node(conn, user_id)
            .await?
            .ok_or(SettlementError::UserNotFound(user_id))?;

        let path: Vec<i64> = member
            .ancestors
            .as_deref()
            .map(parse_ancestor_path)
            .unwrap_or_default()
            .into_iter()
            .filter(|id| *id != self.root_id && *id != user_id)
            .collect();

        let mut nodes: HashMap<i64, _> = load_user_nodes(conn, &path)
            .await?
            .into_iter()
            .map(|node| (node.user_id, node))
            .collect();

        let mut agents = Vec::with_capacity(path.len());
        for id in &path {
            match nodes.remove(id) {
                Some(node) => agents.push(node),
                None => warn!("[Hierarchy] Ancestor {} of user {} not found, skipping", id, user_id),
            }
        }

        debug!("[Hierarchy] Resolved {} agents for user {}", agents.len(), user_id);
        Ok(AgentChain { member, agents })
    }

    /// Drop every cached chain the user appears in
    pub async fn invalidate(&self, user_id: i64) {
        let mut cache = self.cache.write().await;
        cache.retain(|_, cached| !cached.chain.contains(user_id));
    }

    pub async fn clear(&self) {
        self.cache.write().await.clear();
    }

    pub async fn cached_len(&self) -> usize {
        self.cache.read().await.len()
    }
}
