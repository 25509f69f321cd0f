//! Commission Cascade Poster
//!
//! Distributes a bettor's result up the agent chain. Each agent earns the slice
//! of commission its descendants did not already claim; whatever the chain does
//! not cover goes to the platform root, so for every source
//! `sum(agent amounts) + net_result == 0`.

use crate::error::SettlementResult;
use crate::ledger::hierarchy::HierarchyResolver;
use crate::ledger::poster::{LedgerDeltas, LedgerEntry, LedgerPoster};
use crate::services::retry::{retry, RetryPolicy};
use crate::types::{money, AgentChain, Outcome};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use sqlx::Connection;
use tracing::{debug, warn};

/// Which turnover fields a posting populates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowFlags {
    pub gross: bool,
    pub actual: bool,
}

/// How level failures are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeMode {
    /// Any failure aborts the caller's transaction (contest settlement)
    Atomic,
    /// Failed levels are logged and their share falls to the platform root
    BestEffort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadePolicy {
    /// Walk the bettor's agent chain
    AgentChain,
    /// Skip the chain, the platform root takes the full amount
    PlatformOnly,
}

#[derive(Debug, Clone)]
pub struct CommissionRequest {
    pub bettor_id: i64,
    pub source_id: String,
    pub day: NaiveDate,
    pub stake: Decimal,
    pub net_result: Decimal,
    /// Money returned to the bettor, recorded as settlement flow
    pub settlement_flow: Decimal,
    pub outcome: Outcome,
    pub flows: FlowFlags,
    /// Credited to the bettor's wallet with the bettor's own posting
    pub wallet_credit: Option<Decimal>,
    pub policy: CascadePolicy,
}

/// One posted level
#[derive(Debug, Clone, PartialEq)]
pub struct PostedLevel {
    pub recipient_id: i64,
    pub level: i64,
    pub amount: Decimal,
    pub ratio: Decimal,
}

#[derive(Debug, Clone, Default)]
pub struct CascadeOutcome {
    /// Bettor first, then agents nearest first, platform root last
    pub levels: Vec<PostedLevel>,
    /// Agents whose posting failed in best-effort mode
    pub failed_agents: Vec<i64>,
}

impl CascadeOutcome {
    /// Total posted to everyone above the bettor
    pub fn agent_total(&self) -> Decimal {
        self.levels.iter().filter(|l| l.level > 0).map(|l| l.amount).sum()
    }
}

#[derive(Clone)]
pub struct CommissionCascade {
    pool: SqlitePool,
    resolver: HierarchyResolver,
    poster: LedgerPoster,
}

impl CommissionCascade {
    pub fn new(pool: SqlitePool, resolver: HierarchyResolver) -> Self {
        let poster = LedgerPoster::new(resolver.root_id());
        Self { pool, resolver, poster }
    }

    pub fn resolver(&self) -> &HierarchyResolver {
        &self.resolver
    }

    pub fn poster(&self) -> &LedgerPoster {
        &self.poster
    }

    /// Resolve the chain, cascade and commit in one transaction, repeating
    /// the whole transaction when it loses the write lock
    pub async fn post_commission(&self, request: &CommissionRequest, mode: CascadeMode) -> SettlementResult<CascadeOutcome> {
        retry(&RetryPolicy::ledger(), &request.source_id, || self.post_commission_once(request, mode)).await
    }

    async fn post_commission_once(&self, request: &CommissionRequest, mode: CascadeMode) -> SettlementResult<CascadeOutcome> {
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        let chain = self.resolver.chain_for(&mut *tx, request.bettor_id).await?;
        let outcome = self.post(&mut *tx, &chain, request, mode).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Post the bettor row, every agent level and the platform remainder on the
    /// caller's transaction
    pub async fn post(
        &self,
        conn: &mut SqliteConnection,
        chain: &AgentChain,
        request: &CommissionRequest,
        mode: CascadeMode,
    ) -> SettlementResult<CascadeOutcome> {
        let mut outcome = CascadeOutcome::default();
        let root_id = self.resolver.root_id();

        let stake_flow = if request.flows.gross { request.stake } else { Decimal::ZERO };
        let actual_flow = if request.flows.actual { request.stake } else { Decimal::ZERO };

        // Bettor's own row
        let member = &chain.member;
        let bettor_entry = LedgerEntry {
            user_id: request.bettor_id,
            day: request.day,
            ancestors: member.ancestors.clone(),
            parent_user_id: member.parent_id,
            link_identifier: member.link_identifier.clone(),
            deltas: LedgerDeltas {
                gross_flow: stake_flow,
                actual_flow,
                settlement_flow: request.settlement_flow,
                result_amount: request.net_result,
                ..Default::default()
            },
            wallet_delta: request.wallet_credit,
            source_id: request.source_id.clone(),
            bettor_id: request.bettor_id,
            level: 0,
            ratio: Decimal::ONE,
        };
        self.poster.post(conn, &bettor_entry).await?;
        outcome.levels.push(PostedLevel {
            recipient_id: request.bettor_id,
            level: 0,
            amount: request.net_result,
            ratio: Decimal::ONE,
        });

        // Commission flows opposite to the bettor's result
        let total = match request.outcome {
            Outcome::Push => Decimal::ZERO,
            Outcome::Win | Outcome::Lose => money(-request.net_result),
        };

        let lower_deltas = |amount: Decimal, divided: Decimal| LedgerDeltas {
            result_amount: amount,
            lower_level_flow: stake_flow,
            lower_level_actual_flow: actual_flow,
            lower_level_settlement_flow: request.settlement_flow,
            parent_divided_into: divided,
            ..Default::default()
        };

        let walk_chain = request.policy == CascadePolicy::AgentChain && !chain.is_empty();
        let mut posted = Decimal::ZERO;
        let mut posted_ratio = Decimal::ZERO;
        let mut level: i64 = 0;

        if walk_chain {
            let shares = chain.level_shares();
            for (agent, share) in chain.agents.iter().zip(shares).rev() {
                level += 1;
                let amount = match request.outcome {
                    Outcome::Push => Decimal::ZERO,
                    Outcome::Win | Outcome::Lose => money(-request.net_result * share),
                };

                let entry = LedgerEntry {
                    user_id: agent.user_id,
                    day: request.day,
                    ancestors: agent.ancestors.clone(),
                    parent_user_id: agent.parent_id,
                    link_identifier: agent.link_identifier.clone(),
                    deltas: lower_deltas(amount, posted),
                    wallet_delta: None,
                    source_id: request.source_id.clone(),
                    bettor_id: request.bettor_id,
                    level,
                    ratio: share,
                };

                match mode {
                    CascadeMode::Atomic => {
                        self.poster.post(conn, &entry).await?;
                    }
                    CascadeMode::BestEffort => {
                        let mut savepoint = conn.begin().await?;
                        match self.poster.post(&mut *savepoint, &entry).await {
                            Ok(_) => savepoint.commit().await?,
                            Err(e) => {
                                savepoint.rollback().await?;
                                warn!(
                                    "[Cascade] Level {} (agent {}) failed for {}: {}",
                                    level, agent.user_id, request.source_id, e
                                );
                                outcome.failed_agents.push(agent.user_id);
                                continue;
                            }
                        }
                    }
                }

                posted += amount;
                posted_ratio += share;
                outcome.levels.push(PostedLevel {
                    recipient_id: agent.user_id,
                    level,
                    amount,
                    ratio: share,
                });
            }
        }

        // Platform root takes the remainder, or everything when there is no chain
        let remainder = total - posted;
        if !walk_chain || !remainder.is_zero() {
            level += 1;
            let ratio = Decimal::ONE - posted_ratio;
            let entry = LedgerEntry {
                user_id: root_id,
                day: request.day,
                ancestors: Some(String::new()),
                parent_user_id: None,
                link_identifier: None,
                deltas: lower_deltas(remainder, posted),
                wallet_delta: None,
                source_id: request.source_id.clone(),
                bettor_id: request.bettor_id,
                level,
                ratio,
            };
            self.poster.post(conn, &entry).await?;
            outcome.levels.push(PostedLevel {
                recipient_id: root_id,
                level,
                amount: remainder,
                ratio,
            });
        }

        debug!(
            "[Cascade] {} posted {} levels for bettor {} (net {})",
            request.source_id,
            outcome.levels.len(),
            request.bettor_id,
            request.net_result
        );

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, NewUser};
    use crate::error::SettlementError;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
    }

    async fn user(db: &Database, id: i64, parent: Option<i64>, path: &str, ratio: Decimal, link: Option<&str>) {
        db.upsert_user(&NewUser {
            id,
            parent_id: parent,
            ancestors: Some(path.to_string()),
            commission_ratio: ratio,
            link_identifier: link.map(str::to_string),
            external_account: None,
        })
        .await
        .unwrap();
    }

    /// Bettor 100 under agents 10 (0.30) > 20 (0.20) > 30 (0.05)
    async fn setup() -> (Database, CommissionCascade) {
        let db = Database::in_memory().await.unwrap();
        user(&db, 10, Some(1), "1", dec!(0.30), Some("A")).await;
        user(&db, 20, Some(10), "1,10", dec!(0.20), Some("B")).await;
        user(&db, 30, Some(20), "1,10,20", dec!(0.05), Some("C")).await;
        user(&db, 100, Some(30), "1,10,20,30", dec!(0), Some("D")).await;
        user(&db, 200, Some(1), "1", dec!(0), Some("E")).await;

        let resolver = HierarchyResolver::new(db.pool().clone(), Duration::from_secs(60), 1);
        let cascade = CommissionCascade::new(db.pool().clone(), resolver);
        (db, cascade)
    }

    fn request(bettor_id: i64, net: Decimal, outcome: Outcome) -> CommissionRequest {
        CommissionRequest {
            bettor_id,
            source_id: format!("test:{}", bettor_id),
            day: day(),
            stake: dec!(100),
            net_result: net,
            settlement_flow: Decimal::ZERO,
            outcome,
            flows: FlowFlags { gross: true, actual: true },
            wallet_credit: None,
            policy: CascadePolicy::AgentChain,
        }
    }

    #[tokio::test]
    async fn test_loss_cascades_by_level_share() {
        let (db, cascade) = setup().await;
        let result = cascade
            .post_commission(&request(100, dec!(-100), Outcome::Lose), CascadeMode::Atomic)
            .await
            .unwrap();

        let agents: Vec<(i64, Decimal)> = result.levels[1..4].iter().map(|l| (l.recipient_id, l.amount)).collect();
        assert_eq!(agents, vec![(30, dec!(5)), (20, dec!(15)), (10, dec!(10))]);

        let root = result.levels.last().unwrap();
        assert_eq!((root.recipient_id, root.amount, root.ratio), (1, dec!(70), dec!(0.70)));
        assert_eq!(result.agent_total() + dec!(-100), Decimal::ZERO);

        let nearest = db.daily_statistics(30, day()).await.unwrap().unwrap();
        assert_eq!(nearest.lower_level_flow, dec!(100));
        assert_eq!(nearest.parent_divided_into, Decimal::ZERO);
        let top = db.daily_statistics(10, day()).await.unwrap().unwrap();
        assert_eq!(top.parent_divided_into, dec!(20));
    }

    #[tokio::test]
    async fn test_win_inverts_sign() {
        let (db, cascade) = setup().await;
        cascade
            .post_commission(&request(100, dec!(90), Outcome::Win), CascadeMode::Atomic)
            .await
            .unwrap();

        assert_eq!(db.payout_total(30, day()).await.unwrap(), dec!(-4.50));
        assert_eq!(db.payout_total(20, day()).await.unwrap(), dec!(-13.50));
        assert_eq!(db.payout_total(10, day()).await.unwrap(), dec!(-9));
        assert_eq!(db.payout_total(1, day()).await.unwrap(), dec!(-63));
        assert_eq!(db.payout_total(100, day()).await.unwrap(), dec!(90));
    }

    #[tokio::test]
    async fn test_push_posts_zero_records() {
        let (db, cascade) = setup().await;
        let result = cascade
            .post_commission(&request(100, Decimal::ZERO, Outcome::Push), CascadeMode::Atomic)
            .await
            .unwrap();

        assert_eq!(result.levels.len(), 4);
        assert!(result.levels.iter().all(|l| l.amount.is_zero()));
        let stats = db.daily_statistics(20, day()).await.unwrap().unwrap();
        assert_eq!(stats.lower_level_flow, dec!(100));
        assert_eq!(stats.result_amount, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_no_chain_goes_to_root() {
        let (db, cascade) = setup().await;
        let result = cascade
            .post_commission(&request(200, dec!(-40), Outcome::Lose), CascadeMode::Atomic)
            .await
            .unwrap();

        assert_eq!(result.levels.len(), 2);
        assert_eq!(result.levels[1], PostedLevel { recipient_id: 1, level: 1, amount: dec!(40), ratio: Decimal::ONE });
        assert_eq!(db.payout_total(1, day()).await.unwrap(), dec!(40));
    }

    #[tokio::test]
    async fn test_platform_only_skips_chain() {
        let (db, cascade) = setup().await;
        let mut req = request(100, dec!(-25), Outcome::Lose);
        req.policy = CascadePolicy::PlatformOnly;
        cascade.post_commission(&req, CascadeMode::Atomic).await.unwrap();

        assert_eq!(db.payout_total(1, day()).await.unwrap(), dec!(25));
        assert!(db.daily_statistics(30, day()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_best_effort_absorbs_failed_level() {
        let (db, cascade) = setup().await;
        // Agent 20 loses its link identifier
        user(&db, 20, Some(10), "1,10", dec!(0.20), None).await;
        cascade.resolver().clear().await;

        let result = cascade
            .post_commission(&request(100, dec!(-100), Outcome::Lose), CascadeMode::BestEffort)
            .await
            .unwrap();

        assert_eq!(result.failed_agents, vec![20]);
        assert_eq!(db.payout_total(1, day()).await.unwrap(), dec!(85));
        assert_eq!(result.agent_total(), dec!(100));
        assert!(db.daily_statistics(20, day()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_atomic_aborts_on_failed_level() {
        let (db, cascade) = setup().await;
        user(&db, 20, Some(10), "1,10", dec!(0.20), None).await;
        cascade.resolver().clear().await;

        let err = cascade
            .post_commission(&request(100, dec!(-100), Outcome::Lose), CascadeMode::Atomic)
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::MissingLinkIdentifier { user_id: 20 }));
        assert_eq!(db.payout_record_count().await.unwrap(), 0);
    }
}
