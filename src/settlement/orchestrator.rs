//! Settlement Orchestrator
//!
//! Settles every pending wager of a finished contest in a single transaction:
//! resolve, compute payout, write the wager result, cascade commission, then
//! credit wallets in one batch and mark the contest completed. Any error drops
//! the transaction, so a contest is either fully settled or untouched. An
//! attempt that loses the write lock is repeated from the start.

use crate::config::SettlementConfig;
use crate::db::{self, Database};
use crate::error::{SettlementError, SettlementResult};
use crate::ledger::{CascadeMode, CascadePolicy, CommissionCascade, CommissionRequest, FlowFlags};
use crate::services::metrics::SettlementMetrics;
use crate::services::retry::{retry, RetryClass, RetryPolicy, Retryable};
use crate::settlement::{payout, resolver};
use crate::types::{ContestStatus, Outcome, TeamSide};
use chrono::Utc;
use chrono_tz::Tz;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SettlementState {
    Pending,
    Resolving,
    Posting,
    Completed,
    RolledBack,
}

#[derive(Debug, Clone, Serialize)]
pub struct SettlementReport {
    pub contest_id: i64,
    pub state: SettlementState,
    /// The contest was already completed, nothing was written
    pub already_settled: bool,
    pub wagers_settled: usize,
    pub winner: Option<TeamSide>,
    /// Sum of bettor net results
    pub total_net: Decimal,
    pub total_payout: Decimal,
}

impl SettlementReport {
    fn new(contest_id: i64) -> Self {
        Self {
            contest_id,
            state: SettlementState::Pending,
            already_settled: false,
            wagers_settled: 0,
            winner: None,
            total_net: Decimal::ZERO,
            total_payout: Decimal::ZERO,
        }
    }
}

/// Flows recorded for a contest wager. A refunded stake is not real turnover.
fn contest_flows(outcome: Outcome) -> FlowFlags {
    match outcome {
        Outcome::Win | Outcome::Lose => FlowFlags { gross: true, actual: true },
        Outcome::Push => FlowFlags { gross: true, actual: false },
    }
}

/// A settlement that did not commit. The report is in `RolledBack` state and
/// `failed_during` names the stage that broke.
#[derive(Debug, Error)]
#[error("contest {} rolled back during {:?}: {}", .report.contest_id, .failed_during, .error)]
pub struct SettlementFailure {
    pub report: SettlementReport,
    pub failed_during: SettlementState,
    #[source]
    pub error: SettlementError,
}

impl Retryable for SettlementFailure {
    fn retry_class(&self) -> Option<RetryClass> {
        self.error.retry_class()
    }
}

#[derive(Clone)]
pub struct SettlementOrchestrator {
    db: Database,
    cascade: CommissionCascade,
    config: SettlementConfig,
    timezone: Tz,
    metrics: SettlementMetrics,
    retry: RetryPolicy,
}

impl SettlementOrchestrator {
    pub fn new(
        db: Database,
        cascade: CommissionCascade,
        config: SettlementConfig,
        timezone: Tz,
        metrics: SettlementMetrics,
    ) -> Self {
        Self {
            db,
            cascade,
            config,
            timezone,
            metrics,
            retry: RetryPolicy::ledger(),
        }
    }

    /// Settle one contest. Calling it on a completed contest is a no-op.
    pub async fn settle_contest(&self, contest_id: i64) -> Result<SettlementReport, SettlementFailure> {
        let label = format!("contest {}", contest_id);
        let result = retry(&self.retry, &label, || self.attempt(contest_id)).await;

        match &result {
            Ok(report) if !report.already_settled => {
                self.metrics.inc_contests_settled();
                self.metrics.add_wagers_settled(report.wagers_settled as u64);
                info!(
                    "[Settlement] Contest {} settled: {} wagers, winner {:?}, net {}",
                    contest_id, report.wagers_settled, report.winner, report.total_net
                );
            }
            Ok(_) => {}
            Err(failure) => error!("[Settlement] {}", failure),
        }
        result
    }

    async fn attempt(&self, contest_id: i64) -> Result<SettlementReport, SettlementFailure> {
        let mut report = SettlementReport::new(contest_id);
        match self.run(contest_id, &mut report).await {
            Ok(()) => Ok(report),
            Err(error) => {
                let failed_during = report.state;
                report.state = SettlementState::RolledBack;
                Err(SettlementFailure {
                    report,
                    failed_during,
                    error,
                })
            }
        }
    }

    async fn run(&self, contest_id: i64, report: &mut SettlementReport) -> SettlementResult<()> {
        let mut tx = self.db.begin().await?;

        let contest = db::load_contest(&mut *tx, contest_id)
            .await?
            .ok_or(SettlementError::ContestNotFound(contest_id))?;

        if contest.status == ContestStatus::Completed {
            debug!("[Settlement] Contest {} already completed", contest_id);
            report.already_settled = true;
            report.state = SettlementState::Completed;
            report.winner = contest.winner;
            return Ok(());
        }

        report.state = SettlementState::Resolving;
        let result = db::load_contest_result(&mut *tx, contest_id).await?;
        let wagers = db::load_pending_wagers(&mut *tx, contest_id).await?;
        let day = Utc::now().with_timezone(&self.timezone).date_naive();

        report.state = SettlementState::Posting;
        let mut credits: BTreeMap<i64, Decimal> = BTreeMap::new();

        for wager in &wagers {
            let resolution = resolver::resolve(wager, &result, &self.config)?;
            let payout = payout::compute(&resolution, wager);

            let written = db::record_wager_result(
                &mut *tx,
                wager.id,
                resolution.outcome,
                payout.net_result,
                payout.payout_amount,
            )
            .await?;
            if written == 0 {
                return Err(SettlementError::Conflict(format!("wager {} already settled", wager.id)));
            }

            let chain = self.cascade.resolver().chain_for(&mut *tx, wager.user_id).await?;
            let request = CommissionRequest {
                bettor_id: wager.user_id,
                source_id: format!("wager:{}", wager.id),
                day,
                stake: wager.stake,
                net_result: payout.net_result,
                settlement_flow: match resolution.outcome {
                    Outcome::Push => Decimal::ZERO,
                    Outcome::Win | Outcome::Lose => payout.payout_amount,
                },
                outcome: resolution.outcome,
                flows: contest_flows(resolution.outcome),
                wallet_credit: None,
                policy: CascadePolicy::AgentChain,
            };
            self.cascade.post(&mut *tx, &chain, &request, CascadeMode::Atomic).await?;

            debug!(
                "[Settlement] Wager {} ({}) -> {} net {} payout {}",
                wager.id,
                wager.kind.code(),
                resolution.outcome,
                payout.net_result,
                payout.payout_amount
            );

            *credits.entry(wager.user_id).or_default() += payout.payout_amount;
            report.total_net += payout.net_result;
            report.total_payout += payout.payout_amount;
            report.wagers_settled += 1;
        }

        self.cascade.poster().increment_balances(&mut *tx, &credits).await?;

        let winner = result.winner();
        if db::complete_contest(&mut *tx, contest_id, winner).await? == 0 {
            return Err(SettlementError::Conflict(format!("contest {} completed concurrently", contest_id)));
        }

        tx.commit().await?;

        report.winner = winner;
        report.state = SettlementState::Completed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{NewUser, NewWager};
    use crate::ledger::HierarchyResolver;
    use crate::types::{LegScore, Pick, WagerKind};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    struct Fixture {
        db: Database,
        orchestrator: SettlementOrchestrator,
    }

    async fn fixture() -> Fixture {
        let db = Database::in_memory().await.unwrap();
        for (id, parent, path, ratio, link) in [
            (10, Some(1), "1", dec!(0.30), Some("A")),
            (20, Some(10), "1,10", dec!(0.20), Some("B")),
            (30, Some(20), "1,10,20", dec!(0.05), Some("C")),
            (100, Some(30), "1,10,20,30", dec!(0), Some("D")),
            (101, Some(30), "1,10,20,30", dec!(0), Some("E")),
            (200, Some(1), "1", dec!(0), Some("F")),
        ] {
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

        let resolver = HierarchyResolver::new(db.pool().clone(), Duration::from_secs(60), 1);
        let cascade = CommissionCascade::new(db.pool().clone(), resolver);
        let orchestrator = SettlementOrchestrator::new(
            db.clone(),
            cascade,
            SettlementConfig::default(),
            chrono_tz::UTC,
            SettlementMetrics::new(),
        );
        Fixture { db, orchestrator }
    }

    async fn contest(db: &Database, scores: &[(i64, i64)]) -> i64 {
        let id = db.create_contest("Cup", dec!(0.05)).await.unwrap();
        for (i, (home, away)) in scores.iter().enumerate() {
            db.set_leg_score(
                id,
                &LegScore { leg_no: i as u32 + 1, home: *home, away: *away, home_handicap: Decimal::ZERO },
            )
            .await
            .unwrap();
        }
        id
    }

    async fn place(db: &Database, contest_id: i64, user_id: i64, kind: WagerKind, pick: Pick, stake: Decimal, odds: Decimal) -> i64 {
        db.create_wager(&NewWager {
            contest_id,
            user_id,
            kind,
            pick,
            stake,
            odds,
            tax_rate: dec!(0.05),
        })
        .await
        .unwrap()
    }

    fn today() -> chrono::NaiveDate {
        Utc::now().date_naive()
    }

    #[tokio::test]
    async fn test_settles_contest_and_credits_wallets() {
        let f = fixture().await;
        let cid = contest(&f.db, &[(2, 1)]).await;
        let winner = place(&f.db, cid, 100, WagerKind::WinLoss, Pick::Home, dec!(100), dec!(1.9)).await;
        let loser = place(&f.db, cid, 101, WagerKind::WinLoss, Pick::Away, dec!(100), dec!(1.9)).await;

        let report = f.orchestrator.settle_contest(cid).await.unwrap();
        assert_eq!(report.state, SettlementState::Completed);
        assert_eq!(report.wagers_settled, 2);
        assert_eq!(report.winner, Some(TeamSide::Home));

        let w = f.db.get_wager(winner).await.unwrap().unwrap();
        assert_eq!((w.resolution, w.net_result, w.payout_amount), (Some(Outcome::Win), Some(dec!(90)), Some(dec!(190))));
        let l = f.db.get_wager(loser).await.unwrap().unwrap();
        assert_eq!((l.resolution, l.payout_amount), (Some(Outcome::Lose), Some(Decimal::ZERO)));

        assert_eq!(f.db.wallet_balance(100).await.unwrap(), dec!(190));
        assert_eq!(f.db.wallet_balance(101).await.unwrap(), Decimal::ZERO);

        // Loser's 100 feeds the chain: 5 / 15 / 10, winner's 90 costs 4.5 / 13.5 / 9
        assert_eq!(f.db.payout_total(30, today()).await.unwrap(), dec!(0.50));
        assert_eq!(f.db.payout_total(20, today()).await.unwrap(), dec!(1.50));
        assert_eq!(f.db.payout_total(10, today()).await.unwrap(), dec!(1));

        let contest = f.db.get_contest(cid).await.unwrap().unwrap();
        assert_eq!(contest.status, ContestStatus::Completed);
        assert_eq!(contest.winner, Some(TeamSide::Home));
    }

    #[tokio::test]
    async fn test_every_source_conserves_money() {
        let f = fixture().await;
        let cid = contest(&f.db, &[(3, 0)]).await;
        let ids = [
            place(&f.db, cid, 100, WagerKind::WinLoss, Pick::Home, dec!(33.33), dec!(1.87)).await,
            place(&f.db, cid, 101, WagerKind::Handicap { handicap: dec!(2.5) }, Pick::Away, dec!(12.34), dec!(1.95)).await,
            place(&f.db, cid, 200, WagerKind::OddsPurchase { handicap: dec!(-1.5), base_score: dec!(1) }, Pick::Home, dec!(50), dec!(2)).await,
        ];

        f.orchestrator.settle_contest(cid).await.unwrap();

        for id in ids {
            let records = f.db.payout_records_for_source(&format!("wager:{}", id)).await.unwrap();
            let total: Decimal = records.iter().map(|r| r.amount).sum();
            assert_eq!(total, Decimal::ZERO, "wager {} does not balance", id);
            assert!(records.iter().all(|r| r.ratio >= Decimal::ZERO));
        }

        // Odds purchase: diff 3, (3 + 1) * 2 = 8x, gross 400, tax 20
        let op = f.db.get_wager(ids[2]).await.unwrap().unwrap();
        assert_eq!(op.net_result, Some(dec!(380)));
        assert_eq!(op.payout_amount, Some(dec!(430)));
    }

    #[tokio::test]
    async fn test_push_is_neutral() {
        let f = fixture().await;
        let cid = contest(&f.db, &[(1, 1)]).await;
        let id = place(&f.db, cid, 100, WagerKind::WinLoss, Pick::Home, dec!(80), dec!(2)).await;

        f.orchestrator.settle_contest(cid).await.unwrap();

        let w = f.db.get_wager(id).await.unwrap().unwrap();
        assert_eq!((w.net_result, w.payout_amount), (Some(Decimal::ZERO), Some(dec!(80))));
        let records = f.db.payout_records_for_source(&format!("wager:{}", id)).await.unwrap();
        assert!(records.iter().all(|r| r.amount.is_zero()));

        let stats = f.db.daily_statistics(100, today()).await.unwrap().unwrap();
        assert_eq!(stats.gross_flow, dec!(80));
        assert_eq!(stats.actual_flow, Decimal::ZERO);
        assert_eq!(f.db.wallet_balance(100).await.unwrap(), dec!(80));
    }

    #[tokio::test]
    async fn test_second_settlement_is_noop() {
        let f = fixture().await;
        let cid = contest(&f.db, &[(0, 2)]).await;
        place(&f.db, cid, 100, WagerKind::WinLoss, Pick::Away, dec!(10), dec!(3)).await;

        f.orchestrator.settle_contest(cid).await.unwrap();
        let records = f.db.payout_record_count().await.unwrap();
        let balance = f.db.wallet_balance(100).await.unwrap();

        let again = f.orchestrator.settle_contest(cid).await.unwrap();
        assert!(again.already_settled);
        assert_eq!(again.wagers_settled, 0);
        assert_eq!(f.db.payout_record_count().await.unwrap(), records);
        assert_eq!(f.db.wallet_balance(100).await.unwrap(), balance);
    }

    #[tokio::test]
    async fn test_failure_rolls_back_everything() {
        let f = fixture().await;
        let cid = contest(&f.db, &[(2, 0)]).await;
        let good = place(&f.db, cid, 100, WagerKind::WinLoss, Pick::Home, dec!(10), dec!(2)).await;
        // Over/Under is meaningless on a win/loss wager
        place(&f.db, cid, 101, WagerKind::WinLoss, Pick::Over, dec!(10), dec!(2)).await;

        let failure = f.orchestrator.settle_contest(cid).await.unwrap_err();
        assert!(failure.error.is_validation());
        assert_eq!(failure.report.state, SettlementState::RolledBack);
        assert_eq!(failure.failed_during, SettlementState::Posting);
        // Partial progress inside the attempt is reported, none of it committed
        assert_eq!(failure.report.wagers_settled, 1);

        let contest = f.db.get_contest(cid).await.unwrap().unwrap();
        assert_eq!(contest.status, ContestStatus::Pending);
        assert!(f.db.get_wager(good).await.unwrap().unwrap().resolution.is_none());
        assert_eq!(f.db.payout_record_count().await.unwrap(), 0);
        assert_eq!(f.db.wallet_balance(100).await.unwrap(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_missing_link_identifier_aborts_contest() {
        let f = fixture().await;
        f.db.upsert_user(&NewUser {
            id: 20,
            parent_id: Some(10),
            ancestors: Some("1,10".to_string()),
            commission_ratio: dec!(0.20),
            link_identifier: None,
            external_account: None,
        })
        .await
        .unwrap();

        let cid = contest(&f.db, &[(1, 0)]).await;
        place(&f.db, cid, 100, WagerKind::WinLoss, Pick::Away, dec!(10), dec!(2)).await;

        let failure = f.orchestrator.settle_contest(cid).await.unwrap_err();
        assert!(matches!(failure.error, SettlementError::MissingLinkIdentifier { user_id: 20 }));
        assert_eq!(failure.report.state, SettlementState::RolledBack);
        assert_eq!(f.db.get_contest(cid).await.unwrap().unwrap().status, ContestStatus::Pending);
    }

    #[tokio::test]
    async fn test_unknown_contest() {
        let f = fixture().await;
        let failure = f.orchestrator.settle_contest(404).await.unwrap_err();
        assert!(matches!(failure.error, SettlementError::ContestNotFound(404)));
        assert_eq!(failure.failed_during, SettlementState::Pending);
    }

    #[tokio::test]
    async fn test_rounding_does_not_drift() {
        let f = fixture().await;
        let cid = contest(&f.db, &[(1, 0)]).await;
        for _ in 0..1000 {
            place(&f.db, cid, 200, WagerKind::WinLoss, Pick::Home, dec!(10.01), dec!(1.333)).await;
        }

        let report = f.orchestrator.settle_contest(cid).await.unwrap();
        assert_eq!(report.wagers_settled, 1000);

        // Each win nets round2(10.01 * 0.333) = 3.33
        let stats = f.db.daily_statistics(200, today()).await.unwrap().unwrap();
        assert!((stats.result_amount - dec!(3330)).abs() <= dec!(0.01));
        assert_eq!(stats.result_amount, f.db.payout_total(200, today()).await.unwrap());
    }
}
