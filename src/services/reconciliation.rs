//! Reconciliation Scheduler - pulls external game records into the ledger
//!
//! Three passes share the commission cascade:
//! - the interval cycle stores new bet records and posts the settled ones,
//! - the daily sweep looks up draw results for records stored unsettled,
//! - the running-balance cycle posts balance movement for wallet-style games.
//!
//! Provider calls always happen before a transaction opens. Markers are only
//! written after the transaction they guard has committed, and a failing
//! marker store aborts the whole pass. Any other failure is contained to the
//! user it happened for. Each ledger transaction is repeated on its own when
//! it loses the SQLite write lock; provider calls retry inside the client.

use super::markers::{marker_key, MarkerStage, MarkerStore};
use super::metrics::SettlementMetrics;
use super::provider::GameProvider;
use super::provider_errors::ProviderError;
use super::retry::{retry, RetryPolicy};
use super::scheduler::RecurringTask;
use crate::config::ReconcileConfig;
use crate::db::{self, Database};
use crate::error::SettlementResult;
use crate::ledger::{CascadeMode, CascadePolicy, CommissionCascade, CommissionRequest, FlowFlags};
use crate::types::{
    money, DrawResult, ExternalAccount, ExternalBet, ExternalTransfer, GameInfo, GameKind, Outcome,
    TransferDirection,
};
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use futures::stream::{self, StreamExt};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::sqlite::SqliteConnection;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub users: usize,
    pub failed_users: usize,
    pub stored: usize,
    pub posted: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub pending: usize,
    pub resolved: usize,
    pub posted: usize,
    pub failed_games: usize,
    pub failed_users: usize,
    pub markers_purged: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunningBalanceReport {
    pub checked: usize,
    pub postings: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
struct UserOutcome {
    stored: usize,
    posted: usize,
    skipped: usize,
}

fn outcome_of(net: Decimal) -> Outcome {
    if net > Decimal::ZERO {
        Outcome::Win
    } else if net < Decimal::ZERO {
        Outcome::Lose
    } else {
        Outcome::Push
    }
}

pub struct ReconciliationService {
    db: Database,
    provider: Arc<dyn GameProvider>,
    markers: Arc<dyn MarkerStore>,
    cascade: CommissionCascade,
    config: ReconcileConfig,
    marker_ttl: Duration,
    timezone: Tz,
    metrics: SettlementMetrics,
    ledger_retry: RetryPolicy,
}

impl ReconciliationService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        provider: Arc<dyn GameProvider>,
        markers: Arc<dyn MarkerStore>,
        cascade: CommissionCascade,
        config: ReconcileConfig,
        marker_ttl: Duration,
        timezone: Tz,
        metrics: SettlementMetrics,
    ) -> Self {
        Self {
            db,
            provider,
            markers,
            cascade,
            config,
            marker_ttl,
            timezone,
            metrics,
            ledger_retry: RetryPolicy::ledger(),
        }
    }

    pub fn metrics(&self) -> &SettlementMetrics {
        &self.metrics
    }

    fn day_of(&self, time: DateTime<Utc>) -> NaiveDate {
        time.with_timezone(&self.timezone).date_naive()
    }

    async fn tracked<T, F>(&self, call: F) -> Result<T, ProviderError>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        self.metrics.inc_provider_calls();
        let result = call.await;
        if result.is_err() {
            self.metrics.inc_provider_errors();
        }
        result
    }

    async fn games_of_kind(&self, kind: GameKind) -> SettlementResult<HashMap<String, GameInfo>> {
        let games = self.tracked(self.provider.list_games()).await?;
        Ok(games
            .into_iter()
            .filter(|g| g.active && g.kind == kind)
            .map(|g| (g.game_id.clone(), g))
            .collect())
    }

    /// Commission request for a settled external bet
    fn external_request(&self, bet: &ExternalBet, settlement_amount: Decimal) -> CommissionRequest {
        let net = money(settlement_amount - bet.stake);
        let always_track = self.config.always_track_game_id.as_deref() == Some(bet.game_id.as_str());

        CommissionRequest {
            bettor_id: bet.user_id,
            source_id: format!("ext:{}:{}", bet.game_id, bet.order_id),
            day: self.day_of(bet.settled_at.unwrap_or_else(Utc::now)),
            stake: bet.stake,
            net_result: net,
            settlement_flow: settlement_amount,
            outcome: outcome_of(net),
            flows: FlowFlags {
                gross: true,
                actual: always_track || !settlement_amount.is_zero(),
            },
            wallet_credit: None,
            policy: CascadePolicy::AgentChain,
        }
    }

    async fn post_settlement(
        &self,
        conn: &mut SqliteConnection,
        bet: &ExternalBet,
        settlement_amount: Decimal,
    ) -> SettlementResult<()> {
        let chain = self.cascade.resolver().chain_for(conn, bet.user_id).await?;
        let request = self.external_request(bet, settlement_amount);
        let outcome = self.cascade.post(conn, &chain, &request, CascadeMode::BestEffort).await?;
        if !outcome.failed_agents.is_empty() {
            warn!(
                "[Reconcile] {} posted with failed agents {:?}",
                request.source_id, outcome.failed_agents
            );
        }
        Ok(())
    }

    // ==================== INTERVAL CYCLE ====================

    /// Pull recent bets for every linked user and post the settled ones
    pub async fn run_cycle(&self) -> SettlementResult<CycleReport> {
        self.metrics.inc_cycles();

        let games = self.games_of_kind(GameKind::Standard).await?;
        let accounts = self.db.list_external_accounts().await?;
        let to = Utc::now();
        let from = to - self.config.lookback;

        info!(
            "[Reconcile] Cycle over {} users, {} games ({} .. {})",
            accounts.len(),
            games.len(),
            from,
            to
        );

        let games = &games;
        let mut results = stream::iter(accounts)
            .map(|account| async move {
                let result = self.reconcile_user(&account, games, from, to).await;
                (account, result)
            })
            .buffer_unordered(self.config.concurrency);

        let mut report = CycleReport::default();
        while let Some((account, result)) = results.next().await {
            report.users += 1;
            match result {
                Ok(outcome) => {
                    self.metrics.inc_users_processed();
                    report.stored += outcome.stored;
                    report.posted += outcome.posted;
                    report.skipped += outcome.skipped;
                }
                Err(e) if e.is_catastrophic() => {
                    error!("[Reconcile] Aborting cycle at user {}: {}", account.user_id, e);
                    return Err(e);
                }
                Err(e) => {
                    self.metrics.inc_users_failed();
                    report.failed_users += 1;
                    warn!("[Reconcile] User {} ({}) failed: {}", account.user_id, account.account, e);
                }
            }
        }

        info!(
            "[Reconcile] Cycle done: {} stored, {} posted, {} skipped, {} failed users",
            report.stored, report.posted, report.skipped, report.failed_users
        );
        Ok(report)
    }

    async fn reconcile_user(
        &self,
        account: &ExternalAccount,
        games: &HashMap<String, GameInfo>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> SettlementResult<UserOutcome> {
        let bets = self.tracked(self.provider.list_bets(account, from, to)).await?;
        let mut outcome = UserOutcome::default();

        for bet in bets {
            if !games.contains_key(&bet.game_id) {
                debug!("[Reconcile] Order {} is for untracked game {}", bet.order_id, bet.game_id);
                continue;
            }

            let consumed = marker_key(MarkerStage::Consumed, bet.user_id, &bet.game_id, &bet.order_id);
            if self.markers.exists(&consumed).await? {
                outcome.skipped += 1;
                self.metrics.inc_records_skipped();
                continue;
            }

            let label = format!("store {}", bet.order_id);
            let posted = retry(&self.ledger_retry, &label, || self.store_and_post(&bet)).await?;

            self.markers.set(&consumed, self.marker_ttl).await?;
            if bet.settlement_amount.is_some() {
                let settled = marker_key(MarkerStage::Settled, bet.user_id, &bet.game_id, &bet.order_id);
                self.markers.set(&settled, self.marker_ttl).await?;
            }

            self.metrics.inc_records_stored();
            outcome.stored += 1;
            if posted {
                self.metrics.inc_records_posted();
                outcome.posted += 1;
            }
        }

        Ok(outcome)
    }

    /// Store one record and post it if this is the first time it is settled
    async fn store_and_post(&self, bet: &ExternalBet) -> SettlementResult<bool> {
        let mut tx = self.db.begin().await?;
        let stored = db::store_external_bet(&mut *tx, bet).await?;
        let posted = match bet.settlement_amount {
            Some(amount) if stored.needs_posting(bet) => {
                self.post_settlement(&mut *tx, bet, amount).await?;
                true
            }
            _ => false,
        };
        tx.commit().await?;
        Ok(posted)
    }

    // ==================== UNSETTLED SWEEP ====================

    /// Resolve stored records that were still open when first pulled
    pub async fn run_unsettled_sweep(&self) -> SettlementResult<SweepReport> {
        let now = Utc::now();
        let since = now - self.config.sweep_window;
        let pending = self.db.unsettled_external_bets(since).await?;

        let mut report = SweepReport {
            pending: pending.len(),
            ..Default::default()
        };

        if !pending.is_empty() {
            let mut by_game: HashMap<String, Vec<ExternalBet>> = HashMap::new();
            for bet in pending {
                by_game.entry(bet.game_id.clone()).or_default().push(bet);
            }

            info!(
                "[Sweep] {} unsettled records across {} games",
                report.pending,
                by_game.len()
            );

            let fetched: Vec<_> = stream::iter(by_game)
                .map(|(game_id, bets)| async move {
                    let mut order_ids: Vec<String> = bets.iter().map(|b| b.order_id.clone()).collect();
                    order_ids.sort();
                    order_ids.dedup();
                    let result = self
                        .tracked(self.provider.query_draw_results(&game_id, &order_ids, since, now))
                        .await;
                    (game_id, bets, result)
                })
                .buffer_unordered(self.config.concurrency)
                .collect()
                .await;

            let mut resolved: BTreeMap<i64, Vec<(ExternalBet, DrawResult)>> = BTreeMap::new();
            for (game_id, bets, result) in fetched {
                match result {
                    Ok(draws) => {
                        let draws: HashMap<String, DrawResult> =
                            draws.into_iter().map(|d| (d.order_id.clone(), d)).collect();
                        for bet in bets {
                            if let Some(draw) = draws.get(&bet.order_id) {
                                resolved.entry(bet.user_id).or_default().push((bet, draw.clone()));
                            }
                        }
                    }
                    Err(e) => {
                        report.failed_games += 1;
                        warn!("[Sweep] Draw results for game {} failed: {}", game_id, e);
                    }
                }
            }
            report.resolved = resolved.values().map(Vec::len).sum();

            let mut results = stream::iter(resolved)
                .map(|(user_id, items)| async move { (user_id, self.settle_user_records(user_id, items).await) })
                .buffer_unordered(self.config.concurrency);

            while let Some((user_id, result)) = results.next().await {
                match result {
                    Ok(posted) => report.posted += posted,
                    Err(e) if e.is_catastrophic() => {
                        error!("[Sweep] Aborting at user {}: {}", user_id, e);
                        return Err(e);
                    }
                    Err(e) => {
                        report.failed_users += 1;
                        warn!("[Sweep] User {} failed: {}", user_id, e);
                    }
                }
            }
            self.metrics.add_sweep_resolved(report.resolved as u64);
        }

        report.markers_purged = self.markers.purge_expired().await?;

        info!(
            "[Sweep] Done: {} pending, {} resolved, {} posted, {} markers purged",
            report.pending, report.resolved, report.posted, report.markers_purged
        );
        Ok(report)
    }

    /// Apply draw results for one user's records and post the newly settled ones
    async fn settle_user_records(&self, user_id: i64, items: Vec<(ExternalBet, DrawResult)>) -> SettlementResult<usize> {
        let mut already_settled = Vec::with_capacity(items.len());
        for (bet, _) in &items {
            let key = marker_key(MarkerStage::Settled, bet.user_id, &bet.game_id, &bet.order_id);
            already_settled.push(self.markers.exists(&key).await?);
        }

        let label = format!("sweep user {}", user_id);
        let posted_keys = retry(&self.ledger_retry, &label, || {
            self.apply_draw_results(&items, &already_settled)
        })
        .await?;

        for key in &posted_keys {
            self.markers.set(key, self.marker_ttl).await?;
            self.metrics.inc_records_posted();
        }
        Ok(posted_keys.len())
    }

    /// Returns the settled-marker keys of the records it posted
    async fn apply_draw_results(
        &self,
        items: &[(ExternalBet, DrawResult)],
        already_settled: &[bool],
    ) -> SettlementResult<Vec<String>> {
        let mut tx = self.db.begin().await?;
        let mut posted_keys = Vec::new();
        for ((bet, draw), &marked) in items.iter().zip(already_settled) {
            let settled_at = draw.settled_at.unwrap_or_else(Utc::now);
            let updated = db::apply_settlement(&mut *tx, bet, draw.settlement_amount, settled_at).await?;
            if updated == 0 || marked {
                continue;
            }

            let settled = ExternalBet {
                settlement_amount: Some(draw.settlement_amount),
                settled_at: Some(settled_at),
                ..bet.clone()
            };
            self.post_settlement(&mut *tx, &settled, draw.settlement_amount).await?;
            posted_keys.push(marker_key(MarkerStage::Settled, bet.user_id, &bet.game_id, &bet.order_id));
        }
        tx.commit().await?;
        Ok(posted_keys)
    }

    // ==================== RUNNING BALANCE ====================

    /// Post balance movement of wallet-style games straight to the platform
    pub async fn run_running_balance_cycle(&self) -> SettlementResult<RunningBalanceReport> {
        let games = self.games_of_kind(GameKind::RunningBalance).await?;
        let mut report = RunningBalanceReport::default();
        if games.is_empty() {
            return Ok(report);
        }

        let accounts = self.db.list_external_accounts().await?;
        let work: Vec<(ExternalAccount, String)> = accounts
            .iter()
            .flat_map(|a| games.keys().map(move |g| (a.clone(), g.clone())))
            .collect();

        let mut results = stream::iter(work)
            .map(|(account, game_id)| async move {
                let result = self.reconcile_running_balance(&account, &game_id).await;
                (account, game_id, result)
            })
            .buffer_unordered(self.config.concurrency);

        while let Some((account, game_id, result)) = results.next().await {
            report.checked += 1;
            match result {
                Ok(Some(net)) => {
                    report.postings += 1;
                    self.metrics.inc_running_balance_postings();
                    debug!("[Balance] User {} game {} net {}", account.user_id, game_id, net);
                }
                Ok(None) => {}
                Err(e) if e.is_catastrophic() => {
                    error!("[Balance] Aborting at user {}: {}", account.user_id, e);
                    return Err(e);
                }
                Err(e) => {
                    report.failed += 1;
                    warn!("[Balance] User {} game {} failed: {}", account.user_id, game_id, e);
                }
            }
        }

        info!(
            "[Balance] Checked {} accounts, {} postings, {} failed",
            report.checked, report.postings, report.failed
        );
        Ok(report)
    }

    async fn reconcile_running_balance(
        &self,
        account: &ExternalAccount,
        game_id: &str,
    ) -> SettlementResult<Option<Decimal>> {
        let user_id = account.user_id;
        let transfers = self.tracked(self.provider.list_transactions(account, game_id)).await?;
        let balance = self.tracked(self.provider.get_balance(account, game_id)).await?;

        let mut fresh = Vec::new();
        for transfer in transfers {
            let key = marker_key(MarkerStage::Consumed, user_id, game_id, &transfer.transfer_id);
            if !self.markers.exists(&key).await? {
                fresh.push((transfer, key));
            }
        }

        let label = format!("balance {}:{}", game_id, user_id);
        let transfers: Vec<ExternalTransfer> = fresh.iter().map(|(t, _)| t.clone()).collect();
        let net = retry(&self.ledger_retry, &label, || {
            self.apply_balance(user_id, game_id, balance, &transfers)
        })
        .await?;

        for (_, key) in &fresh {
            self.markers.set(key, self.marker_ttl).await?;
        }

        Ok((!net.is_zero()).then_some(net))
    }

    /// Store new transfers, post the balance movement and move the checkpoint
    async fn apply_balance(
        &self,
        user_id: i64,
        game_id: &str,
        balance: Decimal,
        fresh: &[ExternalTransfer],
    ) -> SettlementResult<Decimal> {
        let now = Utc::now();
        let mut tx = self.db.begin().await?;
        for transfer in fresh {
            db::store_transfer(&mut *tx, user_id, game_id, transfer).await?;
        }

        let pending = db::unprocessed_transfers(&mut *tx, user_id, game_id).await?;
        let checkpoint = db::load_checkpoint(&mut *tx, user_id, game_id).await?;
        let (deposits, withdrawals) = pending.iter().fold(
            (Decimal::ZERO, Decimal::ZERO),
            |(dep, wd), t| match t.direction {
                TransferDirection::Deposit => (dep + t.amount, wd),
                TransferDirection::Withdrawal => (dep, wd + t.amount),
            },
        );
        let net = money(balance - checkpoint - (deposits - withdrawals));

        if !net.is_zero() {
            let chain = self.cascade.resolver().chain_for(&mut *tx, user_id).await?;
            let request = CommissionRequest {
                bettor_id: user_id,
                source_id: format!("rb:{}:{}:{}", game_id, user_id, now.timestamp_millis()),
                day: self.day_of(now),
                stake: Decimal::ZERO,
                net_result: net,
                settlement_flow: Decimal::ZERO,
                outcome: outcome_of(net),
                flows: FlowFlags { gross: false, actual: false },
                wallet_credit: None,
                policy: CascadePolicy::PlatformOnly,
            };
            self.cascade.post(&mut *tx, &chain, &request, CascadeMode::BestEffort).await?;
        }

        let ids: Vec<String> = pending.iter().map(|t| t.transfer_id.clone()).collect();
        db::mark_transfers_processed(&mut *tx, game_id, &ids).await?;
        db::store_checkpoint(&mut *tx, user_id, game_id, balance).await?;
        tx.commit().await?;
        Ok(net)
    }

    // ==================== SCHEDULING ====================

    /// Start the interval cycle, the running-balance cycle and the daily sweep
    pub fn spawn(self: Arc<Self>, shutdown_rx: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let interval = self.config.interval;
        let sweep_hour = self.config.sweep_hour;
        let tz = self.timezone;

        let svc = self.clone();
        let cycle = RecurringTask::every("reconcile", interval).spawn(shutdown_rx.clone(), move || {
            let svc = svc.clone();
            async move {
                if let Err(e) = svc.run_cycle().await {
                    error!("[Reconcile] Cycle failed: {}", e);
                }
                info!("[Reconcile] Metrics: {:?}", svc.metrics.snapshot());
            }
        });

        let svc = self.clone();
        let balance = RecurringTask::every("running-balance", interval).spawn(shutdown_rx.clone(), move || {
            let svc = svc.clone();
            async move {
                if let Err(e) = svc.run_running_balance_cycle().await {
                    error!("[Balance] Cycle failed: {}", e);
                }
            }
        });

        let svc = self;
        let sweep = RecurringTask::daily_at("unsettled-sweep", sweep_hour, tz).spawn(shutdown_rx, move || {
            let svc = svc.clone();
            async move {
                if let Err(e) = svc.run_unsettled_sweep().await {
                    error!("[Sweep] Sweep failed: {}", e);
                }
            }
        });

        vec![cycle, balance, sweep]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewUser;
    use crate::ledger::HierarchyResolver;
    use crate::services::markers::{MarkerError, MemoryMarkerStore};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedProvider {
        games: Vec<GameInfo>,
        bets: Mutex<HashMap<i64, Vec<ExternalBet>>>,
        draws: Mutex<HashMap<String, Vec<DrawResult>>>,
        balances: Mutex<HashMap<(i64, String), Decimal>>,
        transfers: Mutex<HashMap<(i64, String), Vec<ExternalTransfer>>>,
        failing_users: HashSet<i64>,
    }

    #[async_trait]
    impl GameProvider for ScriptedProvider {
        async fn list_games(&self) -> Result<Vec<GameInfo>, ProviderError> {
            Ok(self.games.clone())
        }

        async fn list_bets(
            &self,
            account: &ExternalAccount,
            _from: DateTime<Utc>,
            _to: DateTime<Utc>,
        ) -> Result<Vec<ExternalBet>, ProviderError> {
            if self.failing_users.contains(&account.user_id) {
                return Err(ProviderError::NetworkError("Request timed out".to_string()));
            }
            Ok(self.bets.lock().unwrap().get(&account.user_id).cloned().unwrap_or_default())
        }

        async fn query_draw_results(
            &self,
            game_id: &str,
            _order_ids: &[String],
            _from: DateTime<Utc>,
            _to: DateTime<Utc>,
        ) -> Result<Vec<DrawResult>, ProviderError> {
            Ok(self.draws.lock().unwrap().get(game_id).cloned().unwrap_or_default())
        }

        async fn get_balance(&self, account: &ExternalAccount, game_id: &str) -> Result<Decimal, ProviderError> {
            let key = (account.user_id, game_id.to_string());
            Ok(self.balances.lock().unwrap().get(&key).copied().unwrap_or_default())
        }

        async fn list_transactions(
            &self,
            account: &ExternalAccount,
            game_id: &str,
        ) -> Result<Vec<ExternalTransfer>, ProviderError> {
            let key = (account.user_id, game_id.to_string());
            Ok(self.transfers.lock().unwrap().get(&key).cloned().unwrap_or_default())
        }
    }

    struct BrokenMarkers;

    #[async_trait]
    impl MarkerStore for BrokenMarkers {
        async fn exists(&self, _key: &str) -> Result<bool, MarkerError> {
            Err(MarkerError::Unavailable("connection refused".to_string()))
        }
        async fn set(&self, _key: &str, _ttl: Duration) -> Result<(), MarkerError> {
            Err(MarkerError::Unavailable("connection refused".to_string()))
        }
        async fn purge_expired(&self) -> Result<u64, MarkerError> {
            Ok(0)
        }
    }

    fn game(id: &str, kind: GameKind) -> GameInfo {
        GameInfo {
            game_id: id.to_string(),
            name: id.to_uppercase(),
            kind,
            active: true,
        }
    }

    fn bet(user_id: i64, game_id: &str, order_id: &str, stake: Decimal, settlement: Option<Decimal>) -> ExternalBet {
        ExternalBet {
            user_id,
            game_id: game_id.to_string(),
            order_id: order_id.to_string(),
            stake,
            settlement_amount: settlement,
            placed_at: Utc::now(),
            settled_at: settlement.map(|_| Utc::now()),
        }
    }

    async fn seed_users(db: &Database) {
        for (id, parent, path, ratio, account) in [
            (10, Some(1), "1", dec!(0.20), None),
            (100, Some(10), "1,10", dec!(0), Some("p100")),
            (101, Some(10), "1,10", dec!(0), Some("p101")),
        ] {
            db.upsert_user(&NewUser {
                id,
                parent_id: parent,
                ancestors: Some(path.to_string()),
                commission_ratio: ratio,
                link_identifier: Some(format!("L{}", id)),
                external_account: account.map(str::to_string),
            })
            .await
            .unwrap();
        }
    }

    async fn service(provider: ScriptedProvider, markers: Arc<dyn MarkerStore>) -> (Database, ReconciliationService) {
        let db = Database::in_memory().await.unwrap();
        seed_users(&db).await;
        let resolver = HierarchyResolver::new(db.pool().clone(), Duration::from_secs(60), 1);
        let cascade = CommissionCascade::new(db.pool().clone(), resolver);
        let config = ReconcileConfig {
            always_track_game_id: Some("fish".to_string()),
            ..Default::default()
        };
        let svc = ReconciliationService::new(
            db.clone(),
            Arc::new(provider),
            markers,
            cascade,
            config,
            Duration::from_secs(3600),
            chrono_tz::UTC,
            SettlementMetrics::new(),
        );
        (db, svc)
    }

    fn today() -> NaiveDate {
        Utc::now().date_naive()
    }

    #[tokio::test]
    async fn test_cycle_posts_settled_and_skips_marked() {
        let provider = ScriptedProvider {
            games: vec![game("slots", GameKind::Standard)],
            ..Default::default()
        };
        provider.bets.lock().unwrap().insert(
            100,
            vec![
                bet(100, "slots", "A1", dec!(50), Some(dec!(20))),
                bet(100, "slots", "A2", dec!(10), None),
                bet(100, "unknown-game", "A3", dec!(10), Some(dec!(0))),
            ],
        );

        let (db, svc) = service(provider, Arc::new(MemoryMarkerStore::new())).await;
        let report = svc.run_cycle().await.unwrap();
        assert_eq!((report.stored, report.posted, report.skipped), (2, 1, 0));

        // Lost 30: agent 10 takes 20%, the platform the rest
        let stats = db.daily_statistics(100, today()).await.unwrap().unwrap();
        assert_eq!(stats.result_amount, dec!(-30));
        assert_eq!(stats.gross_flow, dec!(50));
        assert_eq!(stats.settlement_flow, dec!(20));
        assert_eq!(db.payout_total(10, today()).await.unwrap(), dec!(6));
        assert_eq!(db.payout_total(1, today()).await.unwrap(), dec!(24));

        let records = db.payout_record_count().await.unwrap();
        let again = svc.run_cycle().await.unwrap();
        assert_eq!((again.stored, again.skipped), (0, 2));
        assert_eq!(db.payout_record_count().await.unwrap(), records);
        assert_eq!(db.daily_statistics(100, today()).await.unwrap().unwrap(), stats);
    }

    #[tokio::test]
    async fn test_lost_marker_does_not_double_post() {
        let provider = ScriptedProvider {
            games: vec![game("slots", GameKind::Standard)],
            ..Default::default()
        };
        provider
            .bets
            .lock()
            .unwrap()
            .insert(100, vec![bet(100, "slots", "B1", dec!(40), Some(dec!(100)))]);

        let (db, svc) = service(provider, Arc::new(MemoryMarkerStore::new())).await;
        svc.run_cycle().await.unwrap();
        let records = db.payout_record_count().await.unwrap();

        // Fresh marker store: the stored row alone must stop a second posting
        let svc = ReconciliationService {
            markers: Arc::new(MemoryMarkerStore::new()),
            ..svc
        };
        let report = svc.run_cycle().await.unwrap();
        assert_eq!(report.posted, 0);
        assert_eq!(db.payout_record_count().await.unwrap(), records);
    }

    #[tokio::test]
    async fn test_failing_user_is_isolated() {
        let mut provider = ScriptedProvider {
            games: vec![game("slots", GameKind::Standard)],
            ..Default::default()
        };
        provider.failing_users.insert(100);
        provider
            .bets
            .lock()
            .unwrap()
            .insert(101, vec![bet(101, "slots", "C1", dec!(10), Some(dec!(25)))]);

        let (db, svc) = service(provider, Arc::new(MemoryMarkerStore::new())).await;
        let report = svc.run_cycle().await.unwrap();
        assert_eq!(report.users, 2);
        assert_eq!(report.failed_users, 1);
        assert_eq!(report.posted, 1);
        assert_eq!(db.payout_total(101, today()).await.unwrap(), dec!(15));
        assert_eq!(svc.metrics().snapshot().users_failed, 1);
    }

    #[tokio::test]
    async fn test_marker_outage_aborts_cycle() {
        let provider = ScriptedProvider {
            games: vec![game("slots", GameKind::Standard)],
            ..Default::default()
        };
        provider
            .bets
            .lock()
            .unwrap()
            .insert(100, vec![bet(100, "slots", "D1", dec!(10), Some(dec!(0)))]);

        let (db, svc) = service(provider, Arc::new(BrokenMarkers)).await;
        let err = svc.run_cycle().await.unwrap_err();
        assert!(err.is_catastrophic());
        assert_eq!(db.payout_record_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_actual_flow_rules() {
        let provider = ScriptedProvider {
            games: vec![game("slots", GameKind::Standard), game("fish", GameKind::Standard)],
            ..Default::default()
        };
        provider.bets.lock().unwrap().insert(
            100,
            vec![
                bet(100, "slots", "E1", dec!(10), Some(dec!(0))),
                bet(100, "fish", "E2", dec!(7), Some(dec!(0))),
                bet(100, "slots", "E3", dec!(5), Some(dec!(9))),
            ],
        );

        let (db, svc) = service(provider, Arc::new(MemoryMarkerStore::new())).await;
        svc.run_cycle().await.unwrap();

        let stats = db.daily_statistics(100, today()).await.unwrap().unwrap();
        assert_eq!(stats.gross_flow, dec!(22));
        // Zero settlement only counts as real money on the always-track game
        assert_eq!(stats.actual_flow, dec!(12));
    }

    #[tokio::test]
    async fn test_sweep_settles_stored_records_once() {
        let provider = ScriptedProvider {
            games: vec![game("slots", GameKind::Standard)],
            ..Default::default()
        };
        provider.bets.lock().unwrap().insert(
            100,
            vec![bet(100, "slots", "F1", dec!(30), None), bet(100, "slots", "F2", dec!(30), None)],
        );
        provider.draws.lock().unwrap().insert(
            "slots".to_string(),
            vec![DrawResult {
                order_id: "F1".to_string(),
                settlement_amount: dec!(80),
                settled_at: None,
            }],
        );

        let (db, svc) = service(provider, Arc::new(MemoryMarkerStore::new())).await;
        svc.run_cycle().await.unwrap();
        assert_eq!(db.payout_record_count().await.unwrap(), 0);

        let sweep = svc.run_unsettled_sweep().await.unwrap();
        assert_eq!((sweep.pending, sweep.resolved, sweep.posted), (2, 1, 1));
        assert_eq!(db.payout_total(100, today()).await.unwrap(), dec!(50));
        assert_eq!(db.payout_total(10, today()).await.unwrap(), dec!(-10));

        let again = svc.run_unsettled_sweep().await.unwrap();
        assert_eq!((again.pending, again.posted), (1, 0));
        assert_eq!(db.payout_total(100, today()).await.unwrap(), dec!(50));
    }

    #[tokio::test]
    async fn test_running_balance_posts_platform_only() {
        let provider = ScriptedProvider {
            games: vec![game("vboss", GameKind::RunningBalance)],
            ..Default::default()
        };
        let key = (100, "vboss".to_string());
        provider.balances.lock().unwrap().insert(key.clone(), dec!(50));
        provider.transfers.lock().unwrap().insert(
            key.clone(),
            vec![
                ExternalTransfer {
                    transfer_id: "T1".to_string(),
                    amount: dec!(100),
                    direction: TransferDirection::Deposit,
                    created_at: Utc::now(),
                },
                ExternalTransfer {
                    transfer_id: "T2".to_string(),
                    amount: dec!(30),
                    direction: TransferDirection::Withdrawal,
                    created_at: Utc::now(),
                },
            ],
        );

        let (db, svc) = service(provider, Arc::new(MemoryMarkerStore::new())).await;
        let report = svc.run_running_balance_cycle().await.unwrap();
        assert_eq!(report.postings, 1);

        // 50 - 0 - (100 - 30) = -20, all of it to the platform
        assert_eq!(db.payout_total(100, today()).await.unwrap(), dec!(-20));
        assert_eq!(db.payout_total(1, today()).await.unwrap(), dec!(20));
        assert!(db.daily_statistics(10, today()).await.unwrap().is_none());

        let again = svc.run_running_balance_cycle().await.unwrap();
        assert_eq!((again.checked, again.postings), (2, 0));
        assert_eq!(db.payout_total(1, today()).await.unwrap(), dec!(20));
    }
}
