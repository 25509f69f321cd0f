//! SQLite persistence for contests, wagers, hierarchy and external records
//!
//! Money columns hold integer cents so that ledger upserts can add deltas in a
//! single statement. Ratios, odds and handicaps are decimal text.

use crate::error::{SettlementError, SettlementResult};
use crate::types::{
    from_cents, to_cents, ChainNode, Contest, ContestResult, ContestStatus, DailyStatistics,
    ExternalAccount, ExternalBet, ExternalTransfer, LegScore, Outcome, PayoutRecord, Pick,
    TeamSide, TransferDirection, Wager, WagerKind,
};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// How long a writer waits for the SQLite lock before failing with SQLITE_BUSY
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Database connection pool
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

/// User row used to seed or update the hierarchy
#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub id: i64,
    pub parent_id: Option<i64>,
    pub ancestors: Option<String>,
    pub commission_ratio: Decimal,
    pub link_identifier: Option<String>,
    pub external_account: Option<String>,
}

/// Wager as placed, before settlement
#[derive(Debug, Clone)]
pub struct NewWager {
    pub contest_id: i64,
    pub user_id: i64,
    pub kind: WagerKind,
    pub pick: Pick,
    pub stake: Decimal,
    pub odds: Decimal,
    pub tax_rate: Decimal,
}

impl Database {
    /// Create a new database connection
    pub async fn new(path: &str) -> SettlementResult<Self> {
        let options = SqliteConnectOptions::from_str(path)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.initialize().await?;

        Ok(db)
    }

    /// Private in-memory database. A single long-lived connection keeps the
    /// schema alive for the lifetime of the pool.
    pub async fn in_memory() -> SettlementResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.initialize().await?;

        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Open a write transaction. `BEGIN IMMEDIATE` takes the write lock up
    /// front, so a unit of work that reads before it writes waits behind other
    /// writers instead of failing on upgrade with a stale snapshot.
    pub async fn begin(&self) -> SettlementResult<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }

    /// Run database migrations
    async fn run_migrations(&self) -> SettlementResult<()> {
        let table_info: Vec<(i64, String, String, i64, Option<String>, i64)> =
            sqlx::query_as("PRAGMA table_info(users)")
                .fetch_all(&self.pool)
                .await
                .unwrap_or_default();

        // Older databases predate external game accounts
        let has_external_account = table_info
            .iter()
            .any(|(_, name, _, _, _, _)| name == "external_account");
        if !table_info.is_empty() && !has_external_account {
            info!("Migrating users table: adding external_account column");
            sqlx::query("ALTER TABLE users ADD COLUMN external_account TEXT")
                .execute(&self.pool)
                .await?;
        }

        let has_active = table_info.iter().any(|(_, name, _, _, _, _)| name == "active");
        if !table_info.is_empty() && !has_active {
            info!("Migrating users table: adding active column");
            sqlx::query("ALTER TABLE users ADD COLUMN active INTEGER NOT NULL DEFAULT 1")
                .execute(&self.pool)
                .await?;
        }

        Ok(())
    }

    /// Initialize database schema
    async fn initialize(&self) -> SettlementResult<()> {
        self.run_migrations().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                parent_id INTEGER,
                ancestors TEXT,
                commission_ratio TEXT NOT NULL DEFAULT '0',
                link_identifier TEXT,
                external_account TEXT,
                active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS wallets (
                user_id INTEGER PRIMARY KEY,
                balance INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS contests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                tax_rate TEXT NOT NULL DEFAULT '0',
                status TEXT NOT NULL DEFAULT 'pending',
                winner TEXT,
                created_at TEXT NOT NULL,
                settled_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS contest_legs (
                contest_id INTEGER NOT NULL,
                leg_no INTEGER NOT NULL,
                home_score INTEGER NOT NULL DEFAULT 0,
                away_score INTEGER NOT NULL DEFAULT 0,
                home_handicap TEXT NOT NULL DEFAULT '0',
                PRIMARY KEY (contest_id, leg_no)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS wagers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                contest_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                kind TEXT NOT NULL,
                pick TEXT NOT NULL,
                stake INTEGER NOT NULL,
                odds TEXT NOT NULL,
                handicap TEXT,
                line TEXT,
                leg_no INTEGER,
                base_score TEXT,
                tax_rate TEXT NOT NULL DEFAULT '0',
                resolution TEXT,
                net_result INTEGER,
                payout_amount INTEGER,
                placed_at TEXT NOT NULL,
                settled_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS payout_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_id TEXT NOT NULL,
                recipient_id INTEGER NOT NULL,
                bettor_id INTEGER NOT NULL,
                level INTEGER NOT NULL,
                amount INTEGER NOT NULL,
                ratio TEXT NOT NULL,
                ancestors TEXT NOT NULL,
                link_identifier TEXT,
                day TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS daily_statistics (
                user_id INTEGER NOT NULL,
                day TEXT NOT NULL,
                parent_user_id INTEGER,
                ancestors TEXT NOT NULL,
                link_identifier TEXT,
                gross_flow INTEGER NOT NULL DEFAULT 0,
                actual_flow INTEGER NOT NULL DEFAULT 0,
                settlement_flow INTEGER NOT NULL DEFAULT 0,
                result_amount INTEGER NOT NULL DEFAULT 0,
                lower_level_flow INTEGER NOT NULL DEFAULT 0,
                lower_level_actual_flow INTEGER NOT NULL DEFAULT 0,
                lower_level_settlement_flow INTEGER NOT NULL DEFAULT 0,
                parent_divided_into INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (user_id, day)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS external_bets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                game_id TEXT NOT NULL,
                order_id TEXT NOT NULL,
                stake INTEGER NOT NULL,
                settlement_amount INTEGER,
                placed_at TEXT NOT NULL,
                settled_at TEXT,
                created_at TEXT NOT NULL,
                UNIQUE (user_id, game_id, order_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS external_transfers (
                game_id TEXT NOT NULL,
                transfer_id TEXT NOT NULL,
                user_id INTEGER NOT NULL,
                amount INTEGER NOT NULL,
                direction TEXT NOT NULL,
                processed INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                PRIMARY KEY (game_id, transfer_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS balance_checkpoints (
                user_id INTEGER NOT NULL,
                game_id TEXT NOT NULL,
                balance INTEGER NOT NULL,
                checked_at TEXT NOT NULL,
                PRIMARY KEY (user_id, game_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settlement_markers (
                key TEXT PRIMARY KEY,
                expires_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Create indexes for fast lookups
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_wagers_contest ON wagers(contest_id, resolution)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_payout_records_source ON payout_records(source_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_payout_records_recipient_day ON payout_records(recipient_id, day)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_external_bets_unsettled ON external_bets(settlement_amount, placed_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_external_transfers_user ON external_transfers(user_id, game_id, processed)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_settlement_markers_expiry ON settlement_markers(expires_at)")
            .execute(&self.pool)
            .await?;

        info!("Database initialized");
        Ok(())
    }

    // ==================== HIERARCHY ====================

    /// Insert or replace a user's hierarchy attributes
    pub async fn upsert_user(&self, user: &NewUser) -> SettlementResult<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO users (id, parent_id, ancestors, commission_ratio, link_identifier, external_account, active, created_at)
            VALUES (?, ?, ?, ?, ?, ?, 1, ?)
            ON CONFLICT(id) DO UPDATE SET
                parent_id = excluded.parent_id,
                ancestors = excluded.ancestors,
                commission_ratio = excluded.commission_ratio,
                link_identifier = excluded.link_identifier,
                external_account = excluded.external_account
            "#,
        )
        .bind(user.id)
        .bind(user.parent_id)
        .bind(&user.ancestors)
        .bind(user.commission_ratio.to_string())
        .bind(&user.link_identifier)
        .bind(&user.external_account)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_user_active(&self, user_id: i64, active: bool) -> SettlementResult<()> {
        sqlx::query("UPDATE users SET active = ? WHERE id = ?")
            .bind(active)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Users with an external game account that reconciliation should visit
    pub async fn list_external_accounts(&self) -> SettlementResult<Vec<ExternalAccount>> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT id, external_account FROM users WHERE active = 1 AND external_account IS NOT NULL AND external_account != '' ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(user_id, account)| ExternalAccount { user_id, account })
            .collect())
    }

    // ==================== CONTESTS & WAGERS ====================

    pub async fn create_contest(&self, title: &str, tax_rate: Decimal) -> SettlementResult<i64> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "INSERT INTO contests (title, tax_rate, status, created_at) VALUES (?, ?, 'pending', ?)",
        )
        .bind(title)
        .bind(tax_rate.to_string())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn set_contest_status(&self, contest_id: i64, status: ContestStatus) -> SettlementResult<()> {
        sqlx::query("UPDATE contests SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(contest_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record (or overwrite) the score of one leg
    pub async fn set_leg_score(&self, contest_id: i64, leg: &LegScore) -> SettlementResult<()> {
        sqlx::query(
            r#"
            INSERT INTO contest_legs (contest_id, leg_no, home_score, away_score, home_handicap)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(contest_id, leg_no) DO UPDATE SET
                home_score = excluded.home_score,
                away_score = excluded.away_score,
                home_handicap = excluded.home_handicap
            "#,
        )
        .bind(contest_id)
        .bind(leg.leg_no as i64)
        .bind(leg.home)
        .bind(leg.away)
        .bind(leg.home_handicap.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_contest(&self, contest_id: i64) -> SettlementResult<Option<Contest>> {
        let mut conn = self.pool.acquire().await?;
        load_contest(&mut conn, contest_id).await
    }

    pub async fn create_wager(&self, wager: &NewWager) -> SettlementResult<i64> {
        let now = Utc::now().to_rfc3339();
        let (handicap, line, leg_no, base_score) = kind_columns(&wager.kind);

        let result = sqlx::query(
            r#"
            INSERT INTO wagers (contest_id, user_id, kind, pick, stake, odds, handicap, line, leg_no, base_score, tax_rate, placed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(wager.contest_id)
        .bind(wager.user_id)
        .bind(wager.kind.code())
        .bind(wager.pick.as_str())
        .bind(to_cents(wager.stake))
        .bind(wager.odds.to_string())
        .bind(handicap.map(|d| d.to_string()))
        .bind(line.map(|d| d.to_string()))
        .bind(leg_no.map(|n| n as i64))
        .bind(base_score.map(|d| d.to_string()))
        .bind(wager.tax_rate.to_string())
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get_wager(&self, wager_id: i64) -> SettlementResult<Option<Wager>> {
        let row = sqlx::query("SELECT * FROM wagers WHERE id = ?")
            .bind(wager_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_wager).transpose()
    }

    // ==================== LEDGER READS ====================

    pub async fn daily_statistics(&self, user_id: i64, day: NaiveDate) -> SettlementResult<Option<DailyStatistics>> {
        let row = sqlx::query("SELECT * FROM daily_statistics WHERE user_id = ? AND day = ?")
            .bind(user_id)
            .bind(day_key(day))
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| DailyStatistics {
            user_id: r.get("user_id"),
            day: r.get("day"),
            gross_flow: from_cents(r.get("gross_flow")),
            actual_flow: from_cents(r.get("actual_flow")),
            settlement_flow: from_cents(r.get("settlement_flow")),
            result_amount: from_cents(r.get("result_amount")),
            lower_level_flow: from_cents(r.get("lower_level_flow")),
            lower_level_actual_flow: from_cents(r.get("lower_level_actual_flow")),
            lower_level_settlement_flow: from_cents(r.get("lower_level_settlement_flow")),
            parent_divided_into: from_cents(r.get("parent_divided_into")),
        }))
    }

    /// Sum of payout records credited to a user on a day
    pub async fn payout_total(&self, user_id: i64, day: NaiveDate) -> SettlementResult<Decimal> {
        let (total,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(amount), 0) FROM payout_records WHERE recipient_id = ? AND day = ?",
        )
        .bind(user_id)
        .bind(day_key(day))
        .fetch_one(&self.pool)
        .await?;
        Ok(from_cents(total))
    }

    pub async fn payout_records_for_source(&self, source_id: &str) -> SettlementResult<Vec<PayoutRecord>> {
        let rows = sqlx::query("SELECT * FROM payout_records WHERE source_id = ? ORDER BY level, id")
            .bind(source_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_payout_record).collect()
    }

    pub async fn payout_record_count(&self) -> SettlementResult<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM payout_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn wallet_balance(&self, user_id: i64) -> SettlementResult<Decimal> {
        let balance: Option<(i64,)> = sqlx::query_as("SELECT balance FROM wallets WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(balance.map(|(cents,)| from_cents(cents)).unwrap_or_default())
    }

    // ==================== EXTERNAL RECORDS ====================

    /// Stored records still waiting for a settlement amount
    pub async fn unsettled_external_bets(&self, since: DateTime<Utc>) -> SettlementResult<Vec<ExternalBet>> {
        let rows = sqlx::query(
            "SELECT * FROM external_bets WHERE settlement_amount IS NULL AND placed_at >= ? ORDER BY id",
        )
        .bind(since.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_external_bet).collect()
    }

    pub async fn get_external_bet(
        &self,
        user_id: i64,
        game_id: &str,
        order_id: &str,
    ) -> SettlementResult<Option<ExternalBet>> {
        let row = sqlx::query("SELECT * FROM external_bets WHERE user_id = ? AND game_id = ? AND order_id = ?")
            .bind(user_id)
            .bind(game_id)
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_external_bet).transpose()
    }
}

// ==================== TRANSACTION-SCOPED QUERIES ====================
//
// These take a connection so callers can run them inside their own
// transaction (`&mut *tx`).

pub fn day_key(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

fn parse_decimal(field: &'static str, value: &str) -> SettlementResult<Decimal> {
    Decimal::from_str(value).map_err(|_| SettlementError::InvalidValue {
        field,
        value: value.to_string(),
    })
}

fn parse_optional_decimal(field: &'static str, value: Option<String>) -> SettlementResult<Option<Decimal>> {
    value.map(|v| parse_decimal(field, &v)).transpose()
}

fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

fn kind_columns(kind: &WagerKind) -> (Option<Decimal>, Option<Decimal>, Option<u32>, Option<Decimal>) {
    match kind {
        WagerKind::WinLoss | WagerKind::Unknown(_) => (None, None, None, None),
        WagerKind::Handicap { handicap } | WagerKind::LegCountHandicap { handicap } => {
            (Some(*handicap), None, None, None)
        }
        WagerKind::TotalLine { line } => (None, Some(*line), None, None),
        WagerKind::SingleLegHandicap { leg_no, handicap } => (Some(*handicap), None, *leg_no, None),
        WagerKind::OddsPurchase { handicap, base_score } => (Some(*handicap), None, None, Some(*base_score)),
    }
}

fn row_to_wager(row: &SqliteRow) -> SettlementResult<Wager> {
    let id: i64 = row.get("id");
    let kind_code: String = row.get("kind");
    let pick_code: String = row.get("pick");
    let leg_no: Option<i64> = row.get("leg_no");

    let kind = WagerKind::from_parts(
        id,
        &kind_code,
        parse_optional_decimal("handicap", row.get("handicap"))?,
        parse_optional_decimal("line", row.get("line"))?,
        leg_no.and_then(|n| u32::try_from(n).ok()),
        parse_optional_decimal("base_score", row.get("base_score"))?,
    )?;

    let pick = Pick::from_code(&pick_code).ok_or(SettlementError::InvalidValue {
        field: "pick",
        value: pick_code.clone(),
    })?;

    let odds: String = row.get("odds");
    let tax_rate: String = row.get("tax_rate");
    let resolution: Option<String> = row.get("resolution");
    let net_result: Option<i64> = row.get("net_result");
    let payout_amount: Option<i64> = row.get("payout_amount");

    Ok(Wager {
        id,
        contest_id: row.get("contest_id"),
        user_id: row.get("user_id"),
        kind,
        pick,
        stake: from_cents(row.get("stake")),
        odds: parse_decimal("odds", &odds)?,
        tax_rate: parse_decimal("tax_rate", &tax_rate)?,
        resolution: resolution.as_deref().and_then(Outcome::from_code),
        net_result: net_result.map(from_cents),
        payout_amount: payout_amount.map(from_cents),
    })
}

fn row_to_payout_record(row: &SqliteRow) -> SettlementResult<PayoutRecord> {
    let ratio: String = row.get("ratio");
    let day: String = row.get("day");
    let created_at: String = row.get("created_at");

    Ok(PayoutRecord {
        id: row.get("id"),
        source_id: row.get("source_id"),
        recipient_id: row.get("recipient_id"),
        bettor_id: row.get("bettor_id"),
        level: row.get("level"),
        amount: from_cents(row.get("amount")),
        ratio: parse_decimal("ratio", &ratio)?,
        ancestors: row.get("ancestors"),
        link_identifier: row.get("link_identifier"),
        day: NaiveDate::parse_from_str(&day, "%Y-%m-%d").map_err(|_| SettlementError::InvalidValue {
            field: "day",
            value: day.clone(),
        })?,
        created_at: parse_time(&created_at).unwrap_or_else(Utc::now),
    })
}

fn row_to_external_bet(row: &SqliteRow) -> SettlementResult<ExternalBet> {
    let placed_at: String = row.get("placed_at");
    let settled_at: Option<String> = row.get("settled_at");
    let settlement_amount: Option<i64> = row.get("settlement_amount");

    Ok(ExternalBet {
        user_id: row.get("user_id"),
        game_id: row.get("game_id"),
        order_id: row.get("order_id"),
        stake: from_cents(row.get("stake")),
        settlement_amount: settlement_amount.map(from_cents),
        placed_at: parse_time(&placed_at).ok_or(SettlementError::InvalidValue {
            field: "placed_at",
            value: placed_at.clone(),
        })?,
        settled_at: settled_at.as_deref().and_then(parse_time),
    })
}

fn row_to_node(row: &SqliteRow) -> SettlementResult<ChainNode> {
    let ratio: String = row.get("commission_ratio");
    Ok(ChainNode {
        user_id: row.get("id"),
        parent_id: row.get("parent_id"),
        ancestors: row.get("ancestors"),
        commission_ratio: parse_decimal("commission_ratio", &ratio)?,
        link_identifier: row.get("link_identifier"),
    })
}

pub async fn load_user_node(conn: &mut SqliteConnection, user_id: i64) -> SettlementResult<Option<ChainNode>> {
    let row = sqlx::query(
        "SELECT id, parent_id, ancestors, commission_ratio, link_identifier FROM users WHERE id = ?",
    )
    .bind(user_id)
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(row_to_node).transpose()
}

/// Load several hierarchy nodes in one round trip (order not guaranteed)
pub async fn load_user_nodes(conn: &mut SqliteConnection, user_ids: &[i64]) -> SettlementResult<Vec<ChainNode>> {
    if user_ids.is_empty() {
        return Ok(Vec::new());
    }

    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT id, parent_id, ancestors, commission_ratio, link_identifier FROM users WHERE id IN (",
    );
    let mut separated = builder.separated(", ");
    for id in user_ids {
        separated.push_bind(*id);
    }
    separated.push_unseparated(")");

    let rows = builder.build().fetch_all(&mut *conn).await?;
    rows.iter().map(row_to_node).collect()
}

pub async fn load_contest(conn: &mut SqliteConnection, contest_id: i64) -> SettlementResult<Option<Contest>> {
    let row = sqlx::query("SELECT * FROM contests WHERE id = ?")
        .bind(contest_id)
        .fetch_optional(&mut *conn)
        .await?;

    match row {
        Some(r) => {
            let tax_rate: String = r.get("tax_rate");
            let status: String = r.get("status");
            let winner: Option<String> = r.get("winner");
            let settled_at: Option<String> = r.get("settled_at");

            Ok(Some(Contest {
                id: r.get("id"),
                title: r.get("title"),
                tax_rate: parse_decimal("tax_rate", &tax_rate)?,
                status: ContestStatus::from_code(&status),
                winner: winner.as_deref().and_then(TeamSide::from_code),
                settled_at: settled_at.as_deref().and_then(parse_time),
            }))
        }
        None => Ok(None),
    }
}

pub async fn load_contest_result(conn: &mut SqliteConnection, contest_id: i64) -> SettlementResult<ContestResult> {
    let rows = sqlx::query(
        "SELECT leg_no, home_score, away_score, home_handicap FROM contest_legs WHERE contest_id = ? ORDER BY leg_no",
    )
    .bind(contest_id)
    .fetch_all(&mut *conn)
    .await?;

    let legs = rows
        .iter()
        .map(|r| {
            let handicap: String = r.get("home_handicap");
            let leg_no: i64 = r.get("leg_no");
            Ok(LegScore {
                leg_no: u32::try_from(leg_no).map_err(|_| SettlementError::InvalidValue {
                    field: "leg_no",
                    value: leg_no.to_string(),
                })?,
                home: r.get("home_score"),
                away: r.get("away_score"),
                home_handicap: parse_decimal("home_handicap", &handicap)?,
            })
        })
        .collect::<SettlementResult<Vec<_>>>()?;

    Ok(ContestResult::new(legs))
}

pub async fn load_pending_wagers(conn: &mut SqliteConnection, contest_id: i64) -> SettlementResult<Vec<Wager>> {
    let rows = sqlx::query("SELECT * FROM wagers WHERE contest_id = ? AND resolution IS NULL ORDER BY id")
        .bind(contest_id)
        .fetch_all(&mut *conn)
        .await?;

    rows.iter().map(row_to_wager).collect()
}

/// Write the result fields of a wager. Only succeeds once per wager.
pub async fn record_wager_result(
    conn: &mut SqliteConnection,
    wager_id: i64,
    outcome: Outcome,
    net_result: Decimal,
    payout_amount: Decimal,
) -> SettlementResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE wagers SET resolution = ?, net_result = ?, payout_amount = ?, settled_at = ?
        WHERE id = ? AND resolution IS NULL
        "#,
    )
    .bind(outcome.as_str())
    .bind(to_cents(net_result))
    .bind(to_cents(payout_amount))
    .bind(Utc::now().to_rfc3339())
    .bind(wager_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

/// Move a contest to `completed`. Touches nothing if it already is.
pub async fn complete_contest(
    conn: &mut SqliteConnection,
    contest_id: i64,
    winner: Option<TeamSide>,
) -> SettlementResult<u64> {
    let result = sqlx::query(
        "UPDATE contests SET status = 'completed', winner = ?, settled_at = ? WHERE id = ? AND status != 'completed'",
    )
    .bind(winner.map(|w| w.as_str()))
    .bind(Utc::now().to_rfc3339())
    .bind(contest_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

/// What storing an external bet changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredBet {
    /// First time this order was seen
    Inserted,
    /// Known order that just received its settlement amount
    NewlySettled,
    /// Nothing changed
    Unchanged,
}

impl StoredBet {
    /// Whether the bet's settlement should now be posted
    pub fn needs_posting(&self, bet: &ExternalBet) -> bool {
        match self {
            StoredBet::Inserted => bet.settlement_amount.is_some(),
            StoredBet::NewlySettled => true,
            StoredBet::Unchanged => false,
        }
    }
}

/// Store a raw external bet. A settlement amount already on file is never
/// overwritten, so a record is reported as settled at most once.
pub async fn store_external_bet(conn: &mut SqliteConnection, bet: &ExternalBet) -> SettlementResult<StoredBet> {
    let result = sqlx::query(
        r#"
        INSERT INTO external_bets (user_id, game_id, order_id, stake, settlement_amount, placed_at, settled_at, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(user_id, game_id, order_id) DO NOTHING
        "#,
    )
    .bind(bet.user_id)
    .bind(&bet.game_id)
    .bind(&bet.order_id)
    .bind(to_cents(bet.stake))
    .bind(bet.settlement_amount.map(to_cents))
    .bind(bet.placed_at.to_rfc3339())
    .bind(bet.settled_at.map(|t| t.to_rfc3339()))
    .bind(Utc::now().to_rfc3339())
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 1 {
        return Ok(StoredBet::Inserted);
    }

    match bet.settlement_amount {
        Some(amount) => {
            let settled_at = bet.settled_at.unwrap_or_else(Utc::now);
            if apply_settlement(conn, bet, amount, settled_at).await? == 1 {
                Ok(StoredBet::NewlySettled)
            } else {
                Ok(StoredBet::Unchanged)
            }
        }
        None => Ok(StoredBet::Unchanged),
    }
}

/// Attach a settlement amount to a stored, still unsettled record
pub async fn apply_settlement(
    conn: &mut SqliteConnection,
    bet: &ExternalBet,
    settlement_amount: Decimal,
    settled_at: DateTime<Utc>,
) -> SettlementResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE external_bets SET settlement_amount = ?, settled_at = ?
        WHERE user_id = ? AND game_id = ? AND order_id = ? AND settlement_amount IS NULL
        "#,
    )
    .bind(to_cents(settlement_amount))
    .bind(settled_at.to_rfc3339())
    .bind(bet.user_id)
    .bind(&bet.game_id)
    .bind(&bet.order_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

pub async fn store_transfer(
    conn: &mut SqliteConnection,
    user_id: i64,
    game_id: &str,
    transfer: &ExternalTransfer,
) -> SettlementResult<u64> {
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO external_transfers (game_id, transfer_id, user_id, amount, direction, processed, created_at)
        VALUES (?, ?, ?, ?, ?, 0, ?)
        "#,
    )
    .bind(game_id)
    .bind(&transfer.transfer_id)
    .bind(user_id)
    .bind(to_cents(transfer.amount))
    .bind(transfer.direction.as_str())
    .bind(transfer.created_at.to_rfc3339())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

pub async fn unprocessed_transfers(
    conn: &mut SqliteConnection,
    user_id: i64,
    game_id: &str,
) -> SettlementResult<Vec<ExternalTransfer>> {
    let rows = sqlx::query(
        "SELECT * FROM external_transfers WHERE user_id = ? AND game_id = ? AND processed = 0 ORDER BY created_at, transfer_id",
    )
    .bind(user_id)
    .bind(game_id)
    .fetch_all(&mut *conn)
    .await?;

    rows.iter()
        .map(|r| {
            let direction: String = r.get("direction");
            let created_at: String = r.get("created_at");
            Ok(ExternalTransfer {
                transfer_id: r.get("transfer_id"),
                amount: from_cents(r.get("amount")),
                direction: TransferDirection::from_code(&direction).ok_or(SettlementError::InvalidValue {
                    field: "direction",
                    value: direction.clone(),
                })?,
                created_at: parse_time(&created_at).unwrap_or_else(Utc::now),
            })
        })
        .collect()
}

/// Flag every contributing transfer in one statement
pub async fn mark_transfers_processed(
    conn: &mut SqliteConnection,
    game_id: &str,
    transfer_ids: &[String],
) -> SettlementResult<u64> {
    if transfer_ids.is_empty() {
        return Ok(0);
    }

    let mut builder: QueryBuilder<Sqlite> =
        QueryBuilder::new("UPDATE external_transfers SET processed = 1 WHERE processed = 0 AND game_id = ");
    builder.push_bind(game_id);
    builder.push(" AND transfer_id IN (");
    let mut separated = builder.separated(", ");
    for id in transfer_ids {
        separated.push_bind(id.as_str());
    }
    separated.push_unseparated(")");

    let result = builder.build().execute(&mut *conn).await?;
    Ok(result.rows_affected())
}

pub async fn load_checkpoint(conn: &mut SqliteConnection, user_id: i64, game_id: &str) -> SettlementResult<Decimal> {
    let row: Option<(i64,)> = sqlx::query_as(
        "SELECT balance FROM balance_checkpoints WHERE user_id = ? AND game_id = ?",
    )
    .bind(user_id)
    .bind(game_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.map(|(cents,)| from_cents(cents)).unwrap_or_default())
}

pub async fn store_checkpoint(
    conn: &mut SqliteConnection,
    user_id: i64,
    game_id: &str,
    balance: Decimal,
) -> SettlementResult<()> {
    sqlx::query(
        r#"
        INSERT INTO balance_checkpoints (user_id, game_id, balance, checked_at) VALUES (?, ?, ?, ?)
        ON CONFLICT(user_id, game_id) DO UPDATE SET balance = excluded.balance, checked_at = excluded.checked_at
        "#,
    )
    .bind(user_id)
    .bind(game_id)
    .bind(to_cents(balance))
    .bind(Utc::now().to_rfc3339())
    .execute(&mut *conn)
    .await?;
    Ok(())
}
