//! Ledger Poster - the only writer of daily statistics, payout records and
//! wallet balances.
//!
//! Every write is a single additive statement (`col = col + excluded.col`), so
//! two postings for the same user and day never read-modify-write a field.

use crate::db::day_key;
use crate::error::{SettlementError, SettlementResult};
use crate::types::to_cents;
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteConnection;
use std::collections::BTreeMap;
use tracing::debug;

/// Additive amounts for one daily statistics row
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerDeltas {
    pub gross_flow: Decimal,
    pub actual_flow: Decimal,
    pub settlement_flow: Decimal,
    pub result_amount: Decimal,
    pub lower_level_flow: Decimal,
    pub lower_level_actual_flow: Decimal,
    pub lower_level_settlement_flow: Decimal,
    pub parent_divided_into: Decimal,
}

/// One posting: a statistics delta, its payout record and an optional wallet delta
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub user_id: i64,
    pub day: NaiveDate,
    pub ancestors: Option<String>,
    pub parent_user_id: Option<i64>,
    pub link_identifier: Option<String>,
    pub deltas: LedgerDeltas,
    pub wallet_delta: Option<Decimal>,
    /// Wager id or external order the posting comes from
    pub source_id: String,
    pub bettor_id: i64,
    pub level: i64,
    pub ratio: Decimal,
}

#[derive(Debug, Clone, Copy)]
pub struct LedgerPoster {
    root_id: i64,
}

impl LedgerPoster {
    pub fn new(root_id: i64) -> Self {
        Self { root_id }
    }

    fn validate(&self, entry: &LedgerEntry) -> SettlementResult<()> {
        if entry.ancestors.is_none() {
            return Err(SettlementError::MissingAncestors { user_id: entry.user_id });
        }
        if entry.user_id != self.root_id
            && entry.link_identifier.as_deref().map_or(true, |l| l.trim().is_empty())
        {
            return Err(SettlementError::MissingLinkIdentifier { user_id: entry.user_id });
        }
        Ok(())
    }

    /// Apply one entry on the caller's transaction.
    ///
    /// Returns the rows affected by the statistics upsert.
    pub async fn post(&self, conn: &mut SqliteConnection, entry: &LedgerEntry) -> SettlementResult<u64> {
        self.validate(entry)?;

        let now = Utc::now().to_rfc3339();
        let day = day_key(entry.day);
        let ancestors = entry.ancestors.as_deref().unwrap_or_default();
        let d = &entry.deltas;

        let result = sqlx::query(
            r#"
            INSERT INTO daily_statistics (
                user_id, day, parent_user_id, ancestors, link_identifier,
                gross_flow, actual_flow, settlement_flow, result_amount,
                lower_level_flow, lower_level_actual_flow, lower_level_settlement_flow,
                parent_divided_into, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id, day) DO UPDATE SET
                gross_flow = gross_flow + excluded.gross_flow,
                actual_flow = actual_flow + excluded.actual_flow,
                settlement_flow = settlement_flow + excluded.settlement_flow,
                result_amount = result_amount + excluded.result_amount,
                lower_level_flow = lower_level_flow + excluded.lower_level_flow,
                lower_level_actual_flow = lower_level_actual_flow + excluded.lower_level_actual_flow,
                lower_level_settlement_flow = lower_level_settlement_flow + excluded.lower_level_settlement_flow,
                parent_divided_into = parent_divided_into + excluded.parent_divided_into,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(entry.user_id)
        .bind(&day)
        .bind(entry.parent_user_id)
        .bind(ancestors)
        .bind(&entry.link_identifier)
        .bind(to_cents(d.gross_flow))
        .bind(to_cents(d.actual_flow))
        .bind(to_cents(d.settlement_flow))
        .bind(to_cents(d.result_amount))
        .bind(to_cents(d.lower_level_flow))
        .bind(to_cents(d.lower_level_actual_flow))
        .bind(to_cents(d.lower_level_settlement_flow))
        .bind(to_cents(d.parent_divided_into))
        .bind(&now)
        .bind(&now)
        .execute(&mut *conn)
        .await?;

        let affected = result.rows_affected();
        if affected == 0 {
            debug!(
                "[Ledger] Statistics upsert for user {} on {} touched no rows",
                entry.user_id, day
            );
        }

        sqlx::query(
            r#"
            INSERT INTO payout_records (
                source_id, recipient_id, bettor_id, level, amount, ratio,
                ancestors, link_identifier, day, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.source_id)
        .bind(entry.user_id)
        .bind(entry.bettor_id)
        .bind(entry.level)
        .bind(to_cents(d.result_amount))
        .bind(entry.ratio.to_string())
        .bind(ancestors)
        .bind(&entry.link_identifier)
        .bind(&day)
        .bind(&now)
        .execute(&mut *conn)
        .await?;

        if let Some(delta) = entry.wallet_delta {
            apply_wallet_delta(conn, entry.user_id, delta, &now).await?;
        }

        Ok(affected)
    }

    /// Apply wallet deltas, one statement per user, ascending by user id
    pub async fn increment_balances(
        &self,
        conn: &mut SqliteConnection,
        deltas: &BTreeMap<i64, Decimal>,
    ) -> SettlementResult<usize> {
        let now = Utc::now().to_rfc3339();
        let mut applied = 0;
        for (user_id, delta) in deltas {
            if delta.is_zero() {
                continue;
            }
            apply_wallet_delta(conn, *user_id, *delta, &now).await?;
            applied += 1;
        }
        Ok(applied)
    }
}

async fn apply_wallet_delta(
    conn: &mut SqliteConnection,
    user_id: i64,
    delta: Decimal,
    now: &str,
) -> SettlementResult<()> {
    sqlx::query(
        r#"
        INSERT INTO wallets (user_id, balance, updated_at) VALUES (?, ?, ?)
        ON CONFLICT(user_id) DO UPDATE SET
            balance = balance + excluded.balance,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(user_id)
    .bind(to_cents(delta))
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}
