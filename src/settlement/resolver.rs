//! Wager Resolver - decides win, lose or push for one wager
//!
//! One function per wager kind. Scores are always viewed from the side the
//! bettor backed, so every rule is symmetric in the pick.

use crate::config::SettlementConfig;
use crate::error::{SettlementError, SettlementResult};
use crate::types::{ContestResult, Outcome, Pick, TeamSide, Wager, WagerKind};
use rust_decimal::Decimal;
use std::cmp::Ordering;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub outcome: Outcome,
    /// Unadjusted absolute score differential (odds-purchase multiplier input)
    pub score_diff: Decimal,
}

impl Resolution {
    fn of(outcome: Outcome) -> Self {
        Self {
            outcome,
            score_diff: Decimal::ZERO,
        }
    }
}

fn compare(mine: Decimal, theirs: Decimal) -> Outcome {
    match mine.cmp(&theirs) {
        Ordering::Greater => Outcome::Win,
        Ordering::Less => Outcome::Lose,
        Ordering::Equal => Outcome::Push,
    }
}

/// (backed, opposing) pair from a (home, away) pair
fn oriented<T>(side: TeamSide, home: T, away: T) -> (T, T) {
    match side {
        TeamSide::Home => (home, away),
        TeamSide::Away => (away, home),
    }
}

fn backed_side(wager: &Wager) -> SettlementResult<TeamSide> {
    wager.pick.team().ok_or_else(|| SettlementError::InvalidPick {
        kind: wager.kind.code().to_string(),
        pick: wager.pick,
    })
}

pub fn resolve(wager: &Wager, result: &ContestResult, config: &SettlementConfig) -> SettlementResult<Resolution> {
    match &wager.kind {
        WagerKind::WinLoss => resolve_win_loss(backed_side(wager)?, result),
        WagerKind::Handicap { handicap } => resolve_handicap(backed_side(wager)?, *handicap, result),
        WagerKind::TotalLine { line } => resolve_total_line(wager, *line, result),
        WagerKind::LegCountHandicap { handicap } => resolve_leg_count(backed_side(wager)?, *handicap, result),
        WagerKind::SingleLegHandicap { leg_no, handicap } => {
            resolve_single_leg(backed_side(wager)?, *leg_no, *handicap, result)
        }
        WagerKind::OddsPurchase { handicap, .. } => {
            resolve_odds_purchase(backed_side(wager)?, *handicap, result, config.odds_purchase_max_diff)
        }
        WagerKind::Unknown(code) => {
            warn!("[Resolver] Wager {} has unknown type '{}', pushing", wager.id, code);
            Ok(Resolution::of(Outcome::Push))
        }
    }
}

fn resolve_win_loss(side: TeamSide, result: &ContestResult) -> SettlementResult<Resolution> {
    let (home, away) = result.aggregate();
    let (mine, theirs) = oriented(side, home, away);
    Ok(Resolution::of(compare(Decimal::from(mine), Decimal::from(theirs))))
}

fn resolve_handicap(side: TeamSide, handicap: Decimal, result: &ContestResult) -> SettlementResult<Resolution> {
    let (home, away) = result.aggregate();
    let (mine, theirs) = oriented(side, home, away);
    Ok(Resolution::of(compare(Decimal::from(mine) + handicap, Decimal::from(theirs))))
}

fn resolve_total_line(wager: &Wager, line: Decimal, result: &ContestResult) -> SettlementResult<Resolution> {
    let (home, away) = result.aggregate();
    let total = Decimal::from(home + away);
    let outcome = match wager.pick {
        Pick::Over => compare(total, line),
        Pick::Under => compare(line, total),
        Pick::Home | Pick::Away => {
            return Err(SettlementError::InvalidPick {
                kind: wager.kind.code().to_string(),
                pick: wager.pick,
            })
        }
    };
    Ok(Resolution::of(outcome))
}

fn resolve_leg_count(side: TeamSide, handicap: Decimal, result: &ContestResult) -> SettlementResult<Resolution> {
    let mut home_wins = 0i64;
    let mut away_wins = 0i64;
    for leg in &result.legs {
        match (Decimal::from(leg.home) + leg.home_handicap).cmp(&Decimal::from(leg.away)) {
            Ordering::Greater => home_wins += 1,
            Ordering::Less => away_wins += 1,
            Ordering::Equal => {}
        }
    }

    let (mine, theirs) = oriented(side, home_wins, away_wins);
    Ok(Resolution::of(compare(Decimal::from(mine) + handicap, Decimal::from(theirs))))
}

fn resolve_single_leg(
    side: TeamSide,
    leg_no: Option<u32>,
    handicap: Decimal,
    result: &ContestResult,
) -> SettlementResult<Resolution> {
    let Some(leg) = leg_no.and_then(|n| result.leg(n)) else {
        return Ok(Resolution::of(Outcome::Push));
    };

    let (mine, theirs) = oriented(side, leg.home, leg.away);
    Ok(Resolution::of(compare(Decimal::from(mine) + handicap, Decimal::from(theirs))))
}

fn resolve_odds_purchase(
    side: TeamSide,
    handicap: Decimal,
    result: &ContestResult,
    max_diff: Decimal,
) -> SettlementResult<Resolution> {
    let (home, away) = result.aggregate();
    let score_diff = Decimal::from((home - away).abs());

    // Beyond the cap the wager is void, not paid at the cap
    if score_diff > max_diff {
        return Ok(Resolution {
            outcome: Outcome::Push,
            score_diff,
        });
    }

    let (mine, theirs) = oriented(side, home, away);
    Ok(Resolution {
        outcome: compare(Decimal::from(mine) + handicap, Decimal::from(theirs)),
        score_diff,
    })
}
