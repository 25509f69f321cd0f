//! Payout Calculator
//!
//! Amounts are rounded to cents as they are computed, never at storage time.

use crate::settlement::resolver::Resolution;
use crate::types::{money, Outcome, Wager, WagerKind};
use rust_decimal::Decimal;

/// Monetary result of one settled wager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Payout {
    /// Bettor's profit (negative on a loss)
    pub net_result: Decimal,
    /// What the bettor gets back, stake included
    pub payout_amount: Decimal,
    /// Withheld from odds-purchase winnings
    pub tax: Decimal,
}

pub fn compute(resolution: &Resolution, wager: &Wager) -> Payout {
    let stake = money(wager.stake);

    match resolution.outcome {
        Outcome::Win => match &wager.kind {
            WagerKind::OddsPurchase { base_score, .. } => {
                let multiplier = (resolution.score_diff.abs() + base_score) * wager.odds;
                let gross = money(stake * multiplier);
                let tax = money(gross * wager.tax_rate);
                let net_result = gross - tax;
                Payout {
                    net_result,
                    payout_amount: stake + net_result,
                    tax,
                }
            }
            _ => {
                let net_result = money(stake * (wager.odds - Decimal::ONE));
                Payout {
                    net_result,
                    payout_amount: stake + net_result,
                    tax: Decimal::ZERO,
                }
            }
        },
        Outcome::Lose => Payout {
            net_result: -stake,
            payout_amount: Decimal::ZERO,
            tax: Decimal::ZERO,
        },
        Outcome::Push => Payout {
            net_result: Decimal::ZERO,
            payout_amount: stake,
            tax: Decimal::ZERO,
        },
    }
}
