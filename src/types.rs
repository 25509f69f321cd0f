//! Core types for wager settlement and commission posting

use crate::error::SettlementError;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Round a monetary amount to cents (midpoint away from zero)
pub fn money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Convert an amount to integer cents for storage
pub fn to_cents(value: Decimal) -> i64 {
    let mut rounded = money(value);
    rounded.rescale(2);
    let mantissa = rounded.mantissa();
    i64::try_from(mantissa).unwrap_or(if mantissa.is_negative() { i64::MIN } else { i64::MAX })
}

/// Convert stored integer cents back to a decimal amount
pub fn from_cents(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}

/// Parse a comma-joined ancestor path ("1,5,9") into ids, root first.
/// Empty segments and garbage are dropped.
pub fn parse_ancestor_path(path: &str) -> Vec<i64> {
    path.split(',')
        .filter_map(|part| part.trim().parse::<i64>().ok())
        .filter(|id| *id > 0)
        .collect()
}

/// One of the two competing sides of a contest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TeamSide {
    Home,
    Away,
}

impl TeamSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TeamSide::Home => "home",
            TeamSide::Away => "away",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "home" => Some(TeamSide::Home),
            "away" => Some(TeamSide::Away),
            _ => None,
        }
    }
}

/// What the bettor backed. Over/Under are only meaningful for total-line wagers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Pick {
    Home,
    Away,
    Over,
    Under,
}

impl Pick {
    pub fn as_str(&self) -> &'static str {
        match self {
            Pick::Home => "home",
            Pick::Away => "away",
            Pick::Over => "over",
            Pick::Under => "under",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "home" => Some(Pick::Home),
            "away" => Some(Pick::Away),
            "over" => Some(Pick::Over),
            "under" => Some(Pick::Under),
            _ => None,
        }
    }

    /// The contest side this pick backs, if it backs one
    pub fn team(&self) -> Option<TeamSide> {
        match self {
            Pick::Home => Some(TeamSide::Home),
            Pick::Away => Some(TeamSide::Away),
            Pick::Over | Pick::Under => None,
        }
    }
}

impl fmt::Display for Pick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Contest lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContestStatus {
    Pending,
    InProgress,
    Completed,
}

impl ContestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContestStatus::Pending => "pending",
            ContestStatus::InProgress => "in_progress",
            ContestStatus::Completed => "completed",
        }
    }

    pub fn from_code(code: &str) -> Self {
        match code {
            "in_progress" => ContestStatus::InProgress,
            "completed" => ContestStatus::Completed,
            _ => ContestStatus::Pending,
        }
    }
}

/// Score of one leg (set, game, half...) of a contest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegScore {
    pub leg_no: u32,
    pub home: i64,
    pub away: i64,
    /// Per-leg handicap in favour of the home side (0 when the leg has none)
    pub home_handicap: Decimal,
}

/// Final per-leg scores of a contest
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContestResult {
    pub legs: Vec<LegScore>,
}

impl ContestResult {
    pub fn new(legs: Vec<LegScore>) -> Self {
        Self { legs }
    }

    /// Raw aggregate (home, away) over all legs
    pub fn aggregate(&self) -> (i64, i64) {
        self.legs
            .iter()
            .fold((0, 0), |(h, a), leg| (h + leg.home, a + leg.away))
    }

    pub fn leg(&self, leg_no: u32) -> Option<&LegScore> {
        self.legs.iter().find(|leg| leg.leg_no == leg_no)
    }

    /// Winner from raw aggregate scores, `None` for a draw
    pub fn winner(&self) -> Option<TeamSide> {
        let (home, away) = self.aggregate();
        match home.cmp(&away) {
            std::cmp::Ordering::Greater => Some(TeamSide::Home),
            std::cmp::Ordering::Less => Some(TeamSide::Away),
            std::cmp::Ordering::Equal => None,
        }
    }
}

/// A match or season that wagers are placed against
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contest {
    pub id: i64,
    pub title: String,
    pub tax_rate: Decimal,
    pub status: ContestStatus,
    pub winner: Option<TeamSide>,
    pub settled_at: Option<DateTime<Utc>>,
}

/// Wager type with its type-specific parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WagerKind {
    WinLoss,
    Handicap { handicap: Decimal },
    TotalLine { line: Decimal },
    LegCountHandicap { handicap: Decimal },
    SingleLegHandicap { leg_no: Option<u32>, handicap: Decimal },
    OddsPurchase { handicap: Decimal, base_score: Decimal },
    Unknown(String),
}

impl WagerKind {
    pub fn code(&self) -> &str {
        match self {
            WagerKind::WinLoss => "win_loss",
            WagerKind::Handicap { .. } => "handicap",
            WagerKind::TotalLine { .. } => "total_line",
            WagerKind::LegCountHandicap { .. } => "leg_count_handicap",
            WagerKind::SingleLegHandicap { .. } => "single_leg_handicap",
            WagerKind::OddsPurchase { .. } => "odds_purchase",
            WagerKind::Unknown(code) => code,
        }
    }

    pub fn is_odds_purchase(&self) -> bool {
        matches!(self, WagerKind::OddsPurchase { .. })
    }

    /// Rebuild a kind from its stored columns
    pub fn from_parts(
        wager_id: i64,
        code: &str,
        handicap: Option<Decimal>,
        line: Option<Decimal>,
        leg_no: Option<u32>,
        base_score: Option<Decimal>,
    ) -> Result<Self, SettlementError> {
        let require = |value: Option<Decimal>, parameter: &'static str| {
            value.ok_or(SettlementError::MissingParameter { wager_id, parameter })
        };

        Ok(match code {
            "win_loss" => WagerKind::WinLoss,
            "handicap" => WagerKind::Handicap {
                handicap: require(handicap, "handicap")?,
            },
            "total_line" => WagerKind::TotalLine {
                line: require(line, "line")?,
            },
            "leg_count_handicap" => WagerKind::LegCountHandicap {
                handicap: handicap.unwrap_or_default(),
            },
            "single_leg_handicap" => WagerKind::SingleLegHandicap {
                leg_no,
                handicap: handicap.unwrap_or_default(),
            },
            "odds_purchase" => WagerKind::OddsPurchase {
                handicap: handicap.unwrap_or_default(),
                base_score: require(base_score, "base_score")?,
            },
            other => WagerKind::Unknown(other.to_string()),
        })
    }
}

/// Settled outcome of a wager from the bettor's perspective
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Win,
    Lose,
    Push,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Win => "win",
            Outcome::Lose => "lose",
            Outcome::Push => "push",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "win" => Some(Outcome::Win),
            "lose" => Some(Outcome::Lose),
            "push" => Some(Outcome::Push),
            _ => None,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single bet placed by a user against a contest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wager {
    pub id: i64,
    pub contest_id: i64,
    pub user_id: i64,
    pub kind: WagerKind,
    pub pick: Pick,
    pub stake: Decimal,
    pub odds: Decimal,
    /// Tax rate captured when the wager was placed
    pub tax_rate: Decimal,
    pub resolution: Option<Outcome>,
    pub net_result: Option<Decimal>,
    pub payout_amount: Option<Decimal>,
}

/// A user's position in the agent hierarchy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainNode {
    pub user_id: i64,
    pub parent_id: Option<i64>,
    /// Comma-joined ancestor path, root first
    pub ancestors: Option<String>,
    /// Cumulative commission ratio granted to this user
    pub commission_ratio: Decimal,
    /// Grouping key linking the user to its upline
    pub link_identifier: Option<String>,
}

/// Materialized ancestor list of a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentChain {
    pub member: ChainNode,
    /// Agents above the member, root first, nearest agent last
    pub agents: Vec<ChainNode>,
}

impl AgentChain {
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn contains(&self, user_id: i64) -> bool {
        self.member.user_id == user_id || self.agents.iter().any(|a| a.user_id == user_id)
    }

    /// Cumulative ratio of the top-most agent
    pub fn top_ratio(&self) -> Decimal {
        self.effective_ratios().first().copied().unwrap_or_default()
    }

    /// Cumulative ratios clamped to [0, 1] and forced non-increasing towards
    /// the member, so a misconfigured child can never out-earn its parent.
    fn effective_ratios(&self) -> Vec<Decimal> {
        let mut ceiling = Decimal::ONE;
        self.agents
            .iter()
            .map(|agent| {
                let ratio = agent
                    .commission_ratio
                    .clamp(Decimal::ZERO, Decimal::ONE)
                    .min(ceiling);
                ceiling = ratio;
                ratio
            })
            .collect()
    }

    /// Each agent's own slice of commission, aligned with `agents`.
    /// `share[i] = eff[i] - eff[i + 1]`, the innermost level keeps its whole ratio.
    pub fn level_shares(&self) -> Vec<Decimal> {
        let effective = self.effective_ratios();
        effective
            .iter()
            .enumerate()
            .map(|(i, ratio)| *ratio - effective.get(i + 1).copied().unwrap_or(Decimal::ZERO))
            .collect()
    }
}

/// Immutable ledger line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutRecord {
    pub id: i64,
    pub source_id: String,
    pub recipient_id: i64,
    pub bettor_id: i64,
    /// 0 = bettor, 1.. = agents nearest first, last = platform remainder
    pub level: i64,
    pub amount: Decimal,
    pub ratio: Decimal,
    pub ancestors: String,
    pub link_identifier: Option<String>,
    pub day: NaiveDate,
    pub created_at: DateTime<Utc>,
}

/// Per-user, per-day running totals
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DailyStatistics {
    pub user_id: i64,
    pub day: String,
    pub gross_flow: Decimal,
    pub actual_flow: Decimal,
    pub settlement_flow: Decimal,
    pub result_amount: Decimal,
    pub lower_level_flow: Decimal,
    pub lower_level_actual_flow: Decimal,
    pub lower_level_settlement_flow: Decimal,
    pub parent_divided_into: Decimal,
}

/// Game catalogue entry from the external provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameInfo {
    pub game_id: String,
    pub name: String,
    pub kind: GameKind,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GameKind {
    /// Discrete bets that are settled individually
    Standard,
    /// Wallet-style game with no per-bet resolution ("VBOSS")
    RunningBalance,
}

/// A bet record pulled from the external provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalBet {
    pub user_id: i64,
    pub game_id: String,
    pub order_id: String,
    pub stake: Decimal,
    /// Amount returned to the player, absent until the provider settles it
    pub settlement_amount: Option<Decimal>,
    pub placed_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl ExternalBet {
    /// Player net profit for a settled record
    pub fn net_profit(&self) -> Option<Decimal> {
        self.settlement_amount.map(|amount| money(amount - self.stake))
    }
}

/// Draw/settlement result for one external order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawResult {
    pub order_id: String,
    pub settlement_amount: Decimal,
    pub settled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferDirection {
    Deposit,
    Withdrawal,
}

impl TransferDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferDirection::Deposit => "deposit",
            TransferDirection::Withdrawal => "withdrawal",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "deposit" | "in" => Some(TransferDirection::Deposit),
            "withdrawal" | "out" => Some(TransferDirection::Withdrawal),
            _ => None,
        }
    }
}

/// Money moved into or out of a running-balance game
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalTransfer {
    pub transfer_id: String,
    pub amount: Decimal,
    pub direction: TransferDirection,
    pub created_at: DateTime<Utc>,
}

/// A local user linked to an account at the external provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalAccount {
    pub user_id: i64,
    pub account: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn node(user_id: i64, ratio: Decimal) -> ChainNode {
        ChainNode {
            user_id,
            parent_id: None,
            ancestors: Some(String::new()),
            commission_ratio: ratio,
            link_identifier: Some(format!("L{}", user_id)),
        }
    }

    fn chain(ratios: &[Decimal]) -> AgentChain {
        AgentChain {
            member: node(99, Decimal::ZERO),
            agents: ratios
                .iter()
                .enumerate()
                .map(|(i, r)| node(i as i64 + 10, *r))
                .collect(),
        }
    }

    #[test]
    fn test_money_rounds_half_away_from_zero() {
        assert_eq!(money(dec!(1.005)), dec!(1.01));
        assert_eq!(money(dec!(-1.005)), dec!(-1.01));
        assert_eq!(money(dec!(2.344)), dec!(2.34));
    }

    #[test]
    fn test_cents_conversion() {
        assert_eq!(to_cents(dec!(90)), 9000);
        assert_eq!(to_cents(dec!(-12.345)), -1235);
        assert_eq!(from_cents(19000), dec!(190.00));
    }

    #[test]
    fn test_parse_ancestor_path() {
        assert_eq!(parse_ancestor_path("1,5,9"), vec![1, 5, 9]);
        assert_eq!(parse_ancestor_path(" 1, ,x,7,"), vec![1, 7]);
        assert!(parse_ancestor_path("").is_empty());
    }

    #[test]
    fn test_level_shares_scenario() {
        let shares = chain(&[dec!(0.30), dec!(0.20), dec!(0.05)]).level_shares();
        assert_eq!(shares, vec![dec!(0.10), dec!(0.15), dec!(0.05)]);
    }

    #[test]
    fn test_level_shares_never_negative() {
        // A child configured above its parent is capped at the parent's ratio
        let c = chain(&[dec!(0.10), dec!(0.30), dec!(0.05), dec!(1.5)]);
        let shares = c.level_shares();
        assert!(shares.iter().all(|s| *s >= Decimal::ZERO));
        let total: Decimal = shares.iter().sum();
        assert!(total <= dec!(0.10));
        assert_eq!(c.top_ratio(), dec!(0.10));
    }

    #[test]
    fn test_contest_winner_from_raw_scores() {
        let result = ContestResult::new(vec![
            LegScore { leg_no: 1, home: 2, away: 1, home_handicap: dec!(-3) },
            LegScore { leg_no: 2, home: 0, away: 3, home_handicap: Decimal::ZERO },
        ]);
        assert_eq!(result.aggregate(), (2, 4));
        assert_eq!(result.winner(), Some(TeamSide::Away));
        assert_eq!(ContestResult::default().winner(), None);
    }

    #[test]
    fn test_wager_kind_missing_parameter() {
        let err = WagerKind::from_parts(7, "handicap", None, None, None, None).unwrap_err();
        assert!(matches!(err, SettlementError::MissingParameter { wager_id: 7, .. }));

        let unknown = WagerKind::from_parts(8, "parlay", None, None, None, None).unwrap();
        assert_eq!(unknown, WagerKind::Unknown("parlay".to_string()));
    }
}
