//! Configuration management for the settlement engine

use anyhow::{Context, Result};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Engine configuration loaded from environment
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to SQLite database
    pub database_path: String,

    /// Timezone that defines the calendar day of ledger postings
    pub processing_timezone: Tz,

    /// Account that absorbs commission no agent claims
    pub platform_root_id: i64,

    /// How long a settlement marker stays valid
    pub marker_ttl: Duration,

    /// How long a resolved agent chain stays cached
    pub hierarchy_cache_ttl: Duration,

    /// Settlement rules
    pub settlement: SettlementConfig,

    /// External game provider connection
    pub provider: ProviderConfig,

    /// Reconciliation scheduling
    pub reconcile: ReconcileConfig,
}

#[derive(Debug, Clone)]
pub struct SettlementConfig {
    /// Odds-purchase wagers whose raw score differential exceeds this push
    pub odds_purchase_max_diff: Decimal,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            odds_purchase_max_diff: Decimal::from(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Base URL of the game provider API
    pub base_url: String,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    /// Timezone the provider reads and writes timestamps in
    pub timezone: Tz,
    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9000/api".to_string(),
            api_key: None,
            api_secret: None,
            timezone: chrono_tz::Asia::Shanghai,
            timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Interval between bet reconciliation cycles
    pub interval: Duration,
    /// How far back each cycle pulls bet records
    pub lookback: chrono::Duration,
    /// Local hour (processing timezone) of the unsettled-record sweep
    pub sweep_hour: u32,
    /// How far back the sweep looks for unsettled records
    pub sweep_window: chrono::Duration,
    /// Users reconciled in parallel
    pub concurrency: usize,
    /// Game with no cancel-order concept; always tracks actual flow
    pub always_track_game_id: Option<String>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            lookback: chrono::Duration::minutes(60),
            sweep_hour: 4,
            sweep_window: chrono::Duration::hours(48),
            concurrency: 8,
            always_track_game_id: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "settlement.db".to_string(),
            processing_timezone: chrono_tz::Asia::Shanghai,
            platform_root_id: 1,
            marker_ttl: Duration::from_secs(7 * 24 * 3600),
            hierarchy_cache_ttl: Duration::from_secs(3 * 24 * 3600),
            settlement: SettlementConfig::default(),
            provider: ProviderConfig::default(),
            reconcile: ReconcileConfig::default(),
        }
    }
}

fn parse_tz(var: &str, default: Tz) -> Result<Tz> {
    match env::var(var) {
        Ok(v) if !v.is_empty() => Tz::from_str(&v)
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("Invalid timezone in {}", var)),
        _ => Ok(default),
    }
}

fn parse_var<T: FromStr>(var: &str) -> Option<T> {
    env::var(var).ok().and_then(|v| v.parse().ok())
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let defaults = Config::default();

        let database_path = env::var("DATABASE_PATH").unwrap_or(defaults.database_path);

        let processing_timezone = parse_tz("PROCESSING_TIMEZONE", defaults.processing_timezone)?;

        let platform_root_id = parse_var("PLATFORM_ROOT_ID").unwrap_or(defaults.platform_root_id);

        let marker_ttl = parse_var::<u64>("MARKER_TTL_DAYS")
            .map(|days| Duration::from_secs(days * 24 * 3600))
            .unwrap_or(defaults.marker_ttl);

        let hierarchy_cache_ttl = parse_var::<u64>("HIERARCHY_CACHE_TTL_DAYS")
            .map(|days| Duration::from_secs(days * 24 * 3600))
            .unwrap_or(defaults.hierarchy_cache_ttl);

        let settlement = SettlementConfig {
            odds_purchase_max_diff: env::var("ODDS_PURCHASE_MAX_DIFF")
                .ok()
                .and_then(|v| Decimal::from_str(&v).ok())
                .unwrap_or(defaults.settlement.odds_purchase_max_diff),
        };

        let provider = ProviderConfig {
            base_url: env::var("PROVIDER_BASE_URL").unwrap_or(defaults.provider.base_url),
            api_key: env::var("PROVIDER_API_KEY").ok().filter(|s| !s.is_empty()),
            api_secret: env::var("PROVIDER_API_SECRET").ok().filter(|s| !s.is_empty()),
            timezone: parse_tz("PROVIDER_TIMEZONE", defaults.provider.timezone)?,
            timeout: parse_var::<u64>("PROVIDER_TIMEOUT_SECONDS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.provider.timeout),
        };

        let reconcile = ReconcileConfig {
            interval: parse_var::<u64>("RECONCILE_INTERVAL_SECONDS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.reconcile.interval),
            lookback: parse_var::<i64>("RECONCILE_LOOKBACK_MINUTES")
                .map(chrono::Duration::minutes)
                .unwrap_or(defaults.reconcile.lookback),
            sweep_hour: parse_var("SWEEP_HOUR").unwrap_or(defaults.reconcile.sweep_hour),
            sweep_window: parse_var::<i64>("SWEEP_WINDOW_HOURS")
                .map(chrono::Duration::hours)
                .unwrap_or(defaults.reconcile.sweep_window),
            concurrency: parse_var("RECONCILE_CONCURRENCY").unwrap_or(defaults.reconcile.concurrency),
            always_track_game_id: env::var("ALWAYS_TRACK_GAME_ID").ok().filter(|s| !s.is_empty()),
        };

        // Validate configuration
        if reconcile.sweep_hour > 23 {
            anyhow::bail!("SWEEP_HOUR must be between 0 and 23");
        }
        if reconcile.concurrency == 0 {
            anyhow::bail!("RECONCILE_CONCURRENCY must be at least 1");
        }
        if platform_root_id <= 0 {
            anyhow::bail!("PLATFORM_ROOT_ID must be positive");
        }
        if provider.api_key.is_some() != provider.api_secret.is_some() {
            anyhow::bail!("PROVIDER_API_KEY and PROVIDER_API_SECRET must be set together");
        }

        Ok(Self {
            database_path,
            processing_timezone,
            platform_root_id,
            marker_ttl,
            hierarchy_cache_ttl,
            settlement,
            provider,
            reconcile,
        })
    }
}
