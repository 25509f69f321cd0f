//! External game provider client
//!
//! Requests are JSON POSTs signed with HMAC-SHA256. Every timestamp crosses the
//! wire as `YYYY-MM-DD HH:MM:SS` in the provider's declared timezone and is
//! converted to UTC here, so nothing past this module sees provider-local time.

use super::provider_errors::ProviderError;
use super::retry::{retry, RetryPolicy};
use crate::config::ProviderConfig;
use crate::types::{
    DrawResult, ExternalAccount, ExternalBet, ExternalTransfer, GameInfo, GameKind, TransferDirection,
};
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

pub const PROVIDER_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[async_trait]
pub trait GameProvider: Send + Sync {
    /// Game catalogue
    async fn list_games(&self) -> Result<Vec<GameInfo>, ProviderError>;

    /// Bets placed by one player in `[from, to]`
    async fn list_bets(
        &self,
        account: &ExternalAccount,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ExternalBet>, ProviderError>;

    /// Settlement amounts for the given orders of one game
    async fn query_draw_results(
        &self,
        game_id: &str,
        order_ids: &[String],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DrawResult>, ProviderError>;

    /// Current balance of a player inside a running-balance game
    async fn get_balance(&self, account: &ExternalAccount, game_id: &str) -> Result<Decimal, ProviderError>;

    /// Deposits into and withdrawals out of a running-balance game
    async fn list_transactions(
        &self,
        account: &ExternalAccount,
        game_id: &str,
    ) -> Result<Vec<ExternalTransfer>, ProviderError>;
}

/// Render a UTC instant in the provider's wire format
pub fn format_provider_time(time: DateTime<Utc>, tz: Tz) -> String {
    time.with_timezone(&tz).format(PROVIDER_TIME_FORMAT).to_string()
}

/// Parse a provider timestamp into UTC. Ambiguous local times (DST fold)
/// resolve to the earlier instant.
pub fn parse_provider_time(value: &str, tz: Tz) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(value.trim(), PROVIDER_TIME_FORMAT).ok()?;
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}

/// Base64 HMAC-SHA256 over `timestamp + nonce + path + body`
pub fn sign_request(secret: &str, timestamp: &str, nonce: &str, path: &str, body: &str) -> Result<String, ProviderError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| ProviderError::AuthenticationFailed)?;
    mac.update(timestamp.as_bytes());
    mac.update(nonce.as_bytes());
    mac.update(path.as_bytes());
    mac.update(body.as_bytes());
    Ok(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

/// Response envelope: `code == 0` means success
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i64,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct WireGame {
    game_id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    kind: String,
    #[serde(default = "default_true")]
    active: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct WireBet {
    order_id: String,
    game_id: String,
    stake: Decimal,
    #[serde(default)]
    settlement_amount: Option<Decimal>,
    bet_time: String,
    #[serde(default)]
    settle_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireDraw {
    order_id: String,
    settlement_amount: Decimal,
    #[serde(default)]
    settle_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireBalance {
    balance: Decimal,
}

#[derive(Debug, Deserialize)]
struct WireTransfer {
    transfer_id: String,
    amount: Decimal,
    direction: String,
    created_at: String,
}

#[derive(Debug, Serialize)]
struct BetQuery<'a> {
    account: &'a str,
    start_time: String,
    end_time: String,
}

#[derive(Debug, Serialize)]
struct DrawQuery<'a> {
    game_id: &'a str,
    order_ids: &'a [String],
    start_time: String,
    end_time: String,
}

#[derive(Debug, Serialize)]
struct AccountQuery<'a> {
    account: &'a str,
    game_id: &'a str,
}

/// HTTP implementation of `GameProvider`
pub struct HttpGameProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    api_secret: Option<String>,
    timezone: Tz,
    retry: RetryPolicy,
}

impl HttpGameProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::from_network_error(&e))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            timezone: config.timezone,
            retry: RetryPolicy::provider(),
        })
    }

    async fn call<B, T>(&self, path: &str, body: &B) -> Result<T, ProviderError>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        retry(&self.retry, path, || self.call_once(path, body)).await
    }

    async fn call_once<B, T>(&self, path: &str, body: &B) -> Result<T, ProviderError>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let body = serde_json::to_string(body).map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        let url = format!("{}{}", self.base_url, path);

        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json");

        if let (Some(key), Some(secret)) = (&self.api_key, &self.api_secret) {
            let timestamp = Utc::now().timestamp().to_string();
            let nonce = uuid::Uuid::new_v4().to_string();
            let signature = sign_request(secret, &timestamp, &nonce, path, &body)?;
            request = request
                .header("X-Api-Key", key)
                .header("X-Timestamp", &timestamp)
                .header("X-Nonce", &nonce)
                .header("X-Signature", &signature);
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| ProviderError::from_network_error(&e))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::from_network_error(&e))?;

        if !(200..300).contains(&status) {
            return Err(ProviderError::from_response(status, &text));
        }

        let envelope: Envelope<T> =
            serde_json::from_str(&text).map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        if envelope.code != 0 {
            return Err(ProviderError::from_response(status, &text));
        }

        envelope
            .data
            .ok_or_else(|| ProviderError::InvalidResponse(format!("{} returned no data", path)))
    }
}

#[async_trait]
impl GameProvider for HttpGameProvider {
    async fn list_games(&self) -> Result<Vec<GameInfo>, ProviderError> {
        let games: Vec<WireGame> = self.call("/games", &serde_json::json!({})).await?;
        Ok(games
            .into_iter()
            .map(|g| GameInfo {
                kind: match g.kind.as_str() {
                    "running_balance" | "vboss" => GameKind::RunningBalance,
                    _ => GameKind::Standard,
                },
                game_id: g.game_id,
                name: g.name,
                active: g.active,
            })
            .collect())
    }

    async fn list_bets(
        &self,
        account: &ExternalAccount,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ExternalBet>, ProviderError> {
        let query = BetQuery {
            account: &account.account,
            start_time: format_provider_time(from, self.timezone),
            end_time: format_provider_time(to, self.timezone),
        };
        let bets: Vec<WireBet> = self.call("/bets", &query).await?;

        let mut records = Vec::with_capacity(bets.len());
        for bet in bets {
            let Some(placed_at) = parse_provider_time(&bet.bet_time, self.timezone) else {
                warn!("[Provider] Skipping order {} with bad bet_time {:?}", bet.order_id, bet.bet_time);
                continue;
            };
            records.push(ExternalBet {
                user_id: account.user_id,
                game_id: bet.game_id,
                order_id: bet.order_id,
                stake: bet.stake,
                settlement_amount: bet.settlement_amount,
                placed_at,
                settled_at: bet
                    .settle_time
                    .as_deref()
                    .and_then(|t| parse_provider_time(t, self.timezone)),
            });
        }

        debug!("[Provider] {} bets for account {}", records.len(), account.account);
        Ok(records)
    }

    async fn query_draw_results(
        &self,
        game_id: &str,
        order_ids: &[String],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DrawResult>, ProviderError> {
        let query = DrawQuery {
            game_id,
            order_ids,
            start_time: format_provider_time(from, self.timezone),
            end_time: format_provider_time(to, self.timezone),
        };
        let draws: Vec<WireDraw> = self.call("/draw-results", &query).await?;

        Ok(draws
            .into_iter()
            .map(|d| DrawResult {
                settled_at: d
                    .settle_time
                    .as_deref()
                    .and_then(|t| parse_provider_time(t, self.timezone)),
                order_id: d.order_id,
                settlement_amount: d.settlement_amount,
            })
            .collect())
    }

    async fn get_balance(&self, account: &ExternalAccount, game_id: &str) -> Result<Decimal, ProviderError> {
        let query = AccountQuery {
            account: &account.account,
            game_id,
        };
        let balance: WireBalance = self.call("/balance", &query).await?;
        Ok(balance.balance)
    }

    async fn list_transactions(
        &self,
        account: &ExternalAccount,
        game_id: &str,
    ) -> Result<Vec<ExternalTransfer>, ProviderError> {
        let query = AccountQuery {
            account: &account.account,
            game_id,
        };
        let transfers: Vec<WireTransfer> = self.call("/transactions", &query).await?;

        let mut records = Vec::with_capacity(transfers.len());
        for t in transfers {
            let direction = TransferDirection::from_code(&t.direction.to_lowercase());
            let created_at = parse_provider_time(&t.created_at, self.timezone);
            match (direction, created_at) {
                (Some(direction), Some(created_at)) => records.push(ExternalTransfer {
                    transfer_id: t.transfer_id,
                    amount: t.amount.abs(),
                    direction,
                    created_at,
                }),
                _ => warn!("[Provider] Skipping malformed transfer {}", t.transfer_id),
            }
        }
        Ok(records)
    }
}
