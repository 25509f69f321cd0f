//! Game Provider Error Differentiation
//!
//! Parses external game provider responses into structured types so the
//! reconciliation loop can tell a transient failure from a bad request.

use super::retry::{RetryClass, Retryable};
use serde::Deserialize;
use std::fmt;

/// Structured provider API error types
#[derive(Debug, Clone)]
pub enum ProviderError {
    /// Rate limited by the provider
    RateLimited,
    /// API key or request signature rejected
    AuthenticationFailed,
    /// Provider does not know the player account
    AccountNotFound(String),
    /// Provider is in maintenance or temporarily unavailable
    Unavailable,
    /// Network/connection error (timeout, DNS, etc.)
    NetworkError(String),
    /// Response body could not be decoded
    InvalidResponse(String),
    /// Unknown error with status code and body
    Unknown { status: u16, body: String },
}

/// Provider error envelope
#[derive(Debug, Deserialize)]
struct ProviderErrorResponse {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl ProviderError {
    /// Parse a provider response (HTTP status plus body) into a structured error
    pub fn from_response(status: u16, body: &str) -> Self {
        let (code, error_msg) = match serde_json::from_str::<ProviderErrorResponse>(body) {
            Ok(parsed) => (parsed.code, parsed.msg.or(parsed.message).unwrap_or_default()),
            Err(_) => (None, body.to_string()),
        };

        let msg_lower = error_msg.to_lowercase();

        // Rate limiting
        if status == 429 || msg_lower.contains("rate limit") || msg_lower.contains("too many requests") {
            return ProviderError::RateLimited;
        }

        // Authentication
        if status == 401
            || status == 403
            || msg_lower.contains("unauthorized")
            || msg_lower.contains("invalid signature")
            || msg_lower.contains("invalid api key")
        {
            return ProviderError::AuthenticationFailed;
        }

        // Unknown player
        if msg_lower.contains("account") && (msg_lower.contains("not found") || msg_lower.contains("not exist")) {
            return ProviderError::AccountNotFound(error_msg);
        }

        // Maintenance / upstream trouble
        if status == 502 || status == 503 || status == 504 || msg_lower.contains("maintenance") {
            return ProviderError::Unavailable;
        }

        ProviderError::Unknown {
            status,
            body: match code {
                Some(code) => format!("[{}] {}", code, error_msg),
                None => error_msg,
            },
        }
    }

    /// Parse a network/reqwest error
    pub fn from_network_error(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::NetworkError("Request timed out".to_string())
        } else if err.is_connect() {
            ProviderError::NetworkError("Connection failed".to_string())
        } else if err.is_decode() {
            ProviderError::InvalidResponse(err.to_string())
        } else {
            ProviderError::NetworkError(err.to_string())
        }
    }

    /// Whether repeating the request may succeed
    pub fn is_retryable(&self) -> bool {
        self.retry_class().is_some()
    }
}

impl Retryable for ProviderError {
    fn retry_class(&self) -> Option<RetryClass> {
        match self {
            ProviderError::RateLimited => Some(RetryClass::Throttled),
            ProviderError::NetworkError(_) | ProviderError::Unavailable => Some(RetryClass::Network),
            _ => None,
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::RateLimited => write!(f, "rate limited by game provider"),
            ProviderError::AuthenticationFailed => write!(f, "game provider rejected credentials"),
            ProviderError::AccountNotFound(msg) => write!(f, "account not found: {}", msg),
            ProviderError::Unavailable => write!(f, "game provider unavailable"),
            ProviderError::NetworkError(msg) => write!(f, "network error: {}", msg),
            ProviderError::InvalidResponse(msg) => write!(f, "invalid provider response: {}", msg),
            ProviderError::Unknown { status, body } => write!(f, "provider error {}: {}", status, body),
        }
    }
}

impl std::error::Error for ProviderError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited() {
        let err = ProviderError::from_response(429, "");
        assert!(err.is_retryable());
        assert!(matches!(err, ProviderError::RateLimited));
    }

    #[test]
    fn test_auth_failed() {
        let err = ProviderError::from_response(200, r#"{"code":1003,"msg":"Invalid signature"}"#);
        assert!(!err.is_retryable());
        assert!(matches!(err, ProviderError::AuthenticationFailed));
    }

    #[test]
    fn test_account_not_found() {
        let err = ProviderError::from_response(200, r#"{"code":2001,"msg":"Account does not exist"}"#);
        assert!(matches!(err, ProviderError::AccountNotFound(_)));
    }

    #[test]
    fn test_maintenance_is_retryable() {
        assert!(ProviderError::from_response(503, "").is_retryable());
        assert!(ProviderError::from_response(200, r#"{"msg":"System maintenance"}"#).is_retryable());
    }

    #[test]
    fn test_unknown_keeps_code() {
        let err = ProviderError::from_response(500, r#"{"code":9,"msg":"boom"}"#);
        assert!(!err.is_retryable());
        match err {
            ProviderError::Unknown { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "[9] boom");
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
