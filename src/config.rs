//! Immutable runtime configuration
//!
//! Assembled once at startup and handed to each component at construction.

use crate::error::LedgerError;
use crate::Result;
use std::env;
use std::time::Duration;

const DEFAULT_QBO_BASE_URL: &str = "https://sandbox-quickbooks.api.intuit.com";
const DEFAULT_TOKEN_URL: &str = "https://oauth.platform.intuit.com/oauth2/v1/tokens/bearer";
const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

#[derive(Debug, Clone)]
pub struct AccountingConfig {
    pub base_url: String,
    pub realm_id: String,
    pub minor_version: u32,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    /// Lifetime assumed for an access token supplied via the environment
    pub access_token_ttl_secs: i64,
    pub request_timeout_secs: u64,
}

impl Default for AccountingConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_QBO_BASE_URL.to_string(),
            realm_id: String::new(),
            minor_version: 65,
            token_url: DEFAULT_TOKEN_URL.to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            access_token: None,
            refresh_token: None,
            access_token_ttl_secs: 3600,
            request_timeout_secs: 30,
        }
    }
}

/// Bounded exponential backoff for the direct report call
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based), doubling each time.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OracleConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "gemini-2.0-flash".to_string(),
            base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub accounting: AccountingConfig,
    pub retry: RetryConfig,
    pub oracle: OracleConfig,
    pub server: ServerConfig,
    pub history_turns: usize,
}

impl AppConfig {
    /// Read configuration from the process environment.
    /// Call `dotenv::dotenv()` first to pick up a `.env` file.
    pub fn from_env() -> Result<Self> {
        let mut config = AppConfig {
            history_turns: 10,
            ..AppConfig::default()
        };

        let acct = &mut config.accounting;
        if let Some(v) = var("QBO_BASE_URL") {
            acct.base_url = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = var("QBO_REALM_ID") {
            acct.realm_id = v;
        }
        if let Some(v) = var("QBO_MINOR_VERSION") {
            acct.minor_version = parse_number("QBO_MINOR_VERSION", &v)?;
        }
        if let Some(v) = var("QBO_TOKEN_URL") {
            acct.token_url = v;
        }
        acct.client_id = var("QBO_CLIENT_ID").unwrap_or_default();
        acct.client_secret = var("QBO_CLIENT_SECRET").unwrap_or_default();
        acct.access_token = var("QBO_ACCESS_TOKEN");
        acct.refresh_token = var("QBO_REFRESH_TOKEN");
        if let Some(v) = var("QBO_REQUEST_TIMEOUT_SECS") {
            acct.request_timeout_secs = parse_number("QBO_REQUEST_TIMEOUT_SECS", &v)?;
        }

        if let Some(v) = var("REPORT_RETRY_ATTEMPTS") {
            config.retry.max_attempts = parse_number("REPORT_RETRY_ATTEMPTS", &v)?;
        }
        if let Some(v) = var("REPORT_RETRY_BASE_DELAY_MS") {
            config.retry.base_delay_ms = parse_number("REPORT_RETRY_BASE_DELAY_MS", &v)?;
        }
        if config.retry.max_attempts == 0 {
            return Err(LedgerError::Configuration(
                "REPORT_RETRY_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        config.oracle.api_key = var("GEMINI_API_KEY").unwrap_or_default();
        if let Some(v) = var("GEMINI_MODEL") {
            config.oracle.model = v;
        }

        if let Some(v) = var("PORT").or_else(|| var("API_PORT")) {
            config.server.port = parse_number("PORT", &v)?;
        }
        if let Some(v) = var("HISTORY_TURNS") {
            config.history_turns = parse_number("HISTORY_TURNS", &v)?;
        }

        Ok(config)
    }
}

fn var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.parse::<T>().map_err(|_| {
        LedgerError::Configuration(format!("{} must be a number, got '{}'", name, value))
    })
}
