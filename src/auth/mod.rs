//! Token lifecycle management
//!
//! Owns the OAuth access/refresh token pair. Callers see only
//! `has_access` / `can_refresh` and never touch the token state directly.
//! A refresh happens at most once per triggering failure.

use crate::audit::AuditSink;
use crate::config::AccountingConfig;
use crate::error::LedgerError;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Tokens are treated as expired this long before their real expiry
const EXPIRY_SKEW_SECS: i64 = 60;

/// Result of a successful authorization or refresh
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_expires_in")]
    pub expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

#[derive(Debug, Clone)]
struct TokenState {
    access_token: String,
    refresh_token: Option<String>,
    expires_at: DateTime<Utc>,
}

impl TokenState {
    fn from_grant(grant: TokenGrant, previous_refresh: Option<String>) -> Self {
        Self {
            access_token: grant.access_token,
            // Providers may omit the refresh token when it did not rotate.
            refresh_token: grant.refresh_token.or(previous_refresh),
            expires_at: Utc::now() + Duration::seconds(grant.expires_in),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at - Duration::seconds(EXPIRY_SKEW_SECS) <= Utc::now()
    }
}

/// Exchanges a refresh token for a new grant
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant>;
}

/// OAuth2 refresh against the provider's token endpoint
pub struct OAuthRefresher {
    client: Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl OAuthRefresher {
    pub fn new(config: &AccountingConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            token_url: config.token_url.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
        })
    }
}

#[async_trait]
impl TokenRefresher for OAuthRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
        if self.client_id.is_empty() {
            return Err(LedgerError::Configuration(
                "QBO_CLIENT_ID is not configured".to_string(),
            ));
        }

        let response = self
            .client
            .post(&self.token_url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .header("Accept", "application/json")
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LedgerError::AuthExpired(format!(
                "token endpoint returned {}: {}",
                status, body
            )));
        }

        let grant = response.json::<TokenGrant>().await.map_err(|e| {
            LedgerError::MalformedResponse(format!("invalid token response: {}", e))
        })?;
        Ok(grant)
    }
}

pub struct TokenManager {
    state: RwLock<Option<TokenState>>,
    refresher: Arc<dyn TokenRefresher>,
    audit: Arc<dyn AuditSink>,
}

impl TokenManager {
    pub fn new(refresher: Arc<dyn TokenRefresher>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            state: RwLock::new(None),
            refresher,
            audit,
        }
    }

    /// Seed from configuration. An access token without a known expiry is
    /// assumed to live for `access_token_ttl_secs`; a refresh token alone
    /// yields an already-expired state that refreshes on first use.
    pub async fn from_config(
        config: &AccountingConfig,
        refresher: Arc<dyn TokenRefresher>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let manager = Self::new(refresher, audit);
        match (&config.access_token, &config.refresh_token) {
            (Some(access), refresh) => {
                manager
                    .authorize(TokenGrant {
                        access_token: access.clone(),
                        refresh_token: refresh.clone(),
                        expires_in: config.access_token_ttl_secs,
                    })
                    .await;
            }
            (None, Some(refresh)) => {
                manager
                    .authorize(TokenGrant {
                        access_token: String::new(),
                        refresh_token: Some(refresh.clone()),
                        expires_in: 0,
                    })
                    .await;
            }
            (None, None) => {}
        }
        manager
    }

    /// Install a grant obtained from a successful authorization.
    pub async fn authorize(&self, grant: TokenGrant) {
        let mut state = self.state.write().await;
        *state = Some(TokenState::from_grant(grant, None));
        self.audit.record("token_authorize", "grant installed", "ok");
    }

    /// True iff a non-expired access token is held
    pub async fn has_access(&self) -> bool {
        self.state
            .read()
            .await
            .as_ref()
            .map(|s| !s.access_token.is_empty() && !s.is_expired())
            .unwrap_or(false)
    }

    pub async fn can_refresh(&self) -> bool {
        self.state
            .read()
            .await
            .as_ref()
            .map(|s| s.refresh_token.is_some())
            .unwrap_or(false)
    }

    /// Return a usable access token, refreshing once if it has expired.
    pub async fn ensure_access(&self) -> Result<String> {
        let current = {
            let state = self.state.read().await;
            match state.as_ref() {
                None => {
                    return Err(LedgerError::AuthRequired(
                        "no access token and no refresh capability".to_string(),
                    ))
                }
                Some(s) if !s.access_token.is_empty() && !s.is_expired() => {
                    return Ok(s.access_token.clone())
                }
                Some(s) if s.refresh_token.is_none() => {
                    return Err(LedgerError::AuthExpired(
                        "access token expired and no refresh token is held".to_string(),
                    ))
                }
                Some(s) => s.access_token.clone(),
            }
        };

        self.refresh_once(&current).await
    }

    /// Run `request` with the current token. On a 401, refresh exactly once
    /// and retry exactly once; a second 401 is surfaced as `AuthExpired`.
    pub async fn refresh_and_retry_once<T, F, Fut>(&self, request: F) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let token = self.ensure_access().await?;

        match request(token.clone()).await {
            Err(LedgerError::Unauthorized(detail)) => {
                if !self.can_refresh().await {
                    return Err(LedgerError::AuthExpired(detail));
                }
                warn!("Accounting API rejected token; refreshing once");
                let fresh = self.refresh_once(&token).await?;
                request(fresh).await.map_err(|e| match e {
                    LedgerError::Unauthorized(detail) => LedgerError::AuthExpired(format!(
                        "rejected again after refresh: {}",
                        detail
                    )),
                    other => other,
                })
            }
            other => other,
        }
    }

    /// Clear all token state. Idempotent.
    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        let had_state = state.take().is_some();
        if had_state {
            self.audit.record("token_reset", "token state cleared", "ok");
        }
    }

    /// Refresh under the write lock. If another caller already replaced
    /// `stale_token`, reuse their result instead of refreshing again.
    async fn refresh_once(&self, stale_token: &str) -> Result<String> {
        let mut state = self.state.write().await;

        let current = state.as_ref().ok_or_else(|| {
            LedgerError::AuthRequired("token state was reset".to_string())
        })?;

        if current.access_token != stale_token && !current.is_expired() {
            return Ok(current.access_token.clone());
        }

        let refresh_token = current.refresh_token.clone().ok_or_else(|| {
            LedgerError::AuthExpired("no refresh token is held".to_string())
        })?;

        match self.refresher.refresh(&refresh_token).await {
            Ok(grant) => {
                let next = TokenState::from_grant(grant, Some(refresh_token));
                let access = next.access_token.clone();
                *state = Some(next);
                info!("Access token refreshed");
                self.audit.record("token_refresh", "refresh attempt", "ok");
                Ok(access)
            }
            Err(e) => {
                warn!(error = %e, "Token refresh failed");
                self.audit.record("token_refresh", "refresh attempt", &format!("failed: {}", e));
                Err(LedgerError::AuthExpired(format!("refresh failed: {}", e)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRefresher {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingRefresher {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl TokenRefresher for CountingRefresher {
        async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                return Err(LedgerError::AuthExpired("invalid_grant".to_string()));
            }
            Ok(TokenGrant {
                access_token: format!("fresh-{}", n),
                refresh_token: None,
                expires_in: 3600,
            })
        }
    }

    async fn manager_with(
        refresher: Arc<CountingRefresher>,
        grant: Option<TokenGrant>,
    ) -> (TokenManager, Arc<AuditLog>) {
        let audit = Arc::new(AuditLog::new());
        let manager = TokenManager::new(refresher, audit.clone());
        if let Some(grant) = grant {
            manager.authorize(grant).await;
        }
        (manager, audit)
    }

    fn live_grant() -> TokenGrant {
        TokenGrant {
            access_token: "live".to_string(),
            refresh_token: Some("r1".to_string()),
            expires_in: 3600,
        }
    }

    #[tokio::test]
    async fn test_no_token_requires_auth() {
        let (manager, _) = manager_with(CountingRefresher::new(false), None).await;
        assert!(!manager.has_access().await);
        assert!(!manager.can_refresh().await);
        let err = manager.ensure_access().await.unwrap_err();
        assert!(matches!(err, LedgerError::AuthRequired(_)));
    }

    #[tokio::test]
    async fn test_expired_token_refreshes_once() {
        let refresher = CountingRefresher::new(false);
        let expired = TokenGrant {
            access_token: "old".to_string(),
            refresh_token: Some("r1".to_string()),
            expires_in: 0,
        };
        let (manager, audit) = manager_with(refresher.clone(), Some(expired)).await;

        assert!(!manager.has_access().await);
        let token = manager.ensure_access().await.unwrap();
        assert_eq!(token, "fresh-1");
        assert!(manager.has_access().await);
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(audit.entries_for("token_refresh").len(), 1);
    }

    #[tokio::test]
    async fn test_failed_refresh_is_auth_expired() {
        let expired = TokenGrant {
            access_token: "old".to_string(),
            refresh_token: Some("r1".to_string()),
            expires_in: 0,
        };
        let (manager, _) = manager_with(CountingRefresher::new(true), Some(expired)).await;
        let err = manager.ensure_access().await.unwrap_err();
        assert!(matches!(err, LedgerError::AuthExpired(_)));
    }

    #[tokio::test]
    async fn test_request_runs_once_without_401() {
        let (manager, _) = manager_with(CountingRefresher::new(false), Some(live_grant())).await;
        let calls = AtomicUsize::new(0);

        let result = manager
            .refresh_and_retry_once(|token| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, LedgerError>(token) }
            })
            .await;

        tokio_test::assert_ok!(&result);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_single_401_retries_with_fresh_token() {
        let refresher = CountingRefresher::new(false);
        let (manager, _) = manager_with(refresher.clone(), Some(live_grant())).await;
        let calls = AtomicUsize::new(0);

        let result = manager
            .refresh_and_retry_once(|token| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if token == "live" {
                        Err(LedgerError::Unauthorized("401".to_string()))
                    } else {
                        Ok(token)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "fresh-1");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_repeated_401_is_not_retried_again() {
        let refresher = CountingRefresher::new(false);
        let (manager, _) = manager_with(refresher.clone(), Some(live_grant())).await;
        let calls = AtomicUsize::new(0);

        let result: Result<()> = manager
            .refresh_and_retry_once(|_token| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(LedgerError::Unauthorized("401".to_string())) }
            })
            .await;

        assert!(matches!(result, Err(LedgerError::AuthExpired(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_401_without_refresh_token() {
        let grant = TokenGrant {
            access_token: "live".to_string(),
            refresh_token: None,
            expires_in: 3600,
        };
        let (manager, _) = manager_with(CountingRefresher::new(false), Some(grant)).await;
        let calls = AtomicUsize::new(0);

        let result: Result<()> = manager
            .refresh_and_retry_once(|_token| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(LedgerError::Unauthorized("401".to_string())) }
            })
            .await;

        assert!(matches!(result, Err(LedgerError::AuthExpired(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reset_is_idempotent() {
        let (manager, audit) =
            manager_with(CountingRefresher::new(false), Some(live_grant())).await;
        assert!(manager.has_access().await);

        manager.reset().await;
        manager.reset().await;

        assert!(!manager.has_access().await);
        assert!(!manager.can_refresh().await);
        assert_eq!(audit.entries_for("token_reset").len(), 1);
    }

    #[tokio::test]
    async fn test_from_config_with_refresh_token_only() {
        let config = AccountingConfig {
            refresh_token: Some("r1".to_string()),
            ..AccountingConfig::default()
        };
        let refresher = CountingRefresher::new(false);
        let manager =
            TokenManager::from_config(&config, refresher.clone(), Arc::new(AuditLog::new())).await;

        assert!(!manager.has_access().await);
        assert!(manager.can_refresh().await);
        assert_eq!(manager.ensure_access().await.unwrap(), "fresh-1");
    }
}
