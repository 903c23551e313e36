//! Account to bot-token lookup.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::channel::BotCredentials;
use crate::config::Config;
use crate::error::ChanguardError;

const AUTH_SERVICE_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait CredentialDirectory: Send + Sync {
    /// Fails with `AccountNotFound` when the account is unknown or has no usable token.
    async fn get_bot_credentials(&self, account_id: &str) -> Result<BotCredentials, ChanguardError>;
}

/// Bot ids are the numeric prefix of the token (`<id>:<secret>`).
pub fn bot_id_from_token(token: &str) -> Option<i64> {
    token.split_once(':')?.0.trim().parse().ok()
}

#[derive(Clone, Debug, Default)]
pub struct StaticCredentialDirectory {
    accounts: BTreeMap<String, BotCredentials>,
}

impl StaticCredentialDirectory {
    pub fn new(accounts: BTreeMap<String, BotCredentials>) -> Self {
        StaticCredentialDirectory { accounts }
    }

    pub fn with_account(mut self, account_id: &str, credentials: BotCredentials) -> Self {
        self.accounts.insert(account_id.to_string(), credentials);
        self
    }
}

#[async_trait]
impl CredentialDirectory for StaticCredentialDirectory {
    async fn get_bot_credentials(&self, account_id: &str) -> Result<BotCredentials, ChanguardError> {
        self.accounts
            .get(account_id)
            .cloned()
            .ok_or_else(|| ChanguardError::AccountNotFound(account_id.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct AccountRecord {
    #[serde(default)]
    bot_id: Option<i64>,
    #[serde(default)]
    bot_token: Option<String>,
    #[serde(default)]
    is_active: Option<bool>,
}

/// Looks accounts up in the external auth service (`GET /api/accounts/{id}`).
pub struct HttpCredentialDirectory {
    http: reqwest::Client,
    base_url: reqwest::Url,
    service_token: Option<String>,
}

impl HttpCredentialDirectory {
    pub fn new(base_url: &str, service_token: Option<String>) -> Result<Self, ChanguardError> {
        let base_url = reqwest::Url::parse(base_url)
            .map_err(|e| ChanguardError::Config(format!("invalid auth_service_url: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ChanguardError::Config(format!(
                "invalid auth_service_url: {base_url}"
            )));
        }
        let http = reqwest::Client::builder()
            .timeout(AUTH_SERVICE_TIMEOUT)
            .build()?;
        Ok(HttpCredentialDirectory {
            http,
            base_url,
            service_token,
        })
    }

    fn account_url(&self, account_id: &str) -> reqwest::Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["api", "accounts", account_id]);
        }
        url
    }
}

#[async_trait]
impl CredentialDirectory for HttpCredentialDirectory {
    async fn get_bot_credentials(&self, account_id: &str) -> Result<BotCredentials, ChanguardError> {
        let mut request = self.http.get(self.account_url(account_id));
        if let Some(token) = &self.service_token {
            request = request.header("X-Service-Token", token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ChanguardError::Transport(format!("auth service: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ChanguardError::AccountNotFound(account_id.to_string()));
        }
        if !status.is_success() {
            warn!(account_id, status = status.as_u16(), "Auth service lookup failed");
            return Err(ChanguardError::Transport(format!(
                "auth service returned HTTP {status}"
            )));
        }

        let record: AccountRecord = response.json().await?;
        if record.is_active == Some(false) {
            debug!(account_id, "Account is inactive");
            return Err(ChanguardError::AccountNotFound(account_id.to_string()));
        }
        let Some(bot_token) = record.bot_token.filter(|t| !t.trim().is_empty()) else {
            warn!(account_id, "Auth service returned an account without a bot token");
            return Err(ChanguardError::AccountNotFound(account_id.to_string()));
        };
        let Some(bot_id) = record.bot_id.or_else(|| bot_id_from_token(&bot_token)) else {
            return Err(ChanguardError::AccountNotFound(account_id.to_string()));
        };
        Ok(BotCredentials { bot_id, bot_token })
    }
}

/// Tries each directory in order; `AccountNotFound` falls through to the next.
pub struct CredentialChain {
    sources: Vec<Arc<dyn CredentialDirectory>>,
}

impl CredentialChain {
    pub fn new(sources: Vec<Arc<dyn CredentialDirectory>>) -> Self {
        CredentialChain { sources }
    }

    pub fn from_config(config: &Config) -> Result<Self, ChanguardError> {
        let mut sources: Vec<Arc<dyn CredentialDirectory>> = Vec::new();
        if !config.accounts.is_empty() {
            sources.push(Arc::new(StaticCredentialDirectory::new(
                config.accounts.clone(),
            )));
        }
        if let Some(url) = &config.auth_service_url {
            sources.push(Arc::new(HttpCredentialDirectory::new(
                url,
                config.auth_service_token.clone(),
            )?));
        }
        Ok(CredentialChain::new(sources))
    }
}

#[async_trait]
impl CredentialDirectory for CredentialChain {
    async fn get_bot_credentials(&self, account_id: &str) -> Result<BotCredentials, ChanguardError> {
        for source in &self.sources {
            match source.get_bot_credentials(account_id).await {
                Err(ChanguardError::AccountNotFound(_)) => continue,
                other => return other,
            }
        }
        Err(ChanguardError::AccountNotFound(account_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(bot_id: i64) -> BotCredentials {
        BotCredentials {
            bot_id,
            bot_token: format!("{bot_id}:secret"),
        }
    }

    #[test]
    fn test_bot_id_from_token() {
        assert_eq!(bot_id_from_token("123456:ABC-def"), Some(123456));
        assert_eq!(bot_id_from_token("nocolon"), None);
        assert_eq!(bot_id_from_token("abc:def"), None);
    }

    #[tokio::test]
    async fn test_static_directory_lookup() {
        let dir = StaticCredentialDirectory::default().with_account("acct-1", creds(7));
        assert_eq!(dir.get_bot_credentials("acct-1").await.unwrap().bot_id, 7);
        assert!(matches!(
            dir.get_bot_credentials("acct-2").await,
            Err(ChanguardError::AccountNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_chain_falls_through_on_not_found() {
        let first: Arc<dyn CredentialDirectory> =
            Arc::new(StaticCredentialDirectory::default().with_account("a", creds(1)));
        let second: Arc<dyn CredentialDirectory> =
            Arc::new(StaticCredentialDirectory::default().with_account("b", creds(2)));
        let chain = CredentialChain::new(vec![first, second]);
        assert_eq!(chain.get_bot_credentials("a").await.unwrap().bot_id, 1);
        assert_eq!(chain.get_bot_credentials("b").await.unwrap().bot_id, 2);
        assert!(matches!(
            chain.get_bot_credentials("c").await,
            Err(ChanguardError::AccountNotFound(_))
        ));
    }

    #[test]
    fn test_account_url_escapes_account_id() {
        let dir = HttpCredentialDirectory::new("https://auth.example.com/base/", None).unwrap();
        assert_eq!(
            dir.account_url("team a/1").as_str(),
            "https://auth.example.com/base/api/accounts/team%20a%2F1"
        );
    }

    #[test]
    fn test_http_directory_rejects_bad_url() {
        assert!(matches!(
            HttpCredentialDirectory::new("not a url", None),
            Err(ChanguardError::Config(_))
        ));
    }
}
