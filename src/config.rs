use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::BotCredentials;
use crate::error::ChanguardError;

fn default_data_dir() -> String {
    "./changuard.data".into()
}
fn default_telegram_api_base() -> String {
    "https://api.telegram.org".into()
}
fn default_gateway_timeout_secs() -> u64 {
    10
}
fn default_gateway_max_attempts() -> u32 {
    3
}
fn default_gateway_backoff_base_ms() -> u64 {
    500
}
fn default_gateway_max_retry_after_secs() -> u64 {
    30
}
fn default_validation_deadline_secs() -> u64 {
    60
}
fn default_revalidation_enabled() -> bool {
    true
}
fn default_revalidation_interval_mins() -> u64 {
    60
}
fn default_staleness_threshold_mins() -> u64 {
    60
}
fn default_revalidation_concurrency() -> usize {
    5
}
fn default_revalidation_batch_limit() -> usize {
    500
}
fn default_history_retention_days() -> u64 {
    30
}
fn default_prune_interval_hours() -> u64 {
    24
}
fn default_web_enabled() -> bool {
    true
}
fn default_web_host() -> String {
    "127.0.0.1".into()
}
fn default_web_port() -> u16 {
    8002
}

fn is_http_url(raw: &str) -> bool {
    let lower = raw.trim().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_telegram_api_base")]
    pub telegram_api_base: String,
    #[serde(default = "default_gateway_timeout_secs")]
    pub gateway_timeout_secs: u64,
    #[serde(default = "default_gateway_max_attempts")]
    pub gateway_max_attempts: u32,
    #[serde(default = "default_gateway_backoff_base_ms")]
    pub gateway_backoff_base_ms: u64,
    #[serde(default = "default_gateway_max_retry_after_secs")]
    pub gateway_max_retry_after_secs: u64,
    #[serde(default = "default_validation_deadline_secs")]
    pub validation_deadline_secs: u64,
    #[serde(default = "default_revalidation_enabled")]
    pub revalidation_enabled: bool,
    #[serde(default = "default_revalidation_interval_mins")]
    pub revalidation_interval_mins: u64,
    #[serde(default = "default_staleness_threshold_mins")]
    pub staleness_threshold_mins: u64,
    #[serde(default = "default_revalidation_concurrency")]
    pub revalidation_concurrency: usize,
    #[serde(default = "default_revalidation_batch_limit")]
    pub revalidation_batch_limit: usize,
    #[serde(default = "default_history_retention_days")]
    pub history_retention_days: u64,
    #[serde(default = "default_prune_interval_hours")]
    pub prune_interval_hours: u64,
    #[serde(default = "default_web_enabled")]
    pub web_enabled: bool,
    #[serde(default = "default_web_host")]
    pub web_host: String,
    #[serde(default = "default_web_port")]
    pub web_port: u16,
    /// External account service that hands out bot tokens.
    #[serde(default)]
    pub auth_service_url: Option<String>,
    #[serde(default)]
    pub auth_service_token: Option<String>,
    /// Statically configured accounts, consulted before the auth service.
    #[serde(default)]
    pub accounts: BTreeMap<String, BotCredentials>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: default_data_dir(),
            telegram_api_base: default_telegram_api_base(),
            gateway_timeout_secs: default_gateway_timeout_secs(),
            gateway_max_attempts: default_gateway_max_attempts(),
            gateway_backoff_base_ms: default_gateway_backoff_base_ms(),
            gateway_max_retry_after_secs: default_gateway_max_retry_after_secs(),
            validation_deadline_secs: default_validation_deadline_secs(),
            revalidation_enabled: default_revalidation_enabled(),
            revalidation_interval_mins: default_revalidation_interval_mins(),
            staleness_threshold_mins: default_staleness_threshold_mins(),
            revalidation_concurrency: default_revalidation_concurrency(),
            revalidation_batch_limit: default_revalidation_batch_limit(),
            history_retention_days: default_history_retention_days(),
            prune_interval_hours: default_prune_interval_hours(),
            web_enabled: default_web_enabled(),
            web_host: default_web_host(),
            web_port: default_web_port(),
            auth_service_url: None,
            auth_service_token: None,
            accounts: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn data_root_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }

    /// Runtime data directory (database and logs).
    pub fn runtime_data_dir(&self) -> String {
        self.data_root_dir()
            .join("runtime")
            .to_string_lossy()
            .to_string()
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_timeout_secs)
    }

    pub fn validation_deadline(&self) -> Duration {
        Duration::from_secs(self.validation_deadline_secs)
    }

    pub fn revalidation_interval(&self) -> Duration {
        Duration::from_secs(self.revalidation_interval_mins * 60)
    }

    pub fn staleness_threshold(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.staleness_threshold_mins as i64)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_hours * 3600)
    }

    pub fn history_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.history_retention_days as i64)
    }

    pub fn resolve_config_path() -> Result<Option<PathBuf>, ChanguardError> {
        if let Ok(custom) = std::env::var("CHANGUARD_CONFIG") {
            if std::path::Path::new(&custom).exists() {
                return Ok(Some(PathBuf::from(custom)));
            }
            return Err(ChanguardError::Config(format!(
                "CHANGUARD_CONFIG points to non-existent file: {custom}"
            )));
        }

        for candidate in ["./changuard.config.yaml", "./changuard.config.yml"] {
            if std::path::Path::new(candidate).exists() {
                return Ok(Some(PathBuf::from(candidate)));
            }
        }
        Ok(None)
    }

    pub fn load() -> Result<Self, ChanguardError> {
        let Some(path) = Self::resolve_config_path()? else {
            return Err(ChanguardError::Config(
                "No changuard.config.yaml found. Set CHANGUARD_CONFIG or create one in the working directory.".into(),
            ));
        };
        let path_str = path.to_string_lossy().to_string();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| ChanguardError::Config(format!("Failed to read {path_str}: {e}")))?;
        Self::from_yaml_str(&content)
            .map_err(|e| ChanguardError::Config(format!("{path_str}: {e}")))
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ChanguardError> {
        let mut config: Config = serde_yaml::from_str(content)
            .map_err(|e| ChanguardError::Config(format!("Failed to parse config: {e}")))?;
        config.post_deserialize()?;
        Ok(config)
    }

    /// Apply post-deserialization normalization and validation.
    pub fn post_deserialize(&mut self) -> Result<(), ChanguardError> {
        if self.data_dir.trim().is_empty() {
            self.data_dir = default_data_dir();
        }
        self.telegram_api_base = self.telegram_api_base.trim().trim_end_matches('/').to_string();
        if self.telegram_api_base.is_empty() {
            self.telegram_api_base = default_telegram_api_base();
        }
        if !is_http_url(&self.telegram_api_base) {
            return Err(ChanguardError::Config(format!(
                "telegram_api_base must be an http(s) URL: {}",
                self.telegram_api_base
            )));
        }
        if self.web_host.trim().is_empty() {
            self.web_host = default_web_host();
        }

        if self.gateway_timeout_secs == 0 {
            self.gateway_timeout_secs = default_gateway_timeout_secs();
        }
        if self.gateway_max_attempts == 0 {
            self.gateway_max_attempts = default_gateway_max_attempts();
        }
        if self.gateway_backoff_base_ms == 0 {
            self.gateway_backoff_base_ms = default_gateway_backoff_base_ms();
        }
        if self.gateway_max_retry_after_secs == 0 {
            self.gateway_max_retry_after_secs = default_gateway_max_retry_after_secs();
        }
        if self.validation_deadline_secs == 0 {
            self.validation_deadline_secs = default_validation_deadline_secs();
        }
        if self.revalidation_interval_mins == 0 {
            self.revalidation_interval_mins = default_revalidation_interval_mins();
        }
        if self.staleness_threshold_mins == 0 {
            self.staleness_threshold_mins = default_staleness_threshold_mins();
        }
        if self.revalidation_concurrency == 0 {
            self.revalidation_concurrency = default_revalidation_concurrency();
        }
        if self.revalidation_batch_limit == 0 {
            self.revalidation_batch_limit = default_revalidation_batch_limit();
        }
        if self.history_retention_days == 0 {
            self.history_retention_days = default_history_retention_days();
        }
        if self.prune_interval_hours == 0 {
            self.prune_interval_hours = default_prune_interval_hours();
        }

        if let Some(url) = &self.auth_service_url {
            let trimmed = url.trim().trim_end_matches('/').to_string();
            if trimmed.is_empty() {
                self.auth_service_url = None;
            } else if !is_http_url(&trimmed) {
                return Err(ChanguardError::Config(format!(
                    "auth_service_url must be an http(s) URL: {trimmed}"
                )));
            } else {
                self.auth_service_url = Some(trimmed);
            }
        }
        if let Some(token) = &self.auth_service_token {
            if token.trim().is_empty() {
                self.auth_service_token = None;
            }
        }

        for (account_id, creds) in &self.accounts {
            if account_id.trim().is_empty() {
                return Err(ChanguardError::Config("accounts: empty account id".into()));
            }
            if creds.bot_token.trim().is_empty() {
                return Err(ChanguardError::Config(format!(
                    "accounts.{account_id}: bot_token is required"
                )));
            }
        }
        if self.accounts.is_empty() && self.auth_service_url.is_none() {
            return Err(ChanguardError::Config(
                "No credential source configured: set auth_service_url or add entries under accounts".into(),
            ));
        }
        Ok(())
    }
}
