//! Calls to the messaging platform.
//!
//! [`TelegramGateway`] makes exactly one HTTP request per call and translates
//! Bot API answers into [`ChanguardError`] variants. [`RetryingGateway`] wraps
//! any [`GatewayClient`] with the bounded retry policy, so callers above it
//! only ever see the final outcome.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::channel::{BotIdentity, ChannelInfo, ChannelKind, Membership, MembershipStatus};
use crate::config::Config;
use crate::error::ChanguardError;
use crate::permissions::{PermissionSet, ALL_PERMISSIONS};

#[async_trait]
pub trait GatewayClient: Send + Sync {
    async fn resolve_channel(
        &self,
        bot_token: &str,
        channel_handle: &str,
    ) -> Result<ChannelInfo, ChanguardError>;

    async fn resolve_bot_membership(
        &self,
        bot_token: &str,
        channel_id: i64,
        bot_id: i64,
    ) -> Result<Membership, ChanguardError>;

    async fn resolve_bot_identity(&self, bot_token: &str) -> Result<BotIdentity, ChanguardError>;

    /// Reachability check used by health reporting.
    async fn probe(&self) -> Result<(), ChanguardError> {
        Ok(())
    }
}

const MAX_HANDLE_LEN: usize = 32;

/// Canonical form of a user-supplied channel reference: `@name` for public
/// handles, the number itself for numeric chat ids.
pub fn normalize_channel_handle(raw: &str) -> Result<String, ChanguardError> {
    let trimmed = raw.trim();
    if trimmed.parse::<i64>().is_ok() {
        return Ok(trimmed.to_string());
    }
    let without_link = ["https://t.me/", "http://t.me/", "t.me/"]
        .iter()
        .find_map(|prefix| trimmed.strip_prefix(prefix))
        .unwrap_or(trimmed);
    let name = without_link.strip_prefix('@').unwrap_or(without_link);

    let valid = !name.is_empty()
        && name.len() <= MAX_HANDLE_LEN
        && name.starts_with(|c: char| c.is_ascii_alphabetic())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(ChanguardError::ChannelNotFound(raw.trim().to_string()));
    }
    Ok(format!("@{name}"))
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ApiChat {
    id: i64,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    members_count: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ApiChatMember {
    status: String,
    #[serde(default)]
    can_post_messages: Option<bool>,
    #[serde(default)]
    can_edit_messages: Option<bool>,
    #[serde(default)]
    can_delete_messages: Option<bool>,
    #[serde(default)]
    can_pin_messages: Option<bool>,
    #[serde(default)]
    can_send_media_messages: Option<bool>,
}

impl ApiChatMember {
    /// Fold the platform's optional flags into the closed permission set.
    fn permission_set(&self) -> PermissionSet {
        PermissionSet {
            can_post_messages: self.can_post_messages.unwrap_or(false),
            can_edit_messages: self.can_edit_messages.unwrap_or(false),
            can_delete_messages: self.can_delete_messages.unwrap_or(false),
            can_pin_messages: self.can_pin_messages.unwrap_or(false),
            can_send_media_messages: self.can_send_media_messages.unwrap_or(false),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiUser {
    id: i64,
    #[serde(default)]
    username: Option<String>,
}

/// A Bot API answer that was neither a success nor a retryable failure.
#[derive(Debug)]
enum ApiReply<T> {
    Success(T),
    Rejected { status: u16, description: String },
}

fn transport_error(e: reqwest::Error) -> ChanguardError {
    // The request URL embeds the bot token.
    let e = e.without_url();
    if e.is_timeout() {
        ChanguardError::Transport("request timed out".into())
    } else if e.is_connect() {
        ChanguardError::Transport(format!("connection failed: {e}"))
    } else {
        ChanguardError::Transport(e.to_string())
    }
}

fn mentions_missing_chat(description: &str) -> bool {
    let lower = description.to_ascii_lowercase();
    lower.contains("chat not found") || lower.contains("chat_id is empty")
}

pub struct TelegramGateway {
    http: reqwest::Client,
    api_base: String,
}

impl TelegramGateway {
    pub fn new(api_base: &str, timeout: Duration) -> Result<Self, ChanguardError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(TelegramGateway {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, ChanguardError> {
        Self::new(&config.telegram_api_base, config.gateway_timeout())
    }

    async fn call<T: DeserializeOwned>(
        &self,
        bot_token: &str,
        method: &str,
        params: &[(&str, String)],
    ) -> Result<ApiReply<T>, ChanguardError> {
        let url = format!("{}/bot{}/{}", self.api_base, bot_token, method);
        let response = self
            .http
            .get(&url)
            .query(params)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(transport_error)?;
        let envelope: Option<ApiEnvelope<T>> = serde_json::from_str(&body).ok();

        let retry_after = envelope
            .as_ref()
            .and_then(|e| e.parameters.as_ref())
            .and_then(|p| p.retry_after);
        if status == 429 || retry_after.is_some() {
            return Err(ChanguardError::RateLimited {
                retry_after_secs: retry_after.unwrap_or(1),
            });
        }
        if status >= 500 {
            return Err(ChanguardError::Transport(format!(
                "{method} failed with HTTP {status}"
            )));
        }

        match envelope {
            Some(ApiEnvelope {
                ok: true,
                result: Some(result),
                ..
            }) => Ok(ApiReply::Success(result)),
            Some(envelope) => Ok(ApiReply::Rejected {
                status,
                description: envelope
                    .description
                    .unwrap_or_else(|| format!("HTTP {status}")),
            }),
            None => Err(ChanguardError::Transport(format!(
                "{method} returned an unreadable response (HTTP {status})"
            ))),
        }
    }
}

#[async_trait]
impl GatewayClient for TelegramGateway {
    async fn resolve_channel(
        &self,
        bot_token: &str,
        channel_handle: &str,
    ) -> Result<ChannelInfo, ChanguardError> {
        let handle = normalize_channel_handle(channel_handle)?;
        let chat: ApiChat = match self
            .call(bot_token, "getChat", &[("chat_id", handle.clone())])
            .await?
        {
            ApiReply::Success(chat) => chat,
            ApiReply::Rejected {
                status,
                description,
            } => {
                debug!(handle = %handle, status, "getChat rejected: {description}");
                return Err(match status {
                    401 | 404 => ChanguardError::InvalidBotToken,
                    403 => ChanguardError::ChannelPrivate(handle),
                    _ if mentions_missing_chat(&description) => {
                        ChanguardError::ChannelNotFound(handle)
                    }
                    400 => ChanguardError::ChannelNotFound(handle),
                    _ => ChanguardError::Transport(description),
                });
            }
        };

        // Private chats are conversations with a user, never a channel.
        let Some(kind) = ChannelKind::parse(&chat.kind) else {
            return Err(ChanguardError::ChannelNotFound(handle));
        };
        Ok(ChannelInfo {
            id: chat.id,
            handle: chat.username.map(|u| format!("@{u}")).unwrap_or(handle),
            title: chat.title.unwrap_or_default(),
            kind,
            member_count: chat.members_count.unwrap_or(0),
        })
    }

    async fn resolve_bot_membership(
        &self,
        bot_token: &str,
        channel_id: i64,
        bot_id: i64,
    ) -> Result<Membership, ChanguardError> {
        let params = [
            ("chat_id", channel_id.to_string()),
            ("user_id", bot_id.to_string()),
        ];
        let member: ApiChatMember = match self.call(bot_token, "getChatMember", &params).await? {
            ApiReply::Success(member) => member,
            ApiReply::Rejected {
                status,
                description,
            } => {
                debug!(channel_id, status, "getChatMember rejected: {description}");
                return Err(match status {
                    401 | 404 => ChanguardError::InvalidBotToken,
                    400 | 403 => ChanguardError::BotNotMember,
                    _ => ChanguardError::Transport(description),
                });
            }
        };

        match member.status.as_str() {
            "creator" => Ok(Membership {
                status: MembershipStatus::Administrator,
                permissions: PermissionSet::from_granted(ALL_PERMISSIONS),
            }),
            "administrator" => Ok(Membership {
                status: MembershipStatus::Administrator,
                permissions: member.permission_set(),
            }),
            "member" | "restricted" => Ok(Membership {
                status: MembershipStatus::Member,
                permissions: PermissionSet::default(),
            }),
            "left" | "kicked" => Err(ChanguardError::BotNotMember),
            other => Err(ChanguardError::Transport(format!(
                "unexpected chat member status: {other}"
            ))),
        }
    }

    async fn resolve_bot_identity(&self, bot_token: &str) -> Result<BotIdentity, ChanguardError> {
        match self.call::<ApiUser>(bot_token, "getMe", &[]).await? {
            ApiReply::Success(user) => Ok(BotIdentity {
                id: user.id,
                username: user.username,
            }),
            ApiReply::Rejected { status, .. } if status == 401 || status == 404 => {
                Err(ChanguardError::InvalidBotToken)
            }
            ApiReply::Rejected { description, .. } => Err(ChanguardError::Transport(description)),
        }
    }

    async fn probe(&self) -> Result<(), ChanguardError> {
        // Any 4xx answer to a deliberately invalid token proves the API is reachable.
        match self.call::<ApiUser>("0:probe", "getMe", &[]).await {
            Ok(_) | Err(ChanguardError::RateLimited { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Bounded retry policy for platform calls.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub max_retry_after: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        RetryPolicy {
            max_attempts: config.gateway_max_attempts.max(1),
            backoff_base: Duration::from_millis(config.gateway_backoff_base_ms),
            max_retry_after: Duration::from_secs(config.gateway_max_retry_after_secs),
        }
    }

    /// How long to wait after failed attempt number `attempt` (1-based), or
    /// `None` when the error must be surfaced.
    pub fn delay_after(&self, error: &ChanguardError, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        match error {
            ChanguardError::RateLimited { retry_after_secs } if *retry_after_secs > 0 => {
                Some(Duration::from_secs(*retry_after_secs).min(self.max_retry_after))
            }
            ChanguardError::RateLimited { .. } => Some(self.backoff_base),
            e if e.is_retryable() => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                Some(self.backoff_base.saturating_mul(factor))
            }
            _ => None,
        }
    }
}

pub struct RetryingGateway<G> {
    inner: G,
    policy: RetryPolicy,
}

impl<G: GatewayClient> RetryingGateway<G> {
    pub fn new(inner: G, policy: RetryPolicy) -> Self {
        RetryingGateway { inner, policy }
    }

    async fn with_retry<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, ChanguardError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ChanguardError>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let Some(delay) = self.policy.delay_after(&e, attempt) else {
                        return Err(e);
                    };
                    warn!(
                        "{operation} failed ({e}), retrying in {:?} (attempt {attempt}/{})",
                        delay, self.policy.max_attempts
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[async_trait]
impl<G: GatewayClient> GatewayClient for RetryingGateway<G> {
    async fn resolve_channel(
        &self,
        bot_token: &str,
        channel_handle: &str,
    ) -> Result<ChannelInfo, ChanguardError> {
        let inner = &self.inner;
        self.with_retry("resolve_channel", move || {
            inner.resolve_channel(bot_token, channel_handle)
        })
        .await
    }

    async fn resolve_bot_membership(
        &self,
        bot_token: &str,
        channel_id: i64,
        bot_id: i64,
    ) -> Result<Membership, ChanguardError> {
        let inner = &self.inner;
        self.with_retry("resolve_bot_membership", move || {
            inner.resolve_bot_membership(bot_token, channel_id, bot_id)
        })
        .await
    }

    async fn resolve_bot_identity(&self, bot_token: &str) -> Result<BotIdentity, ChanguardError> {
        let inner = &self.inner;
        self.with_retry("resolve_bot_identity", move || {
            inner.resolve_bot_identity(bot_token)
        })
        .await
    }

    async fn probe(&self) -> Result<(), ChanguardError> {
        self.inner.probe().await
    }
}
