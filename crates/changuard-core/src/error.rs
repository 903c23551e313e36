use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable, serializable failure code exposed to callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AccountNotFound,
    ChannelNotFound,
    ChannelPrivate,
    BotNotMember,
    BotNotAdmin,
    InsufficientPermissions,
    InvalidBotToken,
    RateLimited,
    TransportError,
    NotConfigured,
    StorageUnavailable,
    InvalidRequest,
    Internal,
}

#[derive(Error, Debug)]
pub enum ChanguardError {
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    #[error("Channel is private or inaccessible: {0}")]
    ChannelPrivate(String),

    #[error("Bot is not a member of the channel")]
    BotNotMember,

    #[error("Bot is not an administrator in the channel")]
    BotNotAdmin,

    #[error("Bot lacks required permissions: {0}")]
    InsufficientPermissions(String),

    #[error("Invalid bot token")]
    InvalidBotToken,

    #[error("Rate limited by platform, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("No channel configured for account {0}")]
    NotConfigured(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ChanguardError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ChanguardError::AccountNotFound(_) => ErrorCode::AccountNotFound,
            ChanguardError::ChannelNotFound(_) => ErrorCode::ChannelNotFound,
            ChanguardError::ChannelPrivate(_) => ErrorCode::ChannelPrivate,
            ChanguardError::BotNotMember => ErrorCode::BotNotMember,
            ChanguardError::BotNotAdmin => ErrorCode::BotNotAdmin,
            ChanguardError::InsufficientPermissions(_) => ErrorCode::InsufficientPermissions,
            ChanguardError::InvalidBotToken => ErrorCode::InvalidBotToken,
            ChanguardError::RateLimited { .. } => ErrorCode::RateLimited,
            ChanguardError::Transport(_) | ChanguardError::Http(_) => ErrorCode::TransportError,
            ChanguardError::NotConfigured(_) => ErrorCode::NotConfigured,
            ChanguardError::Database(_) | ChanguardError::Io(_) => ErrorCode::StorageUnavailable,
            ChanguardError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            ChanguardError::Json(_) | ChanguardError::Config(_) | ChanguardError::Internal(_) => {
                ErrorCode::Internal
            }
        }
    }

    /// Platform and transport failures are retried inside the gateway; nothing else is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChanguardError::RateLimited { .. } | ChanguardError::Transport(_) | ChanguardError::Http(_)
        )
    }

    /// Failures that describe the channel or bot rather than this process.
    /// These are persisted as the outcome of a validation attempt.
    pub fn is_validation_outcome(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::ChannelNotFound
                | ErrorCode::ChannelPrivate
                | ErrorCode::BotNotMember
                | ErrorCode::BotNotAdmin
                | ErrorCode::InsufficientPermissions
                | ErrorCode::InvalidBotToken
                | ErrorCode::RateLimited
                | ErrorCode::TransportError
        )
    }
}
