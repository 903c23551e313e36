//! Platform-side facts about a channel and the bot inside it.

use serde::{Deserialize, Serialize};

use crate::permissions::PermissionSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Channel,
    Group,
    Supergroup,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Channel => "channel",
            ChannelKind::Group => "group",
            ChannelKind::Supergroup => "supergroup",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "channel" => Some(ChannelKind::Channel),
            "group" => Some(ChannelKind::Group),
            "supergroup" => Some(ChannelKind::Supergroup),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: i64,
    pub handle: String,
    pub title: String,
    pub kind: ChannelKind,
    pub member_count: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipStatus {
    Administrator,
    Member,
    NotMember,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub status: MembershipStatus,
    pub permissions: PermissionSet,
}

impl Membership {
    pub fn is_admin(&self) -> bool {
        self.status == MembershipStatus::Administrator
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotIdentity {
    pub id: i64,
    pub username: Option<String>,
}

/// Credentials the external directory hands out for an account.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotCredentials {
    pub bot_id: i64,
    pub bot_token: String,
}

impl std::fmt::Debug for BotCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotCredentials")
            .field("bot_id", &self.bot_id)
            .field("bot_token", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_kind_parse() {
        assert_eq!(ChannelKind::parse("Supergroup"), Some(ChannelKind::Supergroup));
        assert_eq!(ChannelKind::parse("channel"), Some(ChannelKind::Channel));
        assert_eq!(ChannelKind::parse("private"), None);
        assert_eq!(ChannelKind::Group.as_str(), "group");
    }

    #[test]
    fn test_credentials_debug_redacts_token() {
        let creds = BotCredentials {
            bot_id: 42,
            bot_token: "42:secret".into(),
        };
        let debug = format!("{creds:?}");
        assert!(debug.contains("42"));
        assert!(!debug.contains("secret"));
    }
}
