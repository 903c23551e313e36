//! Closed permission model and the permission policy.
//!
//! The platform reports bot capabilities as loose boolean flags. They are
//! normalized into [`PermissionSet`] at the gateway boundary so the policy here
//! stays exhaustive: every [`Permission`] is either required or recommended.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    #[serde(rename = "can_post_messages")]
    PostMessages,
    #[serde(rename = "can_edit_messages")]
    EditMessages,
    #[serde(rename = "can_delete_messages")]
    DeleteMessages,
    #[serde(rename = "can_pin_messages")]
    PinMessages,
    #[serde(rename = "can_send_media_messages")]
    SendMediaMessages,
}

pub const ALL_PERMISSIONS: [Permission; 5] = [
    Permission::PostMessages,
    Permission::EditMessages,
    Permission::DeleteMessages,
    Permission::PinMessages,
    Permission::SendMediaMessages,
];

/// Must all be granted for a channel to count as validated.
pub const REQUIRED_PERMISSIONS: [Permission; 2] =
    [Permission::PostMessages, Permission::EditMessages];

/// Reported for diagnostics only; never affects the verdict.
pub const RECOMMENDED_PERMISSIONS: [Permission; 3] = [
    Permission::DeleteMessages,
    Permission::PinMessages,
    Permission::SendMediaMessages,
];

impl Permission {
    pub fn key(&self) -> &'static str {
        match self {
            Permission::PostMessages => "can_post_messages",
            Permission::EditMessages => "can_edit_messages",
            Permission::DeleteMessages => "can_delete_messages",
            Permission::PinMessages => "can_pin_messages",
            Permission::SendMediaMessages => "can_send_media_messages",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Permission::PostMessages => "Post Messages",
            Permission::EditMessages => "Edit Messages",
            Permission::DeleteMessages => "Delete Messages",
            Permission::PinMessages => "Pin Messages",
            Permission::SendMediaMessages => "Send Media",
        }
    }

    pub fn is_required(&self) -> bool {
        REQUIRED_PERMISSIONS.contains(self)
    }

    fn purpose(&self) -> &'static str {
        match self {
            Permission::PostMessages => "required to publish announcements",
            Permission::EditMessages => "required to update published posts",
            Permission::DeleteMessages => "allows removing outdated posts",
            Permission::PinMessages => "allows pinning important announcements",
            Permission::SendMediaMessages => "allows attaching images and media to posts",
        }
    }
}

fn sort_by_key(perms: &mut [Permission]) {
    perms.sort_by_key(|p| p.key());
}

/// Capabilities observed for the bot in a channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionSet {
    pub can_post_messages: bool,
    pub can_edit_messages: bool,
    pub can_delete_messages: bool,
    pub can_pin_messages: bool,
    pub can_send_media_messages: bool,
}

impl PermissionSet {
    pub fn from_granted(granted: impl IntoIterator<Item = Permission>) -> Self {
        let mut set = PermissionSet::default();
        for p in granted {
            set.set(p, true);
        }
        set
    }

    pub fn set(&mut self, permission: Permission, value: bool) {
        match permission {
            Permission::PostMessages => self.can_post_messages = value,
            Permission::EditMessages => self.can_edit_messages = value,
            Permission::DeleteMessages => self.can_delete_messages = value,
            Permission::PinMessages => self.can_pin_messages = value,
            Permission::SendMediaMessages => self.can_send_media_messages = value,
        }
    }

    /// Channel administrators publish media through the post right, so
    /// send-media is granted by either flag.
    pub fn grants(&self, permission: Permission) -> bool {
        match permission {
            Permission::PostMessages => self.can_post_messages,
            Permission::EditMessages => self.can_edit_messages,
            Permission::DeleteMessages => self.can_delete_messages,
            Permission::PinMessages => self.can_pin_messages,
            Permission::SendMediaMessages => {
                self.can_send_media_messages || self.can_post_messages
            }
        }
    }

    pub fn granted(&self) -> Vec<Permission> {
        let mut out: Vec<Permission> = ALL_PERMISSIONS
            .into_iter()
            .filter(|p| self.grants(*p))
            .collect();
        sort_by_key(&mut out);
        out
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    pub satisfied: bool,
    pub missing_required: Vec<Permission>,
    pub missing_recommended: Vec<Permission>,
}

impl Evaluation {
    pub fn has_gaps(&self) -> bool {
        !self.missing_required.is_empty() || !self.missing_recommended.is_empty()
    }

    /// Comma-separated keys of the missing required permissions.
    pub fn missing_required_keys(&self) -> String {
        self.missing_required
            .iter()
            .map(|p| p.key())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

pub fn evaluate(observed: &PermissionSet) -> Evaluation {
    let mut missing_required: Vec<Permission> = REQUIRED_PERMISSIONS
        .into_iter()
        .filter(|p| !observed.grants(*p))
        .collect();
    let mut missing_recommended: Vec<Permission> = RECOMMENDED_PERMISSIONS
        .into_iter()
        .filter(|p| !observed.grants(*p))
        .collect();
    sort_by_key(&mut missing_required);
    sort_by_key(&mut missing_recommended);
    Evaluation {
        satisfied: missing_required.is_empty(),
        missing_required,
        missing_recommended,
    }
}

/// One hint per missing capability: required first, then recommended,
/// alphabetical by key inside each group.
pub fn recommendations(
    missing_required: &[Permission],
    missing_recommended: &[Permission],
) -> Vec<String> {
    let mut required = missing_required.to_vec();
    let mut recommended = missing_recommended.to_vec();
    sort_by_key(&mut required);
    sort_by_key(&mut recommended);

    let required_hints = required.into_iter().map(|p| {
        format!(
            "Grant the bot '{}' ({}): {}",
            p.label(),
            p.key(),
            p.purpose()
        )
    });
    let recommended_hints = recommended.into_iter().map(|p| {
        format!(
            "Consider granting the bot '{}' ({}): {}",
            p.label(),
            p.key(),
            p.purpose()
        )
    });
    required_hints.chain(recommended_hints).collect()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionStatus {
    pub permission: Permission,
    pub label: String,
    pub granted: bool,
    pub required: bool,
}

/// Display listing of every capability, required first then by label.
pub fn describe(observed: &PermissionSet) -> Vec<PermissionStatus> {
    let mut rows: Vec<PermissionStatus> = ALL_PERMISSIONS
        .into_iter()
        .map(|p| PermissionStatus {
            permission: p,
            label: p.label().to_string(),
            granted: observed.grants(p),
            required: p.is_required(),
        })
        .collect();
    rows.sort_by(|a, b| {
        (!a.required, a.label.as_str()).cmp(&(!b.required, b.label.as_str()))
    });
    rows
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionChange {
    pub gained: Vec<Permission>,
    pub lost: Vec<Permission>,
    pub lost_required: Vec<Permission>,
    pub critical_loss: bool,
}

impl PermissionChange {
    pub fn has_changes(&self) -> bool {
        !self.gained.is_empty() || !self.lost.is_empty()
    }
}

pub fn compare(old: &PermissionSet, new: &PermissionSet) -> PermissionChange {
    let mut gained = Vec::new();
    let mut lost = Vec::new();
    for p in ALL_PERMISSIONS {
        match (old.grants(p), new.grants(p)) {
            (false, true) => gained.push(p),
            (true, false) => lost.push(p),
            _ => {}
        }
    }
    sort_by_key(&mut gained);
    sort_by_key(&mut lost);
    let lost_required: Vec<Permission> = lost.iter().copied().filter(|p| p.is_required()).collect();
    PermissionChange {
        critical_loss: !lost_required.is_empty(),
        gained,
        lost,
        lost_required,
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PermissionTally {
    pub permission: Permission,
    pub granted: usize,
    pub denied: usize,
    /// Share of channels granting it, one decimal place.
    pub granted_pct: f64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChannelGap {
    pub account_id: String,
    pub channel_handle: String,
    pub missing_required: Vec<Permission>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MissingCount {
    pub permission: Permission,
    pub channels: usize,
}

/// Fleet-wide view of bot permissions across configured channels.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PermissionSummary {
    pub total_channels: usize,
    pub with_all_required: usize,
    pub missing_required: usize,
    pub permissions: Vec<PermissionTally>,
    pub gaps: Vec<ChannelGap>,
    pub common_missing: Vec<MissingCount>,
}

/// Summarize `(account_id, channel_handle, permissions)` rows.
pub fn summarize<'a>(
    channels: impl IntoIterator<Item = (&'a str, &'a str, &'a PermissionSet)>,
) -> PermissionSummary {
    let mut total = 0usize;
    let mut granted_counts = [0usize; ALL_PERMISSIONS.len()];
    let mut gaps = Vec::new();
    for (account_id, channel_handle, observed) in channels {
        total += 1;
        for (i, p) in ALL_PERMISSIONS.into_iter().enumerate() {
            if observed.grants(p) {
                granted_counts[i] += 1;
            }
        }
        let evaluation = evaluate(observed);
        if !evaluation.satisfied {
            gaps.push(ChannelGap {
                account_id: account_id.to_string(),
                channel_handle: channel_handle.to_string(),
                missing_required: evaluation.missing_required,
            });
        }
    }

    let permissions = ALL_PERMISSIONS
        .into_iter()
        .zip(granted_counts)
        .map(|(permission, granted)| PermissionTally {
            permission,
            granted,
            denied: total - granted,
            granted_pct: if total == 0 {
                0.0
            } else {
                (granted as f64 * 1000.0 / total as f64).round() / 10.0
            },
        })
        .collect();

    let mut common_missing: Vec<MissingCount> = REQUIRED_PERMISSIONS
        .into_iter()
        .map(|permission| MissingCount {
            permission,
            channels: gaps
                .iter()
                .filter(|g| g.missing_required.contains(&permission))
                .count(),
        })
        .filter(|m| m.channels > 0)
        .collect();
    common_missing.sort_by(|a, b| {
        b.channels
            .cmp(&a.channels)
            .then_with(|| a.permission.key().cmp(b.permission.key()))
    });

    PermissionSummary {
        total_channels: total,
        with_all_required: total - gaps.len(),
        missing_required: gaps.len(),
        permissions,
        gaps,
        common_missing,
    }
}
