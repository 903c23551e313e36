//! Setup and revalidation of an account's channel.
//!
//! Each attempt runs under a per-account lock: resolve the bot, the channel and
//! the bot's membership, evaluate permissions, then commit the configuration
//! and its history record in one transaction. Platform failures are committed
//! as failed attempts. A revalidation whose account has lost its bot
//! credentials is committed as failed too; otherwise `AccountNotFound`,
//! `NotConfigured` and storage failures write nothing.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::channel::{BotCredentials, ChannelInfo, MembershipStatus};
use crate::clock::Clock;
use crate::credentials::CredentialDirectory;
use crate::db::{
    call_blocking, format_ts, ChannelConfiguration, ConfigurationWrite, Database, HistoryEntry,
    ValidationType,
};
use crate::error::{ChanguardError, ErrorCode};
use crate::gateway::{normalize_channel_handle, GatewayClient};
use crate::history::{ValidationHistoryRecord, ValidationStatistics};
use crate::permissions::{
    compare, describe, evaluate, recommendations, summarize, Evaluation, PermissionChange,
    PermissionSet, PermissionStatus, PermissionSummary,
};

pub const DEADLINE_EXCEEDED: &str = "validation deadline exceeded";
pub const MAX_BATCH_ACCOUNTS: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationState {
    Unconfigured,
    Verifying,
    Validated,
    Failed,
}

#[derive(Clone, Debug, Serialize)]
pub struct ValidationOutcome {
    pub configuration: ChannelConfiguration,
    pub evaluation: Evaluation,
    pub recommendations: Vec<String>,
    /// `InsufficientPermissions` when any required or recommended capability is missing.
    pub notice: Option<ErrorCode>,
    /// Drift against the previously stored permissions; revalidation only.
    pub permission_change: Option<PermissionChange>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PermissionReport {
    pub account_id: String,
    pub is_validated: bool,
    pub last_validation_at: Option<String>,
    pub permissions: PermissionSet,
    pub details: Vec<PermissionStatus>,
    pub evaluation: Evaluation,
    pub recommendations: Vec<String>,
}

/// One entry of a batch status lookup.
#[derive(Clone, Debug, Serialize)]
pub struct AccountStatus {
    pub account_id: String,
    pub state: ValidationState,
    pub code: Option<ErrorCode>,
    pub configuration: Option<ChannelConfiguration>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub store: bool,
    pub gateway: bool,
    pub checked_at: String,
}

struct Observation {
    channel: ChannelInfo,
    permissions: PermissionSet,
}

/// Marks an account as `Verifying` for as long as it is alive, including when
/// the attempt's future is dropped mid-flight.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    account_id: String,
}

impl<'a> InFlight<'a> {
    fn enter(set: &'a Mutex<HashSet<String>>, account_id: &str) -> Self {
        set.lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(account_id.to_string());
        InFlight {
            set,
            account_id: account_id.to_string(),
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.account_id);
    }
}

#[derive(Default)]
struct AccountLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl AccountLocks {
    fn lock_for(&self, account_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut guard = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // Drop entries nobody holds or waits on.
        guard.retain(|key, lock| key == account_id || Arc::strong_count(lock) > 1);
        guard
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

pub struct ChannelValidator {
    db: Arc<Database>,
    gateway: Arc<dyn GatewayClient>,
    credentials: Arc<dyn CredentialDirectory>,
    clock: Arc<dyn Clock>,
    default_deadline: Duration,
    locks: AccountLocks,
    in_flight: Mutex<HashSet<String>>,
}

impl ChannelValidator {
    pub fn new(
        db: Arc<Database>,
        gateway: Arc<dyn GatewayClient>,
        credentials: Arc<dyn CredentialDirectory>,
        clock: Arc<dyn Clock>,
        default_deadline: Duration,
    ) -> Self {
        ChannelValidator {
            db,
            gateway,
            credentials,
            clock,
            default_deadline,
            locks: AccountLocks::default(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn database(&self) -> Arc<Database> {
        self.db.clone()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub async fn setup(
        &self,
        account_id: &str,
        channel_handle: &str,
    ) -> Result<ValidationOutcome, ChanguardError> {
        self.setup_within(account_id, channel_handle, self.default_deadline)
            .await
    }

    /// Resolve and validate `channel_handle` for the account, replacing any
    /// configuration it already has.
    pub async fn setup_within(
        &self,
        account_id: &str,
        channel_handle: &str,
        deadline: Duration,
    ) -> Result<ValidationOutcome, ChanguardError> {
        self.ensure_store_available().await?;
        let lock = self.locks.lock_for(account_id);
        let _guard = lock.lock().await;

        let credentials = self.credentials.get_bot_credentials(account_id).await?;
        let _in_flight = InFlight::enter(&self.in_flight, account_id);
        info!(account_id, channel = channel_handle, "Channel setup started");

        let (handle, attempt) = match normalize_channel_handle(channel_handle) {
            Ok(handle) => {
                let attempt = self
                    .observe_within(&credentials, &handle, None, deadline)
                    .await;
                (handle, attempt)
            }
            Err(e) => (channel_handle.trim().to_string(), Err(e)),
        };

        match attempt {
            Ok(observation) => {
                let evaluation = evaluate(&observation.permissions);
                let write = ConfigurationWrite {
                    account_id: account_id.to_string(),
                    channel_id: Some(observation.channel.id),
                    channel_handle: observation.channel.handle.clone(),
                    channel_title: Some(observation.channel.title.clone()),
                    channel_kind: Some(observation.channel.kind),
                    member_count: observation.channel.member_count,
                    permissions: observation.permissions,
                    is_validated: evaluation.satisfied,
                    validation_error: verdict_error(&evaluation),
                };
                let entry = HistoryEntry {
                    validation_type: ValidationType::Setup,
                    result: evaluation.satisfied,
                    error_message: write.validation_error.clone(),
                    permissions_snapshot: Some(observation.permissions),
                };
                let configuration = self.commit(write, entry, Commit::Replace).await?;
                info!(
                    account_id,
                    channel = %configuration.channel_handle,
                    validated = configuration.is_validated,
                    "Channel setup finished"
                );
                Ok(outcome(configuration, evaluation, None))
            }
            Err(e) if e.is_validation_outcome() => {
                warn!(account_id, channel = %handle, "Channel setup failed: {e}");
                let write = ConfigurationWrite {
                    account_id: account_id.to_string(),
                    channel_id: None,
                    channel_handle: handle,
                    channel_title: None,
                    channel_kind: None,
                    member_count: 0,
                    permissions: PermissionSet::default(),
                    is_validated: false,
                    validation_error: Some(e.to_string()),
                };
                let entry = HistoryEntry {
                    validation_type: ValidationType::Setup,
                    result: false,
                    error_message: Some(e.to_string()),
                    permissions_snapshot: None,
                };
                self.commit(write, entry, Commit::Replace).await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn revalidate(&self, account_id: &str) -> Result<ValidationOutcome, ChanguardError> {
        self.revalidate_as(account_id, ValidationType::Revalidate, self.default_deadline)
            .await
    }

    pub async fn revalidate_within(
        &self,
        account_id: &str,
        deadline: Duration,
    ) -> Result<ValidationOutcome, ChanguardError> {
        self.revalidate_as(account_id, ValidationType::Revalidate, deadline)
            .await
    }

    /// Re-run validation against the stored channel handle, updating the
    /// existing configuration in place. Never creates a configuration.
    pub async fn revalidate_as(
        &self,
        account_id: &str,
        validation_type: ValidationType,
        deadline: Duration,
    ) -> Result<ValidationOutcome, ChanguardError> {
        self.ensure_store_available().await?;
        let lock = self.locks.lock_for(account_id);
        let _guard = lock.lock().await;

        let existing = self
            .load(account_id)
            .await?
            .ok_or_else(|| ChanguardError::NotConfigured(account_id.to_string()))?;
        let credentials = match self.credentials.get_bot_credentials(account_id).await {
            Ok(credentials) => credentials,
            Err(e @ ChanguardError::AccountNotFound(_)) => {
                warn!(account_id, "Revalidation: bot credentials are gone: {e}");
                self.commit_failed_revalidation(&existing, validation_type, &e)
                    .await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        let _in_flight = InFlight::enter(&self.in_flight, account_id);

        let attempt = self
            .observe_within(
                &credentials,
                &existing.channel_handle,
                existing.channel_id,
                deadline,
            )
            .await;

        match attempt {
            Ok(observation) => {
                let mut write = ConfigurationWrite::from_existing(&existing);
                let evaluation = evaluate(&observation.permissions);
                let change = compare(&existing.permissions, &observation.permissions);
                if change.critical_loss {
                    warn!(
                        account_id,
                        channel = %existing.channel_handle,
                        lost = ?change.lost_required,
                        "Bot lost required channel permissions"
                    );
                } else if change.has_changes() {
                    info!(
                        account_id,
                        gained = ?change.gained,
                        lost = ?change.lost,
                        "Bot permissions changed"
                    );
                }

                write.channel_id = Some(observation.channel.id);
                write.channel_title = Some(observation.channel.title.clone());
                write.channel_kind = Some(observation.channel.kind);
                write.member_count = observation.channel.member_count;
                write.permissions = observation.permissions;
                write.is_validated = evaluation.satisfied;
                write.validation_error = verdict_error(&evaluation);
                let entry = HistoryEntry {
                    validation_type,
                    result: evaluation.satisfied,
                    error_message: write.validation_error.clone(),
                    permissions_snapshot: Some(observation.permissions),
                };
                let configuration = self.commit(write, entry, Commit::Update).await?;
                Ok(outcome(configuration, evaluation, Some(change)))
            }
            Err(e) if e.is_validation_outcome() => {
                warn!(
                    account_id,
                    channel = %existing.channel_handle,
                    kind = validation_type.as_str(),
                    "Revalidation failed: {e}"
                );
                self.commit_failed_revalidation(&existing, validation_type, &e)
                    .await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Keep the channel identity, mark it unvalidated and record the attempt.
    async fn commit_failed_revalidation(
        &self,
        existing: &ChannelConfiguration,
        validation_type: ValidationType,
        error: &ChanguardError,
    ) -> Result<ChannelConfiguration, ChanguardError> {
        let mut write = ConfigurationWrite::from_existing(existing);
        write.is_validated = false;
        write.validation_error = Some(error.to_string());
        let entry = HistoryEntry {
            validation_type,
            result: false,
            error_message: Some(error.to_string()),
            permissions_snapshot: None,
        };
        self.commit(write, entry, Commit::Update).await
    }

    pub async fn get_status(&self, account_id: &str) -> Result<ChannelConfiguration, ChanguardError> {
        self.load(account_id)
            .await?
            .ok_or_else(|| ChanguardError::NotConfigured(account_id.to_string()))
    }

    pub async fn get_permissions(&self, account_id: &str) -> Result<PermissionReport, ChanguardError> {
        let configuration = self.get_status(account_id).await?;
        let evaluation = evaluate(&configuration.permissions);
        Ok(PermissionReport {
            recommendations: recommendations(
                &evaluation.missing_required,
                &evaluation.missing_recommended,
            ),
            details: describe(&configuration.permissions),
            account_id: configuration.account_id,
            is_validated: configuration.is_validated,
            last_validation_at: configuration.last_validation_at,
            permissions: configuration.permissions,
            evaluation,
        })
    }

    pub async fn delete(&self, account_id: &str) -> Result<(), ChanguardError> {
        let lock = self.locks.lock_for(account_id);
        let _guard = lock.lock().await;
        let owned = account_id.to_string();
        let removed =
            call_blocking(self.db.clone(), move |db| db.delete_configuration(&owned)).await?;
        if !removed {
            return Err(ChanguardError::NotConfigured(account_id.to_string()));
        }
        info!(account_id, "Channel configuration deleted");
        Ok(())
    }

    /// In-flight attempts report `Verifying`; otherwise the persisted verdict.
    pub async fn state(&self, account_id: &str) -> Result<ValidationState, ChanguardError> {
        let configuration = self.load(account_id).await?;
        Ok(self.state_of(account_id, configuration.as_ref()))
    }

    fn state_of(
        &self,
        account_id: &str,
        configuration: Option<&ChannelConfiguration>,
    ) -> ValidationState {
        if self
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(account_id)
        {
            return ValidationState::Verifying;
        }
        match configuration {
            None => ValidationState::Unconfigured,
            Some(c) if c.is_validated => ValidationState::Validated,
            Some(_) => ValidationState::Failed,
        }
    }

    /// Status of several accounts at once, in request order. Accounts without
    /// a configuration carry `NOT_CONFIGURED`, or `ACCOUNT_NOT_FOUND` when the
    /// credential directory does not know them either.
    pub async fn batch_status(
        &self,
        account_ids: &[String],
    ) -> Result<Vec<AccountStatus>, ChanguardError> {
        if account_ids.is_empty() {
            return Err(ChanguardError::InvalidRequest(
                "account_ids must not be empty".into(),
            ));
        }
        if account_ids.len() > MAX_BATCH_ACCOUNTS {
            return Err(ChanguardError::InvalidRequest(format!(
                "at most {MAX_BATCH_ACCOUNTS} account_ids per request"
            )));
        }

        let mut statuses = Vec::with_capacity(account_ids.len());
        for account_id in account_ids {
            let configuration = self.load(account_id).await?;
            let code = match &configuration {
                Some(_) => None,
                None => match self.credentials.get_bot_credentials(account_id).await {
                    Err(ChanguardError::AccountNotFound(_)) => Some(ErrorCode::AccountNotFound),
                    _ => Some(ErrorCode::NotConfigured),
                },
            };
            statuses.push(AccountStatus {
                state: self.state_of(account_id, configuration.as_ref()),
                account_id: account_id.clone(),
                code,
                configuration,
            });
        }
        Ok(statuses)
    }

    pub async fn permission_summary(&self) -> Result<PermissionSummary, ChanguardError> {
        let configurations = self.list_configurations().await?;
        Ok(summarize(configurations.iter().map(|c| {
            (
                c.account_id.as_str(),
                c.channel_handle.as_str(),
                &c.permissions,
            )
        })))
    }

    pub async fn history(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<ValidationHistoryRecord>, ChanguardError> {
        let owned = account_id.to_string();
        call_blocking(self.db.clone(), move |db| {
            db.get_history_for_account(&owned, limit)
        })
        .await
    }

    pub async fn list_configurations(&self) -> Result<Vec<ChannelConfiguration>, ChanguardError> {
        call_blocking(self.db.clone(), |db| db.list_configurations()).await
    }

    pub async fn statistics(&self, days: u32) -> Result<ValidationStatistics, ChanguardError> {
        let since = format_ts(self.clock.now() - chrono::Duration::days(i64::from(days)));
        call_blocking(self.db.clone(), move |db| db.validation_statistics(&since)).await
    }

    pub async fn health(&self) -> HealthReport {
        let store = call_blocking(self.db.clone(), |db| db.ping()).await.is_ok();
        let gateway = match self.gateway.probe().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Gateway probe failed: {e}");
                false
            }
        };
        let status = match (store, gateway) {
            (false, _) => HealthStatus::Unhealthy,
            (true, false) => HealthStatus::Degraded,
            (true, true) => HealthStatus::Healthy,
        };
        HealthReport {
            status,
            store,
            gateway,
            checked_at: format_ts(self.clock.now()),
        }
    }

    async fn ensure_store_available(&self) -> Result<(), ChanguardError> {
        call_blocking(self.db.clone(), |db| db.ping())
            .await
            .inspect_err(|e| error!("Configuration store unavailable, refusing validation: {e}"))
    }

    async fn load(&self, account_id: &str) -> Result<Option<ChannelConfiguration>, ChanguardError> {
        let owned = account_id.to_string();
        call_blocking(self.db.clone(), move |db| db.get_configuration(&owned)).await
    }

    async fn observe_within(
        &self,
        credentials: &BotCredentials,
        channel_handle: &str,
        bound_channel: Option<i64>,
        deadline: Duration,
    ) -> Result<Observation, ChanguardError> {
        tokio::time::timeout(
            deadline,
            self.observe(credentials, channel_handle, bound_channel),
        )
        .await
        .unwrap_or_else(|_| Err(ChanguardError::Transport(DEADLINE_EXCEEDED.into())))
    }

    /// `bound_channel` pins the chat a configuration was validated against;
    /// a handle that now resolves elsewhere counts as the channel being gone.
    async fn observe(
        &self,
        credentials: &BotCredentials,
        channel_handle: &str,
        bound_channel: Option<i64>,
    ) -> Result<Observation, ChanguardError> {
        let token = credentials.bot_token.as_str();
        let bot = self.gateway.resolve_bot_identity(token).await?;
        let channel = self.gateway.resolve_channel(token, channel_handle).await?;
        if let Some(bound) = bound_channel.filter(|id| *id != channel.id) {
            warn!(
                channel = channel_handle,
                bound,
                resolved = channel.id,
                "Channel handle now points at a different chat"
            );
            return Err(ChanguardError::ChannelNotFound(channel_handle.to_string()));
        }
        let membership = self
            .gateway
            .resolve_bot_membership(token, channel.id, bot.id)
            .await?;
        if !membership.is_admin() {
            return Err(match membership.status {
                MembershipStatus::NotMember => ChanguardError::BotNotMember,
                _ => ChanguardError::BotNotAdmin,
            });
        }
        Ok(Observation {
            channel,
            permissions: membership.permissions,
        })
    }

    async fn commit(
        &self,
        write: ConfigurationWrite,
        entry: HistoryEntry,
        mode: Commit,
    ) -> Result<ChannelConfiguration, ChanguardError> {
        let now = self.clock.now();
        call_blocking(self.db.clone(), move |db| match mode {
            Commit::Replace => db.replace_configuration(&write, &entry, now),
            Commit::Update => db.update_configuration(&write, &entry, now),
        })
        .await
    }
}

#[derive(Clone, Copy)]
enum Commit {
    Replace,
    Update,
}

fn verdict_error(evaluation: &Evaluation) -> Option<String> {
    if evaluation.satisfied {
        None
    } else {
        Some(ChanguardError::InsufficientPermissions(evaluation.missing_required_keys()).to_string())
    }
}

fn outcome(
    configuration: ChannelConfiguration,
    evaluation: Evaluation,
    permission_change: Option<PermissionChange>,
) -> ValidationOutcome {
    ValidationOutcome {
        recommendations: recommendations(
            &evaluation.missing_required,
            &evaluation.missing_recommended,
        ),
        notice: evaluation
            .has_gaps()
            .then_some(ErrorCode::InsufficientPermissions),
        configuration,
        evaluation,
        permission_change,
    }
}
