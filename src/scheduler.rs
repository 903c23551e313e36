use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::db::{call_blocking, format_ts, ChannelConfiguration, Database, ValidationType};
use crate::error::ChanguardError;
use crate::validator::ChannelValidator;

#[derive(Clone, Debug)]
pub struct SchedulerSettings {
    pub interval: Duration,
    pub staleness: chrono::Duration,
    pub concurrency: usize,
    pub batch_limit: usize,
    pub deadline: Duration,
    pub retention: chrono::Duration,
    pub prune_interval: Duration,
}

impl SchedulerSettings {
    pub fn from_config(config: &Config) -> Self {
        SchedulerSettings {
            interval: config.revalidation_interval(),
            staleness: config.staleness_threshold(),
            concurrency: config.revalidation_concurrency.max(1),
            batch_limit: config.revalidation_batch_limit.max(1),
            deadline: config.validation_deadline(),
            retention: config.history_retention(),
            prune_interval: config.prune_interval(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub selected: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    Scheduled,
    Manual,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RunRecord {
    pub trigger: RunTrigger,
    pub started_at: String,
    pub finished_at: String,
    pub report: TickReport,
}

#[derive(Clone, Debug, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub interval_secs: u64,
    pub staleness_mins: i64,
    pub concurrency: usize,
    pub batch_limit: usize,
    pub retention_days: i64,
    pub runs_completed: u64,
    pub last_run: Option<RunRecord>,
}

/// Background revalidation of stale or broken configurations plus the
/// history retention job. Both loops stop on [`RevalidationScheduler::stop`],
/// which waits for in-flight revalidations to finish.
pub struct RevalidationScheduler {
    validator: Arc<ChannelValidator>,
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
    settings: SchedulerSettings,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    runs_completed: AtomicU64,
    last_run: Mutex<Option<RunRecord>>,
}

impl RevalidationScheduler {
    pub fn new(validator: Arc<ChannelValidator>, settings: SchedulerSettings) -> Self {
        let (shutdown, _) = watch::channel(false);
        RevalidationScheduler {
            db: validator.database(),
            clock: validator.clock(),
            validator,
            settings,
            shutdown,
            handles: Mutex::new(Vec::new()),
            runs_completed: AtomicU64::new(0),
            last_run: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        !self
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            running: self.is_running(),
            interval_secs: self.settings.interval.as_secs(),
            staleness_mins: self.settings.staleness.num_minutes(),
            concurrency: self.settings.concurrency,
            batch_limit: self.settings.batch_limit,
            retention_days: self.settings.retention.num_days(),
            runs_completed: self.runs_completed.load(Ordering::Relaxed),
            last_run: self
                .last_run
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }

    pub fn start(self: &Arc<Self>) {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        if !handles.is_empty() {
            warn!("Revalidation scheduler already running");
            return;
        }
        self.shutdown.send_replace(false);

        let this = self.clone();
        handles.push(tokio::spawn(async move {
            info!(
                "Revalidation scheduler started (interval: {:?}, concurrency: {})",
                this.settings.interval, this.settings.concurrency
            );
            let mut stop = this.shutdown.subscribe();
            let mut ticker = tokio::time::interval(this.settings.interval);
            // Skip missed ticks instead of bursting to catch up.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = this.run_tick().await;
                        if report.selected > 0 {
                            info!(
                                "Revalidation tick: {} selected, {} validated, {} failed",
                                report.selected, report.succeeded, report.failed
                            );
                        }
                    }
                    _ = stop.changed() => break,
                }
                if *stop.borrow() {
                    break;
                }
            }
            info!("Revalidation scheduler stopped");
        }));

        let this = self.clone();
        handles.push(tokio::spawn(async move {
            let mut stop = this.shutdown.subscribe();
            let mut ticker = tokio::time::interval(this.settings.prune_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = this.run_prune().await {
                            error!("History pruning failed: {e}");
                        }
                    }
                    _ = stop.changed() => break,
                }
                if *stop.borrow() {
                    break;
                }
            }
        }));
    }

    /// Signal both loops and wait for them. A tick already running finishes
    /// the revalidations it has started but starts no new ones.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Scheduler task ended abnormally: {e}");
            }
        }
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// One pass: select due configurations and revalidate them through a
    /// bounded worker pool. One account's failure never stops the batch.
    pub async fn run_tick(&self) -> TickReport {
        let started_at = format_ts(self.clock.now());
        let stale_before = format_ts(self.clock.now() - self.settings.staleness);
        let limit = self.settings.batch_limit;
        let due = match call_blocking(self.db.clone(), move |db| {
            db.get_due_for_revalidation(&stale_before, limit)
        })
        .await
        {
            Ok(due) => due,
            Err(e) => {
                error!("Revalidation: failed to query due configurations: {e}");
                return TickReport::default();
            }
        };
        let report = self.revalidate_all(due, ValidationType::Scheduled).await;
        self.record_run(RunTrigger::Scheduled, started_at, report);
        report
    }

    /// Revalidate one account, or every configured account, right now
    /// regardless of staleness. Shares the worker pool limits of a tick.
    pub async fn run_now(&self, account_id: Option<&str>) -> Result<TickReport, ChanguardError> {
        let started_at = format_ts(self.clock.now());
        let selected = match account_id {
            Some(account_id) => {
                let owned = account_id.to_string();
                let configuration =
                    call_blocking(self.db.clone(), move |db| db.get_configuration(&owned))
                        .await?
                        .ok_or_else(|| ChanguardError::NotConfigured(account_id.to_string()))?;
                vec![configuration]
            }
            None => call_blocking(self.db.clone(), |db| db.list_configurations()).await?,
        };
        info!(
            "Immediate revalidation of {} configuration(s) requested",
            selected.len()
        );
        let report = self.revalidate_all(selected, ValidationType::Revalidate).await;
        self.record_run(RunTrigger::Manual, started_at, report);
        Ok(report)
    }

    fn record_run(&self, trigger: RunTrigger, started_at: String, report: TickReport) {
        self.runs_completed.fetch_add(1, Ordering::Relaxed);
        *self.last_run.lock().unwrap_or_else(|e| e.into_inner()) = Some(RunRecord {
            trigger,
            started_at,
            finished_at: format_ts(self.clock.now()),
            report,
        });
    }

    async fn revalidate_all(
        &self,
        selected: Vec<ChannelConfiguration>,
        validation_type: ValidationType,
    ) -> TickReport {
        let mut report = TickReport {
            selected: selected.len(),
            ..TickReport::default()
        };
        let pool = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let mut workers = JoinSet::new();
        for config in selected {
            if self.stopping() {
                info!("Revalidation: shutdown requested, leaving remaining accounts for later");
                break;
            }
            let Ok(permit) = pool.clone().acquire_owned().await else {
                break;
            };
            let validator = self.validator.clone();
            let deadline = self.settings.deadline;
            workers.spawn(async move {
                let _permit = permit;
                let account_id = config.account_id;
                let result = validator
                    .revalidate_as(&account_id, validation_type, deadline)
                    .await;
                (account_id, result)
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) if outcome.configuration.is_validated => {
                    report.succeeded += 1;
                }
                Ok((account_id, Ok(outcome))) => {
                    warn!(
                        account_id = %account_id,
                        "Revalidation: {}",
                        outcome
                            .configuration
                            .validation_error
                            .as_deref()
                            .unwrap_or("channel not validated")
                    );
                    report.failed += 1;
                }
                Ok((account_id, Err(e))) => {
                    warn!(account_id = %account_id, "Revalidation failed: {e}");
                    report.failed += 1;
                }
                Err(e) => {
                    error!("Revalidation worker panicked: {e}");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Delete history older than the retention window. Returns rows removed.
    pub async fn run_prune(&self) -> Result<usize, ChanguardError> {
        let cutoff = format_ts(self.clock.now() - self.settings.retention);
        let removed = call_blocking(self.db.clone(), move |db| db.prune_history_before(&cutoff))
            .await?;
        if removed > 0 {
            info!("Pruned {removed} validation history record(s)");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{BotCredentials, BotIdentity, ChannelInfo, ChannelKind, Membership, MembershipStatus};
    use crate::clock::ManualClock;
    use crate::credentials::StaticCredentialDirectory;
    use crate::gateway::GatewayClient;
    use crate::permissions::{Permission, PermissionSet};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    struct AdminGateway;

    #[async_trait]
    impl GatewayClient for AdminGateway {
        async fn resolve_channel(
            &self,
            _bot_token: &str,
            channel_handle: &str,
        ) -> Result<ChannelInfo, ChanguardError> {
            Ok(ChannelInfo {
                id: -1,
                handle: channel_handle.to_string(),
                title: "T".into(),
                kind: ChannelKind::Channel,
                member_count: 1,
            })
        }

        async fn resolve_bot_membership(
            &self,
            _bot_token: &str,
            _channel_id: i64,
            _bot_id: i64,
        ) -> Result<Membership, ChanguardError> {
            Ok(Membership {
                status: MembershipStatus::Administrator,
                permissions: PermissionSet::from_granted([
                    Permission::PostMessages,
                    Permission::EditMessages,
                ]),
            })
        }

        async fn resolve_bot_identity(
            &self,
            _bot_token: &str,
        ) -> Result<BotIdentity, ChanguardError> {
            Ok(BotIdentity {
                id: 9,
                username: None,
            })
        }
    }

    fn settings() -> SchedulerSettings {
        SchedulerSettings {
            interval: Duration::from_secs(3600),
            staleness: chrono::Duration::minutes(60),
            concurrency: 2,
            batch_limit: 10,
            deadline: Duration::from_secs(5),
            retention: chrono::Duration::days(30),
            prune_interval: Duration::from_secs(3600),
        }
    }

    fn build() -> (Arc<RevalidationScheduler>, Arc<ChannelValidator>, Arc<ManualClock>, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!("changuard_sched_{}", uuid::Uuid::new_v4()));
        let db = Arc::new(Database::new(dir.to_str().unwrap()).unwrap());
        let clock = Arc::new(ManualClock::new(
            DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        ));
        let credentials = StaticCredentialDirectory::default().with_account(
            "acct",
            BotCredentials {
                bot_id: 9,
                bot_token: "9:x".into(),
            },
        );
        let validator = Arc::new(ChannelValidator::new(
            db,
            Arc::new(AdminGateway),
            Arc::new(credentials),
            clock.clone(),
            Duration::from_secs(5),
        ));
        let scheduler = Arc::new(RevalidationScheduler::new(validator.clone(), settings()));
        (scheduler, validator, clock, dir)
    }

    #[tokio::test]
    async fn test_tick_skips_fresh_and_revalidates_stale() {
        let (scheduler, validator, clock, dir) = build();
        validator.setup("acct", "@demo").await.unwrap();

        let report = scheduler.run_tick().await;
        assert_eq!(report, TickReport::default());

        clock.advance(chrono::Duration::minutes(61));
        let report = scheduler.run_tick().await;
        assert_eq!(
            report,
            TickReport {
                selected: 1,
                succeeded: 1,
                failed: 0
            }
        );
        let history = validator.history("acct", 10).await.unwrap();
        assert_eq!(history[0].validation_type, ValidationType::Scheduled);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_prune_uses_retention_window() {
        let (scheduler, validator, clock, dir) = build();
        validator.setup("acct", "@demo").await.unwrap();
        clock.advance(chrono::Duration::days(29));
        assert_eq!(scheduler.run_prune().await.unwrap(), 0);
        clock.advance(chrono::Duration::days(2));
        assert_eq!(scheduler.run_prune().await.unwrap(), 1);
        assert!(validator.get_status("acct").await.is_ok());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_start_and_stop_lifecycle() {
        let (scheduler, _validator, _clock, dir) = build();
        scheduler.start();
        assert!(scheduler.is_running());
        scheduler.start();
        scheduler.stop().await;
        assert!(!scheduler.is_running());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_run_now_ignores_staleness_and_updates_status() {
        let (scheduler, validator, _clock, dir) = build();
        validator.setup("acct", "@demo").await.unwrap();

        let status = scheduler.status();
        assert!(!status.running);
        assert_eq!(status.runs_completed, 0);
        assert!(status.last_run.is_none());
        assert_eq!(status.concurrency, 2);

        let report = scheduler.run_now(None).await.unwrap();
        assert_eq!(
            report,
            TickReport {
                selected: 1,
                succeeded: 1,
                failed: 0
            }
        );
        let history = validator.history("acct", 10).await.unwrap();
        assert_eq!(history[0].validation_type, ValidationType::Revalidate);

        let status = scheduler.status();
        assert_eq!(status.runs_completed, 1);
        let last = status.last_run.unwrap();
        assert_eq!(last.trigger, RunTrigger::Manual);
        assert_eq!(last.report, report);
        assert_eq!(last.started_at, "2026-03-01T10:00:00.000Z");

        scheduler.run_tick().await;
        let last = scheduler.status().last_run.unwrap();
        assert_eq!(last.trigger, RunTrigger::Scheduled);
        assert_eq!(last.report.selected, 0);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_run_now_for_unconfigured_account_fails() {
        let (scheduler, _validator, _clock, dir) = build();
        assert!(matches!(
            scheduler.run_now(Some("acct")).await,
            Err(ChanguardError::NotConfigured(_))
        ));
        assert_eq!(scheduler.status().runs_completed, 0);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
