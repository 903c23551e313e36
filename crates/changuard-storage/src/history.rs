use rusqlite::params;
use serde::Serialize;

use changuard_core::error::ChanguardError;
use changuard_core::permissions::PermissionSet;
use changuard_core::text::truncate_with_ellipsis;

use crate::db::{Database, ValidationType};

const TOP_ERRORS: usize = 5;
const ERROR_PREVIEW_CHARS: usize = 50;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ValidationHistoryRecord {
    pub id: i64,
    pub config_id: i64,
    pub account_id: Option<String>,
    pub validation_type: ValidationType,
    pub result: bool,
    pub error_message: Option<String>,
    pub permissions_snapshot: Option<PermissionSet>,
    pub validated_at: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ErrorCount {
    pub error: String,
    pub count: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ValidationStatistics {
    pub since: String,
    pub total: i64,
    pub successful: i64,
    pub failed: i64,
    pub success_rate: f64,
    pub setup: i64,
    pub revalidate: i64,
    pub scheduled: i64,
    pub top_errors: Vec<ErrorCount>,
}

impl Database {
    /// Most recent attempts first.
    pub fn get_history_for_account(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<ValidationHistoryRecord>, ChanguardError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT id, config_id, account_id, validation_type, result, error_message,
                    permissions_snapshot, validated_at
             FROM channel_validation_history
             WHERE account_id = ?1
             ORDER BY validated_at DESC, id DESC
             LIMIT ?2",
        )?;
        let raw = stmt
            .query_map(params![account_id, limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut out = Vec::with_capacity(raw.len());
        for (id, config_id, account_id, kind, result, error_message, snapshot, validated_at) in raw
        {
            let validation_type = ValidationType::parse(&kind).ok_or_else(|| {
                ChanguardError::Internal(format!("unknown validation type in history: {kind}"))
            })?;
            let permissions_snapshot = match snapshot {
                Some(json) => Some(serde_json::from_str::<PermissionSet>(&json)?),
                None => None,
            };
            out.push(ValidationHistoryRecord {
                id,
                config_id,
                account_id,
                validation_type,
                result: result != 0,
                error_message,
                permissions_snapshot,
                validated_at,
            });
        }
        Ok(out)
    }

    pub fn count_history(&self) -> Result<i64, ChanguardError> {
        let conn = self.lock_conn();
        let n = conn.query_row(
            "SELECT COUNT(*) FROM channel_validation_history",
            [],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    /// Delete history older than `cutoff`. Returns the number of rows removed.
    pub fn prune_history_before(&self, cutoff: &str) -> Result<usize, ChanguardError> {
        let conn = self.lock_conn();
        let rows = conn.execute(
            "DELETE FROM channel_validation_history WHERE validated_at < ?1",
            params![cutoff],
        )?;
        Ok(rows)
    }

    pub fn validation_statistics(
        &self,
        since: &str,
    ) -> Result<ValidationStatistics, ChanguardError> {
        let conn = self.lock_conn();
        let (total, successful, setup, revalidate, scheduled): (i64, i64, i64, i64, i64) = conn
            .query_row(
                "SELECT
                    COUNT(*),
                    COALESCE(SUM(CASE WHEN result = 1 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN validation_type = 'setup' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN validation_type = 'revalidate' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN validation_type = 'scheduled' THEN 1 ELSE 0 END), 0)
                 FROM channel_validation_history
                 WHERE validated_at >= ?1",
                params![since],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )?;

        let mut stmt = conn.prepare(
            "SELECT error_message, COUNT(*) AS n
             FROM channel_validation_history
             WHERE validated_at >= ?1 AND result = 0 AND error_message IS NOT NULL
             GROUP BY error_message
             ORDER BY n DESC, error_message ASC
             LIMIT ?2",
        )?;
        let top_errors = stmt
            .query_map(params![since, TOP_ERRORS as i64], |row| {
                Ok(ErrorCount {
                    error: row.get::<_, String>(0)?,
                    count: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|mut e| {
                e.error = truncate_with_ellipsis(&e.error, ERROR_PREVIEW_CHARS);
                e
            })
            .collect();

        let success_rate = if total > 0 {
            (successful as f64 / total as f64 * 1000.0).round() / 10.0
        } else {
            0.0
        };

        Ok(ValidationStatistics {
            since: since.to_string(),
            total,
            successful,
            failed: total - successful,
            success_rate,
            setup,
            revalidate,
            scheduled,
            top_errors,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::db::tests::{cleanup, test_db, ts, write_for};
    use crate::db::{HistoryEntry, ValidationType};
    use changuard_core::permissions::{Permission, PermissionSet};

    fn attempt(kind: ValidationType, ok: bool, error: Option<&str>) -> HistoryEntry {
        HistoryEntry {
            validation_type: kind,
            result: ok,
            error_message: error.map(str::to_string),
            permissions_snapshot: Some(PermissionSet::from_granted([Permission::PostMessages])),
        }
    }

    #[test]
    fn test_history_is_newest_first_and_snapshots_survive_updates() {
        let (db, dir) = test_db();
        db.replace_configuration(
            &write_for("acct", "@demo", true),
            &attempt(ValidationType::Setup, true, None),
            ts("2026-03-01T10:00:00Z"),
        )
        .unwrap();
        let mut broken = write_for("acct", "@demo", false);
        broken.permissions = PermissionSet::default();
        db.update_configuration(
            &broken,
            &HistoryEntry {
                validation_type: ValidationType::Revalidate,
                result: false,
                error_message: Some("Bot is not an administrator in the channel".into()),
                permissions_snapshot: Some(PermissionSet::default()),
            },
            ts("2026-03-01T11:00:00Z"),
        )
        .unwrap();

        let history = db.get_history_for_account("acct", 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].validation_type, ValidationType::Revalidate);
        assert!(!history[0].result);
        assert_eq!(history[1].validation_type, ValidationType::Setup);
        assert!(history[1].result);
        assert!(history[1]
            .permissions_snapshot
            .unwrap()
            .can_post_messages);
        assert_eq!(history[0].config_id, history[1].config_id);

        let limited = db.get_history_for_account("acct", 1).unwrap();
        assert_eq!(limited.len(), 1);
        cleanup(&dir);
    }

    #[test]
    fn test_prune_removes_only_old_records() {
        let (db, dir) = test_db();
        db.replace_configuration(
            &write_for("acct", "@demo", true),
            &attempt(ValidationType::Setup, true, None),
            ts("2026-01-01T00:00:00Z"),
        )
        .unwrap();
        db.replace_configuration(
            &write_for("acct", "@demo", true),
            &attempt(ValidationType::Setup, true, None),
            ts("2026-03-01T00:00:00Z"),
        )
        .unwrap();

        let removed = db.prune_history_before("2026-02-01T00:00:00.000Z").unwrap();
        assert_eq!(removed, 1);
        let history = db.get_history_for_account("acct", 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].validated_at, "2026-03-01T00:00:00.000Z");
        assert!(db.get_configuration("acct").unwrap().is_some());
        assert_eq!(db.count_history().unwrap(), 1);
        cleanup(&dir);
    }

    #[test]
    fn test_statistics_counts_and_truncates_errors() {
        let (db, dir) = test_db();
        let long_error = "Channel not found: @a_really_long_channel_handle_that_keeps_going";
        db.replace_configuration(
            &write_for("a", "@a", true),
            &attempt(ValidationType::Setup, true, None),
            ts("2026-03-01T10:00:00Z"),
        )
        .unwrap();
        db.replace_configuration(
            &write_for("b", "@b", false),
            &attempt(ValidationType::Setup, false, Some(long_error)),
            ts("2026-03-01T10:05:00Z"),
        )
        .unwrap();
        db.update_configuration(
            &write_for("b", "@b", false),
            &attempt(ValidationType::Scheduled, false, Some(long_error)),
            ts("2026-03-01T10:10:00Z"),
        )
        .unwrap();
        db.update_configuration(
            &write_for("a", "@a", true),
            &attempt(ValidationType::Revalidate, true, None),
            ts("2026-03-01T10:15:00Z"),
        )
        .unwrap();

        let stats = db
            .validation_statistics("2026-03-01T00:00:00.000Z")
            .unwrap();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.successful, 2);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.success_rate, 50.0);
        assert_eq!(stats.setup, 2);
        assert_eq!(stats.revalidate, 1);
        assert_eq!(stats.scheduled, 1);
        assert_eq!(stats.top_errors.len(), 1);
        assert_eq!(stats.top_errors[0].count, 2);
        assert!(stats.top_errors[0].error.ends_with("..."));
        assert!(stats.top_errors[0].error.chars().count() <= 53);

        let empty = db
            .validation_statistics("2026-04-01T00:00:00.000Z")
            .unwrap();
        assert_eq!(empty.total, 0);
        assert_eq!(empty.success_rate, 0.0);
        cleanup(&dir);
    }
}
