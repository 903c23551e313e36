use rusqlite::OptionalExtension;
use rusqlite::{params, Connection, Row, Transaction};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use changuard_core::channel::ChannelKind;
use changuard_core::error::ChanguardError;
use changuard_core::permissions::PermissionSet;

pub struct Database {
    conn: Mutex<Connection>,
}

pub async fn call_blocking<T, F>(db: std::sync::Arc<Database>, f: F) -> Result<T, ChanguardError>
where
    T: Send + 'static,
    F: FnOnce(&Database) -> Result<T, ChanguardError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(db.as_ref()))
        .await
        .map_err(|e| ChanguardError::Internal(format!("DB task join error: {e}")))?
}

/// Fixed-width UTC timestamp; lexical order equals chronological order.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationType {
    Setup,
    Revalidate,
    Scheduled,
}

impl ValidationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationType::Setup => "setup",
            ValidationType::Revalidate => "revalidate",
            ValidationType::Scheduled => "scheduled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "setup" => Some(ValidationType::Setup),
            "revalidate" => Some(ValidationType::Revalidate),
            "scheduled" => Some(ValidationType::Scheduled),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChannelConfiguration {
    pub id: i64,
    pub account_id: String,
    pub channel_id: Option<i64>,
    pub channel_handle: String,
    pub channel_title: Option<String>,
    pub channel_kind: Option<ChannelKind>,
    pub member_count: i64,
    pub permissions: PermissionSet,
    pub is_validated: bool,
    pub last_validation_at: Option<String>,
    pub validation_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Every mutable column of a configuration, as produced by one validation attempt.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfigurationWrite {
    pub account_id: String,
    pub channel_id: Option<i64>,
    pub channel_handle: String,
    pub channel_title: Option<String>,
    pub channel_kind: Option<ChannelKind>,
    pub member_count: i64,
    pub permissions: PermissionSet,
    pub is_validated: bool,
    pub validation_error: Option<String>,
}

impl ConfigurationWrite {
    /// Carry an existing row forward, to be patched with fresh observations.
    pub fn from_existing(config: &ChannelConfiguration) -> Self {
        Self {
            account_id: config.account_id.clone(),
            channel_id: config.channel_id,
            channel_handle: config.channel_handle.clone(),
            channel_title: config.channel_title.clone(),
            channel_kind: config.channel_kind,
            member_count: config.member_count,
            permissions: config.permissions,
            is_validated: config.is_validated,
            validation_error: config.validation_error.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct HistoryEntry {
    pub validation_type: ValidationType,
    pub result: bool,
    pub error_message: Option<String>,
    pub permissions_snapshot: Option<PermissionSet>,
}

const SCHEMA_VERSION_CURRENT: i64 = 2;

const CONFIG_COLUMNS: &str = "id, account_id, channel_id, channel_handle, channel_title, channel_kind,
    member_count, can_post_messages, can_edit_messages, can_delete_messages, can_pin_messages,
    can_send_media_messages, is_validated, last_validation_at, validation_error, created_at, updated_at";

fn config_from_row(row: &Row<'_>) -> rusqlite::Result<ChannelConfiguration> {
    let kind: Option<String> = row.get(5)?;
    Ok(ChannelConfiguration {
        id: row.get(0)?,
        account_id: row.get(1)?,
        channel_id: row.get(2)?,
        channel_handle: row.get(3)?,
        channel_title: row.get(4)?,
        channel_kind: kind.as_deref().and_then(ChannelKind::parse),
        member_count: row.get(6)?,
        permissions: PermissionSet {
            can_post_messages: row.get::<_, i64>(7)? != 0,
            can_edit_messages: row.get::<_, i64>(8)? != 0,
            can_delete_messages: row.get::<_, i64>(9)? != 0,
            can_pin_messages: row.get::<_, i64>(10)? != 0,
            can_send_media_messages: row.get::<_, i64>(11)? != 0,
        },
        is_validated: row.get::<_, i64>(12)? != 0,
        last_validation_at: row.get(13)?,
        validation_error: row.get(14)?,
        created_at: row.get(15)?,
        updated_at: row.get(16)?,
    })
}

pub(crate) fn table_has_column(
    conn: &Connection,
    table: &str,
    column: &str,
) -> Result<bool, ChanguardError> {
    if !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ChanguardError::Config(format!("invalid table name: {table}")));
    }
    // PRAGMA does not support parameter binding.
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for col in rows {
        if col? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn get_schema_version(conn: &Connection) -> Result<i64, ChanguardError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS db_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
        [],
    )?;
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM db_meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(raw.and_then(|s| s.parse::<i64>().ok()).unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i64) -> Result<(), ChanguardError> {
    conn.execute(
        "INSERT INTO db_meta(key, value) VALUES('schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![version.to_string()],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL,
            note TEXT
        )",
        [],
    )?;
    conn.execute(
        "INSERT OR REPLACE INTO schema_migrations(version, applied_at, note)
         VALUES(?1, ?2, ?3)",
        params![version, format_ts(Utc::now()), "applied"],
    )?;
    Ok(())
}

fn ensure_history_account_column(conn: &Connection) -> Result<(), ChanguardError> {
    if !table_has_column(conn, "channel_validation_history", "account_id")? {
        conn.execute(
            "ALTER TABLE channel_validation_history ADD COLUMN account_id TEXT",
            [],
        )?;
        conn.execute(
            "UPDATE channel_validation_history
             SET account_id = (
                 SELECT c.account_id FROM channel_configs c
                 WHERE c.id = channel_validation_history.config_id
             )
             WHERE account_id IS NULL",
            [],
        )?;
    }
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_history_account_validated
         ON channel_validation_history(account_id, validated_at DESC)",
        [],
    )?;
    Ok(())
}

fn apply_schema_migrations(conn: &Connection) -> Result<(), ChanguardError> {
    let mut version = get_schema_version(conn)?;
    if version < 1 {
        set_schema_version(conn, 1)?;
        version = 1;
    }
    if version < 2 {
        ensure_history_account_column(conn)?;
        set_schema_version(conn, 2)?;
        version = 2;
    }
    if version != SCHEMA_VERSION_CURRENT {
        set_schema_version(conn, SCHEMA_VERSION_CURRENT)?;
    }
    Ok(())
}

impl Database {
    pub(crate) fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn new(data_dir: &str) -> Result<Self, ChanguardError> {
        let db_path = Path::new(data_dir).join("changuard.db");
        std::fs::create_dir_all(data_dir)?;

        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS channel_configs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL UNIQUE,
                channel_id INTEGER,
                channel_handle TEXT NOT NULL,
                channel_title TEXT,
                channel_kind TEXT,
                member_count INTEGER NOT NULL DEFAULT 0,
                can_post_messages INTEGER NOT NULL DEFAULT 0,
                can_edit_messages INTEGER NOT NULL DEFAULT 0,
                can_delete_messages INTEGER NOT NULL DEFAULT 0,
                can_pin_messages INTEGER NOT NULL DEFAULT 0,
                can_send_media_messages INTEGER NOT NULL DEFAULT 0,
                is_validated INTEGER NOT NULL DEFAULT 0,
                last_validation_at TEXT,
                validation_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_channel_configs_last_validation
                ON channel_configs(last_validation_at);

            CREATE TABLE IF NOT EXISTS channel_validation_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                config_id INTEGER NOT NULL,
                validation_type TEXT NOT NULL,
                result INTEGER NOT NULL,
                error_message TEXT,
                permissions_snapshot TEXT,
                validated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_history_config
                ON channel_validation_history(config_id);
            CREATE INDEX IF NOT EXISTS idx_history_validated_at
                ON channel_validation_history(validated_at);
            ",
        )?;

        ensure_history_account_column(&conn)?;
        apply_schema_migrations(&conn)?;

        Ok(Database {
            conn: Mutex::new(conn),
        })
    }

    /// Liveness probe for the persistence layer.
    pub fn ping(&self) -> Result<(), ChanguardError> {
        let conn = self.lock_conn();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    pub fn get_configuration(
        &self,
        account_id: &str,
    ) -> Result<Option<ChannelConfiguration>, ChanguardError> {
        let conn = self.lock_conn();
        conn.query_row(
            &format!("SELECT {CONFIG_COLUMNS} FROM channel_configs WHERE account_id = ?1"),
            params![account_id],
            config_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list_configurations(&self) -> Result<Vec<ChannelConfiguration>, ChanguardError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONFIG_COLUMNS} FROM channel_configs ORDER BY account_id"
        ))?;
        let rows = stmt
            .query_map([], config_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count_configurations(&self, account_id: &str) -> Result<i64, ChanguardError> {
        let conn = self.lock_conn();
        let n = conn.query_row(
            "SELECT COUNT(*) FROM channel_configs WHERE account_id = ?1",
            params![account_id],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    /// Configurations that errored last time or whose last attempt is older
    /// than `stale_before`. Errored rows come first, then oldest first.
    pub fn get_due_for_revalidation(
        &self,
        stale_before: &str,
        limit: usize,
    ) -> Result<Vec<ChannelConfiguration>, ChanguardError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONFIG_COLUMNS} FROM channel_configs
             WHERE validation_error IS NOT NULL
                OR last_validation_at IS NULL
                OR last_validation_at < ?1
             ORDER BY (validation_error IS NULL) ASC, last_validation_at ASC, id ASC
             LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![stale_before, limit as i64], config_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Create or wholly replace the account's configuration and append the
    /// attempt to history in one transaction. `created_at` and the row id
    /// survive a replace so existing history keeps pointing at it.
    pub fn replace_configuration(
        &self,
        write: &ConfigurationWrite,
        entry: &HistoryEntry,
        validated_at: DateTime<Utc>,
    ) -> Result<ChannelConfiguration, ChanguardError> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;
        let now = format_ts(validated_at);
        let p = &write.permissions;
        tx.execute(
            "INSERT INTO channel_configs (
                account_id, channel_id, channel_handle, channel_title, channel_kind, member_count,
                can_post_messages, can_edit_messages, can_delete_messages, can_pin_messages,
                can_send_media_messages, is_validated, last_validation_at, validation_error,
                created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?13, ?13)
             ON CONFLICT(account_id) DO UPDATE SET
                channel_id = excluded.channel_id,
                channel_handle = excluded.channel_handle,
                channel_title = excluded.channel_title,
                channel_kind = excluded.channel_kind,
                member_count = excluded.member_count,
                can_post_messages = excluded.can_post_messages,
                can_edit_messages = excluded.can_edit_messages,
                can_delete_messages = excluded.can_delete_messages,
                can_pin_messages = excluded.can_pin_messages,
                can_send_media_messages = excluded.can_send_media_messages,
                is_validated = excluded.is_validated,
                last_validation_at = excluded.last_validation_at,
                validation_error = excluded.validation_error,
                updated_at = excluded.updated_at",
            params![
                write.account_id,
                write.channel_id,
                write.channel_handle,
                write.channel_title,
                write.channel_kind.map(|k| k.as_str()),
                write.member_count,
                p.can_post_messages as i32,
                p.can_edit_messages as i32,
                p.can_delete_messages as i32,
                p.can_pin_messages as i32,
                p.can_send_media_messages as i32,
                write.is_validated as i32,
                now,
                write.validation_error,
            ],
        )?;
        let config = Self::commit_with_history(tx, &write.account_id, entry, &now)?;
        Ok(config)
    }

    /// Update an existing configuration in place and append history. Fails
    /// with `NotConfigured` and writes nothing when the account has no row.
    pub fn update_configuration(
        &self,
        write: &ConfigurationWrite,
        entry: &HistoryEntry,
        validated_at: DateTime<Utc>,
    ) -> Result<ChannelConfiguration, ChanguardError> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;
        let now = format_ts(validated_at);
        let p = &write.permissions;
        let rows = tx.execute(
            "UPDATE channel_configs SET
                channel_id = ?2,
                channel_handle = ?3,
                channel_title = ?4,
                channel_kind = ?5,
                member_count = ?6,
                can_post_messages = ?7,
                can_edit_messages = ?8,
                can_delete_messages = ?9,
                can_pin_messages = ?10,
                can_send_media_messages = ?11,
                is_validated = ?12,
                last_validation_at = ?13,
                validation_error = ?14,
                updated_at = ?13
             WHERE account_id = ?1",
            params![
                write.account_id,
                write.channel_id,
                write.channel_handle,
                write.channel_title,
                write.channel_kind.map(|k| k.as_str()),
                write.member_count,
                p.can_post_messages as i32,
                p.can_edit_messages as i32,
                p.can_delete_messages as i32,
                p.can_pin_messages as i32,
                p.can_send_media_messages as i32,
                write.is_validated as i32,
                now,
                write.validation_error,
            ],
        )?;
        if rows == 0 {
            return Err(ChanguardError::NotConfigured(write.account_id.clone()));
        }
        Self::commit_with_history(tx, &write.account_id, entry, &now)
    }

    fn commit_with_history(
        tx: Transaction<'_>,
        account_id: &str,
        entry: &HistoryEntry,
        validated_at: &str,
    ) -> Result<ChannelConfiguration, ChanguardError> {
        let config = tx.query_row(
            &format!("SELECT {CONFIG_COLUMNS} FROM channel_configs WHERE account_id = ?1"),
            params![account_id],
            config_from_row,
        )?;
        let snapshot = entry
            .permissions_snapshot
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        tx.execute(
            "INSERT INTO channel_validation_history
                (config_id, account_id, validation_type, result, error_message, permissions_snapshot, validated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                config.id,
                account_id,
                entry.validation_type.as_str(),
                entry.result as i32,
                entry.error_message,
                snapshot,
                validated_at,
            ],
        )?;
        tx.commit()?;
        Ok(config)
    }

    /// Remove the account's configuration. History rows are left for audit.
    pub fn delete_configuration(&self, account_id: &str) -> Result<bool, ChanguardError> {
        let conn = self.lock_conn();
        let rows = conn.execute(
            "DELETE FROM channel_configs WHERE account_id = ?1",
            params![account_id],
        )?;
        Ok(rows > 0)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use changuard_core::permissions::{Permission, PermissionSet};

    pub(crate) fn test_db() -> (Database, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!("changuard_test_{}", uuid::Uuid::new_v4()));
        let db = Database::new(dir.to_str().unwrap()).unwrap();
        (db, dir)
    }

    pub(crate) fn cleanup(dir: &std::path::Path) {
        let _ = std::fs::remove_dir_all(dir);
    }

    pub(crate) fn ts(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw)
            .unwrap()
            .with_timezone(&Utc)
    }

    pub(crate) fn write_for(account: &str, handle: &str, validated: bool) -> ConfigurationWrite {
        ConfigurationWrite {
            account_id: account.into(),
            channel_id: Some(-100123),
            channel_handle: handle.into(),
            channel_title: Some("Demo".into()),
            channel_kind: Some(ChannelKind::Channel),
            member_count: 10,
            permissions: PermissionSet::from_granted([
                Permission::PostMessages,
                Permission::EditMessages,
            ]),
            is_validated: validated,
            validation_error: if validated {
                None
            } else {
                Some("Bot is not an administrator in the channel".into())
            },
        }
    }

    pub(crate) fn entry(result: bool) -> HistoryEntry {
        HistoryEntry {
            validation_type: ValidationType::Setup,
            result,
            error_message: None,
            permissions_snapshot: Some(PermissionSet::default()),
        }
    }

    #[test]
    fn test_new_database_creates_tables() {
        let (db, dir) = test_db();
        assert!(db.list_configurations().unwrap().is_empty());
        assert!(db.get_configuration("a").unwrap().is_none());
        db.ping().unwrap();
        cleanup(&dir);
    }

    #[test]
    fn test_schema_version_is_tracked() {
        let (db, dir) = test_db();
        let conn = db.lock_conn();
        let version: String = conn
            .query_row(
                "SELECT value FROM db_meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION_CURRENT.to_string());
        drop(conn);
        cleanup(&dir);
    }

    #[test]
    fn test_legacy_history_table_gets_account_column() {
        let dir = std::env::temp_dir().join(format!("changuard_legacy_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        {
            let conn = Connection::open(dir.join("changuard.db")).unwrap();
            conn.execute_batch(
                "CREATE TABLE channel_validation_history (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    config_id INTEGER NOT NULL,
                    validation_type TEXT NOT NULL,
                    result INTEGER NOT NULL,
                    error_message TEXT,
                    permissions_snapshot TEXT,
                    validated_at TEXT NOT NULL
                );
                INSERT INTO channel_validation_history
                    (config_id, validation_type, result, validated_at)
                    VALUES (1, 'setup', 1, '2026-01-01T00:00:00.000Z');",
            )
            .unwrap();
        }
        let db = Database::new(dir.to_str().unwrap()).unwrap();
        let conn = db.lock_conn();
        assert!(table_has_column(&conn, "channel_validation_history", "account_id").unwrap());
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM channel_validation_history", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(count, 1);
        drop(conn);
        cleanup(&dir);
    }

    #[test]
    fn test_replace_configuration_creates_then_overwrites() {
        let (db, dir) = test_db();
        let first = db
            .replace_configuration(
                &write_for("acct", "@demo", true),
                &entry(true),
                ts("2026-03-01T10:00:00Z"),
            )
            .unwrap();
        assert!(first.is_validated);
        assert_eq!(first.channel_handle, "@demo");
        assert_eq!(
            first.last_validation_at.as_deref(),
            Some("2026-03-01T10:00:00.000Z")
        );

        let mut other = write_for("acct", "@other", false);
        other.channel_id = None;
        let second = db
            .replace_configuration(&other, &entry(false), ts("2026-03-01T11:00:00Z"))
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.channel_handle, "@other");
        assert_eq!(second.channel_id, None);
        assert!(!second.is_validated);
        assert!(second.validation_error.is_some());
        assert_eq!(db.count_configurations("acct").unwrap(), 1);
        assert_eq!(db.list_configurations().unwrap().len(), 1);
        cleanup(&dir);
    }

    #[test]
    fn test_update_configuration_requires_existing_row() {
        let (db, dir) = test_db();
        let err = db
            .update_configuration(
                &write_for("ghost", "@demo", true),
                &entry(true),
                ts("2026-03-01T10:00:00Z"),
            )
            .unwrap_err();
        assert!(matches!(err, ChanguardError::NotConfigured(_)));
        assert!(db.get_history_for_account("ghost", 10).unwrap().is_empty());
        cleanup(&dir);
    }

    #[test]
    fn test_update_configuration_in_place() {
        let (db, dir) = test_db();
        let created = db
            .replace_configuration(
                &write_for("acct", "@demo", true),
                &entry(true),
                ts("2026-03-01T10:00:00Z"),
            )
            .unwrap();
        let mut patch = ConfigurationWrite::from_existing(&created);
        patch.is_validated = false;
        patch.validation_error = Some("Channel not found: @demo".into());
        let updated = db
            .update_configuration(&patch, &entry(false), ts("2026-03-01T12:00:00Z"))
            .unwrap();
        assert_eq!(updated.id, created.id);
        assert_eq!(updated.channel_title.as_deref(), Some("Demo"));
        assert!(!updated.is_validated);
        assert_eq!(updated.updated_at, "2026-03-01T12:00:00.000Z");
        cleanup(&dir);
    }

    #[test]
    fn test_delete_configuration_keeps_history() {
        let (db, dir) = test_db();
        db.replace_configuration(
            &write_for("acct", "@demo", true),
            &entry(true),
            ts("2026-03-01T10:00:00Z"),
        )
        .unwrap();
        assert!(db.delete_configuration("acct").unwrap());
        assert!(!db.delete_configuration("acct").unwrap());
        assert!(db.get_configuration("acct").unwrap().is_none());
        assert_eq!(db.get_history_for_account("acct", 10).unwrap().len(), 1);
        cleanup(&dir);
    }

    #[test]
    fn test_due_for_revalidation_prioritizes_failures() {
        let (db, dir) = test_db();
        db.replace_configuration(
            &write_for("fresh-ok", "@a", true),
            &entry(true),
            ts("2026-03-01T11:50:00Z"),
        )
        .unwrap();
        db.replace_configuration(
            &write_for("stale-ok", "@b", true),
            &entry(true),
            ts("2026-03-01T08:00:00Z"),
        )
        .unwrap();
        db.replace_configuration(
            &write_for("fresh-broken", "@c", false),
            &entry(false),
            ts("2026-03-01T11:55:00Z"),
        )
        .unwrap();

        let due = db
            .get_due_for_revalidation("2026-03-01T11:00:00.000Z", 10)
            .unwrap();
        let accounts: Vec<&str> = due.iter().map(|c| c.account_id.as_str()).collect();
        assert_eq!(accounts, vec!["fresh-broken", "stale-ok"]);

        let limited = db
            .get_due_for_revalidation("2026-03-01T11:00:00.000Z", 1)
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].account_id, "fresh-broken");
        cleanup(&dir);
    }

    #[test]
    fn test_validation_type_roundtrip() {
        for t in [
            ValidationType::Setup,
            ValidationType::Revalidate,
            ValidationType::Scheduled,
        ] {
            assert_eq!(ValidationType::parse(t.as_str()), Some(t));
        }
        assert_eq!(ValidationType::parse("periodic"), None);
    }
}
