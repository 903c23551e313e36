//! Log sinks for the changuard process.
//!
//! Long-running service mode writes to one file per UTC hour under
//! `<runtime>/logs`, named `changuard-YYYY-MM-DD-HH.log`. Files older than
//! the retention window are removed at startup and on every hour rollover.
//! One-shot CLI commands log to the console instead.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::writer::MakeWriter;
use tracing_subscriber::EnvFilter;

pub const LOG_FILE_PREFIX: &str = "changuard-";
pub const LOG_FILE_SUFFIX: &str = ".log";
pub const LOG_RETENTION_DAYS: i64 = 30;

fn default_filter() -> EnvFilter {
    EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into())
}

/// File logging for `changuard start`.
pub fn init_file_logging(runtime_dir: &Path) -> Result<()> {
    let log_dir = runtime_dir.join("logs");
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;
    let removed = remove_expired_logs(&log_dir, Utc::now(), LOG_RETENTION_DAYS)?;

    let sink = HourlyFileSink::open(log_dir, LOG_RETENTION_DAYS)?;
    tracing_subscriber::fmt()
        .with_env_filter(default_filter())
        .with_ansi(false)
        .with_writer(sink)
        .init();

    if removed > 0 {
        tracing::info!(removed, "Removed expired log files");
    }
    Ok(())
}

pub fn init_console_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(default_filter())
        .init();
}

#[derive(Debug)]
struct OpenHour {
    hour: String,
    file: File,
}

#[derive(Clone, Debug)]
struct HourlyFileSink {
    log_dir: PathBuf,
    retention_days: i64,
    current: Arc<Mutex<OpenHour>>,
}

impl HourlyFileSink {
    fn open(log_dir: PathBuf, retention_days: i64) -> Result<Self> {
        let hour = hour_stamp(Utc::now());
        let file = append_to(&log_dir, &hour)
            .with_context(|| format!("Failed to open log file in {}", log_dir.display()))?;
        Ok(Self {
            log_dir,
            retention_days,
            current: Arc::new(Mutex::new(OpenHour { hour, file })),
        })
    }

    fn with_current<T>(
        &self,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut File) -> io::Result<T>,
    ) -> io::Result<T> {
        let mut open = self
            .current
            .lock()
            .map_err(|_| io::Error::other("log sink lock poisoned"))?;
        let hour = hour_stamp(now);
        if open.hour != hour {
            open.file.flush()?;
            open.file = append_to(&self.log_dir, &hour)?;
            open.hour = hour;
            let _ = remove_expired_logs(&self.log_dir, now, self.retention_days);
        }
        f(&mut open.file)
    }
}

impl<'a> MakeWriter<'a> for HourlyFileSink {
    type Writer = SinkHandle;

    fn make_writer(&'a self) -> Self::Writer {
        SinkHandle { sink: self.clone() }
    }
}

struct SinkHandle {
    sink: HourlyFileSink,
}

impl Write for SinkHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sink.with_current(Utc::now(), |file| file.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.with_current(Utc::now(), |file| file.flush())
    }
}

fn hour_stamp(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d-%H").to_string()
}

fn append_to(log_dir: &Path, hour: &str) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(format!("{LOG_FILE_PREFIX}{hour}{LOG_FILE_SUFFIX}")))
}

/// Hour encoded in a log file name, or `None` for files this module did not write.
fn hour_of_log_file(file_name: &str) -> Option<DateTime<Utc>> {
    let stamp = file_name
        .strip_prefix(LOG_FILE_PREFIX)?
        .strip_suffix(LOG_FILE_SUFFIX)?;
    let naive = NaiveDateTime::parse_from_str(&format!("{stamp}:00"), "%Y-%m-%d-%H:%M").ok()?;
    Some(naive.and_utc())
}

/// Delete log files whose hour falls before `now - retention_days`.
pub fn remove_expired_logs(log_dir: &Path, now: DateTime<Utc>, retention_days: i64) -> Result<usize> {
    let cutoff = now - Duration::days(retention_days);
    let entries = match fs::read_dir(log_dir) {
        Ok(v) => v,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", log_dir.display())),
    };

    let mut removed = 0;
    for entry in entries {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(written_at) = path
            .file_name()
            .and_then(|s| s.to_str())
            .and_then(hour_of_log_file)
        else {
            continue;
        };
        if written_at < cutoff && fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}
