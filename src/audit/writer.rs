//! Append-only JSONL audit sink, one file per UTC day.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{NaiveDate, Utc};
use tracing::warn;

use super::{AuditEntry, AuditLogger};
use crate::{AppError, Result};

/// File opened for the current calendar day.
struct DailyFile {
    date: NaiveDate,
    writer: BufWriter<File>,
}

/// Writes `bus-audit-YYYY-MM-DD.jsonl` files under one directory.
///
/// Appends one JSON object per line to `<log_dir>/bus-audit-YYYY-MM-DD.jsonl`
/// and flushes after every entry, so a crash loses at most the entry being
/// written.
pub struct JsonlAuditWriter {
    log_dir: PathBuf,
    current: Mutex<Option<DailyFile>>,
}

impl JsonlAuditWriter {
    /// Construct a writer that stores logs in `log_dir`, creating it if
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if the directory cannot be created.
    pub fn new(log_dir: impl Into<PathBuf>) -> Result<Self> {
        let log_dir = log_dir.into();
        fs::create_dir_all(&log_dir).map_err(|err| {
            AppError::Io(format!(
                "failed to create audit directory {}: {err}",
                log_dir.display()
            ))
        })?;
        Ok(Self {
            log_dir,
            current: Mutex::new(None),
        })
    }

    /// Path of the file entries for `date` go to.
    #[must_use]
    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        Self::file_path(&self.log_dir, date)
    }

    fn file_path(log_dir: &Path, date: NaiveDate) -> PathBuf {
        log_dir.join(format!("bus-audit-{date}.jsonl"))
    }

    fn open(log_dir: &Path, date: NaiveDate) -> Result<DailyFile> {
        let path = Self::file_path(log_dir, date);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| AppError::Io(format!("failed to open {}: {err}", path.display())))?;
        Ok(DailyFile {
            date,
            writer: BufWriter::new(file),
        })
    }
}

impl AuditLogger for JsonlAuditWriter {
    fn log_entry(&self, entry: AuditEntry) -> Result<()> {
        let today = Utc::now().date_naive();
        let line = serde_json::to_string(&entry)
            .map_err(|err| AppError::Io(format!("failed to serialize audit entry: {err}")))?;

        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if !current.as_ref().is_some_and(|file| file.date == today) {
            *current = Some(Self::open(&self.log_dir, today)?);
        }
        let Some(file) = current.as_mut() else {
            return Err(AppError::Io("audit file unavailable".into()));
        };

        writeln!(file.writer, "{line}")
            .and_then(|()| file.writer.flush())
            .map_err(|err| {
                warn!(%err, "audit write failed");
                AppError::Io(format!("audit write failed: {err}"))
            })
    }
}
