//! DC-015: Append-only JSONL run journal.

use super::{RunEvent, TimestampedEvent};
use crate::core::error::{Error, Result};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Generate an ISO 8601 timestamp.
pub fn now_iso8601() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format_iso8601(secs)
}

/// Format seconds since the epoch as `YYYY-MM-DDTHH:MM:SSZ`.
fn format_iso8601(secs: u64) -> String {
    let days = secs / 86400;
    let time_secs = secs % 86400;
    let hours = time_secs / 3600;
    let minutes = (time_secs % 3600) / 60;
    let seconds = time_secs % 60;

    let mut year = 1970u64;
    let mut remaining = days;
    loop {
        let year_days = if is_leap(year) { 366 } else { 365 };
        if remaining < year_days {
            break;
        }
        remaining -= year_days;
        year += 1;
    }
    let feb = if is_leap(year) { 29 } else { 28 };
    let month_days = [31, feb, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
    let mut month = 12;
    for (i, &md) in month_days.iter().enumerate() {
        if remaining < md {
            month = i + 1;
            break;
        }
        remaining -= md;
    }

    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        year,
        month,
        remaining + 1,
        hours,
        minutes,
        seconds
    )
}

fn is_leap(y: u64) -> bool {
    (y % 4 == 0 && y % 100 != 0) || y % 400 == 0
}

/// Generate a run ID.
pub fn generate_run_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("r-{:012x}", nanos & 0xFFFF_FFFF_FFFF)
}

/// Derive the journal path for a recipe.
pub fn event_log_path(journal_dir: &Path, recipe: &str) -> PathBuf {
    journal_dir.join(recipe).join("events.jsonl")
}

/// Append an event to the recipe's journal as one JSON line.
pub async fn append_event(journal_dir: &Path, recipe: &str, event: RunEvent) -> Result<()> {
    let path = event_log_path(journal_dir, recipe);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::io(parent, e))?;
    }

    let te = TimestampedEvent {
        ts: now_iso8601(),
        event,
    };
    let mut line = serde_json::to_string(&te).map_err(|e| Error::codec(e.to_string()))?;
    line.push('\n');

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .map_err(|e| Error::io(&path, e))?;
    file.write_all(line.as_bytes())
        .await
        .map_err(|e| Error::io(&path, e))?;
    file.flush().await.map_err(|e| Error::io(&path, e))?;

    Ok(())
}

/// Read every event of a recipe's journal, oldest first.
pub fn read_events(journal_dir: &Path, recipe: &str) -> Result<Vec<TimestampedEvent>> {
    let path = event_log_path(journal_dir, recipe);
    let content = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::io(&path, e)),
    };
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(|e| Error::config(&path, e.to_string())))
        .collect()
}

/// Journal bound to one directory and one run id.
#[derive(Debug, Clone)]
pub struct Journal {
    dir: PathBuf,
    run_id: String,
}

impl Journal {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            run_id: generate_run_id(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append an event. Journal failures never fail a run.
    pub async fn record(&self, recipe: &str, event: RunEvent) {
        if let Err(e) = append_event(&self.dir, recipe, event).await {
            tracing::warn!(recipe, error = %e, "cannot write journal event");
        }
    }
}
