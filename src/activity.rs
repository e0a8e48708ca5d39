//! Append-only user activity log.
//!
//! Every record carries the embedding of what the user searched for or looked
//! at; the recent window per user is the implicit preference signal used by
//! category personalization. Logging is best-effort: nothing in here ever
//! returns an error to the caller's primary action.

use std::{
    fs::OpenOptions,
    io::ErrorKind,
    path::PathBuf,
    sync::{Arc, Mutex, RwLock},
};

use serde::{Deserialize, Serialize};

use crate::{
    config::ActivityConfig,
    semantic::{Embedding, EmbeddingProvider},
};

const MILLIS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Search,
    View,
    Click,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionKind::Search => write!(f, "search"),
            ActionKind::View => write!(f, "view"),
            ActionKind::Click => write!(f, "click"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    MissingUser,
    MissingContent,
    EmbeddingFailed,
    WriteFailed,
}

/// Outcome of a best-effort write. Callers may inspect it but never escalate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Logged {
    Written,
    Skipped(SkipReason),
}

#[derive(Debug, Clone)]
pub struct ActivityRecord {
    pub user_id: String,
    pub action: ActionKind,
    pub content: String,
    pub embedding: Embedding,
    /// Unix millis
    pub timestamp: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ActivityRow {
    user_id: String,
    action: ActionKind,
    content: String,
    timestamp: i64,
    embedding: String,
}

impl From<&ActivityRecord> for ActivityRow {
    fn from(record: &ActivityRecord) -> Self {
        Self {
            user_id: record.user_id.clone(),
            action: record.action,
            content: record.content.clone(),
            timestamp: record.timestamp,
            embedding: record.embedding.to_base64(),
        }
    }
}

pub struct ActivityLedger {
    path: PathBuf,
    provider: Arc<dyn EmbeddingProvider>,
    retention: ActivityConfig,
    records: RwLock<Vec<ActivityRecord>>,
    /// rows currently in the csv file; also serializes writes to it
    file_rows: Mutex<usize>,
}

impl ActivityLedger {
    /// Replays the log, applies retention and rewrites the compacted file.
    pub fn open(
        path: impl Into<PathBuf>,
        provider: Arc<dyn EmbeddingProvider>,
        retention: ActivityConfig,
    ) -> anyhow::Result<Self> {
        let path = path.into();

        let mut records = vec![];
        let mut dropped = 0usize;
        match csv::Reader::from_path(&path) {
            Ok(mut reader) => {
                for row in reader.deserialize::<ActivityRow>() {
                    // a crash mid-append leaves a torn last row
                    let row = match row {
                        Ok(row) => row,
                        Err(err) => {
                            dropped += 1;
                            log::warn!("skipping unreadable activity row: {err}");
                            continue;
                        }
                    };
                    match Embedding::from_base64(&row.embedding) {
                        Ok(embedding) => records.push(ActivityRecord {
                            user_id: row.user_id,
                            action: row.action,
                            content: row.content,
                            embedding,
                            timestamp: row.timestamp,
                        }),
                        Err(err) => {
                            dropped += 1;
                            log::warn!("skipping unreadable activity record: {err}");
                        }
                    }
                }
            }
            Err(err) if is_not_found(&err) => {}
            Err(err) => Err(err)?,
        }

        let before = records.len();
        let records = apply_retention(records, &retention, chrono::Utc::now().timestamp_millis());
        log::info!(
            "loaded {} activity records ({} evicted, {} unreadable)",
            records.len(),
            before - records.len(),
            dropped
        );

        let ledger = Self {
            path,
            provider,
            retention,
            records: RwLock::new(records),
            file_rows: Mutex::new(0),
        };
        ledger.compact()?;

        Ok(ledger)
    }

    /// Rewrite the log file with exactly the retained records.
    fn compact(&self) -> anyhow::Result<()> {
        let mut file_rows = self.file_rows.lock().unwrap_or_else(|e| e.into_inner());
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());

        let temp_path = self.path.with_extension("csv.tmp");
        {
            let mut csv_wrt = csv::Writer::from_path(&temp_path)?;
            if records.is_empty() {
                csv_wrt.write_record(["user_id", "action", "content", "timestamp", "embedding"])?;
            }
            for record in records.iter() {
                csv_wrt.serialize(ActivityRow::from(record))?;
            }
            csv_wrt.flush()?;
        }
        std::fs::rename(&temp_path, &self.path)?;
        *file_rows = records.len();

        Ok(())
    }

    fn append(&self, record: &ActivityRecord) -> anyhow::Result<()> {
        let mut file_rows = self.file_rows.lock().unwrap_or_else(|e| e.into_inner());
        let file = OpenOptions::new().append(true).create(true).open(&self.path)?;
        let mut csv_wrt = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        csv_wrt.serialize(ActivityRow::from(record))?;
        csv_wrt.flush()?;
        *file_rows += 1;
        Ok(())
    }

    /// Evicted records stay in the file until it holds more than twice the
    /// retained ones; then retention is reapplied and the file rewritten.
    fn compact_if_oversized(&self) {
        let file_rows = *self.file_rows.lock().unwrap_or_else(|e| e.into_inner());
        if file_rows <= 2 * self.len().max(1) {
            return;
        }

        {
            let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
            let all = std::mem::take(&mut *records);
            *records = apply_retention(all, &self.retention, chrono::Utc::now().timestamp_millis());
        }

        match self.compact() {
            Ok(()) => log::debug!("compacted activity log from {file_rows} rows to {}", self.len()),
            Err(err) => log::warn!("failed to compact activity log: {err}"),
        }
    }

    /// Log one user action. `content` is embedded when no vector is supplied.
    pub fn record(
        &self,
        user_id: &str,
        action: ActionKind,
        content: &str,
        vector: Option<Embedding>,
    ) -> Logged {
        let user_id = user_id.trim();
        let content = content.trim();

        if user_id.is_empty() {
            return Logged::Skipped(SkipReason::MissingUser);
        }
        if content.is_empty() {
            return Logged::Skipped(SkipReason::MissingContent);
        }

        let embedding = match vector {
            Some(v) => v,
            None => match self.provider.embed_text(content) {
                Ok(v) => v,
                Err(err) => {
                    log::debug!("not logging {action} for {user_id}: {err}");
                    return Logged::Skipped(SkipReason::EmbeddingFailed);
                }
            },
        };

        let record = ActivityRecord {
            user_id: user_id.to_string(),
            action,
            content: content.to_string(),
            embedding,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };

        if let Err(err) = self.append(&record) {
            log::warn!("failed to append activity record: {err}");
            return Logged::Skipped(SkipReason::WriteFailed);
        }

        {
            let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
            records.push(record);
            evict_user_overflow(&mut records, user_id, self.retention.max_records_per_user);
        }
        self.compact_if_oversized();

        Logged::Written
    }

    /// Up to `limit` embeddings of the user's `action` records, newest first.
    pub fn recent_embeddings(&self, user_id: &str, action: ActionKind, limit: usize) -> Vec<Embedding> {
        let cutoff = self.cutoff(chrono::Utc::now().timestamp_millis());
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());

        let mut matching: Vec<&ActivityRecord> = records
            .iter()
            .filter(|r| r.user_id == user_id && r.action == action && r.timestamp >= cutoff)
            .collect();

        // records are appended in time order; the stable sort keeps later
        // appends first among equal timestamps after the reverse
        matching.reverse();
        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        matching
            .into_iter()
            .take(limit)
            .map(|r| r.embedding.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn cutoff(&self, now: i64) -> i64 {
        now - self.retention.max_age_days as i64 * MILLIS_PER_DAY
    }
}

fn is_not_found(err: &csv::Error) -> bool {
    matches!(err.kind(), csv::ErrorKind::Io(io) if io.kind() == ErrorKind::NotFound)
}

/// Keep records younger than the max age and at most the newest
/// `max_records_per_user` per user, preserving log order.
fn apply_retention(
    records: Vec<ActivityRecord>,
    retention: &ActivityConfig,
    now: i64,
) -> Vec<ActivityRecord> {
    let cutoff = now - retention.max_age_days as i64 * MILLIS_PER_DAY;

    let mut per_user: std::collections::HashMap<String, usize> = Default::default();
    let mut kept: Vec<ActivityRecord> = records
        .into_iter()
        .rev()
        .filter(|r| r.timestamp >= cutoff)
        .filter(|r| {
            let seen = per_user.entry(r.user_id.clone()).or_default();
            *seen += 1;
            *seen <= retention.max_records_per_user
        })
        .collect();
    kept.reverse();
    kept
}

fn evict_user_overflow(records: &mut Vec<ActivityRecord>, user_id: &str, max: usize) {
    let count = records.iter().filter(|r| r.user_id == user_id).count();
    if count <= max {
        return;
    }

    let mut excess = count - max;
    records.retain(|r| {
        if excess > 0 && r.user_id == user_id {
            excess -= 1;
            false
        } else {
            true
        }
    });
}
