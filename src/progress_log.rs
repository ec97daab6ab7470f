use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, Table, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::record::{ProgressKey, ProgressReport, WatchProgress};

const PROGRESS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("watch_progress");
const PENDING_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("pending_sync");

/// Serialized record form stored as JSON bytes in redb.
/// The composite key is the table key, not repeated in the value.
#[derive(Serialize, Deserialize)]
struct StoredRecord {
    title: String,
    position_secs: f64,
    duration_secs: f64,
    updated_at_ms: i64,
    committed: bool,
}

impl StoredRecord {
    fn into_record(self, key: ProgressKey) -> WatchProgress {
        let updated_at = DateTime::from_timestamp_millis(self.updated_at_ms)
            .unwrap_or_else(Utc::now);
        WatchProgress {
            key,
            title: self.title,
            position_secs: self.position_secs,
            duration_secs: self.duration_secs,
            updated_at,
            committed: self.committed,
        }
    }
}

/// Queue entry for a record awaiting remote commit.
#[derive(Serialize, Deserialize)]
struct PendingEntry {
    /// Monotonic insertion sequence; `list_pending` order.
    seq: u64,
    retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_attempt_ms: Option<i64>,
}

/// Verdict from `increment_retry`. The queue never abandons an entry on
/// its own; it tells the caller to give up and the caller decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Entry stays queued; carries the new retry count.
    Retry(u32),
    /// Retry budget exhausted (or entry vanished); caller should
    /// mark the record committed and dequeue.
    GiveUp,
}

/// Durable local log of watch-progress records plus the pending-sync queue,
/// persisted as two tables of one redb database so every mutation keeps the
/// queue invariant (queued iff uncommitted) inside a single transaction.
pub struct ProgressLog {
    db: Database,
    cap: usize,
    max_retries: u32,
    clock: Arc<dyn Clock>,
}

impl ProgressLog {
    pub fn open(path: &Path, config: &SyncConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let db = Database::create(path)
            .context("Failed to open progress database")?;
        // Ensure tables exist
        let txn = db.begin_write()?;
        {
            let _ = txn.open_table(PROGRESS_TABLE)?;
            let _ = txn.open_table(PENDING_TABLE)?;
        }
        txn.commit()?;
        Ok(Self {
            db,
            cap: config.history_cap,
            max_retries: config.max_retries,
            clock,
        })
    }

    /// Open the database at its default per-profile location.
    pub fn open_default(config: &SyncConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let path = Self::default_db_path()?;
        Self::open(&path, config, clock)
    }

    fn default_db_path() -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .context("Failed to get data directory")?
            .join("shiori");
        std::fs::create_dir_all(&data_dir)
            .context("Failed to create data directory")?;
        Ok(data_dir.join("progress.redb"))
    }

    // ── Log ──────────────────────────────────────────────────────────

    /// Insert or replace the record at its composite key.
    ///
    /// Sets `committed = false` and `updated_at = now`, queues the key for
    /// sync (an already-queued key keeps its retry counter), and evicts the
    /// user's least-recently-updated records beyond the cap. A storage
    /// failure surfaces to the caller; it is not retried here.
    pub fn upsert(&self, report: &ProgressReport) -> Result<()> {
        report.validate()?;
        let storage_key = report.key.storage_key();
        let now_ms = self.clock.now().timestamp_millis();

        let txn = self.db.begin_write()
            .context("Failed to begin progress write")?;
        {
            let mut records = txn.open_table(PROGRESS_TABLE)?;
            let mut pending = txn.open_table(PENDING_TABLE)?;

            let stored = StoredRecord {
                title: report.title.clone(),
                position_secs: report.position_secs,
                duration_secs: report.duration_secs,
                updated_at_ms: now_ms,
                committed: false,
            };
            let json = serde_json::to_vec(&stored)?;
            records.insert(storage_key.as_str(), json.as_slice())?;

            if pending.get(storage_key.as_str())?.is_none() {
                let entry = PendingEntry {
                    seq: next_seq(&pending)?,
                    retries: 0,
                    last_attempt_ms: None,
                };
                let json = serde_json::to_vec(&entry)?;
                pending.insert(storage_key.as_str(), json.as_slice())?;
            }

            evict_over_cap(&mut records, &mut pending, &report.key.user_id, self.cap)?;
        }
        txn.commit().context("Failed to commit progress upsert")?;
        Ok(())
    }

    pub fn get(&self, key: &ProgressKey) -> Result<Option<WatchProgress>> {
        let storage_key = key.storage_key();
        let rtxn = self.db.begin_read()?;
        let table = rtxn.open_table(PROGRESS_TABLE)?;
        match table.get(storage_key.as_str())? {
            Some(v) => {
                let stored: StoredRecord = serde_json::from_slice(v.value())
                    .context("Corrupt progress record")?;
                Ok(Some(stored.into_record(key.clone())))
            }
            None => Ok(None),
        }
    }

    /// All of a user's records, most-recently-updated first.
    pub fn get_all(&self, user_id: &str) -> Result<Vec<WatchProgress>> {
        let prefix = ProgressKey::user_prefix(user_id);
        let rtxn = self.db.begin_read()?;
        let table = rtxn.open_table(PROGRESS_TABLE)?;

        let mut records = Vec::new();
        for item in table.range(prefix.as_str()..)? {
            let (k, v) = item?;
            let raw_key = k.value();
            if !raw_key.starts_with(&prefix) {
                break;
            }
            let key = match ProgressKey::from_storage_key(raw_key) {
                Some(key) => key,
                None => continue,
            };
            if let Ok(stored) = serde_json::from_slice::<StoredRecord>(v.value()) {
                records.push(stored.into_record(key));
            }
        }
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(records)
    }

    /// Mark the record durably accepted by the remote store and dequeue it.
    /// Idempotent; a missing record is a no-op.
    pub fn mark_committed(&self, key: &ProgressKey) -> Result<()> {
        let storage_key = key.storage_key();
        let txn = self.db.begin_write()?;
        {
            let mut records = txn.open_table(PROGRESS_TABLE)?;
            let mut pending = txn.open_table(PENDING_TABLE)?;

            let existing = records
                .get(storage_key.as_str())?
                .map(|v| v.value().to_vec());
            if let Some(raw) = existing {
                let mut stored: StoredRecord = serde_json::from_slice(&raw)
                    .context("Corrupt progress record")?;
                if !stored.committed {
                    stored.committed = true;
                    let json = serde_json::to_vec(&stored)?;
                    records.insert(storage_key.as_str(), json.as_slice())?;
                }
            }
            pending.remove(storage_key.as_str())?;
        }
        txn.commit().context("Failed to commit progress update")?;
        Ok(())
    }

    /// Hard delete a single record and its queue entry.
    pub fn remove(&self, key: &ProgressKey) -> Result<()> {
        let storage_key = key.storage_key();
        let txn = self.db.begin_write()?;
        {
            let mut records = txn.open_table(PROGRESS_TABLE)?;
            let mut pending = txn.open_table(PENDING_TABLE)?;
            records.remove(storage_key.as_str())?;
            pending.remove(storage_key.as_str())?;
        }
        txn.commit().context("Failed to commit progress removal")?;
        Ok(())
    }

    /// Remove all of a user's records and queue entries.
    pub fn clear(&self, user_id: &str) -> Result<()> {
        let prefix = ProgressKey::user_prefix(user_id);
        let txn = self.db.begin_write()?;
        {
            let mut records = txn.open_table(PROGRESS_TABLE)?;
            let mut pending = txn.open_table(PENDING_TABLE)?;
            remove_by_prefix(&mut records, &prefix)?;
            remove_by_prefix(&mut pending, &prefix)?;
        }
        txn.commit().context("Failed to commit history clear")?;
        Ok(())
    }

    // ── Pending queue ────────────────────────────────────────────────

    /// Currently queued keys in insertion order.
    pub fn list_pending(&self) -> Result<Vec<ProgressKey>> {
        let rtxn = self.db.begin_read()?;
        let table = rtxn.open_table(PENDING_TABLE)?;

        let mut entries: Vec<(u64, ProgressKey)> = Vec::new();
        for item in table.iter()? {
            let (k, v) = item?;
            let key = match ProgressKey::from_storage_key(k.value()) {
                Some(key) => key,
                None => continue,
            };
            if let Ok(entry) = serde_json::from_slice::<PendingEntry>(v.value()) {
                entries.push((entry.seq, key));
            }
        }
        entries.sort_by_key(|(seq, _)| *seq);
        Ok(entries.into_iter().map(|(_, key)| key).collect())
    }

    /// Drop a key from the queue. Idempotent.
    pub fn dequeue(&self, key: &ProgressKey) -> Result<()> {
        let storage_key = key.storage_key();
        let txn = self.db.begin_write()?;
        {
            let mut pending = txn.open_table(PENDING_TABLE)?;
            pending.remove(storage_key.as_str())?;
        }
        txn.commit().context("Failed to commit dequeue")?;
        Ok(())
    }

    /// Record a failed delivery attempt.
    ///
    /// Returns [`RetryDecision::GiveUp`] once the new count exceeds the
    /// retry budget; the caller then abandons the entry.
    pub fn increment_retry(&self, key: &ProgressKey) -> Result<RetryDecision> {
        let storage_key = key.storage_key();
        let now_ms = self.clock.now().timestamp_millis();
        let txn = self.db.begin_write()?;
        let decision;
        {
            let mut pending = txn.open_table(PENDING_TABLE)?;
            let existing = pending
                .get(storage_key.as_str())?
                .map(|v| v.value().to_vec());
            match existing {
                Some(raw) => {
                    let mut entry: PendingEntry = serde_json::from_slice(&raw)
                        .context("Corrupt pending entry")?;
                    entry.retries += 1;
                    entry.last_attempt_ms = Some(now_ms);
                    decision = if entry.retries > self.max_retries {
                        RetryDecision::GiveUp
                    } else {
                        RetryDecision::Retry(entry.retries)
                    };
                    let json = serde_json::to_vec(&entry)?;
                    pending.insert(storage_key.as_str(), json.as_slice())?;
                }
                None => decision = RetryDecision::GiveUp,
            }
        }
        txn.commit().context("Failed to commit retry update")?;
        Ok(decision)
    }

    /// Reset every retry counter to zero (explicit "retry now" actions).
    pub fn reset_retries(&self) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut pending = txn.open_table(PENDING_TABLE)?;
            let entries: Vec<(String, Vec<u8>)> = pending
                .iter()?
                .map(|item| item.map(|(k, v)| (k.value().to_string(), v.value().to_vec())))
                .collect::<std::result::Result<_, _>>()?;
            for (key, raw) in entries {
                if let Ok(mut entry) = serde_json::from_slice::<PendingEntry>(&raw) {
                    if entry.retries != 0 {
                        entry.retries = 0;
                        let json = serde_json::to_vec(&entry)?;
                        pending.insert(key.as_str(), json.as_slice())?;
                    }
                }
            }
        }
        txn.commit().context("Failed to commit retry reset")?;
        Ok(())
    }

    pub fn pending_count(&self) -> Result<usize> {
        Ok(self.list_pending()?.len())
    }

    /// Queued entries that have failed at least once.
    pub fn retrying_count(&self) -> Result<usize> {
        let rtxn = self.db.begin_read()?;
        let table = rtxn.open_table(PENDING_TABLE)?;
        let mut count = 0;
        for item in table.iter()? {
            let (_, v) = item?;
            if let Ok(entry) = serde_json::from_slice::<PendingEntry>(v.value()) {
                if entry.retries > 0 {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    /// Current retry count for a queued key; None when not queued.
    pub fn retry_count(&self, key: &ProgressKey) -> Result<Option<u32>> {
        let storage_key = key.storage_key();
        let rtxn = self.db.begin_read()?;
        let table = rtxn.open_table(PENDING_TABLE)?;
        match table.get(storage_key.as_str())? {
            Some(v) => {
                let entry: PendingEntry = serde_json::from_slice(v.value())
                    .context("Corrupt pending entry")?;
                Ok(Some(entry.retries))
            }
            None => Ok(None),
        }
    }

    #[cfg(test)]
    pub(crate) fn new_temp(
        config: &SyncConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<(tempfile::TempDir, Self)> {
        let dir = tempfile::tempdir()?;
        let log = Self::open(&dir.path().join("progress.redb"), config, clock)?;
        Ok((dir, log))
    }
}

fn next_seq(pending: &Table<'_, &'static str, &'static [u8]>) -> Result<u64> {
    let mut max_seq = 0u64;
    for item in pending.iter()? {
        let (_, v) = item?;
        if let Ok(entry) = serde_json::from_slice::<PendingEntry>(v.value()) {
            max_seq = max_seq.max(entry.seq);
        }
    }
    Ok(max_seq + 1)
}

fn evict_over_cap(
    records: &mut Table<'_, &'static str, &'static [u8]>,
    pending: &mut Table<'_, &'static str, &'static [u8]>,
    user_id: &str,
    cap: usize,
) -> Result<()> {
    let prefix = ProgressKey::user_prefix(user_id);
    let mut entries: Vec<(String, i64)> = Vec::new();
    for item in records.range(prefix.as_str()..)? {
        let (k, v) = item?;
        let raw_key = k.value();
        if !raw_key.starts_with(&prefix) {
            break;
        }
        if let Ok(stored) = serde_json::from_slice::<StoredRecord>(v.value()) {
            entries.push((raw_key.to_string(), stored.updated_at_ms));
        }
    }
    if entries.len() <= cap {
        return Ok(());
    }

    // Least-recently-updated first
    entries.sort_by_key(|(_, updated_at_ms)| *updated_at_ms);
    let excess = entries.len() - cap;
    for (key, _) in entries.into_iter().take(excess) {
        records.remove(key.as_str())?;
        pending.remove(key.as_str())?;
    }
    Ok(())
}

fn remove_by_prefix(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    prefix: &str,
) -> Result<()> {
    let keys: Vec<String> = table
        .range(prefix..)?
        .map(|item| item.map(|(k, _)| k.value().to_string()))
        .collect::<std::result::Result<_, _>>()?;
    for key in keys {
        if !key.starts_with(prefix) {
            break;
        }
        table.remove(key.as_str())?;
    }
    Ok(())
}
