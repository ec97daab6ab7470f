//! Delivery of pending log entries to the remote store.
//!
//! The reconciler drains the queue sequentially, classifies each failure as
//! transient or permanent, and applies the bounded-retry give-up policy.
//! It never returns an error: sync is best-effort background work and one
//! bad entry must not block the rest of the queue.

use tracing::{debug, warn};

use crate::progress_log::{ProgressLog, RetryDecision};
use crate::record::{ProgressKey, WatchProgress};
use crate::remote::{RemoteError, RemoteStore};

/// Result of one delivery attempt.
#[derive(Debug)]
pub enum SyncOutcome {
    Synced,
    Transient(RemoteError),
    Permanent(RemoteError),
}

/// Aggregated result of a sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    /// Entries durably accepted by the remote store.
    pub synced: usize,
    /// Entries left queued for the next cycle after a transient failure.
    pub retried: usize,
    /// Entries given up on: marked committed locally without a real remote
    /// commit, so the queue drains instead of retrying forever.
    pub abandoned: usize,
}

impl SyncSummary {
    pub fn is_empty(&self) -> bool {
        self.synced == 0 && self.retried == 0 && self.abandoned == 0
    }
}

pub struct Reconciler<'a> {
    log: &'a ProgressLog,
    remote: &'a dyn RemoteStore,
}

impl<'a> Reconciler<'a> {
    pub fn new(log: &'a ProgressLog, remote: &'a dyn RemoteStore) -> Self {
        Self { log, remote }
    }

    /// Attempt a single remote upsert and classify the result.
    pub async fn sync_one(&self, record: &WatchProgress) -> SyncOutcome {
        match self.remote.upsert_progress(record).await {
            Ok(()) => SyncOutcome::Synced,
            Err(e) if e.is_transient() => SyncOutcome::Transient(e),
            Err(e) => SyncOutcome::Permanent(e),
        }
    }

    /// Deliver every pending entry, in queue order.
    ///
    /// The pending list is read fresh here, not snapshotted by the caller,
    /// so writes racing a cycle are picked up.
    pub async fn sync_all(&self) -> SyncSummary {
        let pending = match self.log.list_pending() {
            Ok(pending) => pending,
            Err(e) => {
                warn!("Failed to read pending queue: {e:#}");
                return SyncSummary::default();
            }
        };

        let mut summary = SyncSummary::default();
        for key in pending {
            self.sync_entry(&key, &mut summary).await;
        }
        summary
    }

    /// Deliver one queued key (used by explicit per-item sync).
    pub async fn sync_key(&self, key: &ProgressKey) -> SyncSummary {
        let mut summary = SyncSummary::default();
        self.sync_entry(key, &mut summary).await;
        summary
    }

    async fn sync_entry(&self, key: &ProgressKey, summary: &mut SyncSummary) {
        let record = match self.log.get(key) {
            Ok(Some(record)) => record,
            Ok(None) => {
                // Record deleted while queued; drop the stale entry.
                if let Err(e) = self.log.dequeue(key) {
                    warn!("Failed to drop stale queue entry {key}: {e:#}");
                }
                return;
            }
            Err(e) => {
                warn!("Failed to load record {key}: {e:#}");
                return;
            }
        };
        if record.committed {
            if let Err(e) = self.log.dequeue(key) {
                warn!("Failed to drop committed queue entry {key}: {e:#}");
            }
            return;
        }

        match self.sync_one(&record).await {
            SyncOutcome::Synced => {
                if let Err(e) = self.log.mark_committed(key) {
                    warn!("Synced {key} but failed to mark committed: {e:#}");
                    return;
                }
                debug!("Synced {key}");
                summary.synced += 1;
            }
            SyncOutcome::Transient(err) => match self.log.increment_retry(key) {
                Ok(RetryDecision::Retry(count)) => {
                    debug!("Transient failure for {key} (attempt {count}): {err}");
                    summary.retried += 1;
                }
                Ok(RetryDecision::GiveUp) => {
                    self.abandon(key, summary, &err);
                }
                Err(e) => {
                    warn!("Failed to record retry for {key}: {e:#}");
                }
            },
            SyncOutcome::Permanent(err) => {
                self.abandon(key, summary, &err);
            }
        }
    }

    /// Give up on an entry: mark it committed locally even though the remote
    /// store never accepted it, so the queue drains. The local record keeps
    /// the user's position; only the commit state is a lie, which is why the
    /// discrepancy is logged and counted rather than silent.
    fn abandon(&self, key: &ProgressKey, summary: &mut SyncSummary, err: &RemoteError) {
        warn!("Abandoning sync of {key}: {err}");
        if let Err(e) = self.log.mark_committed(key) {
            warn!("Failed to abandon {key}: {e:#}");
            return;
        }
        summary.abandoned += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::ManualClock;
    use crate::config::SyncConfig;
    use crate::record::ProgressReport;
    use crate::remote::testing::MockRemoteStore;
    use chrono::DateTime;
    use std::sync::Arc;

    fn test_log() -> (tempfile::TempDir, ProgressLog) {
        let clock = Arc::new(ManualClock::new(
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        ));
        ProgressLog::new_temp(&SyncConfig::default(), clock).unwrap()
    }

    fn report(content: &str, episode: u32) -> ProgressReport {
        ProgressReport {
            key: ProgressKey::new("u1", content, episode),
            title: format!("{content} ep{episode}"),
            position_secs: 610.0,
            duration_secs: 1450.0,
        }
    }

    fn network_err() -> RemoteError {
        RemoteError::Network("connection reset".to_string())
    }

    #[tokio::test]
    async fn test_successful_sync_commits_and_dequeues() {
        let (_dir, log) = test_log();
        let remote = MockRemoteStore::new();
        log.upsert(&report("42", 3)).unwrap();

        let summary = Reconciler::new(&log, &remote).sync_all().await;

        assert_eq!(summary, SyncSummary { synced: 1, retried: 0, abandoned: 0 });
        let key = ProgressKey::new("u1", "42", 3);
        assert!(log.get(&key).unwrap().unwrap().committed);
        assert_eq!(log.pending_count().unwrap(), 0);
        assert_eq!(remote.upserted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_leaves_entry_queued() {
        let (_dir, log) = test_log();
        let remote = MockRemoteStore::new();
        remote.script_upserts([Err(network_err())]);
        log.upsert(&report("42", 3)).unwrap();

        let summary = Reconciler::new(&log, &remote).sync_all().await;

        assert_eq!(summary, SyncSummary { synced: 0, retried: 1, abandoned: 0 });
        let key = ProgressKey::new("u1", "42", 3);
        assert!(!log.get(&key).unwrap().unwrap().committed);
        assert_eq!(log.retry_count(&key).unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_bounded_retries_end_in_abandonment() {
        // After max_retries transient failures the entry is abandoned:
        // dequeued and marked committed locally despite never syncing.
        let (_dir, log) = test_log();
        let remote = MockRemoteStore::new();
        remote.script_upserts(std::iter::repeat_with(|| Err(network_err())).take(4));
        log.upsert(&report("42", 3)).unwrap();

        let reconciler = Reconciler::new(&log, &remote);
        for _ in 0..3 {
            let summary = reconciler.sync_all().await;
            assert_eq!(summary.retried, 1);
        }
        let summary = reconciler.sync_all().await;
        assert_eq!(summary, SyncSummary { synced: 0, retried: 0, abandoned: 1 });

        let key = ProgressKey::new("u1", "42", 3);
        assert_eq!(log.pending_count().unwrap(), 0);
        let record = log.get(&key).unwrap().unwrap();
        assert!(record.committed);
        // The local position survives the give-up
        assert_eq!(record.position_secs, 610.0);
    }

    #[tokio::test]
    async fn test_permanent_failure_abandons_immediately() {
        let (_dir, log) = test_log();
        let remote = MockRemoteStore::new();
        remote.script_upserts([Err(RemoteError::Validation("bad episode".to_string()))]);
        log.upsert(&report("42", 3)).unwrap();

        let summary = Reconciler::new(&log, &remote).sync_all().await;

        assert_eq!(summary, SyncSummary { synced: 0, retried: 0, abandoned: 1 });
        assert_eq!(log.pending_count().unwrap(), 0);
        assert_eq!(remote.upsert_call_count(), 1);
    }

    #[tokio::test]
    async fn test_auth_failure_is_permanent() {
        let (_dir, log) = test_log();
        let remote = MockRemoteStore::new();
        remote.script_upserts([Err(RemoteError::Auth)]);
        log.upsert(&report("42", 3)).unwrap();

        let summary = Reconciler::new(&log, &remote).sync_all().await;
        assert_eq!(summary.abandoned, 1);
    }

    #[tokio::test]
    async fn test_one_bad_entry_does_not_block_the_rest() {
        let (_dir, log) = test_log();
        let remote = MockRemoteStore::new();
        log.upsert(&report("42", 1)).unwrap();
        log.upsert(&report("42", 2)).unwrap();
        log.upsert(&report("42", 3)).unwrap();
        // First entry fails, the remaining two succeed
        remote.script_upserts([Err(network_err()), Ok(()), Ok(())]);

        let summary = Reconciler::new(&log, &remote).sync_all().await;

        assert_eq!(summary, SyncSummary { synced: 2, retried: 1, abandoned: 0 });
        assert_eq!(
            log.list_pending().unwrap(),
            vec![ProgressKey::new("u1", "42", 1)]
        );
    }

    #[tokio::test]
    async fn test_entries_delivered_in_queue_order() {
        let (_dir, log) = test_log();
        let remote = MockRemoteStore::new();
        log.upsert(&report("42", 2)).unwrap();
        log.upsert(&report("7", 1)).unwrap();
        log.upsert(&report("42", 1)).unwrap();

        Reconciler::new(&log, &remote).sync_all().await;

        let sent: Vec<ProgressKey> = remote
            .upserted
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.key.clone())
            .collect();
        assert_eq!(
            sent,
            vec![
                ProgressKey::new("u1", "42", 2),
                ProgressKey::new("u1", "7", 1),
                ProgressKey::new("u1", "42", 1),
            ]
        );
    }

    #[tokio::test]
    async fn test_stale_queue_entry_is_dropped() {
        let (_dir, log) = test_log();
        let remote = MockRemoteStore::new();
        log.upsert(&report("42", 3)).unwrap();
        let key = ProgressKey::new("u1", "42", 3);
        // Simulate a record that vanished while queued
        log.remove(&key).unwrap();
        log.upsert(&report("7", 1)).unwrap();

        let summary = Reconciler::new(&log, &remote).sync_all().await;

        assert_eq!(summary.synced, 1);
        assert_eq!(log.pending_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sync_key_single_entry() {
        let (_dir, log) = test_log();
        let remote = MockRemoteStore::new();
        log.upsert(&report("42", 1)).unwrap();
        log.upsert(&report("42", 2)).unwrap();

        let key = ProgressKey::new("u1", "42", 2);
        let summary = Reconciler::new(&log, &remote).sync_key(&key).await;

        assert_eq!(summary.synced, 1);
        assert!(log.get(&key).unwrap().unwrap().committed);
        // The other entry is untouched
        assert_eq!(
            log.list_pending().unwrap(),
            vec![ProgressKey::new("u1", "42", 1)]
        );
    }

    #[tokio::test]
    async fn test_empty_queue_is_a_quiet_noop() {
        let (_dir, log) = test_log();
        let remote = MockRemoteStore::new();

        let summary = Reconciler::new(&log, &remote).sync_all().await;

        assert!(summary.is_empty());
        assert_eq!(remote.upsert_call_count(), 0);
    }
}
