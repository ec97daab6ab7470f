//! Sync lifecycle orchestration.
//!
//! [`SyncEngine`] owns the periodic sync cycle, guarantees at most one cycle
//! in flight at a time, and produces the merged local+remote history view.
//! It is an explicit instance with injected dependencies (log, remote store,
//! clock via the log) rather than module-level state, so tests can run many
//! isolated engines.

use anyhow::Result;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::progress_log::ProgressLog;
use crate::reconciler::{Reconciler, SyncSummary};
use crate::record::{ProgressKey, ProgressReport, WatchProgress};
use crate::remote::RemoteStore;

/// Read-only snapshot of the engine for the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    /// A sync cycle is in flight right now.
    pub is_syncing: bool,
    /// Entries awaiting remote commit.
    pub pending: usize,
    /// Pending entries that have already failed at least once.
    pub retrying: usize,
    /// The periodic scheduler is running.
    pub is_active: bool,
}

/// What a cycle trigger did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Ran(SyncSummary),
    /// Another cycle was in flight; this trigger was dropped, not queued.
    Skipped,
}

#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

struct Inner {
    log: ProgressLog,
    remote: Arc<dyn RemoteStore>,
    config: SyncConfig,
    /// Single-flight flag; set for the duration of a cycle.
    syncing: AtomicBool,
    /// Shutdown handle of the periodic task; Some while active.
    scheduler: Mutex<Option<watch::Sender<()>>>,
}

impl SyncEngine {
    pub fn new(log: ProgressLog, remote: Arc<dyn RemoteStore>, config: SyncConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                log,
                remote,
                config,
                syncing: AtomicBool::new(false),
                scheduler: Mutex::new(None),
            }),
        }
    }

    /// The underlying log, for direct reads and explicit removals.
    pub fn log(&self) -> &ProgressLog {
        &self.inner.log
    }

    // ── Write path ───────────────────────────────────────────────────

    /// Record a playback tick. Always local; the queue picks it up on the
    /// next cycle. Storage failures surface to the caller.
    pub fn record_progress(&self, report: &ProgressReport) -> Result<()> {
        self.inner.log.upsert(report)
    }

    /// Remove one history entry locally and propagate the tombstone.
    /// Remote failure is logged, not surfaced; the local delete is what the
    /// user observes.
    pub async fn remove_entry(&self, key: &ProgressKey) -> Result<()> {
        self.inner.log.remove(key)?;
        if self.inner.remote.is_authenticated() {
            if let Err(e) = self.inner.remote.delete_progress(key).await {
                warn!("Failed to propagate deletion of {key}: {e}");
            }
        }
        Ok(())
    }

    /// Clear a user's history locally and remotely (best effort).
    pub async fn clear_history(&self, user_id: &str) -> Result<()> {
        self.inner.log.clear(user_id)?;
        if self.inner.remote.is_authenticated() {
            if let Err(e) = self.inner.remote.clear_history(user_id).await {
                warn!("Failed to propagate history clear for {user_id}: {e}");
            }
        }
        Ok(())
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Start the periodic scheduler and trigger one immediate cycle.
    /// Idempotent; a second call while active does nothing.
    pub fn start(&self) {
        let mut scheduler = self.inner.scheduler.lock().unwrap();
        if scheduler.is_some() {
            debug!("Sync scheduler already running");
            return;
        }
        let (tx, mut rx) = watch::channel(());
        *scheduler = Some(tx);

        let engine = self.clone();
        tokio::spawn(async move {
            info!("Sync scheduler started");
            loop {
                let _ = engine.run_cycle().await;
                let delay = engine.cycle_delay();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    // Fires when stop() drops the sender. An in-flight
                    // cycle has already finished by the time we get here.
                    _ = rx.changed() => break,
                }
            }
            info!("Sync scheduler stopped");
        });
    }

    /// Cancel future cycles. An in-flight cycle finishes naturally.
    pub fn stop(&self) {
        if self.inner.scheduler.lock().unwrap().take().is_some() {
            info!("Stopping sync scheduler");
        }
    }

    /// Sync runs only while a user session exists.
    pub fn handle_auth_change(&self, authenticated: bool) {
        if authenticated {
            self.start();
        } else {
            self.stop();
        }
    }

    fn cycle_delay(&self) -> Duration {
        let jitter_cap = self.inner.config.interval_jitter_secs;
        let jitter = if jitter_cap > 0 {
            rand::thread_rng().gen_range(0..=jitter_cap)
        } else {
            0
        };
        Duration::from_secs(self.inner.config.sync_interval_secs + jitter)
    }

    // ── Sync cycles ──────────────────────────────────────────────────

    /// Run one sync cycle unless one is already in flight, in which case
    /// this trigger is dropped (the next periodic tick picks up the work).
    pub async fn run_cycle(&self) -> CycleOutcome {
        if !self.begin_cycle() {
            return CycleOutcome::Skipped;
        }
        let summary = Reconciler::new(&self.inner.log, self.inner.remote.as_ref())
            .sync_all()
            .await;
        self.end_cycle(&summary);
        CycleOutcome::Ran(summary)
    }

    /// User-triggered "retry now": reset every retry counter, then run a
    /// full cycle. Still single-flight.
    pub async fn force_sync_all(&self) -> CycleOutcome {
        if let Err(e) = self.inner.log.reset_retries() {
            warn!("Failed to reset retry counters: {e:#}");
        }
        self.run_cycle().await
    }

    /// Sync a single entry immediately, respecting single-flight.
    pub async fn sync_item_now(&self, key: &ProgressKey) -> CycleOutcome {
        if !self.begin_cycle() {
            return CycleOutcome::Skipped;
        }
        let summary = Reconciler::new(&self.inner.log, self.inner.remote.as_ref())
            .sync_key(key)
            .await;
        self.end_cycle(&summary);
        CycleOutcome::Ran(summary)
    }

    /// Reset retry counters without triggering a cycle.
    pub fn clear_retry_data(&self) -> Result<()> {
        self.inner.log.reset_retries()
    }

    fn begin_cycle(&self) -> bool {
        let acquired = self
            .inner
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if !acquired {
            debug!("Sync cycle already in flight; skipping trigger");
        }
        acquired
    }

    fn end_cycle(&self, summary: &SyncSummary) {
        self.inner.syncing.store(false, Ordering::SeqCst);
        if !summary.is_empty() {
            info!(
                "Sync cycle finished: {} synced, {} retried, {} abandoned",
                summary.synced, summary.retried, summary.abandoned
            );
        }
    }

    // ── Read path ────────────────────────────────────────────────────

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            is_syncing: self.inner.syncing.load(Ordering::SeqCst),
            pending: self.inner.log.pending_count().unwrap_or(0),
            retrying: self.inner.log.retrying_count().unwrap_or(0),
            is_active: self.inner.scheduler.lock().unwrap().is_some(),
        }
    }

    /// Merged local+remote history, most-recently-updated first.
    ///
    /// The remote copy is authoritative per key once it exists; local-only
    /// entries are included so just-made progress is never hidden. A remote
    /// failure degrades to local-only data rather than erroring.
    pub async fn merged_history(&self, user_id: &str) -> Result<Vec<WatchProgress>> {
        let local = self.inner.log.get_all(user_id)?;

        let remote_entries = if self.inner.remote.is_authenticated() {
            match self.inner.remote.list_history(user_id).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("History fetch failed, using local data only: {e}");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let mut by_key: HashMap<ProgressKey, WatchProgress> = local
            .into_iter()
            .map(|record| (record.key.clone(), record))
            .collect();
        for entry in remote_entries {
            let record = entry.into_record(user_id);
            by_key.insert(record.key.clone(), record);
        }

        let mut merged: Vec<WatchProgress> = by_key.into_values().collect();
        merged.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(merged)
    }
}
