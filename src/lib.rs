//! Offline-first watch-progress synchronization.
//!
//! Playback progress is always written to a durable local log first, queued
//! for remote delivery, and reconciled with the remote watch-history backend
//! by a periodic sync engine. The network being down never loses a playback
//! position; it only delays the remote commit.

pub mod clock;
pub mod config;
pub mod engine;
pub mod progress_log;
pub mod reconciler;
pub mod record;
pub mod remote;

pub use clock::{Clock, SystemClock};
pub use config::SyncConfig;
pub use engine::{CycleOutcome, SyncEngine, SyncStatus};
pub use progress_log::{ProgressLog, RetryDecision};
pub use reconciler::{Reconciler, SyncOutcome, SyncSummary};
pub use record::{ProgressKey, ProgressReport, WatchProgress};
pub use remote::http::HttpRemoteStore;
pub use remote::{RemoteError, RemoteProgress, RemoteStore};
