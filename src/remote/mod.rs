//! Remote watch-history backend abstraction.
//!
//! The sync engine only ever talks to the backend through [`RemoteStore`],
//! so tests can substitute a scripted implementation and the reconciler can
//! classify failures without knowing the transport.

pub mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::{ProgressKey, WatchProgress};

/// Errors from the remote store, split into transient failures (worth
/// retrying on a later cycle) and permanent ones (retrying cannot succeed).
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("server error (status {0})")]
    Server(u16),

    #[error("not authenticated")]
    Auth,

    #[error("request rejected: {0}")]
    Validation(String),

    #[error("malformed response: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Transient failures are retried across cycles; the rest are abandoned
    /// immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteError::Network(_) | RemoteError::Timeout | RemoteError::Server(_)
        )
    }
}

/// One watch-history entry as reported by the remote store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteProgress {
    pub content_id: String,
    pub episode: u32,
    pub title: String,
    pub position_secs: f64,
    pub duration_secs: f64,
    pub completed: bool,
    pub updated_at: DateTime<Utc>,
}

impl RemoteProgress {
    /// View a remote entry as a local record. Remote entries are committed
    /// by definition.
    pub fn into_record(self, user_id: &str) -> WatchProgress {
        WatchProgress {
            key: ProgressKey::new(user_id, self.content_id, self.episode),
            title: self.title,
            position_secs: self.position_secs,
            duration_secs: self.duration_secs,
            updated_at: self.updated_at,
            committed: true,
        }
    }
}

/// The remote watch-history backend.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Whether a user session is currently available. Sync only runs while
    /// this is true; the auth flow itself is someone else's problem.
    fn is_authenticated(&self) -> bool;

    /// Durably record one progress entry.
    async fn upsert_progress(&self, record: &WatchProgress) -> Result<(), RemoteError>;

    /// Propagate a single-entry deletion.
    async fn delete_progress(&self, key: &ProgressKey) -> Result<(), RemoteError>;

    /// Propagate a full history clear for a user.
    async fn clear_history(&self, user_id: &str) -> Result<(), RemoteError>;

    /// Fetch the user's full watch history.
    async fn list_history(&self, user_id: &str) -> Result<Vec<RemoteProgress>, RemoteError>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(RemoteError::Network("reset".to_string()).is_transient());
        assert!(RemoteError::Timeout.is_transient());
        assert!(RemoteError::Server(503).is_transient());

        assert!(!RemoteError::Auth.is_transient());
        assert!(!RemoteError::Validation("bad episode".to_string()).is_transient());
        assert!(!RemoteError::Decode("truncated body".to_string()).is_transient());
    }

    #[test]
    fn test_remote_progress_into_record_is_committed() {
        let remote = RemoteProgress {
            content_id: "42".to_string(),
            episode: 3,
            title: "Episode 3".to_string(),
            position_secs: 610.0,
            duration_secs: 1450.0,
            completed: false,
            updated_at: Utc::now(),
        };

        let record = remote.into_record("u1");
        assert!(record.committed);
        assert_eq!(record.key, ProgressKey::new("u1", "42", 3));
        assert_eq!(record.position_secs, 610.0);
    }

    #[test]
    fn test_remote_progress_wire_format() {
        let json = r#"{
            "contentId": "42",
            "episode": 3,
            "title": "Episode 3",
            "positionSecs": 610.5,
            "durationSecs": 1450.0,
            "completed": false,
            "updatedAt": "2026-01-15T10:30:00Z"
        }"#;

        let parsed: RemoteProgress = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.content_id, "42");
        assert_eq!(parsed.episode, 3);
        assert_eq!(parsed.position_secs, 610.5);
    }
}
