use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Separator for encoding composite keys as a single storage key.
/// IDs are rejected at the log boundary if they contain it.
pub(crate) const KEY_SEP: char = '\u{1f}';

/// Fraction of the total duration at which an episode counts as watched.
const COMPLETED_THRESHOLD: f64 = 0.9;

/// Composite identity of one watch-progress record:
/// one user's position in one episode of one content item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProgressKey {
    pub user_id: String,
    pub content_id: String,
    pub episode: u32,
}

impl ProgressKey {
    pub fn new(
        user_id: impl Into<String>,
        content_id: impl Into<String>,
        episode: u32,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            content_id: content_id.into(),
            episode,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.user_id.is_empty() || self.content_id.is_empty() {
            bail!("progress key has empty user or content id");
        }
        if self.user_id.contains(KEY_SEP) || self.content_id.contains(KEY_SEP) {
            bail!("progress key contains reserved separator character");
        }
        Ok(())
    }

    /// Flat storage key: `user \x1f content \x1f episode`.
    pub(crate) fn storage_key(&self) -> String {
        format!(
            "{}{KEY_SEP}{}{KEY_SEP}{}",
            self.user_id, self.content_id, self.episode
        )
    }

    /// Prefix matching every storage key belonging to `user_id`.
    pub(crate) fn user_prefix(user_id: &str) -> String {
        format!("{user_id}{KEY_SEP}")
    }

    pub(crate) fn from_storage_key(raw: &str) -> Option<Self> {
        let mut parts = raw.splitn(3, KEY_SEP);
        let user_id = parts.next()?.to_string();
        let content_id = parts.next()?.to_string();
        let episode = parts.next()?.parse().ok()?;
        Some(Self {
            user_id,
            content_id,
            episode,
        })
    }
}

impl std::fmt::Display for ProgressKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/ep{}", self.user_id, self.content_id, self.episode)
    }
}

/// A playback-progress report as produced by the player tick.
///
/// The log fills in `updated_at` and the committed flag on upsert.
#[derive(Debug, Clone)]
pub struct ProgressReport {
    pub key: ProgressKey,
    /// Title snapshot so history renders offline without a catalog join.
    pub title: String,
    pub position_secs: f64,
    /// Total duration, 0 when unknown.
    pub duration_secs: f64,
}

impl ProgressReport {
    pub fn validate(&self) -> Result<()> {
        self.key.validate()?;
        if !self.position_secs.is_finite() || self.position_secs < 0.0 {
            bail!("invalid playback position: {}", self.position_secs);
        }
        if !self.duration_secs.is_finite() || self.duration_secs < 0.0 {
            bail!("invalid duration: {}", self.duration_secs);
        }
        Ok(())
    }
}

/// One stored watch-progress record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchProgress {
    pub key: ProgressKey,
    pub title: String,
    pub position_secs: f64,
    pub duration_secs: f64,
    pub updated_at: DateTime<Utc>,
    /// True once the remote store has durably accepted this record
    /// (or the reconciler gave up on delivering it).
    pub committed: bool,
}

impl WatchProgress {
    pub fn is_completed(&self) -> bool {
        self.duration_secs > 0.0
            && self.position_secs >= self.duration_secs * COMPLETED_THRESHOLD
    }
}
