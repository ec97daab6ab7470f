//! JSON-over-HTTP implementation of [`RemoteStore`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use std::time::Duration;

use super::{RemoteError, RemoteProgress, RemoteStore};
use crate::record::{ProgressKey, WatchProgress};

/// Per-request timeout; firing surfaces as a transient failure.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UpsertBody<'a> {
    title: &'a str,
    position_secs: f64,
    duration_secs: f64,
    completed: bool,
    updated_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct HistoryResponse {
    items: Option<Vec<RemoteProgress>>,
}

/// Remote watch-history backend over HTTP with bearer-token auth.
///
/// The auth flow lives elsewhere; this client only holds the token it is
/// given and reports `is_authenticated` from its presence.
pub struct HttpRemoteStore {
    http: HttpClient,
    base_url: String,
    token: RwLock<Option<String>>,
}

impl HttpRemoteStore {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: RwLock::new(None),
        })
    }

    /// Install or clear the session token.
    pub fn set_token(&self, token: Option<String>) {
        *self.token.write().unwrap() = token;
    }

    fn progress_url(&self, key: &ProgressKey) -> String {
        format!(
            "{}/users/{}/watch-progress/{}/{}",
            self.base_url,
            urlencoding::encode(&key.user_id),
            urlencoding::encode(&key.content_id),
            key.episode,
        )
    }

    fn user_url(&self, user_id: &str, resource: &str) -> String {
        format!(
            "{}/users/{}/{resource}",
            self.base_url,
            urlencoding::encode(user_id),
        )
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, RemoteError> {
        let token = self
            .token
            .read()
            .unwrap()
            .clone()
            .ok_or(RemoteError::Auth)?;
        let resp = req.bearer_auth(token).send().await?;
        let status = resp.status().as_u16();
        if resp.status().is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(classify_status(status, body))
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RemoteError::Timeout
        } else if err.is_decode() {
            RemoteError::Decode(err.to_string())
        } else {
            RemoteError::Network(err.to_string())
        }
    }
}

fn classify_status(status: u16, body: String) -> RemoteError {
    match status {
        401 | 403 => RemoteError::Auth,
        400 | 422 => RemoteError::Validation(body),
        500..=599 => RemoteError::Server(status),
        _ => RemoteError::Validation(format!("unexpected status {status}: {body}")),
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    fn is_authenticated(&self) -> bool {
        self.token.read().unwrap().is_some()
    }

    async fn upsert_progress(&self, record: &WatchProgress) -> Result<(), RemoteError> {
        let body = UpsertBody {
            title: &record.title,
            position_secs: record.position_secs,
            duration_secs: record.duration_secs,
            completed: record.is_completed(),
            updated_at: record.updated_at,
        };
        let req = self.http.put(self.progress_url(&record.key)).json(&body);
        self.send(req).await?;
        Ok(())
    }

    async fn delete_progress(&self, key: &ProgressKey) -> Result<(), RemoteError> {
        let req = self.http.delete(self.progress_url(key));
        match self.send(req).await {
            Ok(_) => Ok(()),
            // Already gone remotely; the tombstone is satisfied.
            Err(RemoteError::Validation(msg)) if msg.contains("404") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn clear_history(&self, user_id: &str) -> Result<(), RemoteError> {
        let req = self.http.delete(self.user_url(user_id, "watch-progress"));
        self.send(req).await?;
        Ok(())
    }

    async fn list_history(&self, user_id: &str) -> Result<Vec<RemoteProgress>, RemoteError> {
        let req = self.http.get(self.user_url(user_id, "watch-history"));
        let resp = self.send(req).await?;
        let parsed: HistoryResponse = resp
            .json()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))?;
        Ok(parsed.items.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(classify_status(401, String::new()), RemoteError::Auth));
        assert!(matches!(classify_status(403, String::new()), RemoteError::Auth));
        assert!(matches!(
            classify_status(400, "bad".to_string()),
            RemoteError::Validation(_)
        ));
        assert!(matches!(
            classify_status(422, "bad".to_string()),
            RemoteError::Validation(_)
        ));
        assert!(matches!(classify_status(500, String::new()), RemoteError::Server(500)));
        assert!(matches!(classify_status(503, String::new()), RemoteError::Server(503)));
    }

    #[test]
    fn test_transient_statuses_are_retryable() {
        assert!(classify_status(502, String::new()).is_transient());
        assert!(!classify_status(401, String::new()).is_transient());
        assert!(!classify_status(422, String::new()).is_transient());
    }

    #[test]
    fn test_progress_url_encodes_segments() {
        let store = HttpRemoteStore::new("https://api.example.com/v1/").unwrap();
        let key = ProgressKey::new("user with space", "42", 3);
        assert_eq!(
            store.progress_url(&key),
            "https://api.example.com/v1/users/user%20with%20space/watch-progress/42/3"
        );
    }

    #[test]
    fn test_unauthenticated_until_token_set() {
        let store = HttpRemoteStore::new("https://api.example.com").unwrap();
        assert!(!store.is_authenticated());
        store.set_token(Some("tok".to_string()));
        assert!(store.is_authenticated());
        store.set_token(None);
        assert!(!store.is_authenticated());
    }

    #[test]
    fn test_upsert_body_wire_format() {
        let body = UpsertBody {
            title: "Episode 3",
            position_secs: 610.0,
            duration_secs: 1450.0,
            completed: false,
            updated_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["positionSecs"], 610.0);
        assert_eq!(json["durationSecs"], 1450.0);
        assert_eq!(json["completed"], false);
        assert!(json["updatedAt"].is_string());
    }
}
