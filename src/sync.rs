//! Credential Sync
//!
//! Polls the upstream `/agent/sync` endpoint with the agent token and swaps
//! the returned app credentials into the [`CredentialStore`]. A failed sync
//! keeps whatever snapshot is currently active.

use crate::credentials::{Credential, CredentialStore};
use crate::metrics;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// Path appended to the configured server URL
pub const SYNC_PATH: &str = "/agent/sync";

/// Header carrying the agent token
pub const AGENT_TOKEN_HEADER: &str = "X-Agent-Token";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("sync rejected: {0}")]
    Rejected(String),

    #[error("failed to parse sync response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct SyncResponse {
    success: bool,
    #[serde(default)]
    message: String,
    #[serde(default)]
    apps: Vec<SyncedApp>,
    #[serde(default)]
    synced_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SyncedApp {
    #[serde(default)]
    id: u64,
    #[serde(default)]
    name: String,
    app_key: String,
    master_secret: String,
    #[serde(default)]
    encryption_enabled: bool,
}

pub struct CredentialSync {
    http: reqwest::Client,
    endpoint: String,
    agent_token: String,
    interval: Duration,
    credentials: CredentialStore,
}

impl CredentialSync {
    pub fn new(
        server_url: &str,
        agent_token: impl Into<String>,
        timeout: Duration,
        interval: Duration,
        credentials: CredentialStore,
    ) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: format!("{}{}", server_url.trim_end_matches('/'), SYNC_PATH),
            agent_token: agent_token.into(),
            interval,
            credentials,
        })
    }

    /// Fetch the app list once and replace the synced credentials
    ///
    /// Returns the number of apps received.
    pub async fn sync_once(&self) -> Result<usize, SyncError> {
        let result = self.fetch().await;
        let status = if result.is_ok() { "success" } else { "failure" };
        metrics::CREDENTIAL_SYNCS_TOTAL.with_label_values(&[status]).inc();

        let apps = result?;
        let count = apps.len();
        let synced: Vec<Credential> = apps
            .into_iter()
            .map(|app| {
                if !app.encryption_enabled {
                    tracing::debug!(app_id = app.id, app_key = %app.app_key, "App has encryption disabled upstream");
                }
                Credential::new(app.name, app.app_key, app.master_secret)
            })
            .collect();

        self.credentials.replace(synced);
        info!(apps = count, active = self.credentials.len(), "Synced credentials from server");
        Ok(count)
    }

    async fn fetch(&self) -> Result<Vec<SyncedApp>, SyncError> {
        let response = self
            .http
            .post(&self.endpoint)
            .header(AGENT_TOKEN_HEADER, &self.agent_token)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if status != reqwest::StatusCode::OK {
            return Err(SyncError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: SyncResponse = serde_json::from_str(&body)?;
        if !parsed.success {
            return Err(SyncError::Rejected(parsed.message));
        }

        if let Some(synced_at) = &parsed.synced_at {
            tracing::debug!(synced_at = %synced_at, "Sync response received");
        }
        Ok(parsed.apps)
    }

    /// Sync immediately, then once per interval until shutdown
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Starting credential sync");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut first = true;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sync_once().await {
                        if first {
                            warn!("Initial sync failed: {} (will retry)", e);
                        } else {
                            warn!("Sync failed: {}", e);
                        }
                    }
                    first = false;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Credential sync stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn syncer(server: &MockServer, store: CredentialStore) -> CredentialSync {
        CredentialSync::new(
            &server.uri(),
            "agent-token",
            Duration::from_secs(5),
            Duration::from_secs(60),
            store,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_sync_replaces_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/agent/sync"))
            .and(header("X-Agent-Token", "agent-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "message": "ok",
                "apps": [
                    {"id": 1, "name": "one", "app_key": "k1", "master_secret": "c2VjcmV0", "encryption_enabled": true},
                    {"id": 2, "name": "two", "app_key": "k2", "master_secret": "c2VjcmV0", "encryption_enabled": true}
                ],
                "synced_at": "2024-01-01T00:00:00Z"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let store = CredentialStore::new(vec![Credential::new("static", "s1", "c2VjcmV0")]);
        let count = syncer(&server, store.clone()).sync_once().await.unwrap();

        assert_eq!(count, 2);
        assert_eq!(store.len(), 3);
        assert!(store.lookup("k1").is_some());
        assert!(store.lookup("k2").is_some());
        assert!(store.lookup("s1").is_some());
    }

    #[tokio::test]
    async fn test_non_200_keeps_snapshot() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/agent/sync"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad token"))
            .mount(&server)
            .await;

        let store = CredentialStore::new(vec![Credential::new("static", "s1", "c2VjcmV0")]);
        let err = syncer(&server, store.clone()).sync_once().await.unwrap_err();

        match err {
            SyncError::Status { status, body } => {
                assert_eq!(status, 401);
                assert_eq!(body, "bad token");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_sync() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/agent/sync"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false,
                "message": "agent disabled"
            })))
            .mount(&server)
            .await;

        let store = CredentialStore::new(vec![]);
        let err = syncer(&server, store.clone()).sync_once().await.unwrap_err();

        assert!(matches!(err, SyncError::Rejected(ref m) if m == "agent disabled"));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/agent/sync"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = syncer(&server, CredentialStore::new(vec![]))
            .sync_once()
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Decode(_)));
    }

    #[tokio::test]
    async fn test_second_sync_drops_removed_apps() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/agent/sync"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "apps": [{"name": "one", "app_key": "k1", "master_secret": "c2VjcmV0"}]
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/agent/sync"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "apps": []
            })))
            .mount(&server)
            .await;

        let store = CredentialStore::new(vec![]);
        let sync = syncer(&server, store.clone());

        sync.sync_once().await.unwrap();
        assert!(store.lookup("k1").is_some());

        sync.sync_once().await.unwrap();
        assert!(store.lookup("k1").is_none());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(syncer(&server, CredentialStore::new(vec![])).run(rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
