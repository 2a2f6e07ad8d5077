//! Upload of queued fixes to the remote sync endpoint.
//!
//! # Wire Format
//! ```text
//! POST <endpoint>
//! {"locations": [{"id": 1, "latitude": .., "longitude": .., "accuracy_m": .., "captured_at_ms": ..}]}
//!
//! 200 OK
//! {"accepted_ids": [1, 2]}
//! ```
//!
//! Delivery is at-least-once: rows stay unsynced until their id comes back in
//! `accepted_ids`, and the server is expected to dedupe by id.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{TrackerError, TrackerResult};
use crate::storage::{LocationRecord, RecordId};
use crate::types::TimestampMs;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UploadRow {
    pub id: RecordId,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_m: f64,
    pub captured_at_ms: TimestampMs,
}

impl From<&LocationRecord> for UploadRow {
    fn from(record: &LocationRecord) -> Self {
        Self {
            id: record.id,
            latitude: record.latitude,
            longitude: record.longitude,
            accuracy_m: record.accuracy_m,
            captured_at_ms: record.captured_at_ms,
        }
    }
}

#[derive(Serialize)]
struct UploadRequest<'a> {
    locations: &'a [UploadRow],
}

#[derive(Deserialize)]
struct UploadResponse {
    #[serde(default)]
    accepted_ids: Vec<RecordId>,
}

#[async_trait]
pub trait SyncClient: Send + Sync {
    /// Upload a batch and return the ids the server accepted.
    async fn upload(&self, rows: &[UploadRow]) -> TrackerResult<Vec<RecordId>>;
}

/// JSON-over-HTTP sync client.
pub struct HttpSyncClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSyncClient {
    pub fn new(endpoint: impl Into<String>, timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(concat!("location_fusion/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl SyncClient for HttpSyncClient {
    async fn upload(&self, rows: &[UploadRow]) -> TrackerResult<Vec<RecordId>> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&UploadRequest { locations: rows })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TrackerError::SyncFailure("network timeout".to_string())
                } else {
                    TrackerError::SyncFailure(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TrackerError::SyncFailure(format!("HTTP error: {}", status.as_u16())));
        }

        let body: UploadResponse = response
            .json()
            .await
            .map_err(|e| TrackerError::SyncFailure(format!("bad response body: {}", e)))?;
        Ok(body.accepted_ids)
    }
}

/// Only ids that were actually sent may be acknowledged, whatever the server claims.
pub fn accepted_subset(sent: &[UploadRow], accepted: &[RecordId]) -> Vec<RecordId> {
    let sent_ids: HashSet<RecordId> = sent.iter().map(|row| row.id).collect();
    let mut ids: Vec<RecordId> = accepted.iter().copied().filter(|id| sent_ids.contains(id)).collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    Periodic,
    NetworkRestored,
    Manual,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkState {
    Unknown,
    Online,
    Offline,
}

/// Tracks connectivity reports and detects offline→online transitions.
#[derive(Debug)]
pub struct NetworkMonitor {
    state: NetworkState,
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self {
            state: NetworkState::Unknown,
        }
    }
}

impl NetworkMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connectivity report. Returns true when it restores the network.
    pub fn observe(&mut self, online: bool) -> bool {
        let restored = online && self.state == NetworkState::Offline;
        self.state = if online { NetworkState::Online } else { NetworkState::Offline };
        restored
    }

    /// Unknown counts as online so a device that never reports still syncs.
    pub fn is_online(&self) -> bool {
        self.state != NetworkState::Offline
    }

    pub fn state(&self) -> NetworkState {
        self.state
    }
}

/// Result of one upload attempt, reported back to the tracker.
#[derive(Clone, Debug)]
pub struct SyncReport {
    pub trigger: SyncTrigger,
    pub sent: Vec<UploadRow>,
    pub result: TrackerResult<Vec<RecordId>>,
}

impl SyncReport {
    /// Ids to acknowledge. Empty when the upload failed.
    pub fn acknowledged_ids(&self) -> Vec<RecordId> {
        match &self.result {
            Ok(accepted) => accepted_subset(&self.sent, accepted),
            Err(_) => Vec::new(),
        }
    }
}

/// Upload one batch. Never panics and never retries; the next cycle resends
/// whatever is still unsynced.
pub async fn upload_batch(client: Arc<dyn SyncClient>, trigger: SyncTrigger, batch: Vec<LocationRecord>) -> SyncReport {
    let sent: Vec<UploadRow> = batch.iter().map(UploadRow::from).collect();
    let result = client.upload(&sent).await;
    match &result {
        Err(e) if e.is_transient() => log::warn!("Sync of {} records failed, will retry: {}", sent.len(), e),
        Err(e) => log::error!("Sync of {} records failed: {}", sent.len(), e),
        Ok(_) => {}
    }
    SyncReport { trigger, sent, result }
}
