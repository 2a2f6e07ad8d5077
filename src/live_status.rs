use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use crate::registry::SourceRegistry;
use crate::sync::NetworkState;
use crate::types::{FusedLocation, SourceKind, SourceSample, TimestampMs};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Active,
    Stale,
    Absent,
    PermissionDenied,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SourceDiagnostics {
    pub kind: SourceKind,
    pub status: SourceStatus,
    pub accuracy_m: Option<f64>,
    pub age_ms: Option<u64>,
    /// Strongest or nearest emitter for radio sources.
    pub emitter_id: Option<String>,
}

/// Display-only snapshot for the UI collaborator.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LiveStatus {
    pub timestamp_ms: TimestampMs,
    pub uptime_seconds: u64,
    pub sources: Vec<SourceDiagnostics>,
    pub last_fix: Option<FusedLocation>,
    pub current_address: Option<String>,
    // Dead reckoning
    pub step_count: u64,
    /// None until the magnetometer has reported.
    pub heading_deg: Option<f64>,
    // Radio
    pub wifi_emitters: usize,
    pub bluetooth_emitters: usize,
    pub radio_scans: u64,
    // Fusion
    pub ticks_emitted: u64,
    pub ticks_skipped: u64,
    /// Kinds dropped from the registry after going silent, cumulative.
    pub sources_evicted: u64,
    /// Set while ticks are being skipped because no positioned source is fresh.
    pub signal_lost: bool,
    // Persistence / sync
    pub unsynced_count: usize,
    pub persistence_failures: u64,
    pub network: NetworkState,
    pub sync_in_flight: bool,
    pub last_sync_ms: Option<TimestampMs>,
    pub verified_addresses: usize,
}

impl LiveStatus {
    pub fn new(now_ms: TimestampMs) -> Self {
        Self {
            timestamp_ms: now_ms,
            uptime_seconds: 0,
            sources: SourceKind::ALL
                .iter()
                .map(|kind| SourceDiagnostics {
                    kind: *kind,
                    status: SourceStatus::Absent,
                    accuracy_m: None,
                    age_ms: None,
                    emitter_id: None,
                })
                .collect(),
            last_fix: None,
            current_address: None,
            step_count: 0,
            heading_deg: None,
            wifi_emitters: 0,
            bluetooth_emitters: 0,
            radio_scans: 0,
            ticks_emitted: 0,
            ticks_skipped: 0,
            sources_evicted: 0,
            signal_lost: false,
            unsynced_count: 0,
            persistence_failures: 0,
            network: NetworkState::Unknown,
            sync_in_flight: false,
            last_sync_ms: None,
            verified_addresses: 0,
        }
    }

    pub fn source(&self, kind: SourceKind) -> Option<&SourceDiagnostics> {
        self.sources.iter().find(|s| s.kind == kind)
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

/// Per-kind status. A denied permission outranks whatever the registry holds.
pub fn classify_sources(
    registry: &SourceRegistry,
    denied: &BTreeSet<SourceKind>,
    now_ms: TimestampMs,
    timeout_ms: u64,
) -> Vec<SourceDiagnostics> {
    SourceKind::ALL
        .iter()
        .map(|&kind| {
            let sample = registry.get(kind);
            let status = if denied.contains(&kind) {
                SourceStatus::PermissionDenied
            } else if sample.is_none() {
                SourceStatus::Absent
            } else if registry.is_fresh(kind, now_ms, timeout_ms) {
                SourceStatus::Active
            } else {
                SourceStatus::Stale
            };
            SourceDiagnostics {
                kind,
                status,
                accuracy_m: sample.map(|s| s.accuracy_m()),
                age_ms: sample.map(|s| s.age_ms(now_ms)),
                emitter_id: sample.and_then(|s| match s {
                    SourceSample::Radio { emitter_id, .. } => Some(emitter_id.clone()),
                    _ => None,
                }),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GeoPoint, RadioTechnology};

    #[test]
    fn test_classify_sources() {
        let mut registry = SourceRegistry::new();
        registry.upsert(SourceSample::Satellite {
            position: GeoPoint::new(1.0, 1.0),
            accuracy_m: 4.0,
            captured_at_ms: 1_000,
        });
        registry.upsert(SourceSample::Radio {
            technology: RadioTechnology::Wifi,
            emitter_id: "ap-7".into(),
            distance_m: 3.0,
            captured_at_ms: 14_000,
        });
        let denied: BTreeSet<SourceKind> = [SourceKind::RadioBluetooth].into_iter().collect();

        let status = classify_sources(&registry, &denied, 15_000, 10_000);
        let by_kind = |k| status.iter().find(|s| s.kind == k).unwrap();

        assert_eq!(by_kind(SourceKind::Satellite).status, SourceStatus::Stale);
        assert_eq!(by_kind(SourceKind::Satellite).age_ms, Some(14_000));
        assert_eq!(by_kind(SourceKind::RadioWifi).status, SourceStatus::Active);
        assert_eq!(by_kind(SourceKind::RadioWifi).emitter_id.as_deref(), Some("ap-7"));
        assert_eq!(by_kind(SourceKind::RadioBluetooth).status, SourceStatus::PermissionDenied);
        assert_eq!(by_kind(SourceKind::DeadReckoning).status, SourceStatus::Absent);
    }

    #[test]
    fn test_new_status_lists_every_kind() {
        let status = LiveStatus::new(0);
        assert_eq!(status.sources.len(), SourceKind::ALL.len());
        assert!(status.sources.iter().all(|s| s.status == SourceStatus::Absent));
    }

    #[test]
    fn test_save_writes_json() {
        let path = std::env::temp_dir().join(format!("location_fusion_status_{}.json", std::process::id()));
        let mut status = LiveStatus::new(5_000);
        status.unsynced_count = 3;
        status.save(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let parsed: LiveStatus = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.unsynced_count, 3);
        assert_eq!(parsed.network, NetworkState::Unknown);
        let _ = fs::remove_file(&path);
    }
}
