use std::collections::BTreeMap;

use crate::types::{SourceKind, SourceSample, TimestampMs};

/// Latest reading per source kind. New samples overwrite, nothing is appended.
#[derive(Clone, Debug, Default)]
pub struct SourceRegistry {
    latest: BTreeMap<SourceKind, SourceSample>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, sample: SourceSample) {
        self.latest.insert(sample.kind(), sample);
    }

    pub fn remove(&mut self, kind: SourceKind) -> Option<SourceSample> {
        self.latest.remove(&kind)
    }

    pub fn get(&self, kind: SourceKind) -> Option<&SourceSample> {
        self.latest.get(&kind)
    }

    pub fn is_fresh(&self, kind: SourceKind, now_ms: TimestampMs, timeout_ms: u64) -> bool {
        self.get(kind)
            .map_or(false, |sample| now_ms.saturating_sub(sample.captured_at_ms()) <= timeout_ms)
    }

    /// Positioned samples no older than `timeout_ms`. Radio samples carry no
    /// coordinates and are never returned.
    pub fn active_sources(&self, now_ms: TimestampMs, timeout_ms: u64) -> Vec<SourceSample> {
        self.latest
            .values()
            .filter(|sample| now_ms.saturating_sub(sample.captured_at_ms()) <= timeout_ms)
            .filter(|sample| sample.position().is_some())
            .cloned()
            .collect()
    }

    /// Evict everything older than `timeout_ms`. Returns the evicted kinds.
    pub fn evict_stale(&mut self, now_ms: TimestampMs, timeout_ms: u64) -> Vec<SourceKind> {
        let stale: Vec<SourceKind> = self
            .latest
            .iter()
            .filter(|(_, sample)| now_ms.saturating_sub(sample.captured_at_ms()) > timeout_ms)
            .map(|(kind, _)| *kind)
            .collect();
        for kind in &stale {
            self.latest.remove(kind);
        }
        stale
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GeoPoint, RadioTechnology};

    fn satellite(ts: u64) -> SourceSample {
        SourceSample::Satellite {
            position: GeoPoint::new(37.0, -122.0),
            accuracy_m: 5.0,
            captured_at_ms: ts,
        }
    }

    fn wifi(ts: u64) -> SourceSample {
        SourceSample::Radio {
            technology: RadioTechnology::Wifi,
            emitter_id: "ap".to_string(),
            distance_m: 4.0,
            captured_at_ms: ts,
        }
    }

    fn dead_reckoning(ts: u64) -> SourceSample {
        SourceSample::DeadReckoning {
            position: GeoPoint::new(37.0001, -122.0),
            accuracy_m: 25.0,
            step_count: 1,
            captured_at_ms: ts,
        }
    }

    #[test]
    fn test_upsert_overwrites_per_kind() {
        let mut registry = SourceRegistry::new();
        registry.upsert(satellite(1_000));
        registry.upsert(satellite(2_000));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(SourceKind::Satellite).unwrap().captured_at_ms(), 2_000);
    }

    #[test]
    fn test_stale_sources_excluded() {
        let mut registry = SourceRegistry::new();
        registry.upsert(satellite(1_000));
        registry.upsert(dead_reckoning(9_000));

        let active = registry.active_sources(12_000, 10_000);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].kind(), SourceKind::DeadReckoning);

        // Boundary is inclusive
        assert_eq!(registry.active_sources(11_000, 10_000).len(), 2);
    }

    #[test]
    fn test_radio_never_active() {
        let mut registry = SourceRegistry::new();
        registry.upsert(wifi(1_000));
        assert!(registry.active_sources(1_000, 10_000).is_empty());
        assert!(registry.is_fresh(SourceKind::RadioWifi, 1_000, 10_000));
    }

    #[test]
    fn test_empty_when_all_stale() {
        let mut registry = SourceRegistry::new();
        registry.upsert(satellite(0));
        registry.upsert(dead_reckoning(0));
        assert!(registry.active_sources(60_000, 10_000).is_empty());
    }

    #[test]
    fn test_evict_stale() {
        let mut registry = SourceRegistry::new();
        registry.upsert(satellite(0));
        registry.upsert(wifi(50_000));
        let evicted = registry.evict_stale(55_000, 10_000);
        assert_eq!(evicted, vec![SourceKind::Satellite]);
        assert_eq!(registry.len(), 1);
    }
}
