// sensor_fusion.rs — periodic source arbitration for the location tracker
//
// Everything in this module is independent of:
//   - tokio / async runtime
//   - platform sensor callbacks
//   - persistence, sync and geocoding
//
// It reads a registry snapshot in and produces at most one fused location per
// tick, so it can be unit-tested with hand-built samples and replayed offline.

use serde::{Deserialize, Serialize};

use crate::filters::ScalarKalmanFilter;
use crate::geodesy::{longitude_delta, normalize_longitude, METERS_PER_DEGREE};
use crate::registry::SourceRegistry;
use crate::types::{FusedLocation, GeoPoint, SourceKind, SourceSample, TimestampMs};

/// Score penalty per second of sample age, in meters.
const RECENCY_PENALTY_PER_SEC: f64 = 10.0;
/// Secondary sources blended alongside the primary.
const MAX_SECONDARY_SOURCES: usize = 2;
const BLENDED_ACCURACY_FACTOR: f64 = 0.8;
const MIN_BLENDED_ACCURACY_M: f64 = 5.0;
/// Guards the 1/accuracy weights against zero or negative accuracies.
const MIN_WEIGHT_ACCURACY_M: f64 = 0.1;

// ─── Configuration ───────────────────────────────────────────────────────────

/// Per-kind measurement noise, expressed as a 1-sigma distance in meters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseTable {
    pub satellite_m: f64,
    pub dead_reckoning_m: f64,
    /// Used for any positioned kind without its own entry.
    pub fallback_m: f64,
}

impl Default for NoiseTable {
    fn default() -> Self {
        Self {
            satellite_m: 5.0,
            dead_reckoning_m: 25.0,
            fallback_m: 50.0,
        }
    }
}

impl NoiseTable {
    pub fn sigma_m(&self, kind: SourceKind) -> f64 {
        match kind {
            SourceKind::Satellite => self.satellite_m,
            SourceKind::DeadReckoning => self.dead_reckoning_m,
            SourceKind::RadioWifi | SourceKind::RadioBluetooth => self.fallback_m,
        }
    }

    /// Variance in squared degrees, the unit the axis filters work in.
    pub fn measurement_noise(&self, kind: SourceKind) -> f64 {
        meters_to_degree_variance(self.sigma_m(kind))
    }
}

fn meters_to_degree_variance(sigma_m: f64) -> f64 {
    let deg = sigma_m / METERS_PER_DEGREE;
    deg * deg
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Samples older than this are ignored by the tick.
    pub source_timeout_ms: u64,
    /// Process noise added per tick, as a 1-sigma drift in meters.
    pub process_noise_m: f64,
    pub noise: NoiseTable,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            source_timeout_ms: 10_000,
            process_noise_m: 1.5,
            noise: NoiseTable::default(),
        }
    }
}

// ─── Events ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub enum FusionEvent {
    TickSkipped { stale_or_absent: usize },
    PrimarySelected { kind: SourceKind, score: f64 },
    Blended { sources: usize, accuracy_m: f64 },
    FilterReset { latitude: f64, longitude: f64 },
}

// ─── Tick output ─────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct FusionOutcome {
    pub location: FusedLocation,
    pub primary: SourceKind,
    pub blended: bool,
    /// Active sources in ranked order, primary first.
    pub sources: Vec<SourceSample>,
}

#[derive(Clone, Debug, Default)]
pub struct FusionTick {
    pub outcome: Option<FusionOutcome>,
    pub events: Vec<FusionEvent>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FusionSnapshot {
    pub filter_initialized: bool,
    pub latitude_error: f64,
    pub longitude_error: f64,
    pub ticks_emitted: u64,
    pub ticks_skipped: u64,
    pub last_tick_ms: Option<TimestampMs>,
}

// ─── The fusion engine ───────────────────────────────────────────────────────

pub struct FusionEngine {
    config: FusionConfig,
    lat_filter: ScalarKalmanFilter,
    lng_filter: ScalarKalmanFilter,
    last_tick_ms: Option<TimestampMs>,
    ticks_emitted: u64,
    ticks_skipped: u64,
}

impl FusionEngine {
    pub fn new(config: FusionConfig) -> Self {
        let process_noise = meters_to_degree_variance(config.process_noise_m);
        let initial_noise = config.noise.measurement_noise(SourceKind::Satellite);
        Self {
            lat_filter: ScalarKalmanFilter::new(process_noise, initial_noise),
            lng_filter: ScalarKalmanFilter::new(process_noise, initial_noise),
            config,
            last_tick_ms: None,
            ticks_emitted: 0,
            ticks_skipped: 0,
        }
    }

    /// Discard filter state in favour of a new trusted fix.
    pub fn reset_to(&mut self, point: GeoPoint) -> FusionEvent {
        let noise = self.config.noise.measurement_noise(SourceKind::Satellite);
        self.lat_filter.set_measurement_noise(noise);
        self.lng_filter.set_measurement_noise(noise);
        self.lat_filter.reset(point.latitude);
        self.lng_filter.reset(point.longitude);
        FusionEvent::FilterReset {
            latitude: point.latitude,
            longitude: point.longitude,
        }
    }

    /// One fusion pass over a registry snapshot. Produces nothing when no
    /// positioned source is fresh.
    pub fn tick(&mut self, registry: &SourceRegistry, now_ms: TimestampMs) -> FusionTick {
        let mut events = Vec::new();

        let mut active = registry.active_sources(now_ms, self.config.source_timeout_ms);
        if active.is_empty() {
            self.ticks_skipped += 1;
            events.push(FusionEvent::TickSkipped {
                stale_or_absent: registry.len(),
            });
            return FusionTick { outcome: None, events };
        }

        rank_sources(&mut active, now_ms);
        let primary = &active[0];
        let primary_pos = match primary.position() {
            Some(p) => p,
            None => {
                self.ticks_skipped += 1;
                return FusionTick { outcome: None, events };
            }
        };
        events.push(FusionEvent::PrimarySelected {
            kind: primary.kind(),
            score: source_score(primary, now_ms),
        });

        let dt = self
            .last_tick_ms
            .map(|last| now_ms.saturating_sub(last) as f64 / 1000.0)
            .unwrap_or(0.0);
        self.last_tick_ms = Some(now_ms);

        let noise = self.config.noise.measurement_noise(primary.kind());
        self.lat_filter.set_measurement_noise(noise);
        self.lng_filter.set_measurement_noise(noise);
        // The longitude filter runs on an unwrapped axis so a crossing of
        // ±180 reads as a small step.
        let lng_measurement = match self.lng_filter.position() {
            Some(prev) => prev + longitude_delta(prev, primary_pos.longitude),
            None => primary_pos.longitude,
        };
        let filtered = GeoPoint::new(
            self.lat_filter
                .update(Some(primary_pos.latitude), dt)
                .unwrap_or(primary_pos.latitude),
            normalize_longitude(
                self.lng_filter
                    .update(Some(lng_measurement), dt)
                    .unwrap_or(lng_measurement),
            ),
        );

        let blended = active.len() >= 2;
        let (point, accuracy_m) = if blended {
            let point = blend(filtered, primary.accuracy_m(), &active[1..]);
            let accuracy = (primary.accuracy_m() * BLENDED_ACCURACY_FACTOR).max(MIN_BLENDED_ACCURACY_M);
            events.push(FusionEvent::Blended {
                sources: active.len().min(1 + MAX_SECONDARY_SOURCES),
                accuracy_m: accuracy,
            });
            (point, accuracy)
        } else {
            (filtered, primary.accuracy_m())
        };

        self.ticks_emitted += 1;
        let outcome = FusionOutcome {
            location: FusedLocation {
                latitude: point.latitude,
                longitude: point.longitude,
                accuracy_m,
                produced_at_ms: now_ms,
            },
            primary: primary.kind(),
            blended,
            sources: active,
        };

        FusionTick {
            outcome: Some(outcome),
            events,
        }
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    pub fn get_snapshot(&self) -> FusionSnapshot {
        FusionSnapshot {
            filter_initialized: self.lat_filter.is_initialized() && self.lng_filter.is_initialized(),
            latitude_error: self.lat_filter.position_error(),
            longitude_error: self.lng_filter.position_error(),
            ticks_emitted: self.ticks_emitted,
            ticks_skipped: self.ticks_skipped,
            last_tick_ms: self.last_tick_ms,
        }
    }
}

// ─── Ranking and blending ────────────────────────────────────────────────────

/// Lower is better: accuracy in meters plus a recency penalty, so a slightly
/// worse but much fresher source can outrank a stale one.
pub fn source_score(sample: &SourceSample, now_ms: TimestampMs) -> f64 {
    let age_secs = sample.age_ms(now_ms) as f64 / 1000.0;
    sample.accuracy_m() + age_secs * RECENCY_PENALTY_PER_SEC
}

/// Sort by score ascending, newest first on ties.
pub fn rank_sources(sources: &mut [SourceSample], now_ms: TimestampMs) {
    sources.sort_by(|a, b| {
        source_score(a, now_ms)
            .total_cmp(&source_score(b, now_ms))
            .then_with(|| b.captured_at_ms().cmp(&a.captured_at_ms()))
    });
}

/// Confidence-weighted average of the filtered primary and up to two
/// secondaries. Secondaries get half weight.
fn blend(primary: GeoPoint, primary_accuracy_m: f64, secondaries: &[SourceSample]) -> GeoPoint {
    let w0 = 1.0 / primary_accuracy_m.max(MIN_WEIGHT_ACCURACY_M);
    let mut total = w0;
    let mut lat = primary.latitude * w0;
    // Longitudes are averaged as offsets from the primary
    let mut lng_offset = 0.0;

    for sample in secondaries.iter().take(MAX_SECONDARY_SOURCES) {
        let Some(pos) = sample.position() else { continue };
        let w = 1.0 / (2.0 * sample.accuracy_m().max(MIN_WEIGHT_ACCURACY_M));
        lat += pos.latitude * w;
        lng_offset += longitude_delta(primary.longitude, pos.longitude) * w;
        total += w;
    }

    GeoPoint::new(lat / total, normalize_longitude(primary.longitude + lng_offset / total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geodesy::haversine_distance;
    use crate::types::RadioTechnology;
    use approx::assert_relative_eq;

    fn satellite(lat: f64, lng: f64, acc: f64, ts: u64) -> SourceSample {
        SourceSample::Satellite {
            position: GeoPoint::new(lat, lng),
            accuracy_m: acc,
            captured_at_ms: ts,
        }
    }

    fn dead_reckoning(lat: f64, lng: f64, acc: f64, ts: u64) -> SourceSample {
        SourceSample::DeadReckoning {
            position: GeoPoint::new(lat, lng),
            accuracy_m: acc,
            step_count: 0,
            captured_at_ms: ts,
        }
    }

    #[test]
    fn test_skips_tick_without_sources() {
        let mut engine = FusionEngine::new(FusionConfig::default());
        let registry = SourceRegistry::new();
        let tick = engine.tick(&registry, 1_000);
        assert!(tick.outcome.is_none());
        assert!(matches!(tick.events[0], FusionEvent::TickSkipped { .. }));
        assert_eq!(engine.get_snapshot().ticks_skipped, 1);
    }

    #[test]
    fn test_skips_tick_with_only_radio() {
        let mut engine = FusionEngine::new(FusionConfig::default());
        let mut registry = SourceRegistry::new();
        registry.upsert(SourceSample::Radio {
            technology: RadioTechnology::Wifi,
            emitter_id: "ap".into(),
            distance_m: 2.0,
            captured_at_ms: 1_000,
        });
        assert!(engine.tick(&registry, 1_000).outcome.is_none());
    }

    #[test]
    fn test_skips_tick_when_all_stale() {
        let mut engine = FusionEngine::new(FusionConfig::default());
        let mut registry = SourceRegistry::new();
        registry.upsert(satellite(37.0, -122.0, 5.0, 0));
        assert!(engine.tick(&registry, 60_000).outcome.is_none());
    }

    #[test]
    fn test_single_source_passes_accuracy_through() {
        let mut engine = FusionEngine::new(FusionConfig::default());
        let mut registry = SourceRegistry::new();
        registry.upsert(satellite(37.7749, -122.4194, 7.5, 1_000));

        let outcome = engine.tick(&registry, 1_000).outcome.unwrap();
        assert!(!outcome.blended);
        assert_eq!(outcome.primary, SourceKind::Satellite);
        assert_eq!(outcome.location.accuracy_m, 7.5);
        assert_relative_eq!(outcome.location.latitude, 37.7749);
        assert_relative_eq!(outcome.location.longitude, -122.4194);
        assert_eq!(outcome.location.produced_at_ms, 1_000);
    }

    #[test]
    fn test_blend_closer_to_accurate_source() {
        let mut engine = FusionEngine::new(FusionConfig::default());
        let mut registry = SourceRegistry::new();
        let accurate = GeoPoint::new(37.7749, -122.4194);
        let coarse = GeoPoint::new(37.7759, -122.4184);
        registry.upsert(satellite(accurate.latitude, accurate.longitude, 10.0, 5_000));
        registry.upsert(dead_reckoning(coarse.latitude, coarse.longitude, 40.0, 5_000));

        let outcome = engine.tick(&registry, 5_000).outcome.unwrap();
        assert!(outcome.blended);

        let fused = outcome.location.point();
        let midpoint = GeoPoint::new(
            (accurate.latitude + coarse.latitude) / 2.0,
            (accurate.longitude + coarse.longitude) / 2.0,
        );
        assert!(haversine_distance(fused, accurate) < haversine_distance(midpoint, accurate));
        assert!(haversine_distance(fused, accurate) < haversine_distance(fused, coarse));
    }

    #[test]
    fn test_blend_across_antimeridian() {
        let mut engine = FusionEngine::new(FusionConfig::default());
        let mut registry = SourceRegistry::new();
        registry.upsert(satellite(-16.5, 179.9999, 10.0, 1_000));
        registry.upsert(dead_reckoning(-16.5, -179.9999, 10.0, 1_000));

        let fused = engine.tick(&registry, 1_000).outcome.unwrap().location;
        assert!(fused.longitude.abs() > 179.999, "blend landed at {}", fused.longitude);
        assert!(haversine_distance(fused.point(), GeoPoint::new(-16.5, 180.0)) < 20.0);
    }

    #[test]
    fn test_filter_follows_antimeridian_crossing() {
        let mut engine = FusionEngine::new(FusionConfig::default());
        let mut registry = SourceRegistry::new();
        registry.upsert(satellite(-16.5, 179.9998, 5.0, 1_000));
        engine.tick(&registry, 1_000);

        registry.upsert(satellite(-16.5, -179.9998, 5.0, 2_000));
        let fused = engine.tick(&registry, 2_000).outcome.unwrap().location;
        assert!((-180.0..180.0).contains(&fused.longitude));
        assert!(haversine_distance(fused.point(), GeoPoint::new(-16.5, -179.9998)) < 50.0);
    }

    #[test]
    fn test_blended_accuracy_improves_with_floor() {
        let mut engine = FusionEngine::new(FusionConfig::default());
        let mut registry = SourceRegistry::new();
        registry.upsert(satellite(1.0, 1.0, 10.0, 1_000));
        registry.upsert(dead_reckoning(1.0001, 1.0, 25.0, 1_000));
        let outcome = engine.tick(&registry, 1_000).outcome.unwrap();
        assert_relative_eq!(outcome.location.accuracy_m, 8.0);

        let mut engine = FusionEngine::new(FusionConfig::default());
        let mut registry = SourceRegistry::new();
        registry.upsert(satellite(1.0, 1.0, 3.0, 1_000));
        registry.upsert(dead_reckoning(1.0001, 1.0, 25.0, 1_000));
        let outcome = engine.tick(&registry, 1_000).outcome.unwrap();
        assert_relative_eq!(outcome.location.accuracy_m, 5.0);
    }

    #[test]
    fn test_fresh_source_outranks_stale_better_one() {
        let mut registry = SourceRegistry::new();
        registry.upsert(satellite(1.0, 1.0, 5.0, 1_000));
        registry.upsert(dead_reckoning(1.0001, 1.0, 25.0, 6_000));

        let mut active = registry.active_sources(6_000, 10_000);
        rank_sources(&mut active, 6_000);
        // satellite: 5 + 5s*10 = 55, dead reckoning: 25
        assert_eq!(active[0].kind(), SourceKind::DeadReckoning);

        rank_sources(&mut active, 1_000);
        assert_eq!(active[0].kind(), SourceKind::Satellite);
    }

    #[test]
    fn test_filter_smooths_successive_fixes() {
        let mut engine = FusionEngine::new(FusionConfig::default());
        let mut registry = SourceRegistry::new();
        registry.upsert(satellite(10.0, 20.0, 5.0, 1_000));
        engine.tick(&registry, 1_000);

        registry.upsert(satellite(10.001, 20.0, 5.0, 2_000));
        let outcome = engine.tick(&registry, 2_000).outcome.unwrap();
        assert!(outcome.location.latitude > 10.0);
        assert!(outcome.location.latitude < 10.001);
    }

    #[test]
    fn test_reset_supersedes_history() {
        let mut engine = FusionEngine::new(FusionConfig::default());
        let mut registry = SourceRegistry::new();
        registry.upsert(satellite(10.0, 20.0, 5.0, 1_000));
        engine.tick(&registry, 1_000);

        engine.reset_to(GeoPoint::new(-5.0, 3.0));
        registry.upsert(satellite(-5.0, 3.0, 5.0, 2_000));
        let outcome = engine.tick(&registry, 2_000).outcome.unwrap();
        assert_relative_eq!(outcome.location.latitude, -5.0, epsilon = 1e-12);
        assert_relative_eq!(outcome.location.longitude, 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_noise_table_orders_trust() {
        let table = NoiseTable::default();
        assert!(
            table.measurement_noise(SourceKind::Satellite)
                < table.measurement_noise(SourceKind::DeadReckoning)
        );
    }
}
