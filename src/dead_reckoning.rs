//! Pedestrian dead reckoning: step detection from accelerometer magnitude
//! peaks, heading from the magnetometer, and forward projection from the
//! last trusted satellite fix.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::geodesy::{meters_to_lat_degrees, meters_to_lng_degrees, normalize_longitude};
use crate::types::{AccelData, GeoPoint, MagData, SourceSample, TimestampMs};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadReckoningConfig {
    pub step_length_m: f64,
    /// Magnitude a peak must exceed to count as a step (m/s², gravity included).
    pub peak_threshold: f64,
    pub debounce_ms: u64,
    pub window_size: usize,
    /// Fixed, deliberately coarse accuracy reported for projected positions.
    pub accuracy_m: f64,
}

impl Default for DeadReckoningConfig {
    fn default() -> Self {
        Self {
            step_length_m: 0.762,
            peak_threshold: 11.5,
            debounce_ms: 250,
            window_size: 10,
            accuracy_m: 25.0,
        }
    }
}

pub struct DeadReckoningEngine {
    config: DeadReckoningConfig,
    window: VecDeque<(TimestampMs, f64)>,
    last_step_ms: Option<TimestampMs>,
    step_count: u64,
    heading_deg: f64,
    heading_known: bool,
    last_trusted_position: Option<GeoPoint>,
    pseudo_position: Option<GeoPoint>,
}

impl DeadReckoningEngine {
    pub fn new(config: DeadReckoningConfig) -> Self {
        Self {
            window: VecDeque::with_capacity(config.window_size.max(3)),
            config,
            last_step_ms: None,
            step_count: 0,
            heading_deg: 0.0,
            heading_known: false,
            last_trusted_position: None,
            pseudo_position: None,
        }
    }

    /// Re-anchor on a satellite fix. Projection restarts from this point.
    pub fn set_trusted_position(&mut self, position: GeoPoint) {
        self.last_trusted_position = Some(position);
        self.pseudo_position = Some(position);
    }

    pub fn on_magnetometer(&mut self, mag: &MagData) {
        if !(mag.x.is_finite() && mag.y.is_finite()) || (mag.x == 0.0 && mag.y == 0.0) {
            return;
        }
        self.heading_deg = normalize_degrees(mag.y.atan2(mag.x).to_degrees());
        self.heading_known = true;
    }

    /// Feed one accelerometer sample. Returns a projected sample when a step
    /// fires and a trusted position exists.
    pub fn on_accelerometer(&mut self, accel: &AccelData) -> Option<SourceSample> {
        let magnitude = Vector3::new(accel.x, accel.y, accel.z).norm();
        if !magnitude.is_finite() {
            return None;
        }

        self.window.push_back((accel.timestamp_ms, magnitude));
        while self.window.len() > self.config.window_size.max(3) {
            self.window.pop_front();
        }

        let step_ts = self.detect_step()?;
        self.last_step_ms = Some(step_ts);
        self.step_count += 1;

        let position = self.project_step()?;
        Some(self.sample_at(position, accel.timestamp_ms))
    }

    /// Fallback timer: re-emit the current pseudo-position with a fresh
    /// timestamp so the source does not go stale while standing still.
    pub fn on_fallback_tick(&mut self, now_ms: TimestampMs) -> Option<SourceSample> {
        let position = self.pseudo_position?;
        Some(self.sample_at(position, now_ms))
    }

    /// The middle of the last three buffered samples is the candidate: it
    /// needs both neighbours to be a strict local maximum.
    fn detect_step(&self) -> Option<TimestampMs> {
        let n = self.window.len();
        if n < 3 {
            return None;
        }
        let (_, prev) = self.window[n - 3];
        let (candidate_ts, candidate) = self.window[n - 2];
        let (_, next) = self.window[n - 1];

        let debounced = self
            .last_step_ms
            .map_or(true, |last| candidate_ts.saturating_sub(last) > self.config.debounce_ms);

        let is_peak = candidate > self.config.peak_threshold && candidate > prev && candidate > next;

        (debounced && is_peak).then_some(candidate_ts)
    }

    fn project_step(&mut self) -> Option<GeoPoint> {
        let anchor = self.last_trusted_position?;
        let current = self.pseudo_position.unwrap_or(anchor);
        let (d_lat, d_lng) = step_delta_degrees(self.config.step_length_m, self.heading_deg, anchor.latitude);
        let next = GeoPoint::new(current.latitude + d_lat, normalize_longitude(current.longitude + d_lng));
        self.pseudo_position = Some(next);
        Some(next)
    }

    fn sample_at(&self, position: GeoPoint, captured_at_ms: TimestampMs) -> SourceSample {
        SourceSample::DeadReckoning {
            position,
            accuracy_m: self.config.accuracy_m,
            step_count: self.step_count,
            captured_at_ms,
        }
    }

    pub fn step_count(&self) -> u64 {
        self.step_count
    }

    pub fn heading_deg(&self) -> f64 {
        self.heading_deg
    }

    /// False until the first usable magnetometer sample.
    pub fn heading_known(&self) -> bool {
        self.heading_known
    }

    pub fn pseudo_position(&self) -> Option<GeoPoint> {
        self.pseudo_position
    }
}

/// Displacement in degrees for one step along `heading_deg`, with longitude
/// scaled by the anchor latitude.
pub fn step_delta_degrees(step_length_m: f64, heading_deg: f64, anchor_latitude: f64) -> (f64, f64) {
    let heading = heading_deg.to_radians();
    let d_lat_m = step_length_m * heading.cos();
    let d_lng_m = step_length_m * heading.sin();
    (
        meters_to_lat_degrees(d_lat_m),
        meters_to_lng_degrees(d_lng_m, anchor_latitude),
    )
}

fn normalize_degrees(deg: f64) -> f64 {
    let wrapped = deg.rem_euclid(360.0);
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn accel(ts: u64, z: f64) -> AccelData {
        AccelData { timestamp_ms: ts, x: 0.0, y: 0.0, z }
    }

    fn mag(x: f64, y: f64) -> MagData {
        MagData { timestamp_ms: 0, x, y, z: 0.0 }
    }

    #[test]
    fn test_step_east_from_origin() {
        let (d_lat, d_lng) = step_delta_degrees(0.762, 90.0, 0.0);
        assert_abs_diff_eq!(d_lat, 0.0, epsilon = 1e-15);
        assert_abs_diff_eq!(d_lng, 0.762 / 111_320.0, epsilon = 1e-12);
        assert_abs_diff_eq!(d_lng, 6.846e-6, epsilon = 1e-9);
    }

    #[test]
    fn test_heading_from_magnetometer() {
        let mut engine = DeadReckoningEngine::new(DeadReckoningConfig::default());
        assert!(!engine.heading_known());
        engine.on_magnetometer(&mag(0.0, 0.0));
        assert!(!engine.heading_known());

        engine.on_magnetometer(&mag(0.0, 1.0));
        assert!(engine.heading_known());
        assert_abs_diff_eq!(engine.heading_deg(), 90.0, epsilon = 1e-9);

        engine.on_magnetometer(&mag(0.0, -1.0));
        assert_abs_diff_eq!(engine.heading_deg(), 270.0, epsilon = 1e-9);

        engine.on_magnetometer(&mag(1.0, 0.0));
        assert_abs_diff_eq!(engine.heading_deg(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_peak_fires_one_step() {
        let mut engine = DeadReckoningEngine::new(DeadReckoningConfig::default());
        engine.set_trusted_position(GeoPoint::new(0.0, 0.0));
        engine.on_magnetometer(&mag(0.0, 1.0));

        assert!(engine.on_accelerometer(&accel(0, 9.8)).is_none());
        assert!(engine.on_accelerometer(&accel(100, 13.0)).is_none());
        let sample = engine.on_accelerometer(&accel(200, 9.9)).expect("step should fire");

        assert_eq!(engine.step_count(), 1);
        let pos = sample.position().unwrap();
        assert_abs_diff_eq!(pos.latitude, 0.0, epsilon = 1e-15);
        assert_abs_diff_eq!(pos.longitude, 0.762 / 111_320.0, epsilon = 1e-12);
        assert_eq!(sample.accuracy_m(), 25.0);
    }

    #[test]
    fn test_below_threshold_is_not_a_step() {
        let mut engine = DeadReckoningEngine::new(DeadReckoningConfig::default());
        engine.set_trusted_position(GeoPoint::new(0.0, 0.0));
        engine.on_accelerometer(&accel(0, 9.8));
        engine.on_accelerometer(&accel(100, 11.0));
        engine.on_accelerometer(&accel(200, 9.8));
        assert_eq!(engine.step_count(), 0);
    }

    #[test]
    fn test_plateau_is_not_strict_maximum() {
        let mut engine = DeadReckoningEngine::new(DeadReckoningConfig::default());
        engine.on_accelerometer(&accel(0, 9.8));
        engine.on_accelerometer(&accel(100, 13.0));
        engine.on_accelerometer(&accel(200, 13.0));
        engine.on_accelerometer(&accel(300, 9.8));
        assert_eq!(engine.step_count(), 0);
    }

    #[test]
    fn test_debounce_suppresses_close_peaks() {
        let mut engine = DeadReckoningEngine::new(DeadReckoningConfig::default());
        engine.on_accelerometer(&accel(0, 9.8));
        engine.on_accelerometer(&accel(100, 13.0));
        engine.on_accelerometer(&accel(150, 9.8));
        // Second peak only 100 ms after the first
        engine.on_accelerometer(&accel(200, 13.5));
        engine.on_accelerometer(&accel(250, 9.8));
        assert_eq!(engine.step_count(), 1);

        // Third peak well past the debounce window
        engine.on_accelerometer(&accel(600, 13.5));
        engine.on_accelerometer(&accel(700, 9.8));
        assert_eq!(engine.step_count(), 2);
    }

    #[test]
    fn test_no_projection_without_trusted_fix() {
        let mut engine = DeadReckoningEngine::new(DeadReckoningConfig::default());
        engine.on_accelerometer(&accel(0, 9.8));
        engine.on_accelerometer(&accel(100, 13.0));
        assert!(engine.on_accelerometer(&accel(200, 9.8)).is_none());
        assert_eq!(engine.step_count(), 1);
        assert!(engine.on_fallback_tick(5_000).is_none());
    }

    #[test]
    fn test_steps_accumulate_and_fix_reanchors() {
        let mut engine = DeadReckoningEngine::new(DeadReckoningConfig::default());
        engine.set_trusted_position(GeoPoint::new(10.0, 20.0));
        engine.on_magnetometer(&mag(1.0, 0.0)); // north

        let mut ts = 0;
        for _ in 0..3 {
            engine.on_accelerometer(&accel(ts, 9.8));
            engine.on_accelerometer(&accel(ts + 100, 13.0));
            engine.on_accelerometer(&accel(ts + 200, 9.8));
            ts += 1_000;
        }
        assert_eq!(engine.step_count(), 3);
        let pos = engine.pseudo_position().unwrap();
        assert_abs_diff_eq!(pos.latitude, 10.0 + 3.0 * 0.762 / 111_320.0, epsilon = 1e-12);

        engine.set_trusted_position(GeoPoint::new(11.0, 21.0));
        assert_eq!(engine.pseudo_position(), Some(GeoPoint::new(11.0, 21.0)));
    }

    #[test]
    fn test_fallback_tick_refreshes_timestamp() {
        let mut engine = DeadReckoningEngine::new(DeadReckoningConfig::default());
        engine.set_trusted_position(GeoPoint::new(1.0, 1.0));
        let sample = engine.on_fallback_tick(9_000).unwrap();
        assert_eq!(sample.captured_at_ms(), 9_000);
        assert_eq!(sample.position(), Some(GeoPoint::new(1.0, 1.0)));
    }
}
