use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::dead_reckoning::DeadReckoningConfig;
use crate::error::{TrackerError, TrackerResult};
use crate::ranging::{PathLossModel, EMITTER_STALENESS_MS};
use crate::sensor_fusion::FusionConfig;

/// Address cache and enrichment settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AddressConfig {
    pub lookup_radius_m: f64,
    /// Same-text confirmations closer than this (degrees, both axes) merge.
    pub confirm_tolerance_deg: f64,
    /// Movement required before another reverse-geocode is attempted.
    pub min_displacement_m: f64,
    pub snapshot_path: Option<PathBuf>,
}

impl Default for AddressConfig {
    fn default() -> Self {
        Self {
            lookup_radius_m: 50.0,
            confirm_tolerance_deg: 1e-4,
            min_displacement_m: 50.0,
            snapshot_path: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    // ── Timers ──
    pub fusion_interval_ms: u64,
    pub scan_interval_ms: u64,
    pub dead_reckoning_fallback_ms: u64,
    pub sync_interval_ms: u64,

    // ── Estimation ──
    pub fusion: FusionConfig,
    pub wifi: PathLossModel,
    pub bluetooth: PathLossModel,
    pub emitter_staleness_ms: u64,
    /// Samples older than this are dropped from the registry on the scan
    /// timer. Between `fusion.source_timeout_ms` and this age a source shows
    /// as stale in diagnostics.
    pub source_eviction_ms: u64,
    pub dead_reckoning: DeadReckoningConfig,

    // ── Persistence ──
    /// No journal means fixes are queued in memory only.
    pub journal_path: Option<PathBuf>,
    pub sync_batch_size: usize,
    pub fsync_appends: bool,

    // ── Address enrichment ──
    pub address: AddressConfig,

    // ── Remote endpoints ──
    pub sync_endpoint: Option<String>,
    pub geocode_endpoint: Option<String>,
    pub http_timeout_secs: u64,

    // ── Diagnostics ──
    pub status_path: Option<PathBuf>,
    pub channel_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            fusion_interval_ms: 1_000,
            scan_interval_ms: 5_000,
            dead_reckoning_fallback_ms: 2_000,
            sync_interval_ms: 60_000,

            fusion: FusionConfig::default(),
            wifi: PathLossModel::WIFI,
            bluetooth: PathLossModel::BLUETOOTH,
            emitter_staleness_ms: EMITTER_STALENESS_MS,
            source_eviction_ms: 60_000,
            dead_reckoning: DeadReckoningConfig::default(),

            journal_path: None,
            sync_batch_size: 50,
            fsync_appends: false,

            address: AddressConfig::default(),

            sync_endpoint: None,
            geocode_endpoint: None,
            http_timeout_secs: 30,

            status_path: None,
            channel_capacity: 1_024,
        }
    }
}

impl TrackerConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> TrackerResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| TrackerError::InvalidConfig(format!("read {}: {}", path.display(), e)))?;
        let config: TrackerConfig = serde_json::from_str(&text)
            .map_err(|e| TrackerError::InvalidConfig(format!("parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> TrackerResult<()> {
        let intervals = [
            ("fusion_interval_ms", self.fusion_interval_ms),
            ("scan_interval_ms", self.scan_interval_ms),
            ("dead_reckoning_fallback_ms", self.dead_reckoning_fallback_ms),
            ("sync_interval_ms", self.sync_interval_ms),
            ("fusion.source_timeout_ms", self.fusion.source_timeout_ms),
            ("emitter_staleness_ms", self.emitter_staleness_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(TrackerError::InvalidConfig(format!("{} must be positive", name)));
            }
        }

        let positives = [
            ("fusion.process_noise_m", self.fusion.process_noise_m),
            ("fusion.noise.satellite_m", self.fusion.noise.satellite_m),
            ("fusion.noise.dead_reckoning_m", self.fusion.noise.dead_reckoning_m),
            ("fusion.noise.fallback_m", self.fusion.noise.fallback_m),
            ("wifi.path_loss_exponent", self.wifi.path_loss_exponent),
            ("bluetooth.path_loss_exponent", self.bluetooth.path_loss_exponent),
            ("dead_reckoning.step_length_m", self.dead_reckoning.step_length_m),
            ("dead_reckoning.accuracy_m", self.dead_reckoning.accuracy_m),
            ("address.lookup_radius_m", self.address.lookup_radius_m),
            ("address.confirm_tolerance_deg", self.address.confirm_tolerance_deg),
        ];
        for (name, value) in positives {
            if !(value.is_finite() && value > 0.0) {
                return Err(TrackerError::InvalidConfig(format!("{} must be positive, got {}", name, value)));
            }
        }

        if self.source_eviction_ms < self.fusion.source_timeout_ms {
            return Err(TrackerError::InvalidConfig(format!(
                "source_eviction_ms ({}) must not be shorter than fusion.source_timeout_ms ({})",
                self.source_eviction_ms, self.fusion.source_timeout_ms
            )));
        }
        if self.address.min_displacement_m < 0.0 {
            return Err(TrackerError::InvalidConfig("address.min_displacement_m must not be negative".into()));
        }
        if self.dead_reckoning.window_size < 3 {
            return Err(TrackerError::InvalidConfig("dead_reckoning.window_size must be at least 3".into()));
        }
        if self.sync_batch_size == 0 {
            return Err(TrackerError::InvalidConfig("sync_batch_size must be positive".into()));
        }
        if self.channel_capacity == 0 {
            return Err(TrackerError::InvalidConfig("channel_capacity must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = TrackerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.fusion_interval_ms, 1_000);
        assert_eq!(config.sync_batch_size, 50);
        assert_eq!(config.address.lookup_radius_m, 50.0);
        assert_eq!(config.wifi, PathLossModel::WIFI);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: TrackerConfig =
            serde_json::from_str(r#"{"fusion_interval_ms": 500, "fusion": {"source_timeout_ms": 4000}}"#).unwrap();
        assert_eq!(config.fusion_interval_ms, 500);
        assert_eq!(config.fusion.source_timeout_ms, 4_000);
        assert_eq!(config.fusion.noise.satellite_m, 5.0);
        assert_eq!(config.scan_interval_ms, 5_000);
    }

    #[test]
    fn test_rejects_eviction_before_timeout() {
        let mut config = TrackerConfig::default();
        config.source_eviction_ms = config.fusion.source_timeout_ms - 1;
        assert!(matches!(config.validate(), Err(TrackerError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_zero_interval() {
        let config = TrackerConfig {
            fusion_interval_ms: 0,
            ..TrackerConfig::default()
        };
        assert!(matches!(config.validate(), Err(TrackerError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_non_positive_noise() {
        let mut config = TrackerConfig::default();
        config.fusion.noise.satellite_m = 0.0;
        assert!(config.validate().is_err());

        let mut config = TrackerConfig::default();
        config.fusion.process_noise_m = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_batch() {
        let config = TrackerConfig {
            sync_batch_size: 0,
            ..TrackerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_invalid_config() {
        let err = TrackerConfig::from_json_file("/nonexistent/location_fusion.json").unwrap_err();
        assert!(matches!(err, TrackerError::InvalidConfig(_)));
    }
}
