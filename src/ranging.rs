use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::{RadioReading, RadioTechnology, SourceSample, TimestampMs};

/// Emitters not heard from within this window are pruned.
pub const EMITTER_STALENESS_MS: u64 = 30_000;

/// Log-distance path-loss model.
///
/// ```text
/// RSSI = Ptx - 10 * n * log10(d)
///    =>  d = 10^((Ptx - RSSI) / (10 * n))
/// ```
///
/// `tx_power_dbm` is the expected RSSI at one meter.
pub fn estimate_distance(rssi_dbm: f64, tx_power_dbm: f64, path_loss_exponent: f64) -> f64 {
    10f64.powf((tx_power_dbm - rssi_dbm) / (10.0 * path_loss_exponent))
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PathLossModel {
    pub tx_power_dbm: f64,
    pub path_loss_exponent: f64,
}

impl PathLossModel {
    /// Typical indoor access point, one-meter reference power.
    pub const WIFI: PathLossModel = PathLossModel {
        tx_power_dbm: -40.0,
        path_loss_exponent: 3.0,
    };

    /// Short-range beacon advertising at low power.
    pub const BLUETOOTH: PathLossModel = PathLossModel {
        tx_power_dbm: -59.0,
        path_loss_exponent: 2.0,
    };

    pub fn distance(&self, rssi_dbm: f64) -> f64 {
        estimate_distance(rssi_dbm, self.tx_power_dbm, self.path_loss_exponent)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmitterObservation {
    pub rssi_dbm: f64,
    pub distance_m: f64,
    pub last_seen_ms: TimestampMs,
}

/// Per-technology emitter table.
///
/// WiFi contributes its strongest access point, Bluetooth its nearest beacon.
pub struct RadioRangingEstimator {
    technology: RadioTechnology,
    model: PathLossModel,
    staleness_ms: u64,
    emitters: HashMap<String, EmitterObservation>,
    scans_ingested: u64,
}

impl RadioRangingEstimator {
    pub fn new(technology: RadioTechnology, model: PathLossModel, staleness_ms: u64) -> Self {
        Self {
            technology,
            model,
            staleness_ms,
            emitters: HashMap::new(),
            scans_ingested: 0,
        }
    }

    pub fn wifi() -> Self {
        Self::new(RadioTechnology::Wifi, PathLossModel::WIFI, EMITTER_STALENESS_MS)
    }

    pub fn bluetooth() -> Self {
        Self::new(RadioTechnology::Bluetooth, PathLossModel::BLUETOOTH, EMITTER_STALENESS_MS)
    }

    pub fn technology(&self) -> RadioTechnology {
        self.technology
    }

    /// Record one scan result batch. Non-finite RSSI values are ignored.
    pub fn ingest_scan(&mut self, readings: &[RadioReading], now_ms: TimestampMs) {
        for reading in readings {
            if !reading.rssi_dbm.is_finite() {
                continue;
            }
            let distance_m = self.model.distance(reading.rssi_dbm);
            self.emitters.insert(
                reading.emitter_id.clone(),
                EmitterObservation {
                    rssi_dbm: reading.rssi_dbm,
                    distance_m,
                    last_seen_ms: now_ms,
                },
            );
        }
        self.scans_ingested += 1;
    }

    /// Drop emitters older than the staleness window. Returns how many were removed.
    pub fn prune(&mut self, now_ms: TimestampMs) -> usize {
        let before = self.emitters.len();
        let window = self.staleness_ms;
        self.emitters
            .retain(|_, obs| now_ms.saturating_sub(obs.last_seen_ms) <= window);
        before - self.emitters.len()
    }

    /// The emitter this technology contributes to the source registry.
    pub fn best_emitter(&self) -> Option<(&str, &EmitterObservation)> {
        let iter = self.emitters.iter().map(|(id, obs)| (id.as_str(), obs));
        match self.technology {
            RadioTechnology::Wifi => iter.max_by(|a, b| a.1.rssi_dbm.total_cmp(&b.1.rssi_dbm)),
            RadioTechnology::Bluetooth => {
                iter.min_by(|a, b| a.1.distance_m.total_cmp(&b.1.distance_m))
            }
        }
    }

    /// Best emitter as a position-less source sample.
    pub fn contribution(&self) -> Option<SourceSample> {
        self.best_emitter().map(|(id, obs)| SourceSample::Radio {
            technology: self.technology,
            emitter_id: id.to_string(),
            distance_m: obs.distance_m,
            captured_at_ms: obs.last_seen_ms,
        })
    }

    pub fn emitter_count(&self) -> usize {
        self.emitters.len()
    }

    pub fn scans_ingested(&self) -> u64 {
        self.scans_ingested
    }
}
