use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Millisecond wall-clock timestamp (Unix epoch).
pub type TimestampMs = u64;

// ─── Geography ───────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }
}

// ─── Source kinds ────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RadioTechnology {
    Wifi,
    Bluetooth,
}

impl RadioTechnology {
    pub fn source_kind(self) -> SourceKind {
        match self {
            RadioTechnology::Wifi => SourceKind::RadioWifi,
            RadioTechnology::Bluetooth => SourceKind::RadioBluetooth,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SourceKind {
    Satellite,
    RadioWifi,
    RadioBluetooth,
    DeadReckoning,
}

impl SourceKind {
    pub const ALL: [SourceKind; 4] = [
        SourceKind::Satellite,
        SourceKind::RadioWifi,
        SourceKind::RadioBluetooth,
        SourceKind::DeadReckoning,
    ];
}

impl Display for SourceKind {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            SourceKind::Satellite => write!(f, "satellite"),
            SourceKind::RadioWifi => write!(f, "wifi"),
            SourceKind::RadioBluetooth => write!(f, "bluetooth"),
            SourceKind::DeadReckoning => write!(f, "dead-reckoning"),
        }
    }
}

// ─── Source samples ──────────────────────────────────────────────────────────

/// Latest reading from one source kind.
///
/// Radio readings never carry a position: the ranging distance only serves as
/// a confidence proxy, so they are kept for diagnostics and skipped by fusion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSample {
    Satellite {
        position: GeoPoint,
        accuracy_m: f64,
        captured_at_ms: TimestampMs,
    },
    Radio {
        technology: RadioTechnology,
        emitter_id: String,
        distance_m: f64,
        captured_at_ms: TimestampMs,
    },
    DeadReckoning {
        position: GeoPoint,
        accuracy_m: f64,
        step_count: u64,
        captured_at_ms: TimestampMs,
    },
}

impl SourceSample {
    pub fn kind(&self) -> SourceKind {
        match self {
            SourceSample::Satellite { .. } => SourceKind::Satellite,
            SourceSample::Radio { technology, .. } => technology.source_kind(),
            SourceSample::DeadReckoning { .. } => SourceKind::DeadReckoning,
        }
    }

    pub fn position(&self) -> Option<GeoPoint> {
        match self {
            SourceSample::Satellite { position, .. } => Some(*position),
            SourceSample::DeadReckoning { position, .. } => Some(*position),
            SourceSample::Radio { .. } => None,
        }
    }

    pub fn accuracy_m(&self) -> f64 {
        match self {
            SourceSample::Satellite { accuracy_m, .. } => *accuracy_m,
            SourceSample::DeadReckoning { accuracy_m, .. } => *accuracy_m,
            SourceSample::Radio { distance_m, .. } => *distance_m,
        }
    }

    pub fn captured_at_ms(&self) -> TimestampMs {
        match self {
            SourceSample::Satellite { captured_at_ms, .. }
            | SourceSample::Radio { captured_at_ms, .. }
            | SourceSample::DeadReckoning { captured_at_ms, .. } => *captured_at_ms,
        }
    }

    /// Age relative to `now_ms`, saturating at zero for samples stamped in the future.
    pub fn age_ms(&self, now_ms: TimestampMs) -> u64 {
        now_ms.saturating_sub(self.captured_at_ms())
    }
}

// ─── Fusion output ───────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FusedLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_m: f64,
    pub produced_at_ms: TimestampMs,
}

impl FusedLocation {
    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }
}

// ─── Raw platform inputs ─────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccelData {
    pub timestamp_ms: TimestampMs,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GyroData {
    pub timestamp_ms: TimestampMs,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MagData {
    pub timestamp_ms: TimestampMs,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GpsFix {
    pub timestamp_ms: TimestampMs,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_m: f64,
}

/// One emitter seen in a radio scan.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RadioReading {
    pub emitter_id: String,
    pub rssi_dbm: f64,
}

/// Current wall-clock time in milliseconds.
pub fn now_ms() -> TimestampMs {
    chrono::Utc::now().timestamp_millis().max(0) as TimestampMs
}
