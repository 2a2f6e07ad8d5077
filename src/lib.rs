//! Multi-source location fusion: satellite fixes, radio ranging and
//! pedestrian dead reckoning arbitrated into one smoothed coordinate stream,
//! with an offline-durable upload queue and a crowd-verified address cache.

pub mod address_cache;
pub mod config;
pub mod dashboard;
pub mod dead_reckoning;
pub mod error;
pub mod filters;
pub mod geocode;
pub mod geodesy;
pub mod live_status;
pub mod ranging;
pub mod registry;
pub mod sensor_fusion;
pub mod sensors;
pub mod storage;
pub mod sync;
pub mod tracker;
pub mod types;

pub use address_cache::{AddressVerificationCache, VerifiedAddress};
pub use config::TrackerConfig;
pub use dead_reckoning::DeadReckoningEngine;
pub use error::{TrackerError, TrackerResult};
pub use filters::ScalarKalmanFilter;
pub use ranging::{estimate_distance, RadioRangingEstimator};
pub use registry::SourceRegistry;
pub use sensor_fusion::FusionEngine;
pub use storage::{LocationPersistenceQueue, LocationRecord};
pub use tracker::{Collaborators, SensorInput, Tracker, TrackerOutput, TrackerSender};
pub use types::{FusedLocation, GeoPoint, SourceKind, SourceSample};
