use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rstar::primitives::GeomWithData;
use rstar::{RTree, AABB};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use crate::error::{TrackerError, TrackerResult};
use crate::geodesy::{haversine_distance, normalize_longitude, BoundingBox};
use crate::types::{GeoPoint, TimestampMs};

pub type AddressId = u64;

/// Default search radius for `lookup`, in meters.
pub const DEFAULT_LOOKUP_RADIUS_M: f64 = 50.0;
/// Same-text confirmations within this many degrees (per axis) merge.
pub const DEFAULT_CONFIRM_TOLERANCE_DEG: f64 = 1e-4;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VerifiedAddress {
    pub id: AddressId,
    pub latitude: f64,
    pub longitude: f64,
    pub address_text: String,
    pub verified_count: u32,
    pub last_verified_at_ms: TimestampMs,
    pub created_at_ms: TimestampMs,
}

impl VerifiedAddress {
    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }
}

/// Index entries are `[longitude, latitude]` tagged with the address id.
type IndexedPoint = GeomWithData<[f64; 2], AddressId>;

#[derive(Serialize, Deserialize)]
struct CacheSnapshot {
    next_id: AddressId,
    entries: Vec<VerifiedAddress>,
}

/// Crowd-verified addresses keyed by location.
///
/// # Lookup
/// - Bounding-box prefilter on an R-tree, sized from the radius with the
///   longitude span widened by latitude
/// - Exact great-circle check against the radius
/// - Ties go to the highest `verified_count`, then the latest confirmation
///
/// # File Format
/// Snapshots are gzip-compressed JSON: `{"next_id": n, "entries": [...]}`.
pub struct AddressVerificationCache {
    tree: RTree<IndexedPoint>,
    entries: HashMap<AddressId, VerifiedAddress>,
    next_id: AddressId,
    confirm_tolerance_deg: f64,
}

impl Default for AddressVerificationCache {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIRM_TOLERANCE_DEG)
    }
}

impl AddressVerificationCache {
    pub fn new(confirm_tolerance_deg: f64) -> Self {
        Self {
            tree: RTree::new(),
            entries: HashMap::new(),
            next_id: 1,
            confirm_tolerance_deg,
        }
    }

    fn index_point(point: GeoPoint, id: AddressId) -> IndexedPoint {
        GeomWithData::new([normalize_longitude(point.longitude), point.latitude], id)
    }

    /// Entries inside `bbox`, querying each side separately when it straddles
    /// the antimeridian.
    fn candidates_in(&self, bbox: &BoundingBox) -> Vec<&VerifiedAddress> {
        bbox.split_at_antimeridian()
            .iter()
            .flat_map(|part| {
                let envelope = AABB::from_corners([part.min_lng, part.min_lat], [part.max_lng, part.max_lat]);
                self.tree.locate_in_envelope(&envelope).collect::<Vec<_>>()
            })
            .filter_map(|indexed| self.entries.get(&indexed.data))
            .collect()
    }

    /// Best verified address within `radius_m` of `point`, if any.
    pub fn lookup(&self, point: GeoPoint, radius_m: f64) -> Option<&VerifiedAddress> {
        let bbox = BoundingBox::around(point, radius_m);
        self.candidates_in(&bbox)
            .into_iter()
            .filter(|entry| haversine_distance(point, entry.point()) <= radius_m)
            .max_by(|a, b| {
                a.verified_count
                    .cmp(&b.verified_count)
                    .then_with(|| a.last_verified_at_ms.cmp(&b.last_verified_at_ms))
            })
    }

    pub fn lookup_text(&self, point: GeoPoint, radius_m: f64) -> Option<String> {
        self.lookup(point, radius_m).map(|entry| entry.address_text.clone())
    }

    /// Record a user confirmation. Re-confirming the same text near an existing
    /// entry bumps its counter; anything else creates a new entry.
    pub fn confirm(&mut self, point: GeoPoint, address_text: &str, now_ms: TimestampMs) -> VerifiedAddress {
        let tol = self.confirm_tolerance_deg;
        let bbox = BoundingBox::from_half_spans(point, tol, tol);

        let existing = self
            .candidates_in(&bbox)
            .into_iter()
            .filter(|entry| entry.address_text == address_text)
            .min_by(|a, b| {
                haversine_distance(point, a.point()).total_cmp(&haversine_distance(point, b.point()))
            })
            .map(|entry| entry.id);

        if let Some(entry) = existing.and_then(|id| self.entries.get_mut(&id)) {
            entry.verified_count = entry.verified_count.saturating_add(1);
            entry.last_verified_at_ms = now_ms;
            log::debug!("Address {} re-confirmed ({}x)", entry.id, entry.verified_count);
            return entry.clone();
        }

        let entry = VerifiedAddress {
            id: self.next_id,
            latitude: point.latitude,
            longitude: point.longitude,
            address_text: address_text.to_string(),
            verified_count: 1,
            last_verified_at_ms: now_ms,
            created_at_ms: now_ms,
        };
        self.next_id += 1;
        self.tree.insert(Self::index_point(point, entry.id));
        self.entries.insert(entry.id, entry.clone());
        log::debug!("Address {} created", entry.id);
        entry
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn save(&self, path: &Path) -> TrackerResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| TrackerError::PersistenceFailure(format!("create cache dir: {}", e)))?;
            }
        }

        let mut entries: Vec<VerifiedAddress> = self.entries.values().cloned().collect();
        entries.sort_by_key(|entry| entry.id);
        let json = serde_json::to_string(&CacheSnapshot {
            next_id: self.next_id,
            entries,
        })
        .map_err(|e| TrackerError::PersistenceFailure(format!("serialize address cache: {}", e)))?;

        let file = File::create(path)
            .map_err(|e| TrackerError::PersistenceFailure(format!("create {}: {}", path.display(), e)))?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder
            .write_all(json.as_bytes())
            .map_err(|e| TrackerError::PersistenceFailure(format!("write address cache: {}", e)))?;
        encoder
            .finish()
            .map_err(|e| TrackerError::PersistenceFailure(format!("finish address cache: {}", e)))?;
        Ok(())
    }

    /// Load a snapshot. A missing file yields an empty cache.
    pub fn load(path: &Path, confirm_tolerance_deg: f64) -> TrackerResult<Self> {
        let mut cache = Self::new(confirm_tolerance_deg);
        if !path.exists() {
            return Ok(cache);
        }

        let file = File::open(path)
            .map_err(|e| TrackerError::PersistenceFailure(format!("open {}: {}", path.display(), e)))?;
        let mut json = String::new();
        GzDecoder::new(file)
            .read_to_string(&mut json)
            .map_err(|e| TrackerError::PersistenceFailure(format!("decompress {}: {}", path.display(), e)))?;
        let snapshot: CacheSnapshot = serde_json::from_str(&json)
            .map_err(|e| TrackerError::PersistenceFailure(format!("parse {}: {}", path.display(), e)))?;

        let max_id = snapshot.entries.iter().map(|e| e.id).max().unwrap_or(0);
        cache.next_id = snapshot.next_id.max(max_id + 1);
        cache.tree = RTree::bulk_load(
            snapshot
                .entries
                .iter()
                .map(|entry| Self::index_point(entry.point(), entry.id))
                .collect(),
        );
        cache.entries = snapshot.entries.into_iter().map(|entry| (entry.id, entry)).collect();
        Ok(cache)
    }
}
