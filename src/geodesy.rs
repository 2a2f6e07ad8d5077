//! Small-area geodesy helpers shared by dead reckoning, fusion and the
//! address cache.

use crate::types::GeoPoint;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Meters spanned by one degree of latitude (and of longitude at the equator).
pub const METERS_PER_DEGREE: f64 = 111_320.0;

/// Great-circle distance in meters.
pub fn haversine_distance(a: GeoPoint, b: GeoPoint) -> f64 {
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();
    let h = (d_lat / 2.0).sin().powi(2)
        + a.latitude.to_radians().cos() * b.latitude.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).max(0.0).sqrt());
    EARTH_RADIUS_M * c
}

/// Degrees of latitude covering `meters` northward.
pub fn meters_to_lat_degrees(meters: f64) -> f64 {
    meters / METERS_PER_DEGREE
}

/// Degrees of longitude covering `meters` eastward at `latitude`.
///
/// Longitude degrees shrink toward the poles; the cosine is floored so the
/// result stays finite at ±90°.
pub fn meters_to_lng_degrees(meters: f64, latitude: f64) -> f64 {
    let cos_lat = latitude.to_radians().cos().abs().max(1e-6);
    meters / (METERS_PER_DEGREE * cos_lat)
}

/// Wrap a longitude into [-180, 180).
pub fn normalize_longitude(lng: f64) -> f64 {
    (lng + 180.0).rem_euclid(360.0) - 180.0
}

/// Shortest signed eastward offset from `from` to `to`, in degrees.
pub fn longitude_delta(from: f64, to: f64) -> f64 {
    normalize_longitude(to - from)
}

/// Padding on prefilter boxes: the flat meters-per-degree constant is a bit
/// longer than a degree on the haversine sphere.
const BBOX_MARGIN: f64 = 1.01;

/// Axis-aligned box around `center` that contains every point within `radius_m`.
///
/// Longitudes may run past ±180 when the box crosses the antimeridian; use
/// [`BoundingBox::split_at_antimeridian`] to get boxes in normal range.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub min_lng: f64,
    pub max_lat: f64,
    pub max_lng: f64,
}

impl BoundingBox {
    pub fn around(center: GeoPoint, radius_m: f64) -> Self {
        let d_lat = meters_to_lat_degrees(radius_m * BBOX_MARGIN);
        let d_lng = meters_to_lng_degrees(radius_m * BBOX_MARGIN, center.latitude);
        Self::from_half_spans(center, d_lat, d_lng)
    }

    pub fn from_half_spans(center: GeoPoint, d_lat: f64, d_lng: f64) -> Self {
        Self {
            min_lat: (center.latitude - d_lat).max(-90.0),
            min_lng: center.longitude - d_lng,
            max_lat: (center.latitude + d_lat).min(90.0),
            max_lng: center.longitude + d_lng,
        }
    }

    /// One box, or two when the longitude span wraps past ±180.
    pub fn split_at_antimeridian(&self) -> Vec<BoundingBox> {
        if self.max_lng - self.min_lng >= 360.0 {
            return vec![BoundingBox {
                min_lng: -180.0,
                max_lng: 180.0,
                ..*self
            }];
        }
        let min_lng = normalize_longitude(self.min_lng);
        let max_lng = normalize_longitude(self.max_lng);
        if min_lng <= max_lng {
            vec![BoundingBox {
                min_lng,
                max_lng,
                ..*self
            }]
        } else {
            vec![
                BoundingBox {
                    min_lng,
                    max_lng: 180.0,
                    ..*self
                },
                BoundingBox {
                    min_lng: -180.0,
                    max_lng,
                    ..*self
                },
            ]
        }
    }

    pub fn contains(&self, point: GeoPoint) -> bool {
        let lng = normalize_longitude(point.longitude);
        point.latitude >= self.min_lat
            && point.latitude <= self.max_lat
            && self
                .split_at_antimeridian()
                .iter()
                .any(|part| lng >= part.min_lng && lng <= part.max_lng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_distance_to_self_is_zero() {
        let points = [
            GeoPoint::new(0.0, 0.0),
            GeoPoint::new(37.7749, -122.4194),
            GeoPoint::new(-33.8688, 151.2093),
            GeoPoint::new(89.9, 10.0),
        ];
        for p in points {
            assert_eq!(haversine_distance(p, p), 0.0);
        }
    }

    #[test]
    fn test_distance_is_symmetric() {
        let points = [
            GeoPoint::new(0.0, 0.0),
            GeoPoint::new(37.7749, -122.4194),
            GeoPoint::new(-33.8688, 151.2093),
            GeoPoint::new(51.5007, -0.1246),
        ];
        for a in points {
            for b in points {
                assert_relative_eq!(
                    haversine_distance(a, b),
                    haversine_distance(b, a),
                    max_relative = 1e-12
                );
            }
        }
    }

    #[test]
    fn test_one_degree_latitude() {
        let d = haversine_distance(GeoPoint::new(0.0, 0.0), GeoPoint::new(1.0, 0.0));
        assert!((d - 111_195.0).abs() < 10.0);
    }

    #[test]
    fn test_longitude_degrees_widen_with_latitude() {
        let at_equator = meters_to_lng_degrees(100.0, 0.0);
        let at_sixty = meters_to_lng_degrees(100.0, 60.0);
        assert_relative_eq!(at_sixty, at_equator * 2.0, max_relative = 1e-9);
    }

    #[test]
    fn test_bounding_box_contains_radius() {
        let center = GeoPoint::new(45.0, 7.0);
        let bbox = BoundingBox::around(center, 50.0);
        let north = GeoPoint::new(45.0 + meters_to_lat_degrees(49.0), 7.0);
        let far = GeoPoint::new(45.0 + meters_to_lat_degrees(200.0), 7.0);
        assert!(bbox.contains(center));
        assert!(bbox.contains(north));
        assert!(!bbox.contains(far));
    }

    #[test]
    fn test_normalize_longitude() {
        assert_relative_eq!(normalize_longitude(190.0), -170.0);
        assert_relative_eq!(normalize_longitude(-190.0), 170.0);
        assert_relative_eq!(normalize_longitude(45.0), 45.0);
        assert_relative_eq!(longitude_delta(179.99, -179.99), 0.02, epsilon = 1e-9);
        assert_relative_eq!(longitude_delta(-179.99, 179.99), -0.02, epsilon = 1e-9);
    }

    #[test]
    fn test_bounding_box_wraps_antimeridian() {
        let center = GeoPoint::new(-16.5, 179.9995);
        let bbox = BoundingBox::around(center, 200.0);
        let parts = bbox.split_at_antimeridian();
        assert_eq!(parts.len(), 2);
        assert!(parts.iter().all(|p| p.min_lng >= -180.0 && p.max_lng <= 180.0));

        let across = GeoPoint::new(-16.5, -179.9995);
        assert!(haversine_distance(center, across) < 200.0);
        assert!(bbox.contains(across));
        assert!(!bbox.contains(GeoPoint::new(-16.5, 0.0)));
    }
}
