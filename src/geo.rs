//! Spherical and local-planar geometry helpers for route shapes.

use serde::{Deserialize, Serialize};

const EARTH_RADIUS_M: f64 = 6_371_000.0;
const METERS_PER_DEG_LAT: f64 = 111_320.0;

/// One vertex of a route shape, with the cumulative distance along the
/// shape in meters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShapePoint {
    pub lat: f64,
    pub lon: f64,
    pub shape_dist: f64,
}

/// Result of projecting a point onto a polyline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolylineSnap {
    pub lat: f64,
    pub lon: f64,
    /// Distance along the polyline at the snapped point, meters.
    pub distance_along: f64,
    /// Great-circle distance from the query point to the snapped point.
    pub offset_m: f64,
}

pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();

    EARTH_RADIUS_M * c
}

fn meters_per_deg_lon(lat: f64) -> f64 {
    METERS_PER_DEG_LAT * lat.to_radians().cos()
}

/// Projects `(lat, lon)` onto the polyline, returning the nearest snapped
/// point. Each segment is treated as planar in a local equirectangular
/// frame, which is accurate at segment lengths typical of transit shapes.
/// Returns `None` for polylines with fewer than two points.
pub fn snap_to_polyline(lat: f64, lon: f64, shape: &[ShapePoint]) -> Option<PolylineSnap> {
    if shape.len() < 2 {
        return None;
    }

    let mut best: Option<PolylineSnap> = None;

    for seg in shape.windows(2) {
        let (a, b) = (&seg[0], &seg[1]);
        let m_lon = meters_per_deg_lon(a.lat);

        let ax = 0.0;
        let ay = 0.0;
        let bx = (b.lon - a.lon) * m_lon;
        let by = (b.lat - a.lat) * METERS_PER_DEG_LAT;
        let px = (lon - a.lon) * m_lon;
        let py = (lat - a.lat) * METERS_PER_DEG_LAT;

        let seg_len_sq = (bx - ax).powi(2) + (by - ay).powi(2);
        let t = if seg_len_sq == 0.0 {
            0.0
        } else {
            (((px - ax) * (bx - ax) + (py - ay) * (by - ay)) / seg_len_sq).clamp(0.0, 1.0)
        };

        let snap_lat = a.lat + t * (b.lat - a.lat);
        let snap_lon = a.lon + t * (b.lon - a.lon);
        let offset = haversine_distance(lat, lon, snap_lat, snap_lon);

        if best.map(|s| offset < s.offset_m).unwrap_or(true) {
            best = Some(PolylineSnap {
                lat: snap_lat,
                lon: snap_lon,
                distance_along: a.shape_dist + t * (b.shape_dist - a.shape_dist),
                offset_m: offset,
            });
        }
    }

    best
}

/// Interpolates the point at `distance` meters along the polyline.
/// Distances outside the shape are clamped to its endpoints.
pub fn point_at_distance(shape: &[ShapePoint], distance: f64) -> Option<(f64, f64)> {
    let first = shape.first()?;
    let last = shape.last()?;

    if distance <= first.shape_dist {
        return Some((first.lat, first.lon));
    }
    if distance >= last.shape_dist {
        return Some((last.lat, last.lon));
    }

    for seg in shape.windows(2) {
        let (a, b) = (&seg[0], &seg[1]);
        if distance >= a.shape_dist && distance <= b.shape_dist {
            let span = b.shape_dist - a.shape_dist;
            let t = if span == 0.0 {
                0.0
            } else {
                (distance - a.shape_dist) / span
            };
            return Some((a.lat + t * (b.lat - a.lat), a.lon + t * (b.lon - a.lon)));
        }
    }

    Some((last.lat, last.lon))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn straight_shape() -> Vec<ShapePoint> {
        // Roughly 1113 m of northward travel per 0.01 degrees latitude
        vec![
            ShapePoint {
                lat: 40.70,
                lon: -74.00,
                shape_dist: 0.0,
            },
            ShapePoint {
                lat: 40.71,
                lon: -74.00,
                shape_dist: 1113.0,
            },
            ShapePoint {
                lat: 40.72,
                lon: -74.00,
                shape_dist: 2226.0,
            },
        ]
    }

    #[test]
    fn test_haversine_known_distance() {
        // One degree of latitude is ~111.2 km
        let d = haversine_distance(40.0, -74.0, 41.0, -74.0);
        assert!((d - 111_195.0).abs() < 500.0, "got {}", d);
    }

    #[test]
    fn test_haversine_zero() {
        assert_eq!(haversine_distance(40.0, -74.0, 40.0, -74.0), 0.0);
    }

    #[test]
    fn test_snap_on_line() {
        let shape = straight_shape();
        let snap = snap_to_polyline(40.705, -74.00, &shape).unwrap();
        assert!(snap.offset_m < 1.0);
        assert!((snap.distance_along - 556.5).abs() < 10.0);
    }

    #[test]
    fn test_snap_offset_to_side() {
        let shape = straight_shape();
        // ~0.001 deg of longitude east of the line, ~84 m at this latitude
        let snap = snap_to_polyline(40.705, -73.999, &shape).unwrap();
        assert!(snap.offset_m > 50.0 && snap.offset_m < 120.0, "{}", snap.offset_m);
        assert!((snap.lon - -74.00).abs() < 1e-9);
    }

    #[test]
    fn test_snap_clamps_before_start() {
        let shape = straight_shape();
        let snap = snap_to_polyline(40.69, -74.00, &shape).unwrap();
        assert_eq!(snap.distance_along, 0.0);
    }

    #[test]
    fn test_snap_requires_two_points() {
        let shape = vec![ShapePoint {
            lat: 40.7,
            lon: -74.0,
            shape_dist: 0.0,
        }];
        assert!(snap_to_polyline(40.7, -74.0, &shape).is_none());
    }

    #[test]
    fn test_point_at_distance_interpolates() {
        let shape = straight_shape();
        let (lat, lon) = point_at_distance(&shape, 556.5).unwrap();
        assert!((lat - 40.705).abs() < 1e-3);
        assert_eq!(lon, -74.00);
    }

    #[test]
    fn test_point_at_distance_clamps() {
        let shape = straight_shape();
        assert_eq!(point_at_distance(&shape, -10.0).unwrap(), (40.70, -74.00));
        assert_eq!(point_at_distance(&shape, 9999.0).unwrap(), (40.72, -74.00));
    }
}
