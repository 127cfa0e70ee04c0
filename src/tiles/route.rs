//! # Route Prediction
//!
//! Great-circle helpers used to extend the recent track along its current
//! heading, so tiles ahead of the device are fetched before it gets there.

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance between two `(lat, lon)` points, in meters.
pub fn haversine_m(a: (f64, f64), b: (f64, f64)) -> f64 {
    let (lat1, lon1) = (a.0.to_radians(), a.1.to_radians());
    let (lat2, lon2) = (b.0.to_radians(), b.1.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

/// Initial bearing from `a` to `b`, degrees clockwise from north in `[0, 360)`.
pub fn bearing_deg(a: (f64, f64), b: (f64, f64)) -> f64 {
    let (lat1, lon1) = (a.0.to_radians(), a.1.to_radians());
    let (lat2, lon2) = (b.0.to_radians(), b.1.to_radians());
    let dlon = lon2 - lon1;

    let x = dlon.sin() * lat2.cos();
    let y = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlon.cos();
    (x.atan2(y).to_degrees() + 360.0) % 360.0
}

/// Point reached from `origin` after `distance_m` meters along `bearing`.
///
/// Longitude is normalized into `[-180, 180)`.
pub fn destination(origin: (f64, f64), bearing: f64, distance_m: f64) -> (f64, f64) {
    let angular = distance_m / EARTH_RADIUS_M;
    let lat1 = origin.0.to_radians();
    let lon1 = origin.1.to_radians();
    let br = bearing.to_radians();

    let lat2 = (lat1.sin() * angular.cos() + lat1.cos() * angular.sin() * br.cos()).asin();
    let lon2 = lon1
        + (br.sin() * angular.sin() * lat1.cos()).atan2(angular.cos() - lat1.sin() * lat2.sin());

    let lon = (lon2.to_degrees() + 540.0) % 360.0 - 180.0;
    (lat2.to_degrees(), lon)
}

/// Extrapolates `lookahead` points past the end of `track`.
///
/// Uses the heading and step length of the last two points. Returns an
/// empty list when the track has fewer than two points or the device has
/// not moved between them.
pub fn predict_route(track: &[(f64, f64)], lookahead: usize) -> Vec<(f64, f64)> {
    let [.., previous, last] = track else {
        return Vec::new();
    };

    let step = haversine_m(*previous, *last);
    if step == 0.0 {
        return Vec::new();
    }
    let heading = bearing_deg(*previous, *last);

    let mut points = Vec::with_capacity(lookahead);
    let mut cursor = *last;
    for _ in 0..lookahead {
        cursor = destination(cursor, heading, step);
        points.push(cursor);
    }
    points
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_haversine_one_degree_latitude() {
        let d = haversine_m((0.0, 0.0), (1.0, 0.0));
        assert!((d - 111_195.0).abs() < 10.0, "got {}", d);
    }

    #[test]
    fn test_haversine_zero() {
        assert_eq!(haversine_m((48.1, 11.5), (48.1, 11.5)), 0.0);
    }

    #[test]
    fn test_bearing_cardinal_directions() {
        assert!((bearing_deg((0.0, 0.0), (1.0, 0.0)) - 0.0).abs() < 1e-9);
        assert!((bearing_deg((0.0, 0.0), (0.0, 1.0)) - 90.0).abs() < 1e-9);
        assert!((bearing_deg((0.0, 0.0), (-1.0, 0.0)) - 180.0).abs() < 1e-9);
        assert!((bearing_deg((0.0, 0.0), (0.0, -1.0)) - 270.0).abs() < 1e-9);
    }

    #[test]
    fn test_destination_inverts_bearing_and_distance() {
        let origin = (52.52, 13.405);
        let target = destination(origin, 45.0, 1_000.0);
        assert!((haversine_m(origin, target) - 1_000.0).abs() < 0.5);
        assert!((bearing_deg(origin, target) - 45.0).abs() < 0.1);
    }

    #[test]
    fn test_destination_wraps_antimeridian() {
        let (_, lon) = destination((0.0, 179.99), 90.0, 5_000.0);
        assert!(lon < -179.0, "got {}", lon);
    }

    #[test]
    fn test_predict_route_continues_heading() {
        let track = [(10.0, 10.0), (10.0, 10.001)];
        let predicted = predict_route(&track, 3);
        assert_eq!(predicted.len(), 3);
        for window in predicted.windows(2) {
            assert!(window[1].1 > window[0].1, "moving east");
        }
        assert!((predicted[0].0 - 10.0).abs() < 1e-4);
    }

    #[test]
    fn test_predict_route_needs_motion() {
        assert!(predict_route(&[], 5).is_empty());
        assert!(predict_route(&[(1.0, 1.0)], 5).is_empty());
        assert!(predict_route(&[(1.0, 1.0), (1.0, 1.0)], 5).is_empty());
    }
}
