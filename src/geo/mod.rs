pub mod pricing;

use crate::models::courier::GeoPoint;

const EARTH_RADIUS_KM: f64 = 6_371.0;

pub fn haversine_km(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let delta_lat = (b.lat - a.lat).to_radians();
    let delta_lng = (b.lng - a.lng).to_radians();

    let sin_lat = (delta_lat / 2.0).sin();
    let sin_lng = (delta_lng / 2.0).sin();

    let haversine = sin_lat * sin_lat + lat1.cos() * lat2.cos() * sin_lng * sin_lng;
    let central_angle = 2.0 * haversine.sqrt().asin();

    EARTH_RADIUS_KM * central_angle
}

/// Upper distance bound (inclusive, km) for each priority, highest first.
const PRIORITY_BREAKPOINTS: [(f64, u8); 9] = [
    (1.0, 10),
    (2.0, 9),
    (3.0, 8),
    (5.0, 7),
    (7.0, 6),
    (10.0, 5),
    (15.0, 4),
    (20.0, 3),
    (30.0, 2),
];

/// Maps a delivery distance to a sort priority in `1..=10`. Shorter is higher.
pub fn priority_from_distance(distance_km: f64) -> u8 {
    PRIORITY_BREAKPOINTS
        .iter()
        .find(|(limit, _)| distance_km <= *limit)
        .map(|(_, priority)| *priority)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::{haversine_km, priority_from_distance};
    use crate::models::courier::GeoPoint;

    #[test]
    fn zero_distance_for_same_point() {
        let p = GeoPoint {
            lat: 13.75,
            lng: 100.50,
        };
        let distance = haversine_km(&p, &p);
        assert!(distance < 1e-9);
    }

    #[test]
    fn london_to_paris_is_around_343_km() {
        let london = GeoPoint {
            lat: 51.5074,
            lng: -0.1278,
        };
        let paris = GeoPoint {
            lat: 48.8566,
            lng: 2.3522,
        };
        let distance = haversine_km(&london, &paris);
        assert!((distance - 343.0).abs() < 5.0);
    }

    #[test]
    fn distance_is_symmetric() {
        let shop = GeoPoint {
            lat: 13.75,
            lng: 100.50,
        };
        let customer = GeoPoint {
            lat: 13.78,
            lng: 100.51,
        };
        assert!((haversine_km(&shop, &customer) - haversine_km(&customer, &shop)).abs() < 1e-12);
    }

    #[test]
    fn priority_buckets_follow_breakpoints() {
        assert_eq!(priority_from_distance(0.0), 10);
        assert_eq!(priority_from_distance(1.0), 10);
        assert_eq!(priority_from_distance(1.5), 9);
        assert_eq!(priority_from_distance(3.4), 7);
        assert_eq!(priority_from_distance(12.0), 4);
        assert_eq!(priority_from_distance(30.0), 2);
        assert_eq!(priority_from_distance(30.1), 1);
        assert_eq!(priority_from_distance(500.0), 1);
    }

    #[test]
    fn priority_never_increases_with_distance() {
        let mut previous = priority_from_distance(0.0);
        for step in 1..400 {
            let current = priority_from_distance(step as f64 * 0.1);
            assert!(current <= previous);
            assert!((1..=10).contains(&current));
            previous = current;
        }
    }
}
