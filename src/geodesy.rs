//! WGS84 conversions between earth-centred coordinates and the configured
//! geodetic base position.

use nalgebra::Vector3;

use crate::gnss::Position;

const SEMI_MAJOR_AXIS: f64 = 6_378_137.0;
const FLATTENING: f64 = 1.0 / 298.257_223_563;
const ECCENTRICITY_SQ: f64 = 2.0 * FLATTENING - FLATTENING * FLATTENING;

fn prime_vertical_radius(lat: f64) -> f64 {
    SEMI_MAJOR_AXIS / (1.0 - ECCENTRICITY_SQ * lat.sin().powi(2)).sqrt()
}

/// Geodetic position (degrees, ellipsoidal metres) to ECEF metres.
pub fn to_ecef(position: &Position) -> Vector3<f64> {
    let lat = position.latitude.to_radians();
    let lon = position.longitude.to_radians();
    let n = prime_vertical_radius(lat);
    let h = position.altitude;
    Vector3::new(
        (n + h) * lat.cos() * lon.cos(),
        (n + h) * lat.cos() * lon.sin(),
        (n * (1.0 - ECCENTRICITY_SQ) + h) * lat.sin(),
    )
}

/// ECEF metres to geodetic position, iterating the latitude a fixed number
/// of times. Converges well below a millimetre for terrestrial points.
pub fn to_geodetic(ecef: &Vector3<f64>) -> Position {
    let p = ecef.x.hypot(ecef.y);
    let lon = ecef.y.atan2(ecef.x);
    let mut lat = ecef.z.atan2(p * (1.0 - ECCENTRICITY_SQ));
    let mut alt = 0.0;
    for _ in 0..6 {
        let n = prime_vertical_radius(lat);
        alt = p / lat.cos() - n;
        lat = ecef.z.atan2(p * (1.0 - ECCENTRICITY_SQ * n / (n + alt)));
    }
    Position {
        latitude: lat.to_degrees(),
        longitude: lon.to_degrees(),
        altitude: alt,
    }
}

/// Straight-line distance in metres between a reported ECEF point and a
/// geodetic position.
pub fn separation(ecef: &Vector3<f64>, position: &Position) -> f64 {
    (ecef - to_ecef(position)).norm()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_ecef_to_geodetic() {
        let ecef = Vector3::new(-2_072_860.7317, -4_139_459.9752, 4_373_707.3810);
        let position = to_geodetic(&ecef);
        assert!((position.latitude - 43.564_978_733).abs() < 1e-8);
        assert!((position.longitude - -116.599_707_708).abs() < 1e-8);
        assert!((position.altitude - 742.4959).abs() < 1e-3);
    }

    #[test]
    fn round_trips_through_ecef() {
        let position = Position {
            latitude: -33.856_784,
            longitude: 151.215_297,
            altitude: 39.2,
        };
        let back = to_geodetic(&to_ecef(&position));
        assert!(separation(&to_ecef(&back), &position) < 1e-4);
        assert!((back.altitude - position.altitude).abs() < 1e-4);
    }

    #[test]
    fn separation_measures_offset() {
        let position = Position {
            latitude: 0.0,
            longitude: 0.0,
            altitude: 0.0,
        };
        let shifted = to_ecef(&position) + Vector3::new(3.0, 0.0, 4.0);
        assert!((separation(&shifted, &position) - 5.0).abs() < 1e-9);
    }
}
