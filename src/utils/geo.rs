// src/utils/geo.rs

/// Great-circle initial bearing from the previous fix to the current one,
/// in degrees normalised into [0, 360). Used when the positioning API does
/// not supply a heading (stationary or low-accuracy fixes).
///
/// Identical points yield 0 by convention.
pub fn calculate_heading(prev_lat: f64, prev_lng: f64, curr_lat: f64, curr_lng: f64) -> f64 {
    if prev_lat == curr_lat && prev_lng == curr_lng {
        return 0.0;
    }

    let d_lng = (curr_lng - prev_lng).to_radians();
    let lat1 = prev_lat.to_radians();
    let lat2 = curr_lat.to_radians();

    let y = d_lng.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * d_lng.cos();

    let bearing = y.atan2(x).to_degrees();
    (bearing + 360.0) % 360.0
}

/// Haversine distance between two coordinates, in meters.
pub fn haversine_distance_m(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;

    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lng = (lng2 - lng1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}
