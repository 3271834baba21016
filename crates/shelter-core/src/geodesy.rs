//! Geodesic distance on the WGS-84 ellipsoid and in-memory nearest-shelter ranking.

use std::cmp::Ordering;

use crate::{GeoPoint, NearbyQuery, ShelterMatch, ShelterRecord};

const WGS84_A: f64 = 6_378_137.0;
const WGS84_F: f64 = 1.0 / 298.257_223_563;
const WGS84_B: f64 = WGS84_A * (1.0 - WGS84_F);
const MEAN_EARTH_RADIUS_M: f64 = 6_371_008.8;

const VINCENTY_MAX_ITERATIONS: usize = 200;
const VINCENTY_TOLERANCE: f64 = 1e-12;

/// Ellipsoidal distance in kilometres.
pub fn geodesic_distance_km(a: GeoPoint, b: GeoPoint) -> f64 {
    geodesic_distance_m(a, b) / 1000.0
}

/// Vincenty inverse solution; nearly antipodal pairs that do not converge fall
/// back to the great-circle distance.
pub fn geodesic_distance_m(a: GeoPoint, b: GeoPoint) -> f64 {
    vincenty_inverse_m(a, b).unwrap_or_else(|| haversine_m(a, b))
}

pub fn haversine_m(a: GeoPoint, b: GeoPoint) -> f64 {
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * MEAN_EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

fn vincenty_inverse_m(a: GeoPoint, b: GeoPoint) -> Option<f64> {
    let l = (b.lon - a.lon).to_radians();
    let u1 = ((1.0 - WGS84_F) * a.lat.to_radians().tan()).atan();
    let u2 = ((1.0 - WGS84_F) * b.lat.to_radians().tan()).atan();
    let (sin_u1, cos_u1) = u1.sin_cos();
    let (sin_u2, cos_u2) = u2.sin_cos();

    let mut lambda = l;
    for _ in 0..VINCENTY_MAX_ITERATIONS {
        let (sin_lambda, cos_lambda) = lambda.sin_cos();
        let sin_sigma = ((cos_u2 * sin_lambda).powi(2)
            + (cos_u1 * sin_u2 - sin_u1 * cos_u2 * cos_lambda).powi(2))
        .sqrt();
        if sin_sigma == 0.0 {
            return Some(0.0);
        }
        let cos_sigma = sin_u1 * sin_u2 + cos_u1 * cos_u2 * cos_lambda;
        let sigma = sin_sigma.atan2(cos_sigma);
        let sin_alpha = cos_u1 * cos_u2 * sin_lambda / sin_sigma;
        let cos_sq_alpha = 1.0 - sin_alpha * sin_alpha;
        // Equatorial lines have cos_sq_alpha == 0.
        let cos_2sigma_m = if cos_sq_alpha != 0.0 {
            cos_sigma - 2.0 * sin_u1 * sin_u2 / cos_sq_alpha
        } else {
            0.0
        };
        let c = WGS84_F / 16.0 * cos_sq_alpha * (4.0 + WGS84_F * (4.0 - 3.0 * cos_sq_alpha));
        let previous = lambda;
        lambda = l
            + (1.0 - c)
                * WGS84_F
                * sin_alpha
                * (sigma
                    + c * sin_sigma
                        * (cos_2sigma_m + c * cos_sigma * (-1.0 + 2.0 * cos_2sigma_m.powi(2))));

        if (lambda - previous).abs() < VINCENTY_TOLERANCE {
            let u_sq = cos_sq_alpha * (WGS84_A.powi(2) - WGS84_B.powi(2)) / WGS84_B.powi(2);
            let big_a =
                1.0 + u_sq / 16384.0 * (4096.0 + u_sq * (-768.0 + u_sq * (320.0 - 175.0 * u_sq)));
            let big_b = u_sq / 1024.0 * (256.0 + u_sq * (-128.0 + u_sq * (74.0 - 47.0 * u_sq)));
            let delta_sigma = big_b
                * sin_sigma
                * (cos_2sigma_m
                    + big_b / 4.0
                        * (cos_sigma * (-1.0 + 2.0 * cos_2sigma_m.powi(2))
                            - big_b / 6.0
                                * cos_2sigma_m
                                * (-3.0 + 4.0 * sin_sigma.powi(2))
                                * (-3.0 + 4.0 * cos_2sigma_m.powi(2))));
            return Some(WGS84_B * big_a * (sigma - delta_sigma));
        }
    }
    None
}

/// Presentation rounding: two decimals.
pub fn round_km(km: f64) -> f64 {
    (km * 100.0).round() / 100.0
}

/// Rounds a distance already inside `radius_km` without pushing it past the
/// radius; rounds down when rounding to nearest would overshoot.
pub fn round_km_within(km: f64, radius_km: f64) -> f64 {
    let rounded = round_km(km);
    if rounded <= radius_km {
        rounded
    } else {
        (km * 100.0).floor() / 100.0
    }
}

/// Ascending distance, then shelter code, so equal distances order deterministically.
pub fn compare_candidates(a: (f64, &str), b: (f64, &str)) -> Ordering {
    a.0.total_cmp(&b.0).then_with(|| a.1.cmp(b.1))
}

/// Filters located records to the query radius, orders them and truncates to the limit.
pub fn rank_nearby<'a>(
    records: impl IntoIterator<Item = &'a ShelterRecord>,
    query: &NearbyQuery,
) -> Vec<ShelterMatch> {
    if query.limit == 0 {
        return Vec::new();
    }

    let mut candidates = records
        .into_iter()
        .filter_map(|record| {
            let location = record.location?;
            let distance_km = geodesic_distance_km(query.point, location);
            (distance_km <= query.radius_km).then_some((distance_km, record))
        })
        .collect::<Vec<_>>();

    candidates.sort_by(|(da, ra), (db, rb)| {
        compare_candidates((*da, ra.shelter_code.as_str()), (*db, rb.shelter_code.as_str()))
    });
    candidates.truncate(query.limit);

    candidates
        .into_iter()
        .map(|(distance_km, record)| ShelterMatch {
            record: record.clone(),
            distance_km: round_km_within(distance_km, query.radius_km),
        })
        .collect()
}
