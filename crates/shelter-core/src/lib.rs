//! Core domain model for the shelter finder: typed source rows, persisted
//! shelter records, query values and the field normalization rules between them.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod address;
pub mod geodesy;

pub use address::normalize_address;
pub use geodesy::{geodesic_distance_km, rank_nearby, round_km_within};

pub const CRATE_NAME: &str = "shelter-core";

pub const DEFAULT_RADIUS_KM: f64 = 10.0;
pub const DEFAULT_LIMIT: usize = 3;

/// Affirmative marker used by the upstream flag columns.
pub const AFFIRMATIVE_FLAG: &str = "Y";

/// WGS-84 point in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn try_new(lat: f64, lon: f64) -> Result<Self, QueryError> {
        if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
            return Err(QueryError::InvalidLatitude(lat));
        }
        if !lon.is_finite() || !(-180.0..=180.0).contains(&lon) {
            return Err(QueryError::InvalidLongitude(lon));
        }
        Ok(Self { lat, lon })
    }
}

/// Caller-input errors raised before any store access.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum QueryError {
    #[error("latitude {0} is outside [-90, 90]")]
    InvalidLatitude(f64),
    #[error("longitude {0} is outside [-180, 180]")]
    InvalidLongitude(f64),
    #[error("radius_km {0} must be a finite, non-negative number")]
    InvalidRadius(f64),
    #[error("limit {0} must be non-negative")]
    InvalidLimit(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Disaster {
    Flood,
    Earthquake,
    Landslide,
    Tsunami,
}

impl Disaster {
    pub const ALL: [Disaster; 4] = [
        Disaster::Flood,
        Disaster::Earthquake,
        Disaster::Landslide,
        Disaster::Tsunami,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Disaster::Flood => "flood",
            Disaster::Earthquake => "earthquake",
            Disaster::Landslide => "landslide",
            Disaster::Tsunami => "tsunami",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|d| d.as_str().eq_ignore_ascii_case(value.trim()))
    }
}

/// How the coordinates of an enriched row were obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CoordinateStatus {
    /// Never looked up.
    #[default]
    Pending,
    /// Shipped with the upstream row.
    Source,
    Geocoded,
    /// Looked up without a result.
    Failed,
}

impl CoordinateStatus {
    pub fn has_coordinates(self) -> bool {
        matches!(self, CoordinateStatus::Source | CoordinateStatus::Geocoded)
    }
}

/// One upstream row mapped onto typed fields. Values keep their source text;
/// interpretation happens in [`ShelterRecord::from_source`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SourceRecord {
    pub shelter_code: Option<String>,
    pub name: String,
    pub city: String,
    pub district: String,
    pub address: String,
    pub capacity: String,
    pub area: String,
    pub flood: String,
    pub earthquake: String,
    pub landslide: String,
    pub tsunami: String,
    pub relief_station: String,
    pub barrier_free: String,
    pub indoor: String,
    pub outdoor: String,
    pub service_area: String,
    pub memo: String,
    pub import_date: Option<String>,
    pub location: Option<GeoPoint>,
}

impl SourceRecord {
    pub fn import_timestamp(&self) -> Option<NaiveDateTime> {
        self.import_date.as_deref().and_then(parse_import_date)
    }

    /// True when the fields that feed the geocoder query are identical.
    pub fn same_address_as(&self, other: &SourceRecord) -> bool {
        self.city.trim() == other.city.trim()
            && self.district.trim() == other.district.trim()
            && self.address.trim() == other.address.trim()
    }

    pub fn disasters(&self) -> Vec<Disaster> {
        [
            (Disaster::Flood, &self.flood),
            (Disaster::Earthquake, &self.earthquake),
            (Disaster::Landslide, &self.landslide),
            (Disaster::Tsunami, &self.tsunami),
        ]
        .into_iter()
        .filter(|(_, flag)| is_affirmative(flag))
        .map(|(disaster, _)| disaster)
        .collect()
    }
}

/// Source row plus the coordinates the pipeline settled on for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    pub source: SourceRecord,
    pub location: Option<GeoPoint>,
    pub coord_status: CoordinateStatus,
}

impl EnrichedRecord {
    pub fn from_source(source: SourceRecord) -> Self {
        let (location, coord_status) = match source.location {
            Some(point) => (Some(point), CoordinateStatus::Source),
            None => (None, CoordinateStatus::Pending),
        };
        Self {
            source,
            location,
            coord_status,
        }
    }

    pub fn shelter_code(&self) -> Option<&str> {
        self.source.shelter_code.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordRejection {
    #[error("record has no shelter code")]
    MissingShelterCode,
}

/// Canonical persisted shelter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShelterRecord {
    pub shelter_code: String,
    pub name: String,
    pub city: String,
    pub district: String,
    pub address: String,
    pub capacity: u32,
    pub area_m2: f64,
    pub disasters: Vec<Disaster>,
    pub relief_station: bool,
    pub barrier_free: bool,
    pub indoor: bool,
    pub outdoor: bool,
    pub service_area: Option<String>,
    pub memo: Option<String>,
    pub location: Option<GeoPoint>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ShelterRecord {
    pub fn from_source(
        source: &SourceRecord,
        location: Option<GeoPoint>,
    ) -> Result<Self, RecordRejection> {
        let shelter_code = source
            .shelter_code
            .as_deref()
            .and_then(text_or_none)
            .ok_or(RecordRejection::MissingShelterCode)?;

        Ok(Self {
            shelter_code,
            name: source.name.trim().to_string(),
            city: source.city.trim().to_string(),
            district: source.district.trim().to_string(),
            address: source.address.trim().to_string(),
            capacity: parse_capacity(&source.capacity),
            area_m2: parse_area(&source.area),
            disasters: source.disasters(),
            relief_station: is_affirmative(&source.relief_station),
            barrier_free: is_affirmative(&source.barrier_free),
            indoor: is_affirmative(&source.indoor),
            outdoor: is_affirmative(&source.outdoor),
            service_area: text_or_none(&source.service_area),
            memo: text_or_none(&source.memo),
            location,
            created_at: None,
            updated_at: None,
        })
    }

    pub fn is_query_eligible(&self) -> bool {
        self.location.is_some()
    }
}

/// Query-time result; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShelterMatch {
    pub record: ShelterRecord,
    /// Rounded to two decimals; ordering uses the unrounded value.
    pub distance_km: f64,
}

/// Validated `find_nearby` arguments.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NearbyQuery {
    pub point: GeoPoint,
    pub radius_km: f64,
    pub limit: usize,
}

impl NearbyQuery {
    pub fn try_new(lat: f64, lon: f64, radius_km: f64, limit: i64) -> Result<Self, QueryError> {
        let point = GeoPoint::try_new(lat, lon)?;
        if !radius_km.is_finite() || radius_km < 0.0 {
            return Err(QueryError::InvalidRadius(radius_km));
        }
        let limit = usize::try_from(limit).map_err(|_| QueryError::InvalidLimit(limit))?;
        Ok(Self {
            point,
            radius_km,
            limit,
        })
    }
}

pub fn is_affirmative(flag: &str) -> bool {
    flag.trim().eq_ignore_ascii_case(AFFIRMATIVE_FLAG)
}

/// Missing, malformed or negative counts become 0.
pub fn parse_capacity(raw: &str) -> u32 {
    let cleaned = raw.trim().replace(',', "");
    if let Ok(value) = cleaned.parse::<u32>() {
        return value;
    }
    match cleaned.parse::<f64>() {
        Ok(value) if value.is_finite() && value >= 0.0 && value.fract() == 0.0 => {
            value.min(u32::MAX as f64) as u32
        }
        _ => 0,
    }
}

/// Annotations such as "改建後重新評估", blanks and negative values become 0.0.
pub fn parse_area(raw: &str) -> f64 {
    match raw.trim().replace(',', "").parse::<f64>() {
        Ok(value) if value.is_finite() && value >= 0.0 => value,
        _ => 0.0,
    }
}

/// Parses the upstream `_importdate.date` value. Zoned values are converted to
/// naive UTC; naive values are kept as published.
pub fn parse_import_date(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(zoned) = DateTime::parse_from_rfc3339(raw) {
        return Some(zoned.naive_utc());
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive);
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
}

/// Latest parseable import timestamp, or `None` when no row carries one.
pub fn latest_import<'a>(records: impl IntoIterator<Item = &'a SourceRecord>) -> Option<NaiveDateTime> {
    records
        .into_iter()
        .filter_map(SourceRecord::import_timestamp)
        .max()
}

pub fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
