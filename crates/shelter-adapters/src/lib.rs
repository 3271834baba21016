//! Upstream adapters: the Taipei open-data shelter dataset and address geocoding.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use serde_json::Value as JsonValue;
use shelter_core::{text_or_none, GeoPoint, SourceRecord};
use shelter_storage::{BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "shelter-adapters";

pub const TAIPEI_SHELTER_RESOURCE_ID: &str = "4c92dbd4-d259-495a-8390-52628119a4dd";
pub const DEFAULT_DATASET_URL: &str =
    "https://data.taipei/api/v1/dataset/4c92dbd4-d259-495a-8390-52628119a4dd";
pub const DEFAULT_GEOCODER_URL: &str = "https://nominatim.openstreetmap.org/search";
pub const DEFAULT_USER_AGENT: &str = "TaipeiShelterBot/1.0";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed dataset payload: {0}")]
    Payload(#[source] serde_json::Error),
    #[error("reading fixture {path}: {source}")]
    Fixture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One page of the upstream dataset. `total_count` is the envelope's row count
/// for the whole resource, when the source reports it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatasetPage {
    pub total_count: Option<usize>,
    pub records: Vec<SourceRecord>,
}

#[async_trait]
pub trait DatasetSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_page(&self, limit: usize, offset: usize) -> Result<DatasetPage, AdapterError>;
}

#[derive(Debug, Deserialize)]
struct DatasetEnvelope {
    #[serde(default)]
    result: Option<DatasetResult>,
}

#[derive(Debug, Deserialize)]
struct DatasetResult {
    #[serde(default, deserialize_with = "lenient_count")]
    count: Option<usize>,
    #[serde(default)]
    results: Vec<ApiRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ImportDate {
    Wrapped { date: Option<String> },
    Plain(String),
}

impl ImportDate {
    fn into_text(self) -> Option<String> {
        match self {
            ImportDate::Wrapped { date } => date.and_then(|d| text_or_none(&d)),
            ImportDate::Plain(date) => text_or_none(&date),
        }
    }
}

/// Row shape of the Taipei shelter resource. Everything is optional upstream.
#[derive(Debug, Deserialize)]
struct ApiRecord {
    #[serde(rename = "收容所編號", default, deserialize_with = "lenient_text")]
    shelter_code: String,
    #[serde(rename = "名稱", default, deserialize_with = "lenient_text")]
    name: String,
    #[serde(rename = "縣市", default, deserialize_with = "lenient_text")]
    city: String,
    #[serde(rename = "鄉鎮", default, deserialize_with = "lenient_text")]
    district: String,
    #[serde(rename = "門牌地址", default, deserialize_with = "lenient_text")]
    address: String,
    #[serde(rename = "容納人數", default, deserialize_with = "lenient_text")]
    capacity: String,
    #[serde(rename = "收容所面積（平方公尺）", default, deserialize_with = "lenient_text")]
    area: String,
    #[serde(rename = "水災", default, deserialize_with = "lenient_text")]
    flood: String,
    #[serde(rename = "震災", default, deserialize_with = "lenient_text")]
    earthquake: String,
    #[serde(rename = "土石流", default, deserialize_with = "lenient_text")]
    landslide: String,
    #[serde(rename = "海嘯", default, deserialize_with = "lenient_text")]
    tsunami: String,
    #[serde(rename = "救濟支站", default, deserialize_with = "lenient_text")]
    relief_station: String,
    #[serde(rename = "無障礙設施", default, deserialize_with = "lenient_text")]
    barrier_free: String,
    #[serde(rename = "室內", default, deserialize_with = "lenient_text")]
    indoor: String,
    #[serde(rename = "室外", default, deserialize_with = "lenient_text")]
    outdoor: String,
    #[serde(rename = "服務里別", default, deserialize_with = "lenient_text")]
    service_area: String,
    #[serde(rename = "備考", default, deserialize_with = "lenient_text")]
    memo: String,
    #[serde(rename = "_importdate", default)]
    import_date: Option<ImportDate>,
    #[serde(rename = "緯度", default, deserialize_with = "lenient_text")]
    latitude: String,
    #[serde(rename = "經度", default, deserialize_with = "lenient_text")]
    longitude: String,
}

impl From<ApiRecord> for SourceRecord {
    fn from(row: ApiRecord) -> Self {
        let location = parse_point(&row.latitude, &row.longitude);
        SourceRecord {
            shelter_code: text_or_none(&row.shelter_code),
            name: row.name,
            city: row.city,
            district: row.district,
            address: row.address,
            capacity: row.capacity,
            area: row.area,
            flood: row.flood,
            earthquake: row.earthquake,
            landslide: row.landslide,
            tsunami: row.tsunami,
            relief_station: row.relief_station,
            barrier_free: row.barrier_free,
            indoor: row.indoor,
            outdoor: row.outdoor,
            service_area: row.service_area,
            memo: row.memo,
            import_date: row.import_date.and_then(ImportDate::into_text),
            location,
        }
    }
}

/// Accepts strings, numbers, booleans and nulls; returns trimmed text.
fn lenient_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(JsonValue::Null) => String::new(),
        Some(JsonValue::String(text)) => text.trim().to_string(),
        Some(other) => other.to_string(),
    })
}

fn lenient_count<'de, D>(deserializer: D) -> Result<Option<usize>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(match value {
        Some(JsonValue::Number(n)) => n.as_u64().map(|n| n as usize),
        Some(JsonValue::String(text)) => text.trim().parse().ok(),
        _ => None,
    })
}

/// Both halves must parse and fall in range, otherwise the row has no location.
pub fn parse_point(lat: &str, lon: &str) -> Option<GeoPoint> {
    let lat = lat.trim().parse::<f64>().ok()?;
    let lon = lon.trim().parse::<f64>().ok()?;
    GeoPoint::try_new(lat, lon).ok()
}

/// Decodes the `{"result": {"count", "results": [...]}}` envelope.
pub fn parse_dataset_envelope(body: &[u8]) -> Result<DatasetPage, AdapterError> {
    let envelope: DatasetEnvelope = serde_json::from_slice(body).map_err(AdapterError::Payload)?;
    let Some(result) = envelope.result else {
        return Ok(DatasetPage::default());
    };
    Ok(DatasetPage {
        total_count: result.count,
        records: result.results.into_iter().map(SourceRecord::from).collect(),
    })
}

/// Live client for the Taipei open-data platform.
#[derive(Debug, Clone)]
pub struct TaipeiOpenDataSource {
    fetcher: HttpFetcher,
    endpoint: String,
    resource_id: String,
}

impl TaipeiOpenDataSource {
    pub fn new(fetcher: HttpFetcher, endpoint: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self {
            fetcher,
            endpoint: endpoint.into(),
            resource_id: resource_id.into(),
        }
    }

    pub fn with_timeout(
        endpoint: impl Into<String>,
        resource_id: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout,
            ..HttpClientConfig::default()
        })
        .context("building dataset http client")?;
        Ok(Self::new(fetcher, endpoint, resource_id))
    }
}

#[async_trait]
impl DatasetSource for TaipeiOpenDataSource {
    fn source_id(&self) -> &str {
        &self.resource_id
    }

    async fn fetch_page(&self, limit: usize, offset: usize) -> Result<DatasetPage, AdapterError> {
        let query = [
            ("scope", "resourceAquire".to_string()),
            ("resource_id", self.resource_id.clone()),
            ("limit", limit.to_string()),
            ("offset", offset.to_string()),
        ];
        let response = self.fetcher.fetch_bytes(&self.endpoint, &query).await?;
        let page = parse_dataset_envelope(&response.body)?;
        debug!(
            rows = page.records.len(),
            total = ?page.total_count,
            limit,
            offset,
            "fetched dataset page"
        );
        Ok(page)
    }
}

/// Serves a captured dataset envelope from disk; pages are sliced locally.
#[derive(Debug, Clone)]
pub struct FixtureDatasetSource {
    source_id: String,
    total_count: Option<usize>,
    records: Vec<SourceRecord>,
}

impl FixtureDatasetSource {
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, AdapterError> {
        let path = path.as_ref();
        let body = tokio::fs::read(path).await.map_err(|source| AdapterError::Fixture {
            path: path.to_path_buf(),
            source,
        })?;
        let page = parse_dataset_envelope(&body)?;
        Ok(Self {
            source_id: format!("fixture:{}", path.display()),
            total_count: page.total_count,
            records: page.records,
        })
    }

    pub fn from_records(records: Vec<SourceRecord>) -> Self {
        Self {
            source_id: "fixture:inline".to_string(),
            total_count: Some(records.len()),
            records,
        }
    }

    pub fn records(&self) -> &[SourceRecord] {
        &self.records
    }
}

#[async_trait]
impl DatasetSource for FixtureDatasetSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_page(&self, limit: usize, offset: usize) -> Result<DatasetPage, AdapterError> {
        let records = self
            .records
            .iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        Ok(DatasetPage {
            total_count: self.total_count.or(Some(self.records.len())),
            records,
        })
    }
}

/// Resolves a free-text address to coordinates. Failures are absorbed and
/// reported as `None`; callers pace the calls.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn resolve(&self, query: &str) -> Option<GeoPoint>;
}

#[derive(Debug, Deserialize)]
struct NominatimCandidate {
    #[serde(default, deserialize_with = "lenient_text")]
    lat: String,
    #[serde(default, deserialize_with = "lenient_text")]
    lon: String,
}

/// First candidate of a Nominatim `format=json` search, if any.
pub fn parse_nominatim_response(body: &[u8]) -> Result<Option<GeoPoint>, serde_json::Error> {
    let candidates: Vec<NominatimCandidate> = serde_json::from_slice(body)?;
    Ok(candidates
        .first()
        .and_then(|candidate| parse_point(&candidate.lat, &candidate.lon)))
}

#[derive(Debug, Clone)]
pub struct NominatimGeocoder {
    fetcher: HttpFetcher,
    endpoint: String,
}

impl NominatimGeocoder {
    /// The provider's usage policy requires an identifying User-Agent. No retries.
    pub fn new(endpoint: impl Into<String>, user_agent: &str, timeout: Duration) -> anyhow::Result<Self> {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout,
            user_agent: Some(user_agent.to_string()),
            backoff: BackoffPolicy::no_retries(),
        })
        .context("building geocoder http client")?;
        Ok(Self {
            fetcher,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn resolve(&self, query: &str) -> Option<GeoPoint> {
        let params = [
            ("q", query.to_string()),
            ("format", "json".to_string()),
            ("limit", "1".to_string()),
            ("countrycodes", "tw".to_string()),
        ];
        let response = match self.fetcher.fetch_bytes(&self.endpoint, &params).await {
            Ok(response) => response,
            Err(err) => {
                warn!(query, error = %err, "geocode request failed");
                return None;
            }
        };
        match parse_nominatim_response(&response.body) {
            Ok(Some(point)) => Some(point),
            Ok(None) => {
                warn!(query, "geocoder returned no candidates");
                None
            }
            Err(err) => {
                warn!(query, error = %err, "geocoder response was not valid JSON");
                None
            }
        }
    }
}
