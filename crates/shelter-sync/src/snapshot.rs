//! CSV snapshot of the last enriched dataset.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use shelter_core::{latest_import, CoordinateStatus, EnrichedRecord, GeoPoint, SourceRecord};
use shelter_storage::{write_atomic, WrittenFile};
use tokio::fs;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// One CSV line. Column names follow the upstream dataset so the file stays
/// readable next to the published data.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotRow {
    #[serde(rename = "收容所編號")]
    shelter_code: Option<String>,
    #[serde(rename = "名稱", default)]
    name: String,
    #[serde(rename = "縣市", default)]
    city: String,
    #[serde(rename = "鄉鎮", default)]
    district: String,
    #[serde(rename = "門牌地址", default)]
    address: String,
    #[serde(rename = "容納人數", default)]
    capacity: String,
    #[serde(rename = "收容所面積（平方公尺）", default)]
    area: String,
    #[serde(rename = "水災", default)]
    flood: String,
    #[serde(rename = "震災", default)]
    earthquake: String,
    #[serde(rename = "土石流", default)]
    landslide: String,
    #[serde(rename = "海嘯", default)]
    tsunami: String,
    #[serde(rename = "救濟支站", default)]
    relief_station: String,
    #[serde(rename = "無障礙設施", default)]
    barrier_free: String,
    #[serde(rename = "室內", default)]
    indoor: String,
    #[serde(rename = "室外", default)]
    outdoor: String,
    #[serde(rename = "服務里別", default)]
    service_area: String,
    #[serde(rename = "備考", default)]
    memo: String,
    #[serde(rename = "_importdate")]
    import_date: Option<String>,
    lat: Option<f64>,
    lon: Option<f64>,
    #[serde(default)]
    coord_status: CoordinateStatus,
}

impl From<&EnrichedRecord> for SnapshotRow {
    fn from(record: &EnrichedRecord) -> Self {
        let source = &record.source;
        Self {
            shelter_code: source.shelter_code.clone(),
            name: source.name.clone(),
            city: source.city.clone(),
            district: source.district.clone(),
            address: source.address.clone(),
            capacity: source.capacity.clone(),
            area: source.area.clone(),
            flood: source.flood.clone(),
            earthquake: source.earthquake.clone(),
            landslide: source.landslide.clone(),
            tsunami: source.tsunami.clone(),
            relief_station: source.relief_station.clone(),
            barrier_free: source.barrier_free.clone(),
            indoor: source.indoor.clone(),
            outdoor: source.outdoor.clone(),
            service_area: source.service_area.clone(),
            memo: source.memo.clone(),
            import_date: source.import_date.clone(),
            lat: record.location.map(|p| p.lat),
            lon: record.location.map(|p| p.lon),
            coord_status: record.coord_status,
        }
    }
}

impl From<SnapshotRow> for EnrichedRecord {
    fn from(row: SnapshotRow) -> Self {
        let location = row
            .lat
            .zip(row.lon)
            .and_then(|(lat, lon)| GeoPoint::try_new(lat, lon).ok());
        // Coordinates without a status predate status tracking; trust them.
        let coord_status = match (location, row.coord_status) {
            (Some(_), CoordinateStatus::Pending | CoordinateStatus::Failed) => {
                CoordinateStatus::Geocoded
            }
            (None, status) if status.has_coordinates() => CoordinateStatus::Pending,
            (_, status) => status,
        };
        let source = SourceRecord {
            shelter_code: row.shelter_code,
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
            import_date: row.import_date,
            location: if coord_status == CoordinateStatus::Source {
                location
            } else {
                None
            },
        };
        Self {
            source,
            location,
            coord_status,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub records: Vec<EnrichedRecord>,
}

impl Snapshot {
    pub fn latest_import(&self) -> Option<NaiveDateTime> {
        latest_import(self.records.iter().map(|r| &r.source))
    }

    pub fn located_count(&self) -> usize {
        self.records.iter().filter(|r| r.location.is_some()).count()
    }
}

#[derive(Debug, Clone)]
pub struct LocalSnapshotStore {
    path: PathBuf,
}

impl LocalSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` when no snapshot has been written yet.
    pub async fn load(&self) -> Result<Option<Snapshot>> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", self.path.display()))
            }
        };
        let records = decode_snapshot(&bytes)
            .with_context(|| format!("parsing snapshot {}", self.path.display()))?;
        Ok(Some(Snapshot { records }))
    }

    /// Replaces the snapshot atomically with the full enriched set.
    pub async fn save(&self, records: &[EnrichedRecord]) -> Result<WrittenFile> {
        let bytes = encode_snapshot(records).context("encoding snapshot csv")?;
        write_atomic(&self.path, &bytes).await
    }
}

fn encode_snapshot(records: &[EnrichedRecord]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for record in records {
        writer.serialize(SnapshotRow::from(record))?;
    }
    writer.into_inner().context("flushing csv writer")
}

fn decode_snapshot(bytes: &[u8]) -> Result<Vec<EnrichedRecord>> {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(bytes);
    reader
        .deserialize::<SnapshotRow>()
        .map(|row| row.map(EnrichedRecord::from).map_err(anyhow::Error::from))
        .collect()
}
