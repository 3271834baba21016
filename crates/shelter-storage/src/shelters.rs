//! The `shelters` table: schema, insert-only batch upserts and the proximity query.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use shelter_core::{
    rank_nearby, round_km_within, Disaster, GeoPoint, NearbyQuery, QueryError, ShelterMatch,
    ShelterRecord, DEFAULT_LIMIT, DEFAULT_RADIUS_KM,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Acquire, PgPool, Row};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

const SCHEMA_SQL: &str = r#"
CREATE EXTENSION IF NOT EXISTS postgis;

CREATE TABLE IF NOT EXISTS shelters (
    id SERIAL PRIMARY KEY,
    shelter_code VARCHAR(20) NOT NULL UNIQUE,
    name TEXT NOT NULL,
    city TEXT,
    district TEXT,
    address TEXT,
    capacity INTEGER NOT NULL DEFAULT 0 CHECK (capacity >= 0),
    area_m2 DOUBLE PRECISION NOT NULL DEFAULT 0 CHECK (area_m2 >= 0),
    disasters TEXT[] NOT NULL DEFAULT '{}',
    relief_station BOOLEAN NOT NULL DEFAULT FALSE,
    barrier_free BOOLEAN NOT NULL DEFAULT FALSE,
    indoor BOOLEAN NOT NULL DEFAULT FALSE,
    outdoor BOOLEAN NOT NULL DEFAULT FALSE,
    service_area TEXT,
    memo TEXT,
    geom GEOGRAPHY(POINT, 4326),
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS shelters_geom_idx ON shelters USING GIST (geom);

CREATE OR REPLACE FUNCTION find_nearby_shelters(
    query_lat DOUBLE PRECISION,
    query_lon DOUBLE PRECISION,
    radius_km DOUBLE PRECISION DEFAULT 10,
    max_results INTEGER DEFAULT 3
)
RETURNS TABLE (
    shelter_code VARCHAR,
    name TEXT,
    city TEXT,
    district TEXT,
    address TEXT,
    capacity INTEGER,
    area_m2 DOUBLE PRECISION,
    disasters TEXT[],
    relief_station BOOLEAN,
    barrier_free BOOLEAN,
    indoor BOOLEAN,
    outdoor BOOLEAN,
    service_area TEXT,
    memo TEXT,
    latitude DOUBLE PRECISION,
    longitude DOUBLE PRECISION,
    distance_m DOUBLE PRECISION,
    created_at TIMESTAMPTZ,
    updated_at TIMESTAMPTZ
)
LANGUAGE sql STABLE AS $$
    SELECT c.shelter_code, c.name, c.city, c.district, c.address, c.capacity, c.area_m2,
           c.disasters, c.relief_station, c.barrier_free, c.indoor, c.outdoor,
           c.service_area, c.memo, c.latitude, c.longitude, c.distance_m,
           c.created_at, c.updated_at
      FROM (
        SELECT s.*,
               ST_Y(s.geom::geometry) AS latitude,
               ST_X(s.geom::geometry) AS longitude,
               ST_Distance(
                   s.geom,
                   ST_SetSRID(ST_MakePoint(query_lon, query_lat), 4326)::geography
               ) AS distance_m
          FROM shelters s
         WHERE s.geom IS NOT NULL
           AND ST_DWithin(
                   s.geom,
                   ST_SetSRID(ST_MakePoint(query_lon, query_lat), 4326)::geography,
                   radius_km * 1000.0
               )
      ) c
     ORDER BY c.distance_m, c.shelter_code
     LIMIT max_results
$$;
"#;

const INSERT_SQL: &str = r#"
INSERT INTO shelters (
    shelter_code, name, city, district, address, capacity,
    area_m2, disasters, relief_station, barrier_free,
    indoor, outdoor, service_area, memo, geom
)
VALUES (
    $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
    ST_SetSRID(ST_MakePoint($16::float8, $15::float8), 4326)::geography
)
ON CONFLICT (shelter_code) DO NOTHING
"#;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("opening store connection failed: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("store transport failure: {0}")]
    Transport(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// A row the store refused for data reasons; the rest of the batch is unaffected.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowRejection {
    pub shelter_code: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UpsertSummary {
    pub inserted: usize,
    /// Existing `shelter_code`; the stored row is left as is.
    pub conflicts: usize,
    pub rejected: Vec<RowRejection>,
}

#[async_trait]
pub trait ShelterStore: Send + Sync {
    /// Idempotent; safe on every start.
    async fn create_schema_if_absent(&self) -> Result<(), StoreError>;

    /// Insert-only upsert committed once per batch. Row-level data rejections are
    /// reported in the summary; a transport failure rolls back the whole batch.
    async fn upsert_batch(&self, records: &[ShelterRecord]) -> Result<UpsertSummary, StoreError>;

    async fn find_nearby(&self, query: &NearbyQuery) -> Result<Vec<ShelterMatch>, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgStoreOptions {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PgStoreOptions {
    fn default() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgShelterStore {
    pool: PgPool,
}

impl PgShelterStore {
    pub async fn connect(database_url: &str, options: PgStoreOptions) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(options.max_connections)
            .acquire_timeout(options.acquire_timeout)
            .connect(database_url)
            .await
            .map_err(StoreError::Connect)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ShelterStore for PgShelterStore {
    async fn create_schema_if_absent(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        info!("shelters schema ensured");
        Ok(())
    }

    async fn upsert_batch(&self, records: &[ShelterRecord]) -> Result<UpsertSummary, StoreError> {
        let mut summary = UpsertSummary::default();
        let mut tx = self.pool.begin().await?;

        for record in records {
            // Savepoint per row: a rejected row must not abort the transaction.
            let mut savepoint = tx.begin().await?;
            let disasters = record
                .disasters
                .iter()
                .map(|d| d.as_str().to_string())
                .collect::<Vec<_>>();
            let result = sqlx::query(INSERT_SQL)
                .bind(&record.shelter_code)
                .bind(&record.name)
                .bind(&record.city)
                .bind(&record.district)
                .bind(&record.address)
                .bind(i32::try_from(record.capacity).unwrap_or(i32::MAX))
                .bind(record.area_m2)
                .bind(disasters)
                .bind(record.relief_station)
                .bind(record.barrier_free)
                .bind(record.indoor)
                .bind(record.outdoor)
                .bind(&record.service_area)
                .bind(&record.memo)
                .bind(record.location.map(|p| p.lat))
                .bind(record.location.map(|p| p.lon))
                .execute(&mut *savepoint)
                .await;

            match result {
                Ok(done) => {
                    savepoint.commit().await?;
                    if done.rows_affected() == 0 {
                        summary.conflicts += 1;
                    } else {
                        summary.inserted += 1;
                    }
                }
                Err(sqlx::Error::Database(db_err)) => {
                    savepoint.rollback().await?;
                    warn!(
                        shelter_code = %record.shelter_code,
                        error = %db_err,
                        "row rejected by store"
                    );
                    summary.rejected.push(RowRejection {
                        shelter_code: record.shelter_code.clone(),
                        reason: db_err.to_string(),
                    });
                }
                Err(err) => return Err(StoreError::Transport(err)),
            }
        }

        tx.commit().await?;
        Ok(summary)
    }

    async fn find_nearby(&self, query: &NearbyQuery) -> Result<Vec<ShelterMatch>, StoreError> {
        let rows = sqlx::query("SELECT * FROM find_nearby_shelters($1, $2, $3, $4)")
            .bind(query.point.lat)
            .bind(query.point.lon)
            .bind(query.radius_km)
            .bind(i32::try_from(query.limit).unwrap_or(i32::MAX))
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| match_from_row(row, query.radius_km))
            .collect()
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM shelters")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

fn match_from_row(row: &PgRow, radius_km: f64) -> Result<ShelterMatch, StoreError> {
    let disasters: Vec<String> = row.try_get("disasters")?;
    let capacity: i32 = row.try_get("capacity")?;
    let latitude: Option<f64> = row.try_get("latitude")?;
    let longitude: Option<f64> = row.try_get("longitude")?;
    let distance_m: f64 = row.try_get("distance_m")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;

    let record = ShelterRecord {
        shelter_code: row.try_get("shelter_code")?,
        name: row.try_get("name")?,
        city: row.try_get::<Option<String>, _>("city")?.unwrap_or_default(),
        district: row.try_get::<Option<String>, _>("district")?.unwrap_or_default(),
        address: row.try_get::<Option<String>, _>("address")?.unwrap_or_default(),
        capacity: capacity.max(0) as u32,
        area_m2: row.try_get("area_m2")?,
        disasters: disasters.iter().filter_map(|d| Disaster::parse(d)).collect(),
        relief_station: row.try_get("relief_station")?,
        barrier_free: row.try_get("barrier_free")?,
        indoor: row.try_get("indoor")?,
        outdoor: row.try_get("outdoor")?,
        service_area: row.try_get("service_area")?,
        memo: row.try_get("memo")?,
        location: latitude.zip(longitude).map(|(lat, lon)| GeoPoint { lat, lon }),
        created_at: Some(created_at),
        updated_at: Some(updated_at),
    };

    Ok(ShelterMatch {
        record,
        distance_km: round_km_within(distance_m / 1000.0, radius_km),
    })
}

/// Process-local store with the same insert-only semantics; backs tests and
/// offline queries over a local snapshot.
#[derive(Debug, Default)]
pub struct InMemoryShelterStore {
    rows: RwLock<BTreeMap<String, ShelterRecord>>,
}

impl InMemoryShelterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = ShelterRecord>) -> Self {
        let mut rows = BTreeMap::new();
        for mut record in records {
            if rows.contains_key(&record.shelter_code) {
                continue;
            }
            let now = Utc::now();
            record.created_at.get_or_insert(now);
            record.updated_at.get_or_insert(now);
            rows.insert(record.shelter_code.clone(), record);
        }
        Self {
            rows: RwLock::new(rows),
        }
    }

    pub async fn records(&self) -> Vec<ShelterRecord> {
        self.rows.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl ShelterStore for InMemoryShelterStore {
    async fn create_schema_if_absent(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn upsert_batch(&self, records: &[ShelterRecord]) -> Result<UpsertSummary, StoreError> {
        let mut rows = self.rows.write().await;
        let mut staged: BTreeMap<String, ShelterRecord> = BTreeMap::new();
        let mut summary = UpsertSummary::default();

        for record in records {
            if record.shelter_code.trim().is_empty() {
                summary.rejected.push(RowRejection {
                    shelter_code: record.shelter_code.clone(),
                    reason: "empty shelter_code".to_string(),
                });
                continue;
            }
            if rows.contains_key(&record.shelter_code) || staged.contains_key(&record.shelter_code) {
                summary.conflicts += 1;
                continue;
            }
            let now = Utc::now();
            let mut stored = record.clone();
            stored.created_at = Some(now);
            stored.updated_at = Some(now);
            staged.insert(stored.shelter_code.clone(), stored);
            summary.inserted += 1;
        }

        rows.extend(staged);
        Ok(summary)
    }

    async fn find_nearby(&self, query: &NearbyQuery) -> Result<Vec<ShelterMatch>, StoreError> {
        let rows = self.rows.read().await;
        Ok(rank_nearby(rows.values(), query))
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.rows.read().await.len() as u64)
    }
}

#[derive(Debug, Error)]
pub enum FindNearbyError {
    #[error("invalid argument: {0}")]
    InvalidArgument(#[from] QueryError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Read-only entry point for nearest-shelter lookups; cheap to clone and share.
#[derive(Clone)]
pub struct ProximityQueryEngine {
    store: Arc<dyn ShelterStore>,
}

impl ProximityQueryEngine {
    pub fn new(store: Arc<dyn ShelterStore>) -> Self {
        Self { store }
    }

    /// `radius_km` defaults to 10 km and `limit` to 3. Arguments are validated
    /// before the store is touched.
    pub async fn find_nearby(
        &self,
        lat: f64,
        lon: f64,
        radius_km: Option<f64>,
        limit: Option<i64>,
    ) -> Result<Vec<ShelterMatch>, FindNearbyError> {
        let query = NearbyQuery::try_new(
            lat,
            lon,
            radius_km.unwrap_or(DEFAULT_RADIUS_KM),
            limit.unwrap_or(DEFAULT_LIMIT as i64),
        )?;
        self.query(&query).await
    }

    pub async fn query(&self, query: &NearbyQuery) -> Result<Vec<ShelterMatch>, FindNearbyError> {
        if query.limit == 0 {
            return Ok(Vec::new());
        }
        let matches = self.store.find_nearby(query).await?;
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn shelter(code: &str, lat: f64, lon: f64) -> ShelterRecord {
        ShelterRecord {
            shelter_code: code.to_string(),
            name: format!("避難所 {code}"),
            city: "臺北市".into(),
            district: "信義區".into(),
            address: "市府路1號".into(),
            capacity: 200,
            area_m2: 350.0,
            disasters: vec![Disaster::Flood, Disaster::Earthquake],
            relief_station: true,
            barrier_free: true,
            indoor: true,
            outdoor: false,
            service_area: None,
            memo: None,
            location: Some(GeoPoint { lat, lon }),
            created_at: None,
            updated_at: None,
        }
    }

    fn unlocated(code: &str) -> ShelterRecord {
        ShelterRecord {
            location: None,
            ..shelter(code, 0.0, 0.0)
        }
    }

    struct CountingStore {
        inner: InMemoryShelterStore,
        queries: AtomicUsize,
    }

    #[async_trait]
    impl ShelterStore for CountingStore {
        async fn create_schema_if_absent(&self) -> Result<(), StoreError> {
            self.inner.create_schema_if_absent().await
        }

        async fn upsert_batch(&self, records: &[ShelterRecord]) -> Result<UpsertSummary, StoreError> {
            self.inner.upsert_batch(records).await
        }

        async fn find_nearby(&self, query: &NearbyQuery) -> Result<Vec<ShelterMatch>, StoreError> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            self.inner.find_nearby(query).await
        }

        async fn count(&self) -> Result<u64, StoreError> {
            self.inner.count().await
        }
    }

    #[tokio::test]
    async fn reinserting_existing_code_is_a_conflict_not_an_update() {
        let store = InMemoryShelterStore::new();
        let first = store
            .upsert_batch(&[shelter("A", 25.03, 121.56), shelter("B", 25.04, 121.57)])
            .await
            .unwrap();
        assert_eq!(first.inserted, 2);

        let mut renamed = shelter("A", 25.03, 121.56);
        renamed.name = "renamed upstream".into();
        let second = store.upsert_batch(&[renamed, shelter("C", 25.05, 121.58)]).await.unwrap();
        assert_eq!(second.inserted, 1);
        assert_eq!(second.conflicts, 1);

        let stored = store.records().await;
        assert_eq!(stored.len(), 3);
        assert_eq!(stored[0].name, "避難所 A");
        assert!(stored.iter().all(|r| r.created_at.is_some()));
    }

    #[tokio::test]
    async fn duplicate_codes_within_one_batch_insert_once() {
        let store = InMemoryShelterStore::new();
        let summary = store
            .upsert_batch(&[shelter("A", 25.03, 121.56), shelter("A", 25.0, 121.0)])
            .await
            .unwrap();
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.conflicts, 1);
    }

    #[tokio::test]
    async fn blank_code_is_rejected_without_failing_the_batch() {
        let store = InMemoryShelterStore::new();
        let summary = store
            .upsert_batch(&[
                shelter("A", 25.03, 121.56),
                shelter("  ", 25.04, 121.57),
                shelter("C", 25.05, 121.58),
            ])
            .await
            .unwrap();
        assert_eq!(summary.inserted, 2);
        assert_eq!(summary.conflicts, 0);
        assert_eq!(summary.rejected.len(), 1);
        assert_eq!(summary.rejected[0].reason, "empty shelter_code");

        let codes = store
            .records()
            .await
            .into_iter()
            .map(|r| r.shelter_code)
            .collect::<Vec<_>>();
        assert_eq!(codes, vec!["A", "C"]);
    }

    #[tokio::test]
    async fn engine_rejects_invalid_arguments_before_store_access() {
        let store = Arc::new(CountingStore {
            inner: InMemoryShelterStore::from_records([shelter("A", 25.03, 121.56)]),
            queries: AtomicUsize::new(0),
        });
        let engine = ProximityQueryEngine::new(store.clone());

        for (lat, lon, radius, limit) in [
            (95.0, 121.5, None, None),
            (25.0, 200.0, None, None),
            (25.0, 121.5, Some(-0.5), None),
            (25.0, 121.5, None, Some(-3)),
        ] {
            let err = engine.find_nearby(lat, lon, radius, limit).await.unwrap_err();
            assert!(matches!(err, FindNearbyError::InvalidArgument(_)));
        }
        assert_eq!(store.queries.load(Ordering::SeqCst), 0);

        let empty = engine.find_nearby(25.03, 121.56, None, Some(0)).await.unwrap();
        assert!(empty.is_empty());
        assert_eq!(store.queries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn engine_applies_defaults_and_excludes_unlocated_rows() {
        let store = Arc::new(InMemoryShelterStore::from_records([
            shelter("S1", 25.0330, 121.5654),
            shelter("S2", 25.0408, 121.5678),
            shelter("S3", 25.10, 121.80),
            shelter("S4", 25.0410, 121.5680),
            shelter("S5", 25.0420, 121.5690),
            unlocated("S0"),
        ]));
        let engine = ProximityQueryEngine::new(store);

        let matches = engine.find_nearby(25.0408, 121.5678, None, None).await.unwrap();
        let codes = matches
            .iter()
            .map(|m| m.record.shelter_code.as_str())
            .collect::<Vec<_>>();
        assert_eq!(codes, vec!["S2", "S4", "S5"]);

        let wide = engine
            .find_nearby(25.0408, 121.5678, Some(100.0), Some(10))
            .await
            .unwrap();
        assert_eq!(wide.len(), 5);
        assert!(wide.iter().all(|m| m.record.shelter_code != "S0"));
        assert!(wide.windows(2).all(|w| w[0].distance_km <= w[1].distance_km));
    }

    #[tokio::test]
    async fn empty_neighbourhood_is_not_an_error() {
        let engine = ProximityQueryEngine::new(Arc::new(InMemoryShelterStore::from_records([
            shelter("A", 25.03, 121.56),
        ])));
        let matches = engine.find_nearby(0.0, 0.0, Some(10.0), Some(3)).await.unwrap();
        assert!(matches.is_empty());
    }

    /// Runs against a real PostGIS database when `SHELTER_TEST_DATABASE_URL` is set.
    #[tokio::test]
    async fn postgis_store_round_trip_when_configured() {
        let Ok(url) = std::env::var("SHELTER_TEST_DATABASE_URL") else {
            return;
        };
        let store = PgShelterStore::connect(&url, PgStoreOptions::default())
            .await
            .expect("connect");
        store.create_schema_if_absent().await.expect("schema");
        store.create_schema_if_absent().await.expect("schema is idempotent");

        let code = format!("T{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        let first = store
            .upsert_batch(&[shelter(&code, 25.0408, 121.5678)])
            .await
            .expect("insert");
        assert_eq!(first.inserted, 1);
        let second = store
            .upsert_batch(&[shelter(&code, 25.0408, 121.5678)])
            .await
            .expect("reinsert");
        assert_eq!(second.conflicts, 1);

        let query = NearbyQuery::try_new(25.0408, 121.5678, 0.01, 50).unwrap();
        let matches = store.find_nearby(&query).await.expect("query");
        assert!(matches.iter().any(|m| m.record.shelter_code == code));
        assert!(matches.iter().all(|m| m.distance_km <= query.radius_km));

        sqlx::query("DELETE FROM shelters WHERE shelter_code = $1")
            .bind(&code)
            .execute(store.pool())
            .await
            .expect("cleanup");
    }
}
