use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shelter_adapters::FixtureDatasetSource;
use shelter_core::ShelterRecord;
use shelter_storage::{
    InMemoryShelterStore, PgShelterStore, PgStoreOptions, ProximityQueryEngine, ShelterStore,
};
use shelter_sync::{IngestionConfig, IngestionPipeline, LocalSnapshotStore};
use shelter_web::{AppState, WebConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "shelter-cli")]
#[command(about = "Taipei emergency shelter finder")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion cycle.
    Ingest {
        /// Read the dataset from a captured JSON envelope instead of the live API.
        #[arg(long)]
        dataset_fixture: Option<PathBuf>,
    },
    /// Create the PostGIS schema if it does not exist.
    Migrate,
    /// Serve the JSON API; runs scheduled ingestion when enabled.
    Serve,
    /// Run scheduled ingestion until interrupted.
    Schedule,
    /// Print the shelters nearest to a coordinate.
    Nearby {
        #[arg(long, allow_negative_numbers = true)]
        lat: f64,
        #[arg(long, allow_negative_numbers = true)]
        lon: f64,
        #[arg(long, allow_negative_numbers = true)]
        radius_km: Option<f64>,
        #[arg(long, allow_negative_numbers = true)]
        limit: Option<i64>,
        /// Query the local snapshot instead of the database.
        #[arg(long)]
        offline: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shelter=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Ingest {
        dataset_fixture: None,
    }) {
        Commands::Ingest { dataset_fixture } => {
            let mut pipeline = IngestionPipeline::connect(IngestionConfig::from_env()).await?;
            if let Some(path) = dataset_fixture {
                let fixture = FixtureDatasetSource::from_path(&path)
                    .await
                    .with_context(|| format!("loading dataset fixture {}", path.display()))?;
                pipeline = pipeline.with_dataset(Arc::new(fixture));
            }
            let report = pipeline.run_ingestion_cycle().await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("serializing report")?
            );
        }
        Commands::Migrate => {
            let config = WebConfig::from_env();
            let store = PgShelterStore::connect(&config.database_url, PgStoreOptions::default()).await?;
            store.create_schema_if_absent().await?;
            println!("shelters schema ready");
        }
        Commands::Serve => {
            let ingestion = IngestionConfig::from_env();
            let _scheduler = if ingestion.scheduler_enabled {
                let pipeline = Arc::new(IngestionPipeline::connect(ingestion).await?);
                let scheduler = pipeline.build_scheduler().await?;
                scheduler.start().await.context("starting scheduler")?;
                Some(scheduler)
            } else {
                None
            };

            let config = WebConfig::from_env();
            let store = PgShelterStore::connect(&config.database_url, PgStoreOptions::default()).await?;
            store.create_schema_if_absent().await?;
            shelter_web::serve(AppState::new(Arc::new(store)), config.port).await?;
        }
        Commands::Schedule => {
            let config = IngestionConfig::from_env();
            let cron = config.sync_cron.clone();
            let pipeline = Arc::new(IngestionPipeline::connect(config).await?);
            let mut scheduler = pipeline.build_scheduler().await?;
            scheduler.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running; press ctrl-c to stop");

            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            scheduler.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Nearby {
            lat,
            lon,
            radius_km,
            limit,
            offline,
        } => {
            let store: Arc<dyn ShelterStore> = if offline {
                Arc::new(load_snapshot_store(&IngestionConfig::from_env()).await?)
            } else {
                let config = WebConfig::from_env();
                Arc::new(PgShelterStore::connect(&config.database_url, PgStoreOptions::default()).await?)
            };
            let engine = ProximityQueryEngine::new(store);
            let matches = engine.find_nearby(lat, lon, radius_km, limit).await?;
            if matches.is_empty() {
                println!("no shelters found within range");
            }
            for (rank, found) in matches.iter().enumerate() {
                let record = &found.record;
                println!(
                    "{}. {} [{}] {:.2} km | {}{}{} | capacity {}",
                    rank + 1,
                    record.name,
                    record.shelter_code,
                    found.distance_km,
                    record.city,
                    record.district,
                    record.address,
                    record.capacity
                );
            }
        }
    }

    Ok(())
}

async fn load_snapshot_store(config: &IngestionConfig) -> Result<InMemoryShelterStore> {
    let snapshots = LocalSnapshotStore::new(config.snapshot_path.clone());
    let snapshot = snapshots
        .load()
        .await?
        .with_context(|| format!("no snapshot at {}; run `ingest` first", snapshots.path().display()))?;
    let records = snapshot
        .records
        .iter()
        .filter_map(|r| ShelterRecord::from_source(&r.source, r.location).ok())
        .filter(ShelterRecord::is_query_eligible);
    Ok(InMemoryShelterStore::from_records(records))
}
