//! Operator CLI for driving a `FactCache` instance against a live Redis.
//!
//! The source analytics database and config service are out-of-scope
//! collaborators (spec §1); this binary stands in a fixture-backed
//! implementation of both so an operator can warm/query/invalidate a data
//! source from a JSON file instead of a real warehouse connection.

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use factcache::{
    ColumnMapping, ConfigService, DataSourceConfig, FactCache, FactCacheConfig, FactCacheError,
    Filter, RedisStore, Row, SourceDatabase, SourceType,
};
use serde::Deserialize;

#[derive(Parser)]
#[command(name = "factcache-cli")]
#[command(about = "Operator CLI for the indexed analytics cache")]
struct Cli {
    /// Redis connection URL.
    #[arg(long, default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    /// Optional TOML config file (see `FactCacheConfig`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Schema allow-list entries, repeatable. Ignored if `--config` is set.
    #[arg(long = "allow-schema")]
    allowed_schemas: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Warm a data source from a JSON fixture file.
    Warm {
        data_source_id: i64,
        /// Path to a fixture file: `{schema, table, time_period_field, rows: [...]}`.
        #[arg(long)]
        fixture: PathBuf,
    },
    /// Query the cache with a filter.
    Query {
        data_source_id: i64,
        #[arg(long)]
        measure: String,
        #[arg(long)]
        frequency: String,
        #[arg(long = "practice", value_delimiter = ',')]
        practice_uids: Vec<i64>,
        #[arg(long = "provider", value_delimiter = ',')]
        provider_uids: Vec<i64>,
    },
    /// Report cardinality and memory stats.
    Stats {
        data_source_id: i64,
        #[arg(long)]
        tabular: bool,
    },
    /// Delete all cache entries and indexes for a data source.
    Invalidate { data_source_id: i64 },
    /// Check whether a data source has a current warm generation.
    IsWarm { data_source_id: i64 },
}

/// `{schema, table, time_period_field, rows}` fixture consumed by `warm`.
#[derive(Deserialize)]
struct Fixture {
    schema: String,
    table: String,
    time_period_field: String,
    rows: Vec<Row>,
}

struct FixtureCollaborator {
    fixture: Fixture,
}

#[async_trait]
impl ConfigService for FixtureCollaborator {
    async fn get_data_source_config(&self, _data_source_id: i64) -> Result<DataSourceConfig, FactCacheError> {
        Ok(DataSourceConfig {
            schema: self.fixture.schema.clone(),
            table: self.fixture.table.clone(),
            column_mapping: ColumnMapping {
                time_period_field: self.fixture.time_period_field.clone(),
            },
        })
    }
}

#[async_trait]
impl SourceDatabase for FixtureCollaborator {
    async fn fetch_all(&self, _schema: &str, _table: &str) -> Result<Vec<Row>, FactCacheError> {
        Ok(self.fixture.rows.clone())
    }
}

fn load_config(cli: &Cli) -> Result<FactCacheConfig, FactCacheError> {
    if let Some(path) = &cli.config {
        return FactCacheConfig::from_file(path);
    }
    let mut config = FactCacheConfig::default();
    config.allowed_schemas = cli.allowed_schemas.clone();
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    factcache::observability::init_tracing();
    let cli = Cli::parse();

    let config = load_config(&cli)?;
    let store = Arc::new(RedisStore::with_key_prefix(&cli.redis_url, config.key_prefix.clone())?);

    match cli.command {
        Commands::Warm { data_source_id, fixture } => {
            let raw = std::fs::read_to_string(&fixture)?;
            let fixture: Fixture = serde_json::from_str(&raw)?;
            let collaborator = Arc::new(FixtureCollaborator { fixture });
            let cache = FactCache::new(store, collaborator.clone(), collaborator, config)?;
            let result = cache.warm(data_source_id).await?;
            println!("{}", serde_json::to_string_pretty(&WarmResultJson::from(result))?);
        }
        Commands::Query { data_source_id, measure, frequency, practice_uids, provider_uids } => {
            let collaborator = Arc::new(NullCollaborator);
            let cache = FactCache::new(store, collaborator.clone(), collaborator, config)?;
            let filter = Filter::new(data_source_id, measure, frequency)
                .with_practice_uids(practice_uids)
                .with_provider_uids(provider_uids);
            let rows = cache.query(&filter).await?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Commands::Stats { data_source_id, tabular } => {
            let collaborator = Arc::new(NullCollaborator);
            let cache = FactCache::new(store, collaborator.clone(), collaborator, config)?;
            let source_type = if tabular { Some(SourceType::Tabular) } else { None };
            let stats = cache.stats(data_source_id, source_type).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Invalidate { data_source_id } => {
            let collaborator = Arc::new(NullCollaborator);
            let cache = FactCache::new(store, collaborator.clone(), collaborator, config)?;
            cache.invalidate(data_source_id).await?;
            println!("invalidated data source {data_source_id}");
        }
        Commands::IsWarm { data_source_id } => {
            let collaborator = Arc::new(NullCollaborator);
            let cache = FactCache::new(store, collaborator.clone(), collaborator, config)?;
            println!("{}", cache.is_warm(data_source_id).await?);
        }
    }

    Ok(())
}

/// Stand-in collaborator for read-only subcommands, which never invoke
/// `warm` and therefore never call either trait method.
struct NullCollaborator;

#[async_trait]
impl ConfigService for NullCollaborator {
    async fn get_data_source_config(&self, data_source_id: i64) -> Result<DataSourceConfig, FactCacheError> {
        Err(FactCacheError::ConfigError(format!(
            "no config service wired for read-only command (data source {data_source_id})"
        )))
    }
}

#[async_trait]
impl SourceDatabase for NullCollaborator {
    async fn fetch_all(&self, _schema: &str, _table: &str) -> Result<Vec<Row>, FactCacheError> {
        Err(FactCacheError::SourceDbError("no source database wired for read-only command".into()))
    }
}

#[derive(serde::Serialize)]
struct WarmResultJson {
    entries_cached: u64,
    entries_skipped: u64,
    total_rows: u64,
    duration_ms: u128,
    skipped: bool,
}

impl From<factcache::WarmResult> for WarmResultJson {
    fn from(r: factcache::WarmResult) -> Self {
        Self {
            entries_cached: r.entries_cached,
            entries_skipped: r.entries_skipped,
            total_rows: r.total_rows,
            duration_ms: r.duration.as_millis(),
            skipped: r.skipped,
        }
    }
}
