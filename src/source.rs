//! Out-of-scope collaborators the core consumes but never implements: the
//! source analytics database and the configuration service (spec §1, §6).

use async_trait::async_trait;

use crate::{error::FactCacheError, model::Row};

/// `GetDataSourceConfig(dataSourceId) → {schema, table, columnMapping}`.
#[derive(Debug, Clone)]
pub struct DataSourceConfig {
    pub schema: String,
    pub table: String,
    pub column_mapping: ColumnMapping,
}

#[derive(Debug, Clone)]
pub struct ColumnMapping {
    pub time_period_field: String,
}

#[async_trait]
pub trait ConfigService: Send + Sync {
    async fn get_data_source_config(&self, data_source_id: i64) -> Result<DataSourceConfig, FactCacheError>;
}

/// `FetchAll(dataSourceId) → rows`. Implementations talk to whatever
/// relational store actually holds the fact table; the core only ever sees
/// `schema`/`table` already validated against the allow-list.
#[async_trait]
pub trait SourceDatabase: Send + Sync {
    async fn fetch_all(&self, schema: &str, table: &str) -> Result<Vec<Row>, FactCacheError>;
}
