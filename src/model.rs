use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single source row. Dynamically typed on purpose: the cache core only
/// ever inspects `measure`, `practice_uid`, `provider_uid`, and the
/// configured time-period column (see [`crate::source::ColumnMapping`]);
/// everything else passes through opaque.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// A value blob: every row sharing a [`Tuple`], in insertion order.
pub type Blob = Vec<Row>;

/// The five-field identifier used as the unit of cached grouping.
/// `provider_uid = None` is legal and renders as `*` in keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tuple {
    pub data_source_id: i64,
    pub measure: String,
    pub practice_uid: i64,
    pub provider_uid: Option<i64>,
    pub frequency: String,
}

/// A loosely-typed tuple recovered from an index key, which only ever
/// encodes a subset of the five fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialTuple {
    pub data_source_id: i64,
    pub measure: Option<String>,
    pub practice_uid: Option<i64>,
    pub provider_uid: Option<i64>,
    pub frequency: Option<String>,
}

/// `cache:meta:{ds:D}:last_warm` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub timestamp: DateTime<Utc>,
    pub unique_measures: u64,
    pub unique_practices: u64,
    pub unique_providers: u64,
    pub unique_frequencies: Vec<String>,
    pub total_entries: u64,
}

#[derive(Debug, Clone)]
pub struct WarmResult {
    pub entries_cached: u64,
    pub entries_skipped: u64,
    pub total_rows: u64,
    pub duration: Duration,
    pub skipped: bool,
}

impl WarmResult {
    pub(crate) fn skipped() -> Self {
        Self {
            entries_cached: 0,
            entries_skipped: 0,
            total_rows: 0,
            duration: Duration::ZERO,
            skipped: true,
        }
    }
}

/// Progress callback invoked by [`crate::Warmer::warm_with_progress`].
pub type ProgressCallback = Box<dyn Fn(ProgressUpdate) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct ProgressUpdate {
    pub rows_processed: u64,
    pub total_rows: u64,
    pub percent: f64,
}

/// Which fetch/probe path [`crate::Stats`] should take for a data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceType {
    #[default]
    Standard,
    Tabular,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub data_source_id: i64,
    pub total_entries: u64,
    pub index_count: u64,
    pub estimated_memory_mb: f64,
    pub last_warmed: Option<DateTime<Utc>>,
    pub is_warm: bool,
    pub unique_measures: u64,
    pub unique_practices: u64,
    pub unique_providers: u64,
    pub unique_frequencies: Vec<String>,
}

/// A query filter. `measure` and `frequency` are required; `practice_uids`
/// and `provider_uids` narrow the result via index union.
#[derive(Debug, Clone)]
pub struct Filter {
    pub data_source_id: i64,
    pub measure: String,
    pub frequency: String,
    pub practice_uids: Vec<i64>,
    pub provider_uids: Vec<i64>,
}

impl Filter {
    pub fn new(data_source_id: i64, measure: impl Into<String>, frequency: impl Into<String>) -> Self {
        Self {
            data_source_id,
            measure: measure.into(),
            frequency: frequency.into(),
            practice_uids: Vec::new(),
            provider_uids: Vec::new(),
        }
    }

    pub fn with_practice_uids(mut self, uids: Vec<i64>) -> Self {
        self.practice_uids = uids;
        self
    }

    pub fn with_provider_uids(mut self, uids: Vec<i64>) -> Self {
        self.provider_uids = uids;
        self
    }
}
