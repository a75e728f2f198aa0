//! Stats Collector (spec §4.F): cardinality and memory reporting via
//! whichever of three paths the data source's metadata supports.

use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    error::FactCacheError,
    keys::Keys,
    model::{CacheStats, Metadata, SourceType},
    store::Store,
};

const MEMORY_SAMPLE_SIZE: usize = 10;

pub struct StatsCollector {
    store: Arc<dyn Store>,
}

impl StatsCollector {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// `Stats(dataSourceId, sourceType)`. Never returns an `Err` for a cold
    /// or partially-populated cache — every path degrades to zeroed fields
    /// instead (spec §4.F).
    pub async fn stats(&self, data_source_id: i64, source_type: Option<SourceType>) -> Result<CacheStats, FactCacheError> {
        match source_type.unwrap_or_default() {
            SourceType::Tabular => self.tabular_stats(data_source_id).await,
            SourceType::Standard => self.standard_stats(data_source_id).await,
        }
    }

    /// Path A (metadata present) falling back to Path B (metadata missing,
    /// `SCARD` only).
    async fn standard_stats(&self, data_source_id: i64) -> Result<CacheStats, FactCacheError> {
        let metadata_key = Keys::metadata_key(data_source_id);
        let raw = self.store.get(&metadata_key).await?;

        if let Some(bytes) = raw {
            match serde_json::from_slice::<Metadata>(&bytes) {
                Ok(metadata) => {
                    let estimated_memory_mb = self.estimate_memory_mb(data_source_id, metadata.total_entries).await;
                    return Ok(CacheStats {
                        data_source_id,
                        total_entries: metadata.total_entries,
                        index_count: metadata.total_entries * 5,
                        estimated_memory_mb,
                        last_warmed: Some(metadata.timestamp),
                        is_warm: true,
                        unique_measures: metadata.unique_measures,
                        unique_practices: metadata.unique_practices,
                        unique_providers: metadata.unique_providers,
                        unique_frequencies: metadata.unique_frequencies,
                    });
                }
                Err(e) => warn!(error = %e, "malformed metadata document, falling back to SCARD"),
            }
        }

        // Path B: no usable metadata, fall back to the master index's cardinality.
        let master = Keys::master_index(data_source_id);
        let total_entries = self.store.scard(&master).await.unwrap_or(0);
        if total_entries > 0 {
            info!(data_source_id, "stats served via SCARD fallback; consider re-warming to restore metadata");
        }
        let estimated_memory_mb = self.estimate_memory_mb(data_source_id, total_entries).await;

        Ok(CacheStats {
            data_source_id,
            total_entries,
            index_count: 0,
            estimated_memory_mb,
            last_warmed: None,
            is_warm: total_entries > 0,
            unique_measures: 0,
            unique_practices: 0,
            unique_providers: 0,
            unique_frequencies: Vec::new(),
        })
    }

    /// Path C: tabular data sources cache a single entry keyed by
    /// `data_source_id` alone, so cardinality is meaningless; report
    /// presence/absence only.
    async fn tabular_stats(&self, data_source_id: i64) -> Result<CacheStats, FactCacheError> {
        let master = Keys::master_index(data_source_id);
        let present = self.store.scard(&master).await.unwrap_or(0) > 0;
        let total_entries = if present { 1 } else { 0 };
        let estimated_memory_mb = self.estimate_memory_mb(data_source_id, total_entries).await;

        Ok(CacheStats {
            data_source_id,
            total_entries,
            index_count: 0,
            estimated_memory_mb,
            last_warmed: None,
            is_warm: present,
            unique_measures: 0,
            unique_practices: 0,
            unique_providers: 0,
            unique_frequencies: Vec::new(),
        })
    }

    /// Samples up to [`MEMORY_SAMPLE_SIZE`] cache entries via
    /// `SRANDMEMBER` + `GET`, averages their byte length, and scales by
    /// `total_entries` — deliberately avoids the `MEMORY USAGE` command
    /// (spec §4.F), which many managed Redis offerings disable.
    async fn estimate_memory_mb(&self, data_source_id: i64, total_entries: u64) -> f64 {
        if total_entries == 0 {
            return 0.0;
        }
        let master = Keys::master_index(data_source_id);
        let sample_keys = match self.store.srandmember(&master, MEMORY_SAMPLE_SIZE).await {
            Ok(keys) => keys,
            Err(_) => return 0.0,
        };
        if sample_keys.is_empty() {
            return 0.0;
        }

        let mut total_bytes = 0usize;
        let mut sampled = 0usize;
        for key in &sample_keys {
            match self.store.get(key).await {
                Ok(Some(bytes)) => {
                    total_bytes += bytes.len();
                    sampled += 1;
                }
                Ok(None) => {}
                Err(_) => return 0.0,
            }
        }
        if sampled == 0 {
            return 0.0;
        }

        let avg_bytes = total_bytes as f64 / sampled as f64;
        (avg_bytes * total_entries as f64) / (1024.0 * 1024.0)
    }
}
