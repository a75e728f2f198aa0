//! Warmer (spec §4.C): bulk ingest, shadow generation, atomic swap.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn};

use crate::{
    config::FactCacheConfig,
    error::FactCacheError,
    keys::Keys,
    model::{ProgressUpdate, Row, Tuple, WarmResult},
    source::{ConfigService, SourceDatabase},
    store::{self, Pipeline, Store},
};

#[cfg(feature = "prometheus")]
use crate::observability::metrics;

pub struct Warmer {
    store: Arc<dyn Store>,
    source_db: Arc<dyn SourceDatabase>,
    config_service: Arc<dyn ConfigService>,
    config: FactCacheConfig,
}

impl Warmer {
    pub fn new(
        store: Arc<dyn Store>,
        source_db: Arc<dyn SourceDatabase>,
        config_service: Arc<dyn ConfigService>,
        config: FactCacheConfig,
    ) -> Self {
        Self { store, source_db, config_service, config }
    }

    /// `Warm(dataSourceId)` — see spec §4.C for the full algorithm.
    pub async fn warm(&self, data_source_id: i64) -> Result<WarmResult, FactCacheError> {
        self.warm_cancellable(data_source_id, &CancellationToken::new()).await
    }

    /// `WarmWithProgress` — per spec §4.C, this currently behaves
    /// identically to `Warm` and invokes `progress` once at completion
    /// (OQ-3 in `DESIGN.md`); true streaming progress is a future
    /// extension, not a current contract.
    pub async fn warm_with_progress(
        &self,
        data_source_id: i64,
        progress: impl Fn(ProgressUpdate) + Send + Sync,
    ) -> Result<WarmResult, FactCacheError> {
        let result = self.warm(data_source_id).await?;
        if !result.skipped {
            progress(ProgressUpdate {
                rows_processed: result.total_rows,
                total_rows: result.total_rows,
                percent: 100.0,
            });
        }
        Ok(result)
    }

    pub async fn warm_cancellable(
        &self,
        data_source_id: i64,
        cancel: &CancellationToken,
    ) -> Result<WarmResult, FactCacheError> {
        let span = info_span!("warm", data_source_id);
        let _enter = span.enter();

        self.sweep_orphans(data_source_id).await?;

        let lock_key = Keys::lock_key(data_source_id);
        let lock_ttl = Duration::from_secs(self.config.lock_ttl_secs);
        if !store::acquire_lock(self.store.as_ref(), &lock_key, lock_ttl).await? {
            info!("warm lock busy, skipping");
            return Ok(WarmResult::skipped());
        }

        let start = Instant::now();
        let outcome = self.warm_locked(data_source_id, cancel).await;

        if let Err(e) = store::release_lock(self.store.as_ref(), &lock_key).await {
            warn!(error = %e, "failed to release warm lock");
        }

        let duration = start.elapsed();
        match outcome {
            Ok(mut result) => {
                result.duration = duration;
                #[cfg(feature = "prometheus")]
                metrics::record_warm(data_source_id, result.entries_cached, result.entries_skipped, duration);
                info!(
                    entries_cached = result.entries_cached,
                    entries_skipped = result.entries_skipped,
                    total_rows = result.total_rows,
                    duration_ms = duration.as_millis() as u64,
                    "warm complete"
                );
                Ok(result)
            }
            Err(e) => {
                #[cfg(feature = "prometheus")]
                metrics::record_warm_error(data_source_id);
                Err(e)
            }
        }
    }

    /// Defensive sweep for shadow keys left behind by an aborted warm
    /// (spec §9 open question; see `DESIGN.md` OQ-2). Runs before lock
    /// acquisition so it never fights an in-flight warm for this data
    /// source.
    async fn sweep_orphans(&self, data_source_id: i64) -> Result<(), FactCacheError> {
        let cache_pattern = Keys::shadow_cache_pattern(data_source_id);
        let index_pattern = Keys::shadow_index_pattern(data_source_id);

        let mut orphans = store::scan_all(self.store.as_ref(), &cache_pattern, self.config.scan_count, self.config.max_scan_pages).await?;
        orphans.extend(store::scan_all(self.store.as_ref(), &index_pattern, self.config.scan_count, self.config.max_scan_pages).await?);

        if orphans.is_empty() {
            return Ok(());
        }
        debug!(count = orphans.len(), "sweeping orphan shadow keys");
        self.store.del(&orphans).await?;
        Ok(())
    }

    async fn warm_locked(&self, data_source_id: i64, cancel: &CancellationToken) -> Result<WarmResult, FactCacheError> {
        let ds_config = self
            .config_service
            .get_data_source_config(data_source_id)
            .await
            .map_err(|e| FactCacheError::ConfigError(e.to_string()))?;

        self.config.validate_source(&ds_config.schema, &ds_config.table)?;

        if cancel.is_cancelled() {
            return Err(FactCacheError::Internal("warm cancelled before fetch".into()));
        }

        let rows = self
            .source_db
            .fetch_all(&ds_config.schema, &ds_config.table)
            .await
            .map_err(|e| FactCacheError::SourceDbError(e.to_string()))?;
        let total_rows = rows.len() as u64;

        let grouped = self.group_rows(data_source_id, rows, &ds_config.column_mapping.time_period_field);

        if cancel.is_cancelled() {
            return Err(FactCacheError::Internal("warm cancelled after grouping".into()));
        }

        let (entries_cached, entries_skipped) = self.write_shadow_generation(&grouped).await?;

        if cancel.is_cancelled() {
            return Err(FactCacheError::Internal("warm cancelled before swap".into()));
        }

        self.swap_shadow(data_source_id, cancel).await?;

        self.publish_metadata(data_source_id, &grouped, entries_cached).await?;

        Ok(WarmResult {
            entries_cached,
            entries_skipped,
            total_rows,
            duration: Duration::ZERO,
            skipped: false,
        })
    }

    /// Groups rows by [`Tuple`] (spec §4.C step 4). Rows missing a required
    /// field are dropped and not counted towards `entries_cached`.
    fn group_rows(&self, data_source_id: i64, rows: Vec<Row>, time_period_field: &str) -> HashMap<Tuple, Vec<Row>> {
        let mut groups: HashMap<Tuple, Vec<Row>> = HashMap::new();

        for row in rows {
            let Some(measure) = row.get("measure").and_then(|v| v.as_str()) else { continue };
            let Some(practice_uid) = row.get("practice_uid").and_then(|v| v.as_i64()) else { continue };
            let Some(frequency) = row.get(time_period_field).and_then(|v| v.as_str()) else { continue };
            let provider_uid = row.get("provider_uid").and_then(|v| v.as_i64());

            let tuple = Tuple {
                data_source_id,
                measure: measure.to_string(),
                practice_uid,
                provider_uid,
                frequency: frequency.to_string(),
            };
            groups.entry(tuple).or_default().push(row);
        }

        groups
    }

    /// Writes the shadow generation in pipelined batches (spec §4.C step 5).
    async fn write_shadow_generation(&self, groups: &HashMap<Tuple, Vec<Row>>) -> Result<(u64, u64), FactCacheError> {
        let mut pipeline = Pipeline::new();
        let mut entries_cached = 0u64;
        let mut entries_skipped = 0u64;

        for (tuple, rows) in groups {
            if rows.is_empty() {
                continue;
            }
            Keys::validate_tuple(tuple)?;

            let serialized = match serde_json::to_vec(rows) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(error = %e, "skipping group: serialization failed");
                    entries_skipped += 1;
                    continue;
                }
            };
            if serialized.len() > self.config.max_entry_bytes {
                warn!(bytes = serialized.len(), limit = self.config.max_entry_bytes, "skipping oversize group");
                entries_skipped += 1;
                continue;
            }

            let production_cache_key = Keys::cache_key(tuple);
            pipeline.set(Keys::shadow_cache_key(tuple), serialized, None);
            for shadow_index in Keys::shadow_index_keys(tuple) {
                pipeline.sadd(shadow_index, production_cache_key.clone());
            }
            entries_cached += 1;

            if pipeline.len() >= self.config.pipeline_batch {
                self.flush(&mut pipeline).await?;
            }
        }

        if !pipeline.is_empty() {
            self.flush(&mut pipeline).await?;
        }

        Ok((entries_cached, entries_skipped))
    }

    async fn flush(&self, pipeline: &mut Pipeline) -> Result<(), FactCacheError> {
        let ops = pipeline.take();
        let total = ops.len();
        let results = self.store.exec_pipeline(ops).await?;
        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            return Err(FactCacheError::PipelineError { failed, total });
        }
        Ok(())
    }

    /// RENAME-based swap from shadow to production namespace (spec §4.C
    /// step 6).
    async fn swap_shadow(&self, data_source_id: i64, cancel: &CancellationToken) -> Result<(), FactCacheError> {
        let ttl = Duration::from_secs(self.config.default_ttl_secs);
        self.rename_pattern(&Keys::shadow_cache_pattern(data_source_id), "shadow:", "cache:", ttl, cancel).await?;
        self.rename_pattern(&Keys::shadow_index_pattern(data_source_id), "shadow_idx:", "idx:", ttl, cancel).await?;
        Ok(())
    }

    async fn rename_pattern(
        &self,
        pattern: &str,
        shadow_prefix: &str,
        production_prefix: &str,
        ttl: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), FactCacheError> {
        let mut cursor = 0u64;
        let mut pages = 0usize;
        loop {
            let (next, keys) = self.store.scan_page(cursor, pattern, self.config.scan_count).await?;
            if !keys.is_empty() {
                let mut pipeline = Pipeline::new();
                for shadow_key in &keys {
                    let Some(suffix) = shadow_key.strip_prefix(shadow_prefix) else { continue };
                    let production_key = format!("{production_prefix}{suffix}");
                    pipeline.rename(shadow_key.clone(), production_key.clone());
                    pipeline.expire(production_key, ttl);
                }
                self.flush(&mut pipeline).await?;
            }

            if cancel.is_cancelled() {
                return Err(FactCacheError::Internal("warm cancelled mid-swap".into()));
            }

            pages += 1;
            if next == 0 {
                break;
            }
            if pages >= self.config.max_scan_pages {
                return Err(FactCacheError::ScanCeilingExceeded { pattern: pattern.to_string() });
            }
            cursor = next;
        }
        Ok(())
    }

    async fn publish_metadata(&self, data_source_id: i64, groups: &HashMap<Tuple, Vec<Row>>, entries_cached: u64) -> Result<(), FactCacheError> {
        let mut measures = HashSet::new();
        let mut practices = HashSet::new();
        let mut providers = HashSet::new();
        let mut frequencies = HashSet::new();

        for tuple in groups.keys() {
            measures.insert(tuple.measure.clone());
            practices.insert(tuple.practice_uid);
            if let Some(p) = tuple.provider_uid {
                providers.insert(p);
            }
            frequencies.insert(tuple.frequency.clone());
        }

        let metadata = crate::model::Metadata {
            timestamp: chrono::Utc::now(),
            unique_measures: measures.len() as u64,
            unique_practices: practices.len() as u64,
            unique_providers: providers.len() as u64,
            unique_frequencies: frequencies.into_iter().collect(),
            total_entries: entries_cached,
        };

        let bytes = serde_json::to_vec(&metadata).map_err(|e| FactCacheError::SerializationError(e.to_string()))?;
        let ttl = Duration::from_secs(self.config.default_ttl_secs);
        self.store.set_ex(&Keys::metadata_key(data_source_id), &bytes, Some(ttl)).await
    }
}
