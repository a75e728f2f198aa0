//! The Cache Facade (spec §4.G): the only entry point downstream
//! consumers see. Composes the four components over a shared [`Store`],
//! wired together by explicit dependency injection — there is no
//! process-wide singleton.

use std::{collections::HashMap, sync::Arc};

use tokio_util::sync::CancellationToken;

use crate::{
    config::FactCacheConfig,
    error::FactCacheError,
    invalidator::Invalidator,
    keys::Keys,
    model::{CacheStats, Filter, ProgressUpdate, Row, SourceType, WarmResult},
    query::QueryEngine,
    source::{ConfigService, SourceDatabase},
    stats::StatsCollector,
    store::Store,
    warmer::Warmer,
};

pub struct FactCache {
    warmer: Warmer,
    query: QueryEngine,
    invalidator: Invalidator,
    stats: StatsCollector,
    store: Arc<dyn Store>,
}

impl FactCache {
    pub fn new(
        store: Arc<dyn Store>,
        source_db: Arc<dyn SourceDatabase>,
        config_service: Arc<dyn ConfigService>,
        config: FactCacheConfig,
    ) -> Result<Self, FactCacheError> {
        config.validate()?;

        let warmer = Warmer::new(store.clone(), source_db, config_service, config.clone());
        let query = QueryEngine::new(store.clone(), config.mget_batch);
        let invalidator = Invalidator::new(store.clone(), config.scan_count, config.max_scan_pages);
        let stats = StatsCollector::new(store.clone());

        Ok(Self { warmer, query, invalidator, stats, store })
    }

    pub async fn warm(&self, data_source_id: i64) -> Result<WarmResult, FactCacheError> {
        self.warmer.warm(data_source_id).await
    }

    /// Same as [`FactCache::warm`], but `cancel` can be triggered by the
    /// caller to abort the warm — after the shadow generation is written
    /// but before the swap, or mid-swap (spec §4.C). A successful swap
    /// page already renamed is not rolled back; cancelling mid-swap can
    /// leave a data source partially on the new generation.
    pub async fn warm_cancellable(
        &self,
        data_source_id: i64,
        cancel: &CancellationToken,
    ) -> Result<WarmResult, FactCacheError> {
        self.warmer.warm_cancellable(data_source_id, cancel).await
    }

    pub async fn warm_with_progress(
        &self,
        data_source_id: i64,
        progress: impl Fn(ProgressUpdate) + Send + Sync,
    ) -> Result<WarmResult, FactCacheError> {
        self.warmer.warm_with_progress(data_source_id, progress).await
    }

    pub async fn query(&self, filter: &Filter) -> Result<Vec<Row>, FactCacheError> {
        self.query.query(filter).await
    }

    pub async fn batch_query(&self, filters: Vec<Filter>) -> Result<HashMap<String, Vec<Row>>, FactCacheError> {
        self.query.batch_query(filters).await
    }

    pub async fn invalidate(&self, data_source_id: i64) -> Result<(), FactCacheError> {
        self.invalidator.invalidate(data_source_id).await
    }

    pub async fn stats(&self, data_source_id: i64, source_type: Option<SourceType>) -> Result<CacheStats, FactCacheError> {
        self.stats.stats(data_source_id, source_type).await
    }

    /// `IsWarm(dataSourceId)` — a fast existence check, deliberately not
    /// routed through [`FactCache::stats`]'s SRANDMEMBER sampling path.
    pub async fn is_warm(&self, data_source_id: i64) -> Result<bool, FactCacheError> {
        Ok(self.store.get(&Keys::metadata_key(data_source_id)).await?.is_some())
    }

    /// `LastWarmed(dataSourceId)` — same fast path as [`FactCache::is_warm`],
    /// decoding just the timestamp field.
    pub async fn last_warmed(&self, data_source_id: i64) -> Result<Option<chrono::DateTime<chrono::Utc>>, FactCacheError> {
        let Some(bytes) = self.store.get(&Keys::metadata_key(data_source_id)).await? else {
            return Ok(None);
        };
        let metadata: crate::model::Metadata = serde_json::from_slice(&bytes)
            .map_err(|e| FactCacheError::SerializationError(e.to_string()))?;
        Ok(Some(metadata.timestamp))
    }
}
