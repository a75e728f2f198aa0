//! Invalidator (spec §4.E): drops every cache entry and index for a data
//! source. No distributed lock — concurrent with an in-flight warm is
//! accepted (spec §9).

use std::sync::Arc;

use tracing::warn;

use crate::{error::FactCacheError, keys::Keys, store::Store};

#[cfg(feature = "prometheus")]
use crate::observability::metrics;

const INVALIDATION_BATCH: usize = 1000;

pub struct Invalidator {
    store: Arc<dyn Store>,
    scan_count: usize,
    max_scan_pages: usize,
}

impl Invalidator {
    pub fn new(store: Arc<dyn Store>, scan_count: usize, max_scan_pages: usize) -> Self {
        Self { store, scan_count, max_scan_pages }
    }

    /// `Invalidate(dataSourceId)`. Continues past per-batch delete errors
    /// (logging them) so one bad batch doesn't abandon the rest of the
    /// sweep; the aggregate outcome only fails on a store-level error from
    /// `scan_page` itself.
    pub async fn invalidate(&self, data_source_id: i64) -> Result<(), FactCacheError> {
        let master = Keys::master_index(data_source_id);
        let cache_keys = match self.store.smembers(&master).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(
                    error = %e,
                    data_source_id,
                    "failed to read master index for invalidation, proceeding without it"
                );
                Vec::new()
            }
        };
        self.delete_in_batches(&cache_keys).await;
        self.store.del(&[master]).await?;

        let index_pattern = Keys::index_pattern(data_source_id);
        self.scan_and_delete(&index_pattern).await?;

        self.store.del(&[Keys::metadata_key(data_source_id)]).await?;

        #[cfg(feature = "prometheus")]
        metrics::record_invalidate(data_source_id);

        Ok(())
    }

    async fn scan_and_delete(&self, pattern: &str) -> Result<(), FactCacheError> {
        let mut cursor = 0u64;
        let mut pages = 0usize;
        loop {
            let (next, keys) = self.store.scan_page(cursor, pattern, self.scan_count).await?;
            self.delete_in_batches(&keys).await;

            pages += 1;
            if next == 0 {
                break;
            }
            if pages >= self.max_scan_pages {
                return Err(FactCacheError::ScanCeilingExceeded { pattern: pattern.to_string() });
            }
            cursor = next;
        }
        Ok(())
    }

    async fn delete_in_batches(&self, keys: &[String]) {
        for batch in keys.chunks(INVALIDATION_BATCH) {
            if let Err(e) = self.store.del(batch).await {
                warn!(error = %e, count = batch.len(), "invalidation batch failed, continuing");
            }
        }
    }
}
