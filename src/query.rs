//! Query Engine (spec §4.D): builds an index-set plan from a [`Filter`]
//! and materializes the matching rows via `Mget`.

use std::{collections::HashMap, sync::Arc, time::Duration};

use futures::future::join_all;
use tracing::warn;

use crate::{
    error::FactCacheError,
    keys::{Keys, TempOp},
    model::{Filter, Row},
    store::{self, Store},
};

#[cfg(feature = "prometheus")]
use crate::observability::metrics;

const TEMP_KEY_TTL: Duration = Duration::from_secs(10);

pub struct QueryEngine {
    store: Arc<dyn Store>,
    mget_batch: usize,
}

impl QueryEngine {
    pub fn new(store: Arc<dyn Store>, mget_batch: usize) -> Self {
        Self { store, mget_batch }
    }

    /// `Query(filter)` — plans the minimal set of index operations, then
    /// materializes the matching cache entries.
    pub async fn query(&self, filter: &Filter) -> Result<Vec<Row>, FactCacheError> {
        if filter.measure.is_empty() || filter.frequency.is_empty() {
            return Err(FactCacheError::InvalidFilter("measure and frequency are required".into()));
        }

        let (result_key, temp_keys) = self.plan(filter).await?;
        let keys = self.store.smembers(&result_key).await?;
        let rows = store::mget_rows(self.store.as_ref(), &keys, self.mget_batch).await;

        if !temp_keys.is_empty() {
            self.cleanup(temp_keys);
        }

        #[cfg(feature = "prometheus")]
        metrics::record_query(filter.data_source_id, rows.is_ok());

        rows
    }

    /// Runs several filters concurrently. All filters must share
    /// `data_source_id` and `frequency` (spec §4.D) — mixing them is an
    /// `InvalidFilter` rather than a silent partial result.
    pub async fn batch_query(&self, filters: Vec<Filter>) -> Result<HashMap<String, Vec<Row>>, FactCacheError> {
        if filters.is_empty() {
            return Ok(HashMap::new());
        }
        let data_source_id = filters[0].data_source_id;
        let frequency = filters[0].frequency.clone();
        for f in &filters {
            if f.data_source_id != data_source_id || f.frequency != frequency {
                return Err(FactCacheError::InvalidFilter(
                    "batch_query requires every filter to share data_source_id and frequency".into(),
                ));
            }
        }

        let futures = filters.into_iter().map(|f| {
            let measure = f.measure.clone();
            let store = self.store.clone();
            let mget_batch = self.mget_batch;
            async move {
                let engine = QueryEngine { store, mget_batch };
                let rows = engine.query(&f).await;
                (measure, rows)
            }
        });

        let mut out = HashMap::new();
        for (measure, rows) in join_all(futures).await {
            out.insert(measure, rows?);
        }
        Ok(out)
    }

    /// Builds the index plan and returns the key whose members are the
    /// final matching cache keys, plus any temp keys created along the way.
    async fn plan(&self, filter: &Filter) -> Result<(String, Vec<String>), FactCacheError> {
        let mut temp_keys = Vec::new();

        let base = Keys::base_index(filter.data_source_id, &filter.measure, &filter.frequency);

        let practice_set = self.union_or_single(filter.data_source_id, &filter.practice_uids, &mut temp_keys, |uid| {
            Keys::practice_index(filter.data_source_id, &filter.measure, uid, &filter.frequency)
        }).await?;

        let provider_set = self.union_or_single(filter.data_source_id, &filter.provider_uids, &mut temp_keys, |uid| {
            Keys::provider_index(filter.data_source_id, &filter.measure, &filter.frequency, Some(uid))
        }).await?;

        let mut sets = vec![base];
        if let Some(s) = practice_set {
            sets.push(s);
        }
        if let Some(s) = provider_set {
            sets.push(s);
        }

        if sets.len() == 1 {
            return Ok((sets.remove(0), temp_keys));
        }

        let result_key = Keys::temp_key(filter.data_source_id, TempOp::Intersect);
        self.store.sinterstore(&result_key, &sets).await?;
        self.store.expire(&result_key, TEMP_KEY_TTL).await?;
        temp_keys.push(result_key.clone());
        Ok((result_key, temp_keys))
    }

    /// For an empty `uids`, no set is contributed. For a single uid, the
    /// index key itself is reused directly (no union needed). For multiple,
    /// a SUNIONSTORE into a temp key is required.
    async fn union_or_single(
        &self,
        data_source_id: i64,
        uids: &[i64],
        temp_keys: &mut Vec<String>,
        index_for: impl Fn(i64) -> String,
    ) -> Result<Option<String>, FactCacheError> {
        match uids {
            [] => Ok(None),
            [single] => Ok(Some(index_for(*single))),
            many => {
                let index_keys: Vec<String> = many.iter().map(|u| index_for(*u)).collect();
                let union_key = Keys::temp_key(data_source_id, TempOp::Union);
                self.store.sunionstore(&union_key, &index_keys).await?;
                self.store.expire(&union_key, TEMP_KEY_TTL).await?;
                temp_keys.push(union_key.clone());
                Ok(Some(union_key))
            }
        }
    }

    /// Fires a best-effort DEL of temp keys without blocking the caller on
    /// it; failures are logged, not propagated, since the keys carry a TTL
    /// as a backstop (spec §4.D).
    fn cleanup(&self, temp_keys: Vec<String>) {
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.del(&temp_keys).await {
                warn!(error = %e, "temp key cleanup failed, relying on TTL");
            }
        });
    }
}
