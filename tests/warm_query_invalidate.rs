//! End-to-end scenarios over [`factcache::FactCache`] backed by the
//! in-process `MemoryStore`, covering the warm → query → invalidate
//! lifecycle and the index invariants a successful warm must establish.

use std::sync::Arc;

use async_trait::async_trait;
use factcache::{
    CancellationToken, ColumnMapping, ConfigService, DataSourceConfig, FactCache, FactCacheConfig,
    FactCacheError, Filter, MemoryStore, Row, SourceDatabase, SourceType, Store,
};
use serde_json::json;

fn row(measure: &str, practice_uid: i64, provider_uid: Option<i64>, frequency: &str, value: i64) -> Row {
    let mut map = serde_json::Map::new();
    map.insert("measure".into(), json!(measure));
    map.insert("practice_uid".into(), json!(practice_uid));
    if let Some(p) = provider_uid {
        map.insert("provider_uid".into(), json!(p));
    } else {
        map.insert("provider_uid".into(), serde_json::Value::Null);
    }
    map.insert("month".into(), json!(frequency));
    map.insert("value".into(), json!(value));
    map
}

struct FixedCollaborator {
    rows: Vec<Row>,
    /// When set, `fetch_all` notifies `started` then waits on `gate` before
    /// returning — lets tests pin down the exact instant a warm holds its
    /// lock and is mid-fetch, instead of racing two warms and hoping.
    gate: Option<(Arc<tokio::sync::Notify>, Arc<tokio::sync::Notify>)>,
}

impl FixedCollaborator {
    fn new(rows: Vec<Row>) -> Self {
        Self { rows, gate: None }
    }

    fn gated(rows: Vec<Row>, started: Arc<tokio::sync::Notify>, gate: Arc<tokio::sync::Notify>) -> Self {
        Self { rows, gate: Some((started, gate)) }
    }
}

#[async_trait]
impl ConfigService for FixedCollaborator {
    async fn get_data_source_config(&self, _data_source_id: i64) -> Result<DataSourceConfig, FactCacheError> {
        Ok(DataSourceConfig {
            schema: "analytics".to_string(),
            table: "facts".to_string(),
            column_mapping: ColumnMapping { time_period_field: "month".to_string() },
        })
    }
}

#[async_trait]
impl SourceDatabase for FixedCollaborator {
    async fn fetch_all(&self, schema: &str, table: &str) -> Result<Vec<Row>, FactCacheError> {
        assert_eq!(schema, "analytics");
        assert_eq!(table, "facts");
        if let Some((started, gate)) = &self.gate {
            started.notify_one();
            gate.notified().await;
        }
        Ok(self.rows.clone())
    }
}

/// Returns a different row generation on each successive `fetch_all` call,
/// clamped to the last one — used to drive a second warm with changed data
/// without a second `FactCache` instance.
struct VersionedCollaborator {
    generations: Vec<Vec<Row>>,
    call: std::sync::atomic::AtomicUsize,
}

#[async_trait]
impl ConfigService for VersionedCollaborator {
    async fn get_data_source_config(&self, _data_source_id: i64) -> Result<DataSourceConfig, FactCacheError> {
        Ok(DataSourceConfig {
            schema: "analytics".to_string(),
            table: "facts".to_string(),
            column_mapping: ColumnMapping { time_period_field: "month".to_string() },
        })
    }
}

#[async_trait]
impl SourceDatabase for VersionedCollaborator {
    async fn fetch_all(&self, _schema: &str, _table: &str) -> Result<Vec<Row>, FactCacheError> {
        let idx = self.call.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let idx = idx.min(self.generations.len() - 1);
        Ok(self.generations[idx].clone())
    }
}

fn config() -> FactCacheConfig {
    let mut cfg = FactCacheConfig::default();
    cfg.allowed_schemas = vec!["analytics".to_string()];
    cfg
}

fn cache_with_rows(rows: Vec<Row>) -> FactCache {
    let store = Arc::new(MemoryStore::new());
    let collaborator = Arc::new(FixedCollaborator::new(rows));
    FactCache::new(store, collaborator.clone(), collaborator, config()).unwrap()
}

/// Scenario 1: warm-then-query, single filter.
#[tokio::test]
async fn warm_then_query_single_filter() {
    let rows = vec![
        row("Revenue", 114, Some(501), "monthly", 1000),
        row("Revenue", 114, Some(501), "monthly", 1200),
        row("Revenue", 114, None, "monthly", 900),
    ];
    let cache = cache_with_rows(rows);

    let result = cache.warm(1).await.unwrap();
    assert!(!result.skipped);
    assert_eq!(result.entries_cached, 2);
    assert_eq!(result.total_rows, 3);

    let all = cache.query(&Filter::new(1, "Revenue", "monthly")).await.unwrap();
    assert_eq!(all.len(), 3);

    let narrowed = cache
        .query(
            &Filter::new(1, "Revenue", "monthly")
                .with_practice_uids(vec![114])
                .with_provider_uids(vec![501]),
        )
        .await
        .unwrap();
    assert_eq!(narrowed.len(), 2);

    let stats = cache.stats(1, None).await.unwrap();
    assert_eq!(stats.total_entries, 2);
    assert_eq!(stats.unique_measures, 1);
    assert_eq!(stats.unique_practices, 1);
    assert_eq!(stats.unique_providers, 1);
    assert_eq!(stats.unique_frequencies, vec!["monthly".to_string()]);
    assert!(stats.is_warm);
}

/// Scenario 2: invalidation clears everything.
#[tokio::test]
async fn invalidate_clears_everything() {
    let rows = vec![
        row("Revenue", 114, Some(501), "monthly", 1000),
        row("Revenue", 114, None, "monthly", 900),
    ];
    let cache = cache_with_rows(rows);
    cache.warm(1).await.unwrap();
    assert!(cache.is_warm(1).await.unwrap());

    cache.invalidate(1).await.unwrap();

    assert!(!cache.is_warm(1).await.unwrap());
    let results = cache.query(&Filter::new(1, "Revenue", "monthly")).await.unwrap();
    assert!(results.is_empty());
    let stats = cache.stats(1, None).await.unwrap();
    assert_eq!(stats.total_entries, 0);
}

/// Scenario 3 / P4: concurrent warms — exactly one performs work, the
/// other observes the held lock and returns `{skipped: true}`. The gated
/// collaborator pins down the exact instant the first warm holds the lock
/// and is mid-fetch, so the second warm's lock attempt is guaranteed to
/// land while the first is still in progress rather than racing and
/// hoping the scheduler interleaves them.
#[tokio::test]
async fn concurrent_warms_only_one_performs_work() {
    let rows = vec![row("Revenue", 1, Some(1), "monthly", 1)];
    let store = Arc::new(MemoryStore::new());
    let started = Arc::new(tokio::sync::Notify::new());
    let gate = Arc::new(tokio::sync::Notify::new());
    let collaborator = Arc::new(FixedCollaborator::gated(rows, started.clone(), gate.clone()));
    let cache = Arc::new(FactCache::new(store, collaborator.clone(), collaborator, config()).unwrap());

    let a = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.warm(7).await.unwrap() })
    };

    started.notified().await;

    let b = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.warm(7).await.unwrap() })
    };
    let r2 = b.await.unwrap();
    assert!(r2.skipped);
    assert_eq!(r2.entries_cached, 0);

    gate.notify_one();
    let r1 = a.await.unwrap();
    assert!(!r1.skipped);
    assert_eq!(r1.entries_cached, 1);
}

/// Scenario 4: a background query loop running concurrently with a
/// re-warm of the same data source must never observe an empty result —
/// the RENAME-based swap (spec §4.C step 6) replaces each production key
/// atomically rather than deleting then re-creating it.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shadow_swap_is_zero_downtime() {
    let mut gen1 = Vec::new();
    let mut gen2 = Vec::new();
    for i in 0..200 {
        gen1.push(row("Revenue", i, Some(1), "monthly", i));
        gen2.push(row("Revenue", i, Some(1), "monthly", i + 1000));
    }

    let store = Arc::new(MemoryStore::new());
    let collaborator = Arc::new(VersionedCollaborator {
        generations: vec![gen1, gen2],
        call: std::sync::atomic::AtomicUsize::new(0),
    });
    let mut cfg = config();
    cfg.pipeline_batch = 8;
    cfg.scan_count = 8;
    let cache = Arc::new(FactCache::new(store, collaborator.clone(), collaborator, cfg).unwrap());

    cache.warm(60).await.unwrap();
    assert!(cache.is_warm(60).await.unwrap());

    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let saw_empty = Arc::new(std::sync::atomic::AtomicBool::new(false));

    let query_task = {
        let cache = cache.clone();
        let stop = stop.clone();
        let saw_empty = saw_empty.clone();
        tokio::spawn(async move {
            let mut iterations = 0u64;
            while !stop.load(std::sync::atomic::Ordering::SeqCst) && iterations < 50_000 {
                let results = cache.query(&Filter::new(60, "Revenue", "monthly")).await.unwrap();
                if results.is_empty() {
                    saw_empty.store(true, std::sync::atomic::Ordering::SeqCst);
                }
                iterations += 1;
            }
            iterations
        })
    };

    cache.warm(60).await.unwrap();
    stop.store(true, std::sync::atomic::Ordering::SeqCst);
    let iterations = query_task.await.unwrap();

    assert!(iterations > 0, "query loop never ran concurrently with the re-warm");
    assert!(!saw_empty.load(std::sync::atomic::Ordering::SeqCst), "query observed an empty result during shadow swap");
}

/// Scenario 5: multi-practice union.
#[tokio::test]
async fn multi_practice_union() {
    let rows = vec![
        row("Sessions", 114, Some(1), "monthly", 1),
        row("Sessions", 115, Some(1), "monthly", 2),
        row("Sessions", 116, Some(1), "monthly", 3),
    ];
    let cache = cache_with_rows(rows);
    cache.warm(3).await.unwrap();

    let results = cache
        .query(&Filter::new(3, "Sessions", "monthly").with_practice_uids(vec![114, 116]))
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    let values: Vec<i64> = results.iter().map(|r| r["value"].as_i64().unwrap()).collect();
    assert!(values.contains(&1));
    assert!(values.contains(&3));
    assert!(!values.contains(&2));
}

/// Scenario 6: an over-size blob is skipped but doesn't abort the warm.
#[tokio::test]
async fn oversize_blob_is_skipped() {
    let big_value = "x".repeat(200);
    let mut rows = Vec::new();
    for i in 0..50 {
        rows.push(row("Huge", 1, Some(1), "monthly", 0));
        rows.last_mut().unwrap().insert("payload".into(), json!(big_value.clone()));
        let _ = i;
    }
    rows.push(row("Small", 2, Some(1), "monthly", 42));

    let store = Arc::new(MemoryStore::new());
    let collaborator = Arc::new(FixedCollaborator::new(rows));
    let mut cfg = config();
    cfg.max_entry_bytes = 1000;
    let cache = FactCache::new(store, collaborator.clone(), collaborator, cfg).unwrap();

    let result = cache.warm(9).await.unwrap();
    assert_eq!(result.entries_skipped, 1);
    assert_eq!(result.entries_cached, 1);

    let huge = cache.query(&Filter::new(9, "Huge", "monthly")).await.unwrap();
    assert!(huge.is_empty());
    let small = cache.query(&Filter::new(9, "Small", "monthly")).await.unwrap();
    assert_eq!(small.len(), 1);
}

/// P1/P2/P3: after a successful warm, every cache key is a member of the
/// master index and of every matching non-master index, and every index
/// member resolves to an existing cache key.
#[tokio::test]
async fn index_invariants_hold_after_warm() {
    let rows = vec![
        row("Revenue", 114, Some(501), "monthly", 1),
        row("Revenue", 114, None, "monthly", 2),
        row("Revenue", 200, Some(9), "weekly", 3),
    ];
    let store = Arc::new(MemoryStore::new());
    let collaborator = Arc::new(FixedCollaborator::new(rows));
    let cache = FactCache::new(store.clone(), collaborator.clone(), collaborator, config()).unwrap();
    cache.warm(5).await.unwrap();

    let store: Arc<dyn Store> = store;
    let master = factcache::Keys::master_index(5);
    let cache_keys = store.smembers(&master).await.unwrap();
    assert_eq!(cache_keys.len(), 3);

    for key in &cache_keys {
        let tuple = factcache::Keys::parse_cache_key(key).expect("cache key must parse");
        assert!(store.get(key).await.unwrap().is_some(), "index member must resolve to a live key");

        for index_key in factcache::Keys::index_keys(&tuple) {
            let members = store.smembers(&index_key).await.unwrap();
            assert!(members.contains(key), "{index_key} must contain {key}");
        }
    }
}

/// P7: invalidate then is_warm is false and the master index is empty.
#[tokio::test]
async fn invalidate_then_is_warm_false_and_master_empty() {
    let rows = vec![row("Revenue", 1, Some(1), "monthly", 1)];
    let store = Arc::new(MemoryStore::new());
    let collaborator = Arc::new(FixedCollaborator::new(rows));
    let cache = FactCache::new(store.clone(), collaborator.clone(), collaborator, config()).unwrap();
    cache.warm(11).await.unwrap();

    cache.invalidate(11).await.unwrap();

    assert!(!cache.is_warm(11).await.unwrap());
    let store: Arc<dyn Store> = store;
    let master = factcache::Keys::master_index(11);
    assert_eq!(store.scard(&master).await.unwrap(), 0);
}

#[tokio::test]
async fn batch_query_rejects_mixed_data_sources() {
    let cache = cache_with_rows(vec![row("Revenue", 1, Some(1), "monthly", 1)]);
    let filters = vec![
        Filter::new(1, "Revenue", "monthly"),
        Filter::new(2, "Revenue", "monthly"),
    ];
    let err = cache.batch_query(filters).await.unwrap_err();
    assert!(matches!(err, FactCacheError::InvalidFilter(_)));
}

#[tokio::test]
async fn batch_query_aggregates_by_measure() {
    let rows = vec![
        row("Revenue", 1, Some(1), "monthly", 1),
        row("Visits", 1, Some(1), "monthly", 2),
    ];
    let cache = cache_with_rows(rows);
    cache.warm(20).await.unwrap();

    let filters = vec![Filter::new(20, "Revenue", "monthly"), Filter::new(20, "Visits", "monthly")];
    let out = cache.batch_query(filters).await.unwrap();
    assert_eq!(out.len(), 2);
    assert_eq!(out["Revenue"].len(), 1);
    assert_eq!(out["Visits"].len(), 1);
}

#[tokio::test]
async fn config_error_surfaces_for_disallowed_schema() {
    struct BadSchemaCollaborator;

    #[async_trait]
    impl ConfigService for BadSchemaCollaborator {
        async fn get_data_source_config(&self, _data_source_id: i64) -> Result<DataSourceConfig, FactCacheError> {
            Ok(DataSourceConfig {
                schema: "untrusted".to_string(),
                table: "facts".to_string(),
                column_mapping: ColumnMapping { time_period_field: "month".to_string() },
            })
        }
    }

    #[async_trait]
    impl SourceDatabase for BadSchemaCollaborator {
        async fn fetch_all(&self, _schema: &str, _table: &str) -> Result<Vec<Row>, FactCacheError> {
            Ok(Vec::new())
        }
    }

    let store = Arc::new(MemoryStore::new());
    let collaborator = Arc::new(BadSchemaCollaborator);
    let cache = FactCache::new(store, collaborator.clone(), collaborator, config()).unwrap();

    let err = cache.warm(99).await.unwrap_err();
    assert!(matches!(err, FactCacheError::ConfigError(_)));
}

/// Path C: a tabular data source with no cache entries reports cold.
#[tokio::test]
async fn tabular_stats_report_presence_only() {
    let cache = cache_with_rows(vec![row("Revenue", 1, Some(1), "monthly", 1)]);
    let stats = cache.stats(42, Some(SourceType::Tabular)).await.unwrap();
    assert!(!stats.is_warm);
    assert_eq!(stats.total_entries, 0);
    assert_eq!(stats.unique_measures, 0);
}

/// A token cancelled up front trips the pre-fetch check, the earliest of
/// the three cancellation points `warm_cancellable` threads through.
#[tokio::test]
async fn warm_cancellable_aborts_when_pre_cancelled() {
    let cache = cache_with_rows(vec![row("Revenue", 1, Some(1), "monthly", 1)]);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = cache.warm_cancellable(40, &cancel).await.unwrap_err();
    assert!(matches!(err, FactCacheError::Internal(_)));
    assert!(!cache.is_warm(40).await.unwrap());
}

#[tokio::test]
async fn rows_missing_required_fields_are_dropped_not_counted() {
    let mut incomplete = row("Revenue", 1, Some(1), "monthly", 1);
    incomplete.remove("practice_uid");
    let rows = vec![incomplete, row("Revenue", 2, Some(1), "monthly", 2)];
    let cache = cache_with_rows(rows);

    let result = cache.warm(30).await.unwrap();
    assert_eq!(result.total_rows, 2);
    assert_eq!(result.entries_cached, 1);
    assert_eq!(result.entries_skipped, 0);
}
