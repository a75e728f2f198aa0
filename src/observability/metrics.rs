//! Prometheus counters/histograms for the cache core. Every function is a
//! no-op when the `prometheus` feature is off, so call sites never need a
//! `cfg` of their own.

use std::time::Duration;

#[cfg(feature = "prometheus")]
use metrics::{counter, histogram};

pub fn record_warm(data_source_id: i64, entries_cached: u64, entries_skipped: u64, duration: Duration) {
    #[cfg(feature = "prometheus")]
    {
        let ds = data_source_id.to_string();
        counter!("factcache_warm_total", "data_source_id" => ds.clone()).increment(1);
        counter!("factcache_warm_entries_cached_total", "data_source_id" => ds.clone()).increment(entries_cached);
        counter!("factcache_warm_entries_skipped_total", "data_source_id" => ds.clone()).increment(entries_skipped);
        histogram!("factcache_warm_duration_seconds", "data_source_id" => ds).record(duration.as_secs_f64());
    }
    #[cfg(not(feature = "prometheus"))]
    let _ = (data_source_id, entries_cached, entries_skipped, duration);
}

pub fn record_warm_error(data_source_id: i64) {
    #[cfg(feature = "prometheus")]
    counter!("factcache_warm_errors_total", "data_source_id" => data_source_id.to_string()).increment(1);
    #[cfg(not(feature = "prometheus"))]
    let _ = data_source_id;
}

pub fn record_query(data_source_id: i64, success: bool) {
    #[cfg(feature = "prometheus")]
    {
        let status = if success { "success" } else { "error" };
        counter!("factcache_query_total", "data_source_id" => data_source_id.to_string(), "status" => status).increment(1);
    }
    #[cfg(not(feature = "prometheus"))]
    let _ = (data_source_id, success);
}

pub fn record_invalidate(data_source_id: i64) {
    #[cfg(feature = "prometheus")]
    counter!("factcache_invalidate_total", "data_source_id" => data_source_id.to_string()).increment(1);
    #[cfg(not(feature = "prometheus"))]
    let _ = data_source_id;
}
