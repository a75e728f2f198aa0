//! An indexed secondary-cache layer over an analytics fact table: bulk
//! warming into Redis secondary indexes, index-plan queries, invalidation,
//! and cardinality/memory stats. See `SPEC_FULL.md` for the full contract.

pub mod config;
pub mod error;
pub mod facade;
pub mod invalidator;
pub mod keys;
pub mod model;
pub mod observability;
pub mod query;
pub mod source;
pub mod stats;
pub mod store;
pub mod warmer;

pub use config::FactCacheConfig;
pub use error::{FactCacheError, Result};
pub use facade::FactCache;
pub use invalidator::Invalidator;
pub use keys::Keys;
pub use model::{CacheStats, Filter, Metadata, ProgressUpdate, Row, SourceType, Tuple, WarmResult};
pub use query::QueryEngine;
pub use source::{ColumnMapping, ConfigService, DataSourceConfig, SourceDatabase};
pub use stats::StatsCollector;
pub use store::Store;
pub use warmer::Warmer;

/// Re-exported so callers of [`FactCache::warm_cancellable`] don't need a
/// direct `tokio-util` dependency just to build a token.
pub use tokio_util::sync::CancellationToken;

#[cfg(any(test, feature = "test-util"))]
pub use store::memory::MemoryStore;

#[cfg(feature = "redis")]
pub use store::redis::RedisStore;
