//! KV Adapter (spec §4.B): a thin, error-normalizing facade over the
//! key-value store plus the pipelining/SCAN/lock/MGET helpers every
//! component builds on.

#[cfg(feature = "redis")]
pub mod redis;

#[cfg(any(test, feature = "test-util"))]
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::error::FactCacheError;

/// A single queued pipeline operation.
#[derive(Debug, Clone)]
pub enum PipelineOp {
    Set {
        key: String,
        value: Vec<u8>,
        ttl: Option<Duration>,
    },
    Sadd {
        key: String,
        member: String,
    },
    Rename {
        from: String,
        to: String,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
    Del {
        key: String,
    },
}

/// Per-op result inside a pipeline.
#[derive(Debug, Clone)]
pub enum PipelineValue {
    Ok,
    Bool(bool),
}

/// Records operations to be flushed together. Mirrors the builder pattern
/// spec §9 calls for: "a builder that records operations and an `Exec`
/// that returns a slice of (error, value) pairs."
#[derive(Debug, Default)]
pub struct Pipeline {
    ops: Vec<PipelineOp>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: Vec<u8>, ttl: Option<Duration>) -> &mut Self {
        self.ops.push(PipelineOp::Set { key: key.into(), value, ttl });
        self
    }

    pub fn sadd(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.ops.push(PipelineOp::Sadd { key: key.into(), member: member.into() });
        self
    }

    pub fn rename(&mut self, from: impl Into<String>, to: impl Into<String>) -> &mut Self {
        self.ops.push(PipelineOp::Rename { from: from.into(), to: to.into() });
        self
    }

    pub fn expire(&mut self, key: impl Into<String>, ttl: Duration) -> &mut Self {
        self.ops.push(PipelineOp::Expire { key: key.into(), ttl });
        self
    }

    pub fn del(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(PipelineOp::Del { key: key.into() });
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Drains the queued operations, leaving the pipeline empty.
    pub fn take(&mut self) -> Vec<PipelineOp> {
        std::mem::take(&mut self.ops)
    }
}

/// Thin, error-normalizing facade over the key-value store. Implementations
/// (see [`redis::RedisStore`], [`memory::MemoryStore`]) need not retry —
/// spec §4.B: "a store-unavailable condition is reported, never retried
/// inside the adapter; the caller decides."
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, FactCacheError>;

    /// `ttl = None` sets no expiration (shadow keys, per I5).
    async fn set_ex(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), FactCacheError>;

    /// Set-if-absent with expiry, used for the distributed lock.
    async fn set_nx_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, FactCacheError>;

    /// Deletes the given keys (missing keys are not an error). Returns the
    /// number of keys actually removed.
    async fn del(&self, keys: &[String]) -> Result<u64, FactCacheError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, FactCacheError>;

    /// Renames `from` to `to`, overwriting any existing `to`. A missing
    /// `from` is an error.
    async fn rename(&self, from: &str, to: &str) -> Result<(), FactCacheError>;

    /// One SCAN iteration. `cursor = 0` starts a new scan; a returned
    /// cursor of `0` means the scan is complete.
    async fn scan_page(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>), FactCacheError>;

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, FactCacheError>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>, FactCacheError>;

    async fn scard(&self, key: &str) -> Result<u64, FactCacheError>;

    async fn srandmember(&self, key: &str, count: usize) -> Result<Vec<String>, FactCacheError>;

    async fn sinterstore(&self, dest: &str, keys: &[String]) -> Result<u64, FactCacheError>;

    async fn sunionstore(&self, dest: &str, keys: &[String]) -> Result<u64, FactCacheError>;

    /// Chunked MGET is the caller's job (see [`mget_chunked`]); this is the
    /// single-round-trip primitive.
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, FactCacheError>;

    /// Executes queued ops as a single batch. The aggregate `Err` means the
    /// batch itself failed to execute (e.g. connection drop); a per-op
    /// `Err` inside the returned vec means that one operation failed while
    /// the batch otherwise completed — callers MUST inspect both, per
    /// spec §9's pipeline note.
    async fn exec_pipeline(&self, ops: Vec<PipelineOp>) -> Result<Vec<Result<PipelineValue, FactCacheError>>, FactCacheError>;
}

/// Drives repeated `scan_page` calls to completion, enforcing
/// `max_pages` (spec §4.B, §5's "max SCAN pages" ceiling).
pub async fn scan_all(store: &dyn Store, pattern: &str, page_size: usize, max_pages: usize) -> Result<Vec<String>, FactCacheError> {
    let mut cursor = 0u64;
    let mut out = Vec::new();
    let mut pages = 0usize;
    loop {
        let (next, mut keys) = store.scan_page(cursor, pattern, page_size).await?;
        out.append(&mut keys);
        pages += 1;
        if next == 0 {
            break;
        }
        if pages >= max_pages {
            return Err(FactCacheError::ScanCeilingExceeded { pattern: pattern.to_string() });
        }
        cursor = next;
    }
    Ok(out)
}

/// SET NX EX over the lock key (spec §3's distributed lock, §4.B's
/// `AcquireLock`).
pub async fn acquire_lock(store: &dyn Store, key: &str, ttl: Duration) -> Result<bool, FactCacheError> {
    store.set_nx_ex(key, b"1", ttl).await
}

/// `ReleaseLock(key)`.
pub async fn release_lock(store: &dyn Store, key: &str) -> Result<(), FactCacheError> {
    store.del(&[key.to_string()]).await.map(|_| ())
}

/// Splits `keys` into `chunk_size`-sized MGETs, JSON-decodes each non-null
/// value, and skips (logging) malformed ones — spec §4.B's `Mget`.
pub async fn mget_rows(
    store: &dyn Store,
    keys: &[String],
    chunk_size: usize,
) -> Result<Vec<crate::model::Row>, FactCacheError> {
    let mut rows = Vec::new();
    for chunk in keys.chunks(chunk_size.max(1)) {
        let values = store.mget(chunk).await?;
        for (key, value) in chunk.iter().zip(values.into_iter()) {
            let Some(bytes) = value else { continue };
            match serde_json::from_slice::<Vec<crate::model::Row>>(&bytes) {
                Ok(mut blob) => rows.append(&mut blob),
                Err(e) => warn!(key, error = %e, "skipping malformed cache blob"),
            }
        }
    }
    Ok(rows)
}
