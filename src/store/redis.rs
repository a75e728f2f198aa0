use std::time::Duration;

use async_trait::async_trait;
use redis::{AsyncCommands, RedisError, Value, aio::MultiplexedConnection};
use tracing::warn;

use super::{PipelineOp, PipelineValue, Store};
use crate::error::FactCacheError;

/// Redis-backed [`Store`]. Wraps a single standalone `redis::Client`; a
/// cluster-aware variant is deferred (see `DESIGN.md` OQ-1) — the Key
/// Codec already produces hash-tagged keys so adding one later touches
/// only this file.
pub struct RedisStore {
    client: redis::Client,
    key_prefix: String,
}

impl RedisStore {
    pub fn new(url: &str) -> Result<Self, FactCacheError> {
        Self::with_key_prefix(url, String::new())
    }

    /// Wraps every key on the wire with `key_prefix` (rejected if it
    /// contains `{`/`}` by [`crate::config::FactCacheConfig::validate`]).
    /// SCAN results are stripped back to logical keys before they reach
    /// the Key Codec, so callers above this module never see the prefix.
    pub fn with_key_prefix(url: &str, key_prefix: String) -> Result<Self, FactCacheError> {
        let client = redis::Client::open(url)?;
        Ok(Self { client, key_prefix })
    }

    async fn conn(&self) -> Result<MultiplexedConnection, FactCacheError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    fn prefixed(&self, key: &str) -> String {
        if self.key_prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}", self.key_prefix, key)
        }
    }

    fn prefixed_all(&self, keys: &[String]) -> Vec<String> {
        keys.iter().map(|k| self.prefixed(k)).collect()
    }

    fn unprefixed(&self, key: String) -> String {
        if self.key_prefix.is_empty() {
            key
        } else {
            key.strip_prefix(self.key_prefix.as_str())
                .map(str::to_string)
                .unwrap_or(key)
        }
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, FactCacheError> {
        let mut conn = self.conn().await?;
        Ok(conn.get(self.prefixed(key)).await?)
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), FactCacheError> {
        let mut conn = self.conn().await?;
        let key = self.prefixed(key);
        match ttl {
            Some(ttl) => {
                let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, FactCacheError> {
        let mut conn = self.conn().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.prefixed(key))
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn del(&self, keys: &[String]) -> Result<u64, FactCacheError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        Ok(conn.del(self.prefixed_all(keys)).await?)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, FactCacheError> {
        let mut conn = self.conn().await?;
        Ok(conn.expire(self.prefixed(key), ttl.as_secs().max(1) as i64).await?)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), FactCacheError> {
        let mut conn = self.conn().await?;
        let _: () = conn.rename(self.prefixed(from), self.prefixed(to)).await?;
        Ok(())
    }

    async fn scan_page(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>), FactCacheError> {
        let mut conn = self.conn().await?;
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(self.prefixed(pattern))
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;
        Ok((next, keys.into_iter().map(|k| self.unprefixed(k)).collect()))
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, FactCacheError> {
        let mut conn = self.conn().await?;
        let added: i64 = conn.sadd(self.prefixed(key), member).await?;
        Ok(added > 0)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, FactCacheError> {
        let mut conn = self.conn().await?;
        Ok(conn.smembers(self.prefixed(key)).await?)
    }

    async fn scard(&self, key: &str) -> Result<u64, FactCacheError> {
        let mut conn = self.conn().await?;
        Ok(conn.scard(self.prefixed(key)).await?)
    }

    async fn srandmember(&self, key: &str, count: usize) -> Result<Vec<String>, FactCacheError> {
        let mut conn = self.conn().await?;
        Ok(redis::cmd("SRANDMEMBER")
            .arg(self.prefixed(key))
            .arg(count)
            .query_async(&mut conn)
            .await?)
    }

    async fn sinterstore(&self, dest: &str, keys: &[String]) -> Result<u64, FactCacheError> {
        let mut conn = self.conn().await?;
        Ok(conn.sinterstore(self.prefixed(dest), self.prefixed_all(keys)).await?)
    }

    async fn sunionstore(&self, dest: &str, keys: &[String]) -> Result<u64, FactCacheError> {
        let mut conn = self.conn().await?;
        Ok(conn.sunionstore(self.prefixed(dest), self.prefixed_all(keys)).await?)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, FactCacheError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        Ok(conn.mget(self.prefixed_all(keys)).await?)
    }

    async fn exec_pipeline(&self, ops: Vec<PipelineOp>) -> Result<Vec<Result<PipelineValue, FactCacheError>>, FactCacheError> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        for op in &ops {
            match op {
                PipelineOp::Set { key, value, ttl } => {
                    let key = self.prefixed(key);
                    if let Some(ttl) = ttl {
                        pipe.cmd("SET").arg(key).arg(value).arg("EX").arg(ttl.as_secs().max(1));
                    } else {
                        pipe.cmd("SET").arg(key).arg(value);
                    }
                }
                PipelineOp::Sadd { key, member } => {
                    pipe.cmd("SADD").arg(self.prefixed(key)).arg(member);
                }
                PipelineOp::Rename { from, to } => {
                    pipe.cmd("RENAME").arg(self.prefixed(from)).arg(self.prefixed(to));
                }
                PipelineOp::Expire { key, ttl } => {
                    pipe.cmd("EXPIRE").arg(self.prefixed(key)).arg(ttl.as_secs().max(1));
                }
                PipelineOp::Del { key } => {
                    pipe.cmd("DEL").arg(self.prefixed(key));
                }
            }
        }

        // A non-transactional pipe aborts reply parsing with a single
        // aggregate `Err` on the first command-level failure (e.g. WRONGTYPE)
        // rather than surfacing it inline in the reply vec, so genuine
        // per-op granularity is only available from `MemoryStore`. We
        // distinguish connection-level failures (true abort) from
        // command-level ones, which we conservatively fail the whole batch
        // for — callers already treat any `failed > 0` as abort-worthy.
        let replies: Vec<Value> = match pipe.query_async(&mut conn).await {
            Ok(replies) => replies,
            Err(e) => {
                if is_connection_error(&e) {
                    return Err(FactCacheError::StoreUnavailable(e.to_string()));
                }
                warn!(
                    error = %e,
                    ops = ops.len(),
                    "pipeline command-level error, redis-rs can't attribute it to a single op; failing entire batch"
                );
                return Ok(ops
                    .iter()
                    .map(|_| Err(FactCacheError::StoreUnavailable(e.to_string())))
                    .collect());
            }
        };

        Ok(ops
            .iter()
            .zip(replies)
            .map(|(op, value)| match (op, value) {
                (_, Value::Okay) => Ok(PipelineValue::Ok),
                (_, Value::Nil) => Ok(PipelineValue::Ok),
                (_, Value::Int(n)) => Ok(PipelineValue::Bool(n > 0)),
                (op, other) => Err(FactCacheError::StoreUnavailable(format!(
                    "unexpected pipeline reply for {op:?}: {other:?}"
                ))),
            })
            .collect())
    }
}

fn is_connection_error(e: &RedisError) -> bool {
    e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
}
