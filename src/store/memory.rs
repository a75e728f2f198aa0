//! In-process [`Store`] double backed by `DashMap`. Supports the full
//! surface `RedisStore` does, including SCAN-cursor emulation and set
//! algebra, so the crate's own test suite (and downstream crates, behind
//! the `test-util` feature) can exercise [`crate::FactCache`] without a
//! live Redis — grounded in the teacher's `MemoryCache`.

use std::{
    collections::HashSet,
    sync::Mutex,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{PipelineOp, PipelineValue, Store};
use crate::error::FactCacheError;

enum Slot {
    Bytes(Vec<u8>),
    Set(HashSet<String>),
}

struct Entry {
    slot: Slot,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| Instant::now() > exp)
    }
}

/// Matches a Redis-style glob pattern containing only `*` wildcards —
/// the only wildcard the Key Codec ever emits. Literal segments must
/// appear in order; the first/last segment is anchored to the start/end
/// of `text` unless the pattern itself starts/ends with `*`.
fn glob_match(pattern: &str, text: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == text;
    }

    let anchored_start = !pattern.starts_with('*');
    let anchored_end = !pattern.ends_with('*');
    let segments: Vec<&str> = pattern.split('*').filter(|s| !s.is_empty()).collect();
    let last_idx = segments.len().saturating_sub(1);

    let mut rest = text;
    for (i, seg) in segments.iter().enumerate() {
        if i == 0 && anchored_start {
            if !rest.starts_with(seg) {
                return false;
            }
            rest = &rest[seg.len()..];
        } else if i == last_idx && anchored_end {
            if !rest.ends_with(seg) {
                return false;
            }
            rest = &rest[..rest.len() - seg.len()];
        } else {
            match rest.find(seg) {
                Some(pos) => rest = &rest[pos + seg.len()..],
                None => return false,
            }
        }
    }
    true
}

pub struct MemoryStore {
    data: DashMap<String, Entry>,
    // Guards rename's remove-then-insert so it reads atomically from the
    // caller's perspective even though DashMap's own locking is per-key.
    rename_lock: Mutex<()>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
            rename_lock: Mutex::new(()),
        }
    }

    fn live_bytes(&self, key: &str) -> Option<Vec<u8>> {
        let entry = self.data.get(key)?;
        if entry.is_expired() {
            return None;
        }
        match &entry.slot {
            Slot::Bytes(b) => Some(b.clone()),
            Slot::Set(_) => None,
        }
    }

    fn live_set(&self, key: &str) -> HashSet<String> {
        match self.data.get(key) {
            Some(entry) if !entry.is_expired() => match &entry.slot {
                Slot::Set(s) => s.clone(),
                Slot::Bytes(_) => HashSet::new(),
            },
            _ => HashSet::new(),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, FactCacheError> {
        Ok(self.live_bytes(key))
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), FactCacheError> {
        self.data.insert(
            key.to_string(),
            Entry {
                slot: Slot::Bytes(value.to_vec()),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, FactCacheError> {
        use dashmap::mapref::entry::Entry as DEntry;
        match self.data.entry(key.to_string()) {
            DEntry::Occupied(mut e) if e.get().is_expired() => {
                e.insert(Entry {
                    slot: Slot::Bytes(value.to_vec()),
                    expires_at: Some(Instant::now() + ttl),
                });
                Ok(true)
            }
            DEntry::Occupied(_) => Ok(false),
            DEntry::Vacant(e) => {
                e.insert(Entry {
                    slot: Slot::Bytes(value.to_vec()),
                    expires_at: Some(Instant::now() + ttl),
                });
                Ok(true)
            }
        }
    }

    async fn del(&self, keys: &[String]) -> Result<u64, FactCacheError> {
        let mut count = 0u64;
        for key in keys {
            if self.data.remove(key).is_some() {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, FactCacheError> {
        if let Some(mut entry) = self.data.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), FactCacheError> {
        let _guard = self.rename_lock.lock().unwrap();
        let Some((_, entry)) = self.data.remove(from) else {
            return Err(FactCacheError::StoreUnavailable(format!("rename: no such key {from}")));
        };
        self.data.insert(to.to_string(), entry);
        Ok(())
    }

    async fn scan_page(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>), FactCacheError> {
        let mut matching: Vec<String> = self
            .data
            .iter()
            .filter(|e| !e.is_expired())
            .map(|e| e.key().clone())
            .filter(|k| glob_match(pattern, k))
            .collect();
        matching.sort();

        let start = cursor as usize;
        if start >= matching.len() {
            return Ok((0, Vec::new()));
        }
        let end = (start + count).min(matching.len());
        let page = matching[start..end].to_vec();
        let next_cursor = if end >= matching.len() { 0 } else { end as u64 };
        Ok((next_cursor, page))
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, FactCacheError> {
        use dashmap::mapref::entry::Entry as DEntry;
        match self.data.entry(key.to_string()) {
            DEntry::Occupied(mut e) => {
                if e.get().is_expired() {
                    let mut members = HashSet::new();
                    members.insert(member.to_string());
                    e.insert(Entry { slot: Slot::Set(members), expires_at: None });
                    Ok(true)
                } else {
                    match &mut e.get_mut().slot {
                        Slot::Set(members) => Ok(members.insert(member.to_string())),
                        Slot::Bytes(_) => Err(FactCacheError::Internal(format!("{key} is not a set"))),
                    }
                }
            }
            DEntry::Vacant(e) => {
                let mut members = HashSet::new();
                members.insert(member.to_string());
                e.insert(Entry { slot: Slot::Set(members), expires_at: None });
                Ok(true)
            }
        }
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, FactCacheError> {
        Ok(self.live_set(key).into_iter().collect())
    }

    async fn scard(&self, key: &str) -> Result<u64, FactCacheError> {
        Ok(self.live_set(key).len() as u64)
    }

    async fn srandmember(&self, key: &str, count: usize) -> Result<Vec<String>, FactCacheError> {
        use rand::seq::IteratorRandom;
        let set = self.live_set(key);
        let mut rng = rand::thread_rng();
        Ok(set.into_iter().choose_multiple(&mut rng, count))
    }

    async fn sinterstore(&self, dest: &str, keys: &[String]) -> Result<u64, FactCacheError> {
        let mut result: Option<HashSet<String>> = None;
        for key in keys {
            let set = self.live_set(key);
            result = Some(match result {
                None => set,
                Some(acc) => acc.intersection(&set).cloned().collect(),
            });
        }
        let result = result.unwrap_or_default();
        let len = result.len() as u64;
        self.data.insert(dest.to_string(), Entry { slot: Slot::Set(result), expires_at: None });
        Ok(len)
    }

    async fn sunionstore(&self, dest: &str, keys: &[String]) -> Result<u64, FactCacheError> {
        let mut result = HashSet::new();
        for key in keys {
            result.extend(self.live_set(key));
        }
        let len = result.len() as u64;
        self.data.insert(dest.to_string(), Entry { slot: Slot::Set(result), expires_at: None });
        Ok(len)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, FactCacheError> {
        Ok(keys.iter().map(|k| self.live_bytes(k)).collect())
    }

    async fn exec_pipeline(&self, ops: Vec<PipelineOp>) -> Result<Vec<Result<PipelineValue, FactCacheError>>, FactCacheError> {
        let mut out = Vec::with_capacity(ops.len());
        for op in ops {
            let result = match op {
                PipelineOp::Set { key, value, ttl } => self.set_ex(&key, &value, ttl).await.map(|_| PipelineValue::Ok),
                PipelineOp::Sadd { key, member } => self.sadd(&key, &member).await.map(PipelineValue::Bool),
                PipelineOp::Rename { from, to } => self.rename(&from, &to).await.map(|_| PipelineValue::Ok),
                PipelineOp::Expire { key, ttl } => self.expire(&key, ttl).await.map(PipelineValue::Bool),
                PipelineOp::Del { key } => self.del(&[key]).await.map(|n| PipelineValue::Bool(n > 0)),
            };
            out.push(result);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matches_leading_and_trailing_wildcard() {
        assert!(glob_match("*idx:{ds:1}:*", "prefix:idx:{ds:1}:master"));
        assert!(glob_match("*idx:{ds:1}:*", "idx:{ds:1}:master"));
        assert!(!glob_match("*idx:{ds:1}:*", "idx:{ds:2}:master"));
    }

    #[tokio::test]
    async fn get_set_round_trip() {
        let store = MemoryStore::new();
        store.set_ex("k", b"v", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn set_nx_ex_respects_existing_key() {
        let store = MemoryStore::new();
        assert!(store.set_nx_ex("lock", b"1", Duration::from_secs(5)).await.unwrap());
        assert!(!store.set_nx_ex("lock", b"1", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn rename_moves_value_and_drops_source() {
        let store = MemoryStore::new();
        store.set_ex("a", b"v", None).await.unwrap();
        store.rename("a", "b").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(store.get("b").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn sinterstore_and_sunionstore() {
        let store = MemoryStore::new();
        store.sadd("s1", "a").await.unwrap();
        store.sadd("s1", "b").await.unwrap();
        store.sadd("s2", "b").await.unwrap();
        store.sadd("s2", "c").await.unwrap();

        store.sinterstore("inter", &["s1".into(), "s2".into()]).await.unwrap();
        let mut inter = store.smembers("inter").await.unwrap();
        inter.sort();
        assert_eq!(inter, vec!["b".to_string()]);

        store.sunionstore("union", &["s1".into(), "s2".into()]).await.unwrap();
        let mut union = store.smembers("union").await.unwrap();
        union.sort();
        assert_eq!(union, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn scan_page_paginates_matching_keys() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.set_ex(&format!("cache:{{ds:1}}:m:M:p:{i}:prov:*:freq:monthly"), b"v", None).await.unwrap();
        }
        let mut seen = Vec::new();
        let mut cursor = 0;
        loop {
            let (next, keys) = store.scan_page(cursor, "*cache:{ds:1}:*", 2).await.unwrap();
            seen.extend(keys);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        assert_eq!(seen.len(), 5);
    }
}
