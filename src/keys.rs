//! Pure functions that encode and parse cache keys, index keys, shadow
//! keys, and SCAN patterns from a [`Tuple`]. Nothing in this module talks
//! to a store.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::{
    error::FactCacheError,
    model::{PartialTuple, Tuple},
};

const PROVIDER_WILDCARD: &str = "*";

/// Rejects a measure/frequency component that would corrupt key parsing.
fn validate_component(value: &str) -> Result<(), FactCacheError> {
    if value.contains(':') || value.contains('{') || value.contains('}') {
        return Err(FactCacheError::InvalidFilter(format!(
            "component '{value}' must not contain ':', '{{', or '}}'"
        )));
    }
    Ok(())
}

fn provider_component(provider_uid: Option<i64>) -> String {
    match provider_uid {
        Some(v) => v.to_string(),
        None => PROVIDER_WILDCARD.to_string(),
    }
}

fn parse_provider_component(s: &str) -> Option<Option<i64>> {
    if s == PROVIDER_WILDCARD {
        Some(None)
    } else {
        s.parse::<i64>().ok().map(Some)
    }
}

/// Which temp-key operation produced a given temporary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TempOp {
    Union,
    Intersect,
    Result,
}

impl TempOp {
    fn as_str(self) -> &'static str {
        match self {
            TempOp::Union => "union",
            TempOp::Intersect => "intersect",
            TempOp::Result => "result",
        }
    }
}

/// Pure key-builder functions, grouped as associated functions on a unit
/// struct so call sites read `Keys::cache_key(&t)`.
pub struct Keys;

impl Keys {
    pub fn validate_tuple(t: &Tuple) -> Result<(), FactCacheError> {
        validate_component(&t.measure)?;
        validate_component(&t.frequency)?;
        Ok(())
    }

    /// `cache:{ds:D}:m:M:p:P:prov:V:freq:F`
    pub fn cache_key(t: &Tuple) -> String {
        format!(
            "cache:{{ds:{}}}:m:{}:p:{}:prov:{}:freq:{}",
            t.data_source_id,
            t.measure,
            t.practice_uid,
            provider_component(t.provider_uid),
            t.frequency,
        )
    }

    /// The five index keys that must contain `CacheKey(t)` after a warm.
    pub fn index_keys(t: &Tuple) -> [String; 5] {
        [
            Self::master_index(t.data_source_id),
            Self::base_index(t.data_source_id, &t.measure, &t.frequency),
            Self::practice_index(t.data_source_id, &t.measure, t.practice_uid, &t.frequency),
            Self::provider_index(t.data_source_id, &t.measure, &t.frequency, t.provider_uid),
            Self::full_index(t),
        ]
    }

    /// `idx:{ds:D}:master`
    pub fn master_index(data_source_id: i64) -> String {
        format!("idx:{{ds:{data_source_id}}}:master")
    }

    /// `cache:meta:{ds:D}:last_warm`
    pub fn metadata_key(data_source_id: i64) -> String {
        format!("cache:meta:{{ds:{data_source_id}}}:last_warm")
    }

    /// `idx:{ds:D}:m:M:freq:F`
    pub fn base_index(data_source_id: i64, measure: &str, frequency: &str) -> String {
        format!("idx:{{ds:{data_source_id}}}:m:{measure}:freq:{frequency}")
    }

    /// `idx:{ds:D}:m:M:p:P:freq:F`
    pub fn practice_index(data_source_id: i64, measure: &str, practice_uid: i64, frequency: &str) -> String {
        format!("idx:{{ds:{data_source_id}}}:m:{measure}:p:{practice_uid}:freq:{frequency}")
    }

    /// `idx:{ds:D}:m:M:freq:F:prov:V`
    pub fn provider_index(data_source_id: i64, measure: &str, frequency: &str, provider_uid: Option<i64>) -> String {
        format!(
            "idx:{{ds:{data_source_id}}}:m:{measure}:freq:{frequency}:prov:{}",
            provider_component(provider_uid)
        )
    }

    /// `idx:{ds:D}:m:M:p:P:prov:V:freq:F` — maintained but unused by the
    /// current query plan (spec §3).
    pub fn full_index(t: &Tuple) -> String {
        format!(
            "idx:{{ds:{}}}:m:{}:p:{}:prov:{}:freq:{}",
            t.data_source_id,
            t.measure,
            t.practice_uid,
            provider_component(t.provider_uid),
            t.frequency,
        )
    }

    /// SCAN pattern matching every index key for a data source. A leading
    /// `*` guards against a store-side global key prefix swallowing the
    /// literal match (spec §4.A).
    pub fn index_pattern(data_source_id: i64) -> String {
        format!("*idx:{{ds:{data_source_id}}}:*")
    }

    /// `temp:{ds:D}:<union|intersect|result>:<monotonic>:<random>`
    pub fn temp_key(data_source_id: i64, op: TempOp) -> String {
        let monotonic = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let suffix: u32 = rand::random();
        format!("temp:{{ds:{data_source_id}}}:{}:{monotonic}:{suffix}", op.as_str())
    }

    /// `lock:cache:warm:{ds:D}`
    pub fn lock_key(data_source_id: i64) -> String {
        format!("lock:cache:warm:{{ds:{data_source_id}}}")
    }

    /// `shadow:{ds:D}:m:M:p:P:prov:V:freq:F` — identical suffix to
    /// [`Keys::cache_key`], `cache:` swapped for `shadow:`.
    pub fn shadow_cache_key(t: &Tuple) -> String {
        format!("shadow:{}", &Self::cache_key(t)["cache:".len()..])
    }

    /// The five shadow index keys, `idx:` swapped for `shadow_idx:`.
    pub fn shadow_index_keys(t: &Tuple) -> [String; 5] {
        Self::index_keys(t).map(|k| format!("shadow_idx:{}", &k["idx:".len()..]))
    }

    pub fn shadow_cache_pattern(data_source_id: i64) -> String {
        format!("*shadow:{{ds:{data_source_id}}}:*")
    }

    pub fn shadow_index_pattern(data_source_id: i64) -> String {
        format!("*shadow_idx:{{ds:{data_source_id}}}:*")
    }

    /// `ParseCacheKey(CacheKey(t)) == t` for all legal `t` (spec P6).
    pub fn parse_cache_key(key: &str) -> Option<Tuple> {
        static RE: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"^cache:\{ds:(-?\d+)\}:m:([^:{}]+):p:(-?\d+):prov:(\*|-?\d+):freq:([^:{}]+)$").unwrap()
        });
        let caps = RE.captures(key)?;
        Some(Tuple {
            data_source_id: caps[1].parse().ok()?,
            measure: caps[2].to_string(),
            practice_uid: caps[3].parse().ok()?,
            provider_uid: parse_provider_component(&caps[4])?,
            frequency: caps[5].to_string(),
        })
    }

    /// Best-effort recovery of whichever fields an index key encodes.
    pub fn parse_index_key(key: &str) -> Option<PartialTuple> {
        static MASTER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^idx:\{ds:(-?\d+)\}:master$").unwrap());
        static FULL: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"^idx:\{ds:(-?\d+)\}:m:([^:{}]+):p:(-?\d+):prov:(\*|-?\d+):freq:([^:{}]+)$").unwrap()
        });
        static PROVIDER: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"^idx:\{ds:(-?\d+)\}:m:([^:{}]+):freq:([^:{}]+):prov:(\*|-?\d+)$").unwrap()
        });
        static PRACTICE: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"^idx:\{ds:(-?\d+)\}:m:([^:{}]+):p:(-?\d+):freq:([^:{}]+)$").unwrap()
        });
        static BASE: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"^idx:\{ds:(-?\d+)\}:m:([^:{}]+):freq:([^:{}]+)$").unwrap());

        if let Some(caps) = MASTER.captures(key) {
            return Some(PartialTuple {
                data_source_id: caps[1].parse().ok()?,
                ..Default::default()
            });
        }
        if let Some(caps) = FULL.captures(key) {
            return Some(PartialTuple {
                data_source_id: caps[1].parse().ok()?,
                measure: Some(caps[2].to_string()),
                practice_uid: caps[3].parse().ok(),
                provider_uid: parse_provider_component(&caps[4])?,
                frequency: Some(caps[5].to_string()),
            });
        }
        if let Some(caps) = PROVIDER.captures(key) {
            return Some(PartialTuple {
                data_source_id: caps[1].parse().ok()?,
                measure: Some(caps[2].to_string()),
                frequency: Some(caps[3].to_string()),
                provider_uid: parse_provider_component(&caps[4])?,
                practice_uid: None,
            });
        }
        if let Some(caps) = PRACTICE.captures(key) {
            return Some(PartialTuple {
                data_source_id: caps[1].parse().ok()?,
                measure: Some(caps[2].to_string()),
                practice_uid: caps[3].parse().ok(),
                frequency: Some(caps[4].to_string()),
                provider_uid: None,
            });
        }
        if let Some(caps) = BASE.captures(key) {
            return Some(PartialTuple {
                data_source_id: caps[1].parse().ok()?,
                measure: Some(caps[2].to_string()),
                frequency: Some(caps[3].to_string()),
                ..Default::default()
            });
        }
        None
    }
}
