use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::FactCacheError;

static TABLE_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]+$").unwrap());

/// Tunable knobs for the cache core (spec §6's configuration table).
///
/// Validated once at construction via [`FactCacheConfig::validate`]; nothing
/// downstream re-checks these values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FactCacheConfig {
    /// TTL applied to production cache and index keys after a swap.
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,

    /// TTL for the warm distributed lock.
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,

    /// Ops per pipeline flush during shadow population and swap.
    #[serde(default = "default_pipeline_batch")]
    pub pipeline_batch: usize,

    /// Keys per MGET during query materialization.
    #[serde(default = "default_mget_batch")]
    pub mget_batch: usize,

    /// Keys per SCAN page.
    #[serde(default = "default_scan_count")]
    pub scan_count: usize,

    /// Safety ceiling on SCAN pages per phase (swap, invalidation, orphan sweep).
    #[serde(default = "default_max_scan_pages")]
    pub max_scan_pages: usize,

    /// Per-blob size cap in bytes; larger groups are skipped during warm.
    #[serde(default = "default_max_entry_bytes")]
    pub max_entry_bytes: usize,

    /// Schema allow-list consulted before composing the warm SELECT.
    #[serde(default)]
    pub allowed_schemas: Vec<String>,

    /// Global key prefix a store-side client may prepend to every key
    /// (spec §4.A, §9's "SCAN prefix handling"). Empty by default; when
    /// set, [`crate::store::redis::RedisStore::with_key_prefix`] applies
    /// it on the wire and strips it back off SCAN results before they
    /// reach the Key Codec.
    #[serde(default)]
    pub key_prefix: String,
}

impl Default for FactCacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_ttl_secs(),
            lock_ttl_secs: default_lock_ttl_secs(),
            pipeline_batch: default_pipeline_batch(),
            mget_batch: default_mget_batch(),
            scan_count: default_scan_count(),
            max_scan_pages: default_max_scan_pages(),
            max_entry_bytes: default_max_entry_bytes(),
            allowed_schemas: Vec::new(),
            key_prefix: String::new(),
        }
    }
}

impl FactCacheConfig {
    pub fn validate(&self) -> std::result::Result<(), FactCacheError> {
        if self.allowed_schemas.is_empty() {
            return Err(FactCacheError::ConfigError(
                "allowed_schemas must not be empty".into(),
            ));
        }
        if self.pipeline_batch == 0 || self.mget_batch == 0 || self.scan_count == 0 {
            return Err(FactCacheError::ConfigError(
                "batch sizes must be greater than 0".into(),
            ));
        }
        if self.max_entry_bytes == 0 {
            return Err(FactCacheError::ConfigError(
                "max_entry_bytes must be greater than 0".into(),
            ));
        }
        if self.key_prefix.contains('{') || self.key_prefix.contains('}') {
            return Err(FactCacheError::ConfigError(
                "key_prefix must not contain '{' or '}' (would break hash-tag parsing)".into(),
            ));
        }
        Ok(())
    }

    /// Validate a schema/table pair against the allow-list and the table
    /// name regex, per spec §4.C step 2. The SELECT statement composed from
    /// these two values has no other defense against injection.
    pub fn validate_source(&self, schema: &str, table: &str) -> std::result::Result<(), FactCacheError> {
        if !self.allowed_schemas.iter().any(|s| s == schema) {
            return Err(FactCacheError::ConfigError(format!(
                "schema '{schema}' is not in the allow-list"
            )));
        }
        if !TABLE_NAME_RE.is_match(table) {
            return Err(FactCacheError::ConfigError(format!(
                "table name '{table}' does not match ^[A-Za-z0-9_]+$"
            )));
        }
        Ok(())
    }

    #[cfg(feature = "cli")]
    pub fn from_toml_str(s: &str) -> std::result::Result<Self, FactCacheError> {
        toml::from_str(s).map_err(|e| FactCacheError::ConfigError(e.to_string()))
    }

    #[cfg(feature = "cli")]
    pub fn from_file(path: &std::path::Path) -> std::result::Result<Self, FactCacheError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| FactCacheError::ConfigError(format!("reading {}: {e}", path.display())))?;
        Self::from_toml_str(&contents)
    }
}

fn default_ttl_secs() -> u64 {
    48 * 3600
}

fn default_lock_ttl_secs() -> u64 {
    300
}

fn default_pipeline_batch() -> usize {
    5000
}

fn default_mget_batch() -> usize {
    10_000
}

fn default_scan_count() -> usize {
    1000
}

fn default_max_scan_pages() -> usize {
    1000
}

fn default_max_entry_bytes() -> usize {
    100 * 1024 * 1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_fails_validation_without_schemas() {
        let cfg = FactCacheConfig::default();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_source_rejects_unlisted_schema() {
        let mut cfg = FactCacheConfig::default();
        cfg.allowed_schemas = vec!["analytics".into()];
        assert!(cfg.validate().is_ok());
        assert!(cfg.validate_source("other", "facts").is_err());
    }

    #[test]
    fn validate_source_rejects_malformed_table() {
        let mut cfg = FactCacheConfig::default();
        cfg.allowed_schemas = vec!["analytics".into()];
        assert!(cfg.validate_source("analytics", "facts; DROP TABLE x").is_err());
        assert!(cfg.validate_source("analytics", "facts").is_ok());
    }

    #[test]
    fn validate_rejects_key_prefix_with_braces() {
        let mut cfg = FactCacheConfig::default();
        cfg.allowed_schemas = vec!["analytics".into()];
        cfg.key_prefix = "gw:{oops}:".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_accepts_plain_key_prefix() {
        let mut cfg = FactCacheConfig::default();
        cfg.allowed_schemas = vec!["analytics".into()];
        cfg.key_prefix = "gw:".into();
        assert!(cfg.validate().is_ok());
    }
}
