//! Storage configuration
//!
//! Layered the usual way: built-in defaults, then an optional TOML file,
//! then `STREAMBLOB__*` environment variables (`STREAMBLOB__PAGE_SIZE=4096`,
//! `STREAMBLOB__STRATEGY__KIND=exact_fit`, ...).
//!
//! ```toml
//! page_size = 65536
//! backend = "lock_free"
//! reclaim = "free_list"
//!
//! [strategy]
//! kind = "percent_slack"
//! min_capacity = 64
//! percent_on_top = 30
//! ```

use crate::error::{Error, Result};
use crate::storage::blob::strategy::StrategyConfig;
use crate::storage::blob::record::MAX_RECORD_CAPACITY;
use crate::storage::paged::validate_page_size;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Prefix of environment variables overriding configuration keys
pub const ENV_PREFIX: &str = "STREAMBLOB";

/// Which paged storage backend to open the file with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Mutex,
    LockFree,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Mutex => write!(f, "mutex"),
            BackendKind::LockFree => write!(f, "lock_free"),
        }
    }
}

/// What happens to the space of deleted records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReclaimPolicy {
    /// Deleted slots stay dead until the storage is compacted
    #[default]
    CompactionOnly,
    /// Deleted slots go to a free list and are reused best-fit
    FreeList,
}

/// Configuration of a blob storage file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Page size of the paged file (power of two)
    pub page_size: usize,
    /// Paged storage backend
    pub backend: BackendKind,
    /// Capacity policy for new and relocated records
    pub strategy: StrategyConfig,
    /// Reuse policy for deleted slots
    pub reclaim: ReclaimPolicy,
    /// Number of per-record lock stripes
    pub lock_stripes: usize,
    /// Longest MOVED chain followed before reporting corruption
    pub max_chain_hops: usize,
    /// Upper bound on a single record's capacity
    pub max_record_capacity: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            page_size: 64 * 1024,
            backend: BackendKind::default(),
            strategy: StrategyConfig::default(),
            reclaim: ReclaimPolicy::default(),
            lock_stripes: 64,
            max_chain_hops: 16,
            max_record_capacity: MAX_RECORD_CAPACITY,
        }
    }
}

impl StorageConfig {
    /// Load defaults, then `path` (if any), then environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = config::Config::try_from(&StorageConfig::default())
            .map_err(|e| Error::Config(format!("Failed to build defaults: {}", e)))?;

        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let loaded: StorageConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::Config(format!("Failed to load configuration: {}", e)))?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Parse a TOML document on top of the defaults
    pub fn from_toml(text: &str) -> Result<Self> {
        let parsed: StorageConfig = toml::from_str(text)
            .map_err(|e| Error::Config(format!("Invalid TOML configuration: {}", e)))?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to render configuration: {}", e)))
    }

    /// Check every field for a usable value
    pub fn validate(&self) -> Result<()> {
        validate_page_size(self.page_size)?;
        if self.lock_stripes == 0 {
            return Err(Error::Config("lock_stripes must be at least 1".to_string()));
        }
        if self.max_chain_hops == 0 {
            return Err(Error::Config("max_chain_hops must be at least 1".to_string()));
        }
        if self.max_record_capacity == 0 {
            return Err(Error::Config(
                "max_record_capacity must be at least 1".to_string(),
            ));
        }
        self.strategy.validate()
    }

    /// Builder-style helpers, mostly for tests and embedding
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_strategy(mut self, strategy: StrategyConfig) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_reclaim(mut self, reclaim: ReclaimPolicy) -> Self {
        self.reclaim = reclaim;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = StorageConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.backend, BackendKind::Mutex);
        assert_eq!(config.reclaim, ReclaimPolicy::CompactionOnly);
    }

    #[test]
    fn test_from_toml_partial() -> Result<()> {
        let config = StorageConfig::from_toml(
            r#"
            page_size = 4096
            backend = "lock_free"

            [strategy]
            kind = "exact_fit"
            "#,
        )?;
        assert_eq!(config.page_size, 4096);
        assert_eq!(config.backend, BackendKind::LockFree);
        assert_eq!(config.strategy, StrategyConfig::ExactFit);
        assert_eq!(config.lock_stripes, 64);
        Ok(())
    }

    #[test]
    fn test_toml_roundtrip() -> Result<()> {
        let config = StorageConfig::default()
            .with_backend(BackendKind::LockFree)
            .with_reclaim(ReclaimPolicy::FreeList);
        let text = config.to_toml()?;
        assert_eq!(StorageConfig::from_toml(&text)?, config);
        Ok(())
    }

    #[test]
    fn test_load_from_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("streamblob.toml");
        std::fs::write(
            &path,
            "page_size = 1024\nreclaim = \"free_list\"\n[strategy]\nkind = \"power_of_two\"\nmin_capacity = 32\n",
        )?;

        let config = StorageConfig::load(Some(&path))?;
        assert_eq!(config.page_size, 1024);
        assert_eq!(config.reclaim, ReclaimPolicy::FreeList);
        assert_eq!(
            config.strategy,
            StrategyConfig::PowerOfTwo { min_capacity: 32 }
        );
        Ok(())
    }

    #[test]
    fn test_rejects_bad_page_size() {
        let result = StorageConfig::from_toml("page_size = 1000");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_zero_stripes() {
        let config = StorageConfig {
            lock_stripes: 0,
            ..StorageConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
