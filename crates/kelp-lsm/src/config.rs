use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_COLUMN_FAMILY_NAME: &str = "default";

/// Engine configuration, supplied at open time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Column families in handle order. Names must be unique.
    pub column_families: Vec<ColumnFamilyDescriptor>,

    /// Space budget for all table files in bytes (default: 0 = unlimited)
    pub max_allowed_space: u64,

    /// Lifetime of a space reservation before it is force-released
    /// (default: 60_000 ms)
    pub reservation_timeout_ms: u64,

    /// Create missing storage directories (default: true)
    pub create_if_missing: bool,

    /// Write buffer configuration
    pub memtable: MemtableConfig,
}

/// One column family: a name plus its ordered storage paths.
/// The first path is the primary one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnFamilyDescriptor {
    pub name: String,
    pub paths: Vec<StoragePathConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoragePathConfig {
    pub path: PathBuf,

    /// Advisory cap used when placing new tables (0 = unset)
    pub target_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemtableConfig {
    /// Flush a column family once its buffer reaches this many bytes
    /// (default: 64 MiB, 0 = manual flushes only)
    pub flush_trigger_bytes: usize,
}

/// Per-write options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WriteOptions {
    /// Skip the write-ahead log (faster, weaker durability)
    pub disable_wal: bool,
}

impl ColumnFamilyDescriptor {
    /// Descriptor with a single path and no target size.
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            paths: vec![StoragePathConfig::new(path, 0)],
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>, target_size: u64) -> Self {
        self.paths.push(StoragePathConfig::new(path, target_size));
        self
    }
}

impl StoragePathConfig {
    pub fn new(path: impl Into<PathBuf>, target_size: u64) -> Self {
        Self {
            path: path.into(),
            target_size,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            column_families: vec![ColumnFamilyDescriptor::new(
                DEFAULT_COLUMN_FAMILY_NAME,
                "data",
            )],
            max_allowed_space: 0,
            reservation_timeout_ms: 60_000,
            create_if_missing: true,
            memtable: MemtableConfig::default(),
        }
    }
}

impl Default for MemtableConfig {
    fn default() -> Self {
        Self {
            flush_trigger_bytes: 64 * 1024 * 1024, // 64 MiB
        }
    }
}

impl EngineConfig {
    /// Config with one column family per `(name, dir)` pair.
    pub fn with_column_families<I, N, P>(families: I) -> Self
    where
        I: IntoIterator<Item = (N, P)>,
        N: Into<String>,
        P: Into<PathBuf>,
    {
        Self {
            column_families: families
                .into_iter()
                .map(|(name, path)| ColumnFamilyDescriptor::new(name, path))
                .collect(),
            ..Default::default()
        }
    }

    pub fn reservation_timeout(&self) -> Duration {
        Duration::from_millis(self.reservation_timeout_ms)
    }

    /// Validates the configuration and returns an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.column_families.is_empty() {
            return Err(Error::Config(
                "at least one column family is required".to_string(),
            ));
        }

        let mut names = HashSet::new();
        let mut dirs = HashSet::new();
        for cf in &self.column_families {
            if cf.name.is_empty() {
                return Err(Error::Config("column family name must not be empty".to_string()));
            }
            if !names.insert(cf.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate column family name: {}",
                    cf.name
                )));
            }
            if cf.paths.is_empty() {
                return Err(Error::Config(format!(
                    "column family {} has no storage paths",
                    cf.name
                )));
            }
            for p in &cf.paths {
                if !dirs.insert(p.path.as_path()) {
                    return Err(Error::Config(format!(
                        "storage path {} used more than once",
                        p.path.display()
                    )));
                }
            }
        }

        if self.reservation_timeout_ms == 0 {
            return Err(Error::Config("reservation_timeout_ms must be > 0".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_allowed_space, 0);
        assert_eq!(config.reservation_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let config = EngineConfig::with_column_families([("default", "/a"), ("default", "/b")]);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_shared_directory_rejected() {
        let config = EngineConfig::with_column_families([("default", "/a"), ("1", "/a")]);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_missing_paths_rejected() {
        let mut config = EngineConfig::default();
        config.column_families[0].paths.clear();
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.column_families.clear();
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.column_families[0].name.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = EngineConfig::default();
        config.reservation_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_descriptor_builder() {
        let cf = ColumnFamilyDescriptor::new("1", "/p0").with_path("/p1", 1 << 20);
        assert_eq!(cf.paths.len(), 2);
        assert_eq!(cf.paths[0].target_size, 0);
        assert_eq!(cf.paths[1], StoragePathConfig::new("/p1", 1 << 20));
    }
}
