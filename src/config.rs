use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{DbError, DbResult};

pub const DEFAULT_PAGE_SIZE: usize = 4096;
pub const DEFAULT_POOL_SIZE: usize = 128;
pub const DEFAULT_SHARD_COUNT: usize = 16;
pub const DEFAULT_STRIPE_COUNT: usize = 64;
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5000;

/// Configuration for a [`crate::DatabaseManager`]. Passed by value, no
/// process-wide state.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Directory holding one paged file per database (`<name>.db`).
    pub data_dir: PathBuf,
    /// Page size in bytes, fixed for the lifetime of every file created
    /// with this configuration.
    pub page_size: usize,
    /// Total buffer pool frames.
    pub pool_size: usize,
    /// Buffer pool shards, power of two.
    pub shard_count: usize,
    /// Lock table stripes, power of two.
    pub stripe_count: usize,
    /// Default lock wait timeout in milliseconds.
    pub lock_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            page_size: DEFAULT_PAGE_SIZE,
            pool_size: DEFAULT_POOL_SIZE,
            shard_count: DEFAULT_SHARD_COUNT,
            stripe_count: DEFAULT_STRIPE_COUNT,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
        }
    }
}

impl DatabaseConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Build a configuration from dotted option keys. Unknown keys are
    /// ignored; unparsable or out-of-range values fail.
    ///
    /// Recognized keys: `database.file_path`, `buffer_pool.pool_size`,
    /// `buffer_pool.shard_count`, `lock.stripe_count`,
    /// `lock.default_timeout_ms`, `page_size`.
    pub fn from_options(options: &HashMap<String, String>) -> DbResult<Self> {
        let mut config = Self::default();

        for (key, value) in options {
            match key.as_str() {
                "database.file_path" => {
                    config.data_dir = PathBuf::from(value);
                }
                "buffer_pool.pool_size" => {
                    config.pool_size = parse_usize(key, value)?;
                }
                "buffer_pool.shard_count" => {
                    config.shard_count = parse_usize(key, value)?;
                }
                "lock.stripe_count" => {
                    config.stripe_count = parse_usize(key, value)?;
                }
                "lock.default_timeout_ms" => {
                    config.lock_timeout_ms = parse_usize(key, value)? as u64;
                }
                "page_size" => {
                    config.page_size = parse_usize(key, value)?;
                }
                // unknown keys belong to outer layers
                _ => {}
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> DbResult<()> {
        if self.page_size < 512 {
            return Err(DbError::invalid(format!(
                "page_size {} below the 512 byte minimum",
                self.page_size
            )));
        }
        // in-page offsets are u16
        if self.page_size > 65536 {
            return Err(DbError::invalid(format!(
                "page_size {} above the 64 KiB maximum",
                self.page_size
            )));
        }
        if self.pool_size == 0 {
            return Err(DbError::invalid("buffer_pool.pool_size must be positive"));
        }
        if !self.shard_count.is_power_of_two() {
            return Err(DbError::invalid(format!(
                "buffer_pool.shard_count {} is not a power of two",
                self.shard_count
            )));
        }
        if !self.stripe_count.is_power_of_two() {
            return Err(DbError::invalid(format!(
                "lock.stripe_count {} is not a power of two",
                self.stripe_count
            )));
        }
        Ok(())
    }
}

fn parse_usize(key: &str, value: &str) -> DbResult<usize> {
    value
        .parse::<usize>()
        .map_err(|_| DbError::invalid(format!("option '{}' has non-integer value '{}'", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        DatabaseConfig::default().validate().unwrap();
    }

    #[test]
    fn test_from_options() {
        let mut options = HashMap::new();
        options.insert("database.file_path".to_string(), "/tmp/db".to_string());
        options.insert("buffer_pool.pool_size".to_string(), "32".to_string());
        options.insert("lock.stripe_count".to_string(), "8".to_string());
        options.insert("some.future.option".to_string(), "whatever".to_string());

        let config = DatabaseConfig::from_options(&options).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/db"));
        assert_eq!(config.pool_size, 32);
        assert_eq!(config.stripe_count, 8);
        // untouched keys keep their defaults
        assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut options = HashMap::new();
        options.insert("buffer_pool.shard_count".to_string(), "3".to_string());
        assert!(DatabaseConfig::from_options(&options).is_err());

        let mut options = HashMap::new();
        options.insert("buffer_pool.pool_size".to_string(), "lots".to_string());
        assert!(DatabaseConfig::from_options(&options).is_err());
    }
}
