//! Key-value backend configuration.

use std::path::PathBuf;

/// Configuration for [`KvBackend`](super::KvBackend).
#[derive(Debug, Clone)]
pub struct KvConfig {
    /// Path to the database directory.
    pub path: PathBuf,

    /// Page cache capacity in bytes.
    pub cache_capacity: u64,

    /// Flush interval in milliseconds. None means flush on every write.
    pub flush_every_ms: Option<u64>,

    /// Enable zstd compression.
    pub compression: bool,

    /// Temporary database (deleted on drop).
    pub temporary: bool,

    /// Rows removed per batch when dropping a table.
    pub drop_batch_size: usize,

    /// Rows rewritten per batch when backfilling or renaming a column.
    pub backfill_batch_size: usize,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./ormkv_data"),
            cache_capacity: 256 * 1024 * 1024, // 256MB
            flush_every_ms: Some(500),
            compression: true,
            temporary: false,
            drop_batch_size: 500,
            backfill_batch_size: 500,
        }
    }
}

impl KvConfig {
    /// Create a new configuration with the given path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Create a temporary configuration for testing.
    pub fn temporary() -> Self {
        Self {
            path: PathBuf::from(""),
            temporary: true,
            ..Default::default()
        }
    }

    /// Set the page cache capacity.
    pub fn with_cache_capacity(mut self, bytes: u64) -> Self {
        self.cache_capacity = bytes;
        self
    }

    /// Set the flush interval.
    pub fn with_flush_every_ms(mut self, ms: Option<u64>) -> Self {
        self.flush_every_ms = ms;
        self
    }

    /// Enable or disable compression.
    pub fn with_compression(mut self, compression: bool) -> Self {
        self.compression = compression;
        self
    }

    /// Set the drop batch size. Zero is treated as one.
    pub fn with_drop_batch_size(mut self, size: usize) -> Self {
        self.drop_batch_size = size.max(1);
        self
    }

    /// Set the backfill batch size. Zero is treated as one.
    pub fn with_backfill_batch_size(mut self, size: usize) -> Self {
        self.backfill_batch_size = size.max(1);
        self
    }

    /// Convert to sled configuration.
    pub(crate) fn to_sled_config(&self) -> sled::Config {
        let mut config = sled::Config::new()
            .cache_capacity(self.cache_capacity)
            .use_compression(self.compression);

        if self.temporary {
            config = config.temporary(true);
        } else {
            config = config.path(&self.path);
        }

        config.flush_every_ms(self.flush_every_ms)
    }
}
