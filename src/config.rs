//! Define the configuration used to create or open a store.

use crate::error::OpenError;
use crate::files::StoreFiles;
use crate::hasher::{FnvHashFunction, HashFunction};
use crate::store::Store;
use std::path::PathBuf;
use std::sync::Arc;

/// Configuration for a store.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub(crate) files: StoreFiles,
    pub(crate) init_level: u8,
    pub(crate) entry_size: u32,
    pub(crate) max_entries: u32,
    pub(crate) segment_file_size_mb: u32,
    pub(crate) segment_compact_factor: f64,
    pub(crate) load_threshold: f64,
    pub(crate) sub_array_len: u32,
    pub(crate) hasher: Arc<dyn HashFunction>,
    pub(crate) create: bool,
    pub(crate) truncate: bool,
}

impl StoreConfig {
    /// Create a new config for a store living in home_dir.
    pub fn new<P: Into<PathBuf>>(home_dir: P) -> Self {
        Self {
            files: StoreFiles::new(home_dir),
            init_level: 0,
            entry_size: 10_000,
            max_entries: 5,
            segment_file_size_mb: 256,
            segment_compact_factor: 0.5,
            load_threshold: 0.75,
            sub_array_len: 1 << 16,
            hasher: Arc::new(FnvHashFunction),
            create: false,
            truncate: false,
        }
    }

    /// Returns a reference to the files for this store.
    pub fn files(&self) -> &StoreFiles {
        &self.files
    }

    /// If the store does not exist then create it, otherwise open existing.
    pub fn create(mut self) -> Self {
        self.create = true;
        self
    }

    /// If the store exists then empty it on open.
    /// This will rebuild the store with new parameters instead of using the old parameters.
    pub fn truncate(mut self) -> Self {
        self.truncate = true;
        self
    }

    /// Pre-expand the address array so an empty store opens with level set to level.
    /// Has no effect on a store that already grew past this level.
    /// Panics if level is greater than 16.
    pub fn set_init_level(mut self, level: u8) -> Self {
        if level > 16 {
            panic!("Invalid init level {}, must be <= 16", level);
        }
        self.init_level = level;
        self
    }

    /// Set the number of redo entries collected before a batch is written to the log.
    /// Panics if entry_size is 0.
    pub fn set_entry_size(mut self, entry_size: u32) -> Self {
        if entry_size == 0 {
            panic!("Invalid entry size, must be at least 1");
        }
        self.entry_size = entry_size;
        self
    }

    /// Set the number of flushed batches that trigger an address array checkpoint.
    /// Panics if max_entries is 0.
    pub fn set_max_entries(mut self, max_entries: u32) -> Self {
        if max_entries == 0 {
            panic!("Invalid max entries, must be at least 1");
        }
        self.max_entries = max_entries;
        self
    }

    /// Set the size of each data segment file in megabytes.
    /// Panics if size_mb is 0.
    pub fn set_segment_file_size_mb(mut self, size_mb: u32) -> Self {
        if size_mb == 0 {
            panic!("Invalid segment file size, must be at least 1MB");
        }
        self.segment_file_size_mb = size_mb;
        self
    }

    /// Set the live usage ratio below which a sealed segment is eligible for compaction.
    /// Panics if factor is not in (0, 1).
    pub fn set_segment_compact_factor(mut self, factor: f64) -> Self {
        if !(factor > 0.0 && factor < 1.0) {
            panic!("Invalid segment compact factor {}, must be in (0, 1)", factor);
        }
        self.segment_compact_factor = factor;
        self
    }

    /// Set the load factor (non-empty buckets over capacity) that triggers bucket splits.
    /// Panics if threshold is not in (0, 1].
    pub fn set_load_threshold(mut self, threshold: f64) -> Self {
        if !(threshold > 0.0 && threshold <= 1.0) {
            panic!("Invalid load threshold {}, must be in (0, 1]", threshold);
        }
        self.load_threshold = threshold;
        self
    }

    /// Set the address array sub array length.  This is the unit the bucket space grows in
    /// and the capacity of a freshly created store.
    /// Panics if len is not a power of two or is larger than 2^24.
    pub fn set_sub_array_len(mut self, len: u32) -> Self {
        if !len.is_power_of_two() || len > 1 << 24 {
            panic!("Invalid sub array length {}, must be a power of two <= 2^24", len);
        }
        self.sub_array_len = len;
        self
    }

    /// Set the hash function used to map keys to buckets.
    /// The function must be stable across runs or the buckets on disk become invalid.
    pub fn set_hash_function(mut self, hasher: Arc<dyn HashFunction>) -> Self {
        self.hasher = hasher;
        self
    }

    /// Consumes the config and opens the store.
    pub fn build(self) -> Result<Store, OpenError> {
        Store::open(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::new("/tmp/nope");
        assert_eq!(config.entry_size, 10_000);
        assert_eq!(config.max_entries, 5);
        assert_eq!(config.segment_file_size_mb, 256);
        assert_eq!(config.sub_array_len, 1 << 16);
        assert!((config.load_threshold - 0.75).abs() < f64::EPSILON);
        assert!((config.segment_compact_factor - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    #[should_panic]
    fn test_bad_sub_array_len_panics() {
        let _ = StoreConfig::new("/tmp/nope").set_sub_array_len(12);
    }

    #[test]
    #[should_panic]
    fn test_bad_load_threshold_panics() {
        let _ = StoreConfig::new("/tmp/nope").set_load_threshold(1.5);
    }
}
