//! Main module for the store.  Implements the linear hashing controller on top of the
//! address array and the data segments.
//!
//! The bucket space doubles one bucket at a time: bucket `split` is redistributed between
//! itself and its sibling at `split + levelCapacity`, then the split counter advances.
//! Readers compute a bucket index from the published (level, split) pair, read the bucket
//! and recompute the index; if it moved they retry.  That loop is the whole read side
//! synchronization, readers never take the writer lock.

use crate::codec;
use crate::config::StoreConfig;
use crate::error::close::CloseError;
use crate::error::write::WriteError;
use crate::error::{CommitError, OpenError, ReadError, RehashError};
use crate::hasher::HashFunction;
use crate::store::data_array::DataArray;
use crate::store_iter::{Iter, Keys};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

pub(crate) mod addr_array;
pub(crate) mod data_array;
pub(crate) mod segment;

/// Pack (level, split) into one word so readers never observe a torn pair.
fn encode_state(level: u32, split: u32) -> u64 {
    ((level as u64) << 32) | split as u64
}

/// Unpack a state word into (level, split).
fn decode_state(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, word as u32)
}

/// Writer side state, only touched with the writer lock held.
struct WriterState {
    /// loadCount above this triggers expansion; recomputed at each level wrap.
    level_threshold: u32,
    closed: bool,
}

/// An instance of a store.
///
/// Keys and values are opaque byte sequences.  One instance may be shared across threads;
/// writes serialize on an internal lock while `get` and the iterators run lock free
/// against them.
pub struct Store {
    data: DataArray,
    hasher: Arc<dyn HashFunction>,
    load_threshold: f64,
    unit_capacity: u32,
    /// level in the high half, split in the low half.  Stored with release ordering
    /// after a splits bucket content has moved, loaded with acquire ordering.
    state: AtomicU64,
    /// Number of non-empty buckets (not entries).
    load_count: AtomicU32,
    writer: Mutex<WriterState>,
}

impl Store {
    /// Open a new or reopen an existing store.  Called through StoreConfig::build().
    pub(crate) fn open(config: StoreConfig) -> Result<Self, OpenError> {
        let files = config.files.clone();
        let home_existed = files.home_dir().exists();
        if !home_existed && !config.create {
            return Err(OpenError::HomeDir(io::Error::new(
                io::ErrorKind::NotFound,
                "home directory does not exist",
            )));
        }
        files.create_dirs().map_err(OpenError::HomeDir)?;
        let result = Self::open_inner(config);
        if result.is_err() && !home_existed {
            // Creation is atomic, do not leave a partial store behind.
            files.delete();
        }
        result
    }

    fn open_inner(config: StoreConfig) -> Result<Self, OpenError> {
        let data = DataArray::open(&config)?;
        if config.init_level > 0 {
            let want = config.sub_array_len * (1_u32 << config.init_level) - 1;
            data.addr().expand_capacity(want);
            // Record the pre-expansion so a reopen sees the same level.
            data.addr().sync().map_err(OpenError::IO)?;
        }
        let store = Self {
            hasher: config.hasher.clone(),
            load_threshold: config.load_threshold,
            unit_capacity: config.sub_array_len,
            state: AtomicU64::new(encode_state(0, 0)),
            load_count: AtomicU32::new(0),
            writer: Mutex::new(WriterState {
                level_threshold: 0,
                closed: false,
            }),
            data,
        };
        store.load_count.store(store.scan(), Ordering::Release);
        store.init_linear_hashing().map_err(OpenError::Bootstrap)?;
        log::info!("opened {}", store.status());
        Ok(store)
    }

    /// Return the value stored for key, or None if the key is not present.
    ///
    /// Never blocks on the writer lock.  The loop re-checks the bucket index after
    /// reading because a concurrent split may have moved the key; it converges in a
    /// couple of iterations at most in practice.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, ReadError> {
        let hash = self.hasher.hash(key);
        let mut index = self.bucket_index(hash);
        let record = loop {
            let record = self.data.get(index)?;
            let check = self.bucket_index(hash);
            if check == index {
                break record;
            }
            index = check;
        };
        match record {
            None => Ok(None),
            Some(record) => codec::extract_by_key(key, &record).map_err(ReadError::Codec),
        }
    }

    /// Store value under key, replacing any existing value.  A None value deletes the
    /// key.  Insert and update are treated uniformly so this always reports true.
    pub fn put(&self, key: &[u8], value: Option<&[u8]>) -> Result<bool, WriteError> {
        let mut w = self.writer.lock();
        let Some(value) = value else {
            return self.delete_locked(&mut w, key);
        };
        self.maintain(&mut w)?;
        let index = self.bucket_index(self.hasher.hash(key));
        self.put_internal(index, key, value)
    }

    /// Remove key.  Returns true if the key was present.
    pub fn delete(&self, key: &[u8]) -> Result<bool, WriteError> {
        let mut w = self.writer.lock();
        self.delete_locked(&mut w, key)
    }

    /// Remove every record.  The hash state (level, split) is kept.
    pub fn clear(&self) -> Result<(), CommitError> {
        let _w = self.writer.lock();
        self.data.clear().map_err(CommitError::Clear)?;
        self.load_count.store(0, Ordering::Release);
        Ok(())
    }

    /// Flush all durable state: segment data, compaction and the address checkpoint.
    /// All data is safely on disk if this call succeeds.
    pub fn sync(&self) -> Result<(), CommitError> {
        let _w = self.writer.lock();
        self.data.sync()
    }

    /// Checkpoint without segment rotation: flush written data and the redo batch but do
    /// not force a full address array checkpoint.  Cheaper than sync().
    pub fn persist(&self) -> Result<(), CommitError> {
        let _w = self.writer.lock();
        self.data.persist()
    }

    /// Drive any in-progress split pass to completion, or if the load factor is over the
    /// threshold drive one complete level of splits, then sync.  Used to quiesce
    /// expansion so later writes do not pay for it.
    pub fn rehash(&self) -> Result<(), RehashError> {
        let mut w = self.writer.lock();
        let (_, split) = decode_state(self.state.load(Ordering::Acquire));
        if split > 0 {
            self.split_to_level_end(&mut w).map_err(RehashError::Split)?;
            self.data.sync().map_err(RehashError::Sync)?;
        } else if self.load_factor() > self.load_threshold {
            self.split_to_level_end(&mut w).map_err(RehashError::Split)?;
            self.data.sync().map_err(RehashError::Sync)?;
        }
        Ok(())
    }

    /// Iterate the (key, value) entries of every live bucket.  Weakly consistent against
    /// concurrent writers.
    pub fn iter(&self) -> Iter<'_> {
        Iter::new(self)
    }

    /// Iterate the keys of every live bucket.  Weakly consistent against concurrent
    /// writers.
    pub fn keys(&self) -> Keys<'_> {
        Keys::new(self)
    }

    /// Flush and release the store.  Both the data segments and the address array are
    /// always closed; if both fail the failures are reported together.  Idempotent.
    pub fn close(&self) -> Result<(), CloseError> {
        let mut w = self.writer.lock();
        if w.closed {
            return Ok(());
        }
        w.closed = true;
        self.load_count.store(0, Ordering::Release);
        self.data.close()
    }

    /// Number of completed doublings of the bucket space.
    pub fn level(&self) -> u32 {
        decode_state(self.state.load(Ordering::Acquire)).0
    }

    /// Index of the next bucket to be split.
    pub fn split(&self) -> u32 {
        decode_state(self.state.load(Ordering::Acquire)).1
    }

    /// Total number of addressable buckets.
    pub fn capacity(&self) -> u32 {
        self.data.length()
    }

    /// The unit the bucket space grows in (the address arrays sub array length).
    pub fn unit_capacity(&self) -> u32 {
        self.unit_capacity
    }

    /// The modulus of the unsplit region: unit_capacity * 2^level.
    pub fn level_capacity(&self) -> u64 {
        (self.unit_capacity as u64) << self.level()
    }

    /// Number of non-empty buckets.
    pub fn load_count(&self) -> u32 {
        self.load_count.load(Ordering::Acquire)
    }

    /// Non-empty buckets over capacity.
    pub fn load_factor(&self) -> f64 {
        self.load_count() as f64 / self.capacity() as f64
    }

    /// The load factor that triggers expansion.
    pub fn load_threshold(&self) -> f64 {
        self.load_threshold
    }

    /// A one line human readable summary of the hash state.
    pub fn status(&self) -> String {
        format!(
            "level={} split={} capacity={} loadCount={} loadFactor={}",
            self.level(),
            self.split(),
            self.capacity(),
            self.load_count(),
            self.load_factor()
        )
    }

    /// Read the raw record of a bucket.  For the iterators.
    pub(crate) fn bucket(&self, index: u32) -> Result<Option<Vec<u8>>, ReadError> {
        self.data.get(index)
    }

    /// Map a hash code to the bucket that currently owns it.
    fn bucket_index(&self, hash: u64) -> u32 {
        let (level, split) = decode_state(self.state.load(Ordering::Acquire));
        let capacity = (self.unit_capacity as u64) << level;
        let index = hash % capacity;
        if (index as u32) < split {
            // Buckets below the split line are already at the next levels width.
            (hash % (capacity << 1)) as u32
        } else {
            index as u32
        }
    }

    /// Split one bucket if a pass is in progress or the load crossed the threshold.
    fn maintain(&self, w: &mut WriterState) -> Result<(), WriteError> {
        let (_, split) = decode_state(self.state.load(Ordering::Acquire));
        if split > 0 || self.load_count.load(Ordering::Acquire) > w.level_threshold {
            self.perform_split(w)?;
        }
        Ok(())
    }

    fn delete_locked(&self, w: &mut WriterState, key: &[u8]) -> Result<bool, WriteError> {
        self.maintain(w)?;
        let index = self.bucket_index(self.hasher.hash(key));
        self.delete_internal(index, key)
    }

    /// Write (key, value) into bucket index, merging with the buckets record.
    fn put_internal(&self, index: u32, key: &[u8], value: &[u8]) -> Result<bool, WriteError> {
        match self.data.get(index).map_err(WriteError::Read)? {
            None => {
                let scn = self.data.next_scn();
                self.data.set(index, Some(codec::assemble(key, value).as_slice()), scn)?;
                self.load_count.fetch_add(1, Ordering::Release);
            }
            Some(existing) => match codec::assemble_with(key, value, &existing) {
                Ok(record) => {
                    let scn = self.data.next_scn();
                    self.data.set(index, Some(record.as_slice()), scn)?;
                }
                Err(err) => {
                    // A corrupt record must not wedge the writer; reset the bucket to
                    // just the new entry.
                    log::warn!("record reset at index={index}: {err}");
                    let scn = self.data.next_scn();
                    self.data.set(index, Some(codec::assemble(key, value).as_slice()), scn)?;
                }
            },
        }
        Ok(true)
    }

    /// Remove key from bucket index.  Returns true if the key was present.
    fn delete_internal(&self, index: u32, key: &[u8]) -> Result<bool, WriteError> {
        let Some(mut record) = self.data.get(index).map_err(WriteError::Read)? else {
            return Ok(false);
        };
        match codec::remove_by_key(key, &mut record) {
            Ok(0) => {
                // The entire record is removed.
                let scn = self.data.next_scn();
                self.data.set(index, None, scn)?;
                self.load_count.fetch_sub(1, Ordering::Release);
                Ok(true)
            }
            Ok(new_len) if new_len < record.len() => {
                let scn = self.data.next_scn();
                self.data.set(index, Some(&record[..new_len]), scn)?;
                Ok(true)
            }
            Ok(_) => Ok(false),
            Err(err) => {
                log::warn!("failed to delete at index={index}: {err}");
                let scn = self.data.next_scn();
                self.data.set(index, None, scn)?;
                self.load_count.fetch_sub(1, Ordering::Release);
                Ok(false)
            }
        }
    }

    /// Redistribute bucket `split` between itself and its sibling one level up, then
    /// advance the split counter.  The counter moves only after the contents have, so
    /// the index computation never disagrees with the on disk content.
    fn perform_split(&self, w: &mut WriterState) -> Result<(), WriteError> {
        let (level, split) = decode_state(self.state.load(Ordering::Acquire));
        let level_capacity = (self.unit_capacity as u64) << level;
        // Make the sibling bucket addressable.
        self.data
            .addr()
            .expand_capacity((split as u64 + level_capacity) as u32);
        if let Some(record) = self.data.get(split).map_err(WriteError::Read)? {
            let doubled = level_capacity << 1;
            for entry in codec::Entries::new(&record).map_err(WriteError::SplitCodec)? {
                let (key, value) = entry.map_err(WriteError::SplitCodec)?;
                let new_index = (self.hasher.hash(key) % doubled) as u32;
                if new_index != split {
                    // The entry moves to the sibling bucket.
                    self.delete_internal(split, key)?;
                    self.put_internal(new_index, key, value)?;
                }
            }
        }
        let split = split + 1;
        if split % self.unit_capacity == 0 {
            log::info!("split {}", self.status());
        }
        if split as u64 == level_capacity {
            self.state
                .store(encode_state(level + 1, 0), Ordering::Release);
            w.level_threshold =
                ((level_capacity << 1) as f64 * self.load_threshold) as u32;
            log::info!("{}", self.status());
        } else {
            self.state.store(encode_state(level, split), Ordering::Release);
        }
        Ok(())
    }

    /// Split until the pass wraps back to zero.
    fn split_to_level_end(&self, w: &mut WriterState) -> Result<(), WriteError> {
        loop {
            self.perform_split(w)?;
            let (_, split) = decode_state(self.state.load(Ordering::Acquire));
            if split == 0 {
                return Ok(());
            }
        }
    }

    /// Derive (level, split) from the address array capacity.  A store that grew past one
    /// unit gets its trailing unit re-split: it may have been mid split at shutdown and
    /// re-splitting restores bucket ownership for the whole unit.
    fn init_linear_hashing(&self) -> Result<(), WriteError> {
        let unit = self.unit_capacity;
        let unit_count = self.data.length() / unit;
        let mut w = self.writer.lock();
        if unit_count <= 1 {
            self.state.store(encode_state(0, 0), Ordering::Release);
            w.level_threshold = (unit as f64 * self.load_threshold) as u32;
        } else {
            let level = (unit_count - 1).ilog2();
            let split = (unit_count - (1 << level) - 1) * unit;
            self.state.store(encode_state(level, split), Ordering::Release);
            w.level_threshold =
                (((unit as u64) << level) as f64 * self.load_threshold) as u32;
            for _ in 0..unit {
                self.perform_split(&mut w)?;
            }
        }
        Ok(())
    }

    /// Count the non-empty buckets.
    fn scan(&self) -> u32 {
        let mut count = 0;
        for index in 0..self.data.length() {
            if self.data.has_data(index) {
                count += 1;
            }
        }
        count
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
