//! Iterators over the live buckets of a store.
//!
//! Both iterators walk the bucket indexes from zero to the current capacity, decode each
//! live bucket and hand out its entries.  They are weakly consistent: for a stable
//! (level, split) an entry is seen at most once, but while a concurrent writer splits
//! buckets an entry that moves ahead of the cursor can be seen twice and one written
//! after the cursor passed can be missed.  A bucket that fails to decode is skipped.

use crate::codec;
use crate::store::Store;
use std::collections::VecDeque;

/// Iterate over the (key, value) entries of a store.
pub struct Iter<'store> {
    store: &'store Store,
    index: u32,
    pending: VecDeque<(Vec<u8>, Vec<u8>)>,
}

impl<'store> Iter<'store> {
    pub(crate) fn new(store: &'store Store) -> Self {
        Self {
            store,
            index: 0,
            pending: VecDeque::new(),
        }
    }

    /// Decode buckets until some entries are pending or the buckets run out.
    fn fill(&mut self) {
        while self.pending.is_empty() {
            if self.index >= self.store.capacity() {
                return;
            }
            let index = self.index;
            self.index += 1;
            let record = match self.store.bucket(index) {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(err) => {
                    log::warn!("bucket {index} skipped during iteration: {err}");
                    continue;
                }
            };
            let entries = match codec::Entries::new(&record) {
                Ok(entries) => entries,
                Err(err) => {
                    log::warn!("bucket {index} skipped during iteration: {err}");
                    continue;
                }
            };
            for entry in entries {
                match entry {
                    Ok((key, value)) => {
                        self.pending.push_back((key.to_vec(), value.to_vec()));
                    }
                    Err(err) => {
                        log::warn!("bucket {index} cut short during iteration: {err}");
                        break;
                    }
                }
            }
        }
    }
}

impl Iterator for Iter<'_> {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        self.fill();
        self.pending.pop_front()
    }
}

/// Iterate over the keys of a store.
pub struct Keys<'store> {
    store: &'store Store,
    index: u32,
    pending: VecDeque<Vec<u8>>,
}

impl<'store> Keys<'store> {
    pub(crate) fn new(store: &'store Store) -> Self {
        Self {
            store,
            index: 0,
            pending: VecDeque::new(),
        }
    }

    fn fill(&mut self) {
        while self.pending.is_empty() {
            if self.index >= self.store.capacity() {
                return;
            }
            let index = self.index;
            self.index += 1;
            let record = match self.store.bucket(index) {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(err) => {
                    log::warn!("bucket {index} skipped during iteration: {err}");
                    continue;
                }
            };
            let entries = match codec::Entries::new(&record) {
                Ok(entries) => entries,
                Err(err) => {
                    log::warn!("bucket {index} skipped during iteration: {err}");
                    continue;
                }
            };
            for entry in entries {
                match entry {
                    Ok((key, _value)) => self.pending.push_back(key.to_vec()),
                    Err(err) => {
                        log::warn!("bucket {index} cut short during iteration: {err}");
                        break;
                    }
                }
            }
        }
    }
}

impl Iterator for Keys<'_> {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        self.fill();
        self.pending.pop_front()
    }
}
