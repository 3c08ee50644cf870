//! Contains the data array: maps a bucket index to its packed record through the address
//! array and the segment files.  This is the only place locators are produced or consumed.

use crate::config::StoreConfig;
use crate::error::close::CloseError;
use crate::error::write::WriteError;
use crate::error::{CommitError, OpenError, ReadError};
use crate::store::addr_array::AddrArray;
use crate::store::segment::{locator, locator_parts, SegmentManager};
use std::io;

/// Maps bucket index -> opaque byte record via the segmented log.
pub(crate) struct DataArray {
    addr: AddrArray,
    segments: SegmentManager,
}

impl DataArray {
    /// Open the address array and segments under the configs home directory.
    pub fn open(config: &StoreConfig) -> Result<Self, OpenError> {
        let addr = AddrArray::open(
            config.files.clone(),
            config.sub_array_len,
            config.entry_size,
            config.max_entries,
            config.truncate,
        )?;
        let segments = SegmentManager::open(
            config.files.clone(),
            addr.uid(),
            config.segment_file_size_mb as u64 * 1024 * 1024,
            config.segment_compact_factor,
            config.truncate,
        )?;
        let array = Self { addr, segments };
        array.segments.rebuild_live(&array.addr);
        Ok(array)
    }

    /// The address array.  The controller expands it ahead of each split.
    pub fn addr(&self) -> &AddrArray {
        &self.addr
    }

    /// Return the next sequence number for a write.
    pub fn next_scn(&self) -> u64 {
        self.addr.next_scn()
    }

    /// Number of addressable buckets.
    pub fn length(&self) -> u32 {
        self.addr.capacity()
    }

    /// True if bucket index holds a record.
    pub fn has_data(&self, index: u32) -> bool {
        self.addr.get(index) != 0
    }

    /// Read the record at bucket index, or None for an empty bucket.
    /// Runs without the writer lock; if compaction moves the record between loading the
    /// locator and reading the segment the locator is reloaded and the read retried.
    pub fn get(&self, index: u32) -> Result<Option<Vec<u8>>, ReadError> {
        loop {
            let loc = self.addr.get(index);
            if loc == 0 {
                return Ok(None);
            }
            let (seg_id, offset) = locator_parts(loc);
            match self.segments.read(seg_id, offset)? {
                Some((bucket, _scn, payload)) => {
                    if bucket != index {
                        return Err(ReadError::CrcFailed);
                    }
                    return Ok(Some(payload));
                }
                None => {
                    if self.addr.get(index) == loc {
                        // Not a compaction race, the locator really is dangling.
                        return Err(ReadError::SegmentMissing);
                    }
                }
            }
        }
    }

    /// Write (or with None, delete) the record at bucket index.
    /// The new record is appended first, then the locator published, so readers always
    /// resolve to a fully written record.
    pub fn set(&self, index: u32, data: Option<&[u8]>, scn: u64) -> Result<(), WriteError> {
        let old = self.addr.get(index);
        let new_loc = match data {
            Some(bytes) => {
                let (seg_id, offset) = self.segments.append(index, scn, bytes)?;
                locator(seg_id, offset)
            }
            None => 0,
        };
        self.addr
            .set(index, new_loc, scn)
            .map_err(WriteError::AddrUpdate)?;
        if old != 0 {
            let (seg_id, offset) = locator_parts(old);
            self.segments.mark_dead(seg_id, offset);
        }
        Ok(())
    }

    /// Delete every record.  Locators are zeroed before the segment files go away so a
    /// concurrent reader resolves to empty rather than a dangling locator.
    pub fn clear(&self) -> io::Result<()> {
        self.addr.zero();
        self.segments.clear()?;
        self.addr.sync()
    }

    /// Flush everything durable: segment data, then compaction, then the address
    /// checkpoint (which covers any locators compaction moved).
    pub fn sync(&self) -> Result<(), CommitError> {
        self.segments.sync().map_err(CommitError::DataFileSync)?;
        self.segments
            .compact(&self.addr)
            .map_err(CommitError::Compact)?;
        self.addr.sync().map_err(CommitError::AddrSync)
    }

    /// Checkpoint without segment rotation: sync segment data and flush the redo batch,
    /// but do not force a full address array checkpoint.
    pub fn persist(&self) -> Result<(), CommitError> {
        self.segments.sync().map_err(CommitError::DataFileSync)?;
        self.addr.persist().map_err(CommitError::AddrSync)
    }

    /// Close both halves.  Each is always attempted; failures are reported combined.
    pub fn close(&self) -> Result<(), CloseError> {
        let data_result = self.segments.sync();
        let addr_result = self.addr.close();
        match (data_result, addr_result) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(data), Ok(())) => Err(CloseError::Data(data)),
            (Ok(()), Err(addr)) => Err(CloseError::Addr(addr)),
            (Err(data), Err(addr)) => Err(CloseError::Both(data, addr)),
        }
    }

    #[cfg(test)]
    pub fn segments(&self) -> &SegmentManager {
        &self.segments
    }
}
