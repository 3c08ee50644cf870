//! Contains the dynamic address array: one 64 bit locator slot per hash bucket.
//!
//! The array grows in fixed power-of-two units (sub arrays) and never shrinks.  Readers
//! load slots with acquire ordering and never block on the writer.  Durability comes from
//! two files: a full checkpoint of the slots (addr.adx) and a redo log of
//! (index, locator, scn) entries (addr.rdx).  Updates collect into batches of entry_size
//! entries; each full batch is appended to the log with a trailing CRC32 and after
//! max_entries batches the whole array is checkpointed and the log started over.  A torn
//! batch at the log tail is ignored on replay, the checkpoint plus the intact prefix is
//! always a consistent state.

use crate::crc::{add_crc32, check_crc};
use crate::error::{LoadHeaderError, OpenError};
use crate::files::StoreFiles;
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::{fs, time};

/// Size of the checkpoint header: magic, version, uid, sub array length, capacity, scn
/// and the crc32 over all of it.
const ADDR_HEADER_BYTES: usize = 38;
/// Size of the redo log header: magic, version, uid and crc32.
const REDO_HEADER_BYTES: usize = 22;
/// Bytes per redo entry: index, locator and scn.
const REDO_ENTRY_BYTES: usize = 20;
/// On disk format version.
const FORMAT_VERSION: u16 = 0;

/// One queued address update.
struct RedoEntry {
    index: u32,
    locator: u64,
    scn: u64,
}

/// Redo log state, only touched with the stores writer lock held.
struct RedoState {
    redo_file: File,
    pending: Vec<RedoEntry>,
    /// Batches flushed to the log since the last checkpoint.
    batches: u32,
}

/// The dynamic array of bucket locators.
pub(crate) struct AddrArray {
    files: StoreFiles,
    uid: u64,
    sub_array_len: u32,
    entry_size: u32,
    max_entries: u32,
    capacity: AtomicU32,
    slots: RwLock<Vec<Arc<[AtomicU64]>>>,
    scn: AtomicU64,
    redo: Mutex<RedoState>,
}

/// Generate a uid for a new store.  Nanos since the epoch are unique enough for files that
/// only ever need to be told apart within one home directory.
fn new_uid() -> u64 {
    match time::SystemTime::now().duration_since(time::UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_nanos() as u64,
        Err(_) => 0x6c68_6462,
    }
}

/// Turn a flat slot vector into sub arrays of atomics.
fn build_slots(values: &[u64], sub_array_len: u32) -> Vec<Arc<[AtomicU64]>> {
    values
        .chunks(sub_array_len as usize)
        .map(|chunk| chunk.iter().map(|v| AtomicU64::new(*v)).collect())
        .collect()
}

impl AddrArray {
    /// Open or create the address array under files.
    pub fn open(
        files: StoreFiles,
        sub_array_len: u32,
        entry_size: u32,
        max_entries: u32,
        truncate: bool,
    ) -> Result<Self, OpenError> {
        if truncate {
            let _ = fs::remove_file(files.addr_path());
            let _ = fs::remove_file(files.addr_tmp_path());
            let _ = fs::remove_file(files.redo_path());
        }
        let addr_path = files.addr_path();
        let (uid, mut scn, mut values) = if addr_path.exists() {
            Self::load_checkpoint(&addr_path, sub_array_len).map_err(OpenError::AddrOpen)?
        } else {
            // No checkpoint means nothing durable yet, a leftover log is from a
            // creation that never finished.
            let _ = fs::remove_file(files.redo_path());
            (new_uid(), 0, Vec::new())
        };
        let (redo_file, replayed) =
            Self::open_redo(&files, uid).map_err(OpenError::AddrOpen)?;
        for entry in replayed {
            let index = entry.index as usize;
            while values.len() <= index {
                values.resize(values.len() + sub_array_len as usize, 0);
            }
            values[index] = entry.locator;
            if entry.scn > scn {
                scn = entry.scn;
            }
        }
        // Always at least one unit so a fresh store has a full level zero.
        if values.is_empty() {
            values.resize(sub_array_len as usize, 0);
        }
        let capacity = values.len() as u32;
        let array = Self {
            files,
            uid,
            sub_array_len,
            entry_size,
            max_entries,
            capacity: AtomicU32::new(capacity),
            slots: RwLock::new(build_slots(&values, sub_array_len)),
            scn: AtomicU64::new(scn),
            redo: Mutex::new(RedoState {
                redo_file,
                pending: Vec::new(),
                batches: 0,
            }),
        };
        // Fold any replayed entries into a fresh checkpoint so the log starts empty.
        array.sync().map_err(OpenError::IO)?;
        Ok(array)
    }

    /// The uid shared by every file of this store.
    pub fn uid(&self) -> u64 {
        self.uid
    }

    /// Current number of addressable slots.  Always a multiple of the sub array length.
    pub fn capacity(&self) -> u32 {
        self.capacity.load(Ordering::Acquire)
    }

    /// Return the next sequence number.  Monotonic, persisted with the checkpoint.
    pub fn next_scn(&self) -> u64 {
        self.scn.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Read the locator for index.  Lock free apart from the brief sub array read lock.
    pub fn get(&self, index: u32) -> u64 {
        if index >= self.capacity() {
            return 0;
        }
        let slots = self.slots.read();
        let sub = &slots[(index / self.sub_array_len) as usize];
        sub[(index % self.sub_array_len) as usize].load(Ordering::Acquire)
    }

    /// Store the locator for index and queue it for the redo log.
    /// Caller must have expanded the array past index.
    pub fn set(&self, index: u32, locator: u64, scn: u64) -> io::Result<()> {
        {
            let slots = self.slots.read();
            let sub = &slots[(index / self.sub_array_len) as usize];
            sub[(index % self.sub_array_len) as usize].store(locator, Ordering::Release);
        }
        let mut redo = self.redo.lock();
        redo.pending.push(RedoEntry {
            index,
            locator,
            scn,
        });
        if redo.pending.len() >= self.entry_size as usize {
            Self::flush_batch(&mut redo)?;
            if redo.batches >= self.max_entries {
                self.checkpoint(&mut redo)?;
            }
        }
        Ok(())
    }

    /// Grow the array (in sub array units) until index is addressable.
    /// Returns the new capacity.  Growth is memory only, the larger capacity is recorded
    /// by the next checkpoint and re-derived from the redo log after a crash.
    pub fn expand_capacity(&self, index: u32) -> u32 {
        let mut slots = self.slots.write();
        let sub = self.sub_array_len;
        let mut capacity = slots.len() as u32 * sub;
        while capacity <= index {
            slots.push((0..sub).map(|_| AtomicU64::new(0)).collect());
            capacity += sub;
        }
        self.capacity.store(capacity, Ordering::Release);
        capacity
    }

    /// Zero every slot and drop queued updates.  Memory only, follow with sync().
    pub fn zero(&self) {
        let slots = self.slots.read();
        for sub in slots.iter() {
            for slot in sub.iter() {
                slot.store(0, Ordering::Release);
            }
        }
        drop(slots);
        self.redo.lock().pending.clear();
    }

    /// Flush the pending batch to the redo log and sync it, without forcing a checkpoint.
    pub fn persist(&self) -> io::Result<()> {
        let mut redo = self.redo.lock();
        Self::flush_batch(&mut redo)?;
        redo.redo_file.sync_data()
    }

    /// Checkpoint the whole array and start the redo log over.
    pub fn sync(&self) -> io::Result<()> {
        let mut redo = self.redo.lock();
        self.checkpoint(&mut redo)
    }

    /// Flush and checkpoint, releasing the on disk state cleanly.
    pub fn close(&self) -> io::Result<()> {
        self.sync()
    }

    /// Append the pending entries to the redo log as one CRC framed batch.
    fn flush_batch(redo: &mut RedoState) -> io::Result<()> {
        if redo.pending.is_empty() {
            return Ok(());
        }
        let mut buffer =
            Vec::with_capacity(4 + redo.pending.len() * REDO_ENTRY_BYTES + 4);
        buffer.extend_from_slice(&(redo.pending.len() as u32).to_le_bytes());
        for entry in &redo.pending {
            buffer.extend_from_slice(&entry.index.to_le_bytes());
            buffer.extend_from_slice(&entry.locator.to_le_bytes());
            buffer.extend_from_slice(&entry.scn.to_le_bytes());
        }
        buffer.extend_from_slice(&[0_u8; 4]);
        add_crc32(&mut buffer[..]);
        redo.redo_file.seek(SeekFrom::End(0))?;
        redo.redo_file.write_all(&buffer)?;
        redo.pending.clear();
        redo.batches += 1;
        Ok(())
    }

    /// Write the whole array to a staged checkpoint file, rename it over the live one and
    /// truncate the redo log back to its header.
    fn checkpoint(&self, redo: &mut RedoState) -> io::Result<()> {
        let tmp_path = self.files.addr_tmp_path();
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            let capacity = self.capacity();
            let mut header = [0_u8; ADDR_HEADER_BYTES];
            let mut pos = 0;
            header[pos..8].copy_from_slice(b"lhdb.adx");
            pos += 8;
            header[pos..(pos + 2)].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
            pos += 2;
            header[pos..(pos + 8)].copy_from_slice(&self.uid.to_le_bytes());
            pos += 8;
            header[pos..(pos + 4)].copy_from_slice(&self.sub_array_len.to_le_bytes());
            pos += 4;
            header[pos..(pos + 4)].copy_from_slice(&capacity.to_le_bytes());
            pos += 4;
            header[pos..(pos + 8)]
                .copy_from_slice(&self.scn.load(Ordering::Acquire).to_le_bytes());
            add_crc32(&mut header);
            file.write_all(&header)?;
            let slots = self.slots.read();
            let mut payload = Vec::with_capacity(capacity as usize * 8 + 4);
            for sub in slots.iter() {
                for slot in sub.iter() {
                    payload.extend_from_slice(&slot.load(Ordering::Acquire).to_le_bytes());
                }
            }
            payload.extend_from_slice(&[0_u8; 4]);
            add_crc32(&mut payload[..]);
            file.write_all(&payload)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, self.files.addr_path())?;
        // The checkpoint covers everything, start the log over.
        redo.pending.clear();
        redo.batches = 0;
        redo.redo_file.set_len(0)?;
        redo.redo_file.seek(SeekFrom::Start(0))?;
        Self::write_redo_header(&mut redo.redo_file, self.uid)?;
        redo.redo_file.sync_all()?;
        Ok(())
    }

    /// Load and validate the checkpoint file, returning (uid, scn, slot values).
    fn load_checkpoint(
        path: &std::path::Path,
        sub_array_len: u32,
    ) -> Result<(u64, u64, Vec<u64>), LoadHeaderError> {
        let mut file = OpenOptions::new().read(true).open(path)?;
        let mut header = [0_u8; ADDR_HEADER_BYTES];
        file.read_exact(&mut header)?;
        if !check_crc(&header) {
            return Err(LoadHeaderError::CrcFailed);
        }
        let mut pos = 0;
        if &header[0..8] != b"lhdb.adx" {
            return Err(LoadHeaderError::InvalidType);
        }
        pos += 8;
        let mut buf16 = [0_u8; 2];
        let mut buf32 = [0_u8; 4];
        let mut buf64 = [0_u8; 8];
        buf16.copy_from_slice(&header[pos..(pos + 2)]);
        if u16::from_le_bytes(buf16) != FORMAT_VERSION {
            return Err(LoadHeaderError::InvalidVersion);
        }
        pos += 2;
        buf64.copy_from_slice(&header[pos..(pos + 8)]);
        let uid = u64::from_le_bytes(buf64);
        pos += 8;
        buf32.copy_from_slice(&header[pos..(pos + 4)]);
        if u32::from_le_bytes(buf32) != sub_array_len {
            return Err(LoadHeaderError::UnitMismatch);
        }
        pos += 4;
        buf32.copy_from_slice(&header[pos..(pos + 4)]);
        let capacity = u32::from_le_bytes(buf32);
        pos += 4;
        buf64.copy_from_slice(&header[pos..(pos + 8)]);
        let scn = u64::from_le_bytes(buf64);
        if capacity % sub_array_len != 0 {
            return Err(LoadHeaderError::InvalidType);
        }
        let mut payload = vec![0_u8; capacity as usize * 8 + 4];
        file.read_exact(&mut payload[..])?;
        if !check_crc(&payload) {
            return Err(LoadHeaderError::CrcFailed);
        }
        let values = payload[..capacity as usize * 8]
            .chunks_exact(8)
            .map(|chunk| {
                let mut buf = [0_u8; 8];
                buf.copy_from_slice(chunk);
                u64::from_le_bytes(buf)
            })
            .collect();
        Ok((uid, scn, values))
    }

    /// Open the redo log, validate its header against uid and replay any intact batches.
    /// A short or corrupt tail batch ends the replay, it was torn by a crash.
    fn open_redo(
        files: &StoreFiles,
        uid: u64,
    ) -> Result<(File, Vec<RedoEntry>), LoadHeaderError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(files.redo_path())?;
        let file_end = file.seek(SeekFrom::End(0))?;
        if file_end == 0 {
            Self::write_redo_header(&mut file, uid)?;
            return Ok((file, Vec::new()));
        }
        file.seek(SeekFrom::Start(0))?;
        let mut header = [0_u8; REDO_HEADER_BYTES];
        file.read_exact(&mut header)?;
        if !check_crc(&header) {
            return Err(LoadHeaderError::CrcFailed);
        }
        if &header[0..8] != b"lhdb.rdx" {
            return Err(LoadHeaderError::InvalidType);
        }
        let mut buf16 = [0_u8; 2];
        buf16.copy_from_slice(&header[8..10]);
        if u16::from_le_bytes(buf16) != FORMAT_VERSION {
            return Err(LoadHeaderError::InvalidVersion);
        }
        let mut buf64 = [0_u8; 8];
        buf64.copy_from_slice(&header[10..18]);
        if u64::from_le_bytes(buf64) != uid {
            return Err(LoadHeaderError::InvalidUid);
        }
        let mut replayed = Vec::new();
        let mut buf32 = [0_u8; 4];
        loop {
            if file.read_exact(&mut buf32).is_err() {
                break;
            }
            let count = u32::from_le_bytes(buf32) as usize;
            if count > 1 << 24 {
                // A count this size is torn tail garbage, not a batch.
                break;
            }
            let mut batch = vec![0_u8; 4 + count * REDO_ENTRY_BYTES + 4];
            batch[0..4].copy_from_slice(&buf32);
            if file.read_exact(&mut batch[4..]).is_err() {
                break;
            }
            if !check_crc(&batch) {
                break;
            }
            let mut pos = 4;
            for _ in 0..count {
                buf32.copy_from_slice(&batch[pos..(pos + 4)]);
                let index = u32::from_le_bytes(buf32);
                pos += 4;
                buf64.copy_from_slice(&batch[pos..(pos + 8)]);
                let locator = u64::from_le_bytes(buf64);
                pos += 8;
                buf64.copy_from_slice(&batch[pos..(pos + 8)]);
                let scn = u64::from_le_bytes(buf64);
                pos += 8;
                replayed.push(RedoEntry {
                    index,
                    locator,
                    scn,
                });
            }
        }
        Ok((file, replayed))
    }

    /// Write the redo log header at the current position.
    fn write_redo_header(file: &mut File, uid: u64) -> io::Result<()> {
        let mut header = [0_u8; REDO_HEADER_BYTES];
        header[0..8].copy_from_slice(b"lhdb.rdx");
        header[8..10].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        header[10..18].copy_from_slice(&uid.to_le_bytes());
        add_crc32(&mut header);
        file.write_all(&header)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn open_array(files: &StoreFiles, entry_size: u32, max_entries: u32) -> AddrArray {
        files.create_dirs().unwrap();
        AddrArray::open(files.clone(), 8, entry_size, max_entries, false).unwrap()
    }

    #[test]
    fn test_set_get_expand() {
        let dir = tempfile::tempdir().unwrap();
        let files = StoreFiles::new(dir.path().join("db"));
        let addr = open_array(&files, 4, 2);
        assert_eq!(addr.capacity(), 8);
        assert_eq!(addr.get(3), 0);
        addr.set(3, 42, addr.next_scn()).unwrap();
        assert_eq!(addr.get(3), 42);
        // Out of range reads are just empty.
        assert_eq!(addr.get(100), 0);
        // Expansion rounds up to whole units.
        assert_eq!(addr.expand_capacity(8), 16);
        assert_eq!(addr.expand_capacity(16), 24);
        assert_eq!(addr.expand_capacity(5), 24);
        addr.set(17, 99, addr.next_scn()).unwrap();
        assert_eq!(addr.get(17), 99);
    }

    #[test]
    fn test_checkpoint_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let files = StoreFiles::new(dir.path().join("db"));
        {
            let addr = open_array(&files, 4, 2);
            for i in 0..8 {
                let scn = addr.next_scn();
                addr.set(i, (i as u64 + 1) * 100, scn).unwrap();
            }
            addr.close().unwrap();
        }
        let addr = open_array(&files, 4, 2);
        for i in 0..8 {
            assert_eq!(addr.get(i), (i as u64 + 1) * 100);
        }
        assert!(addr.next_scn() > 8);
    }

    #[test]
    fn test_redo_replay_without_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let files = StoreFiles::new(dir.path().join("db"));
        {
            let addr = open_array(&files, 100, 100);
            addr.expand_capacity(8);
            let scn = addr.next_scn();
            addr.set(1, 11, scn).unwrap();
            let scn = addr.next_scn();
            addr.set(9, 91, scn).unwrap();
            // Only flush the batch to the log, no checkpoint, no close- the checkpoint
            // on disk still has the old (empty) state.
            addr.persist().unwrap();
        }
        let addr = open_array(&files, 100, 100);
        assert_eq!(addr.get(1), 11);
        assert_eq!(addr.get(9), 91);
        // Replay expanded the capacity to cover index 9.
        assert_eq!(addr.capacity(), 16);
        assert!(addr.next_scn() >= 3);
    }

    #[test]
    fn test_zero_clears_slots() {
        let dir = tempfile::tempdir().unwrap();
        let files = StoreFiles::new(dir.path().join("db"));
        let addr = open_array(&files, 4, 2);
        addr.set(2, 7, addr.next_scn()).unwrap();
        addr.zero();
        addr.sync().unwrap();
        assert_eq!(addr.get(2), 0);
        assert_eq!(addr.capacity(), 8);
    }

    #[test]
    fn test_unit_mismatch_errors() {
        let dir = tempfile::tempdir().unwrap();
        let files = StoreFiles::new(dir.path().join("db"));
        {
            let addr = open_array(&files, 4, 2);
            addr.close().unwrap();
        }
        files.create_dirs().unwrap();
        let result = AddrArray::open(files, 16, 4, 2, false);
        assert!(matches!(
            result,
            Err(OpenError::AddrOpen(LoadHeaderError::UnitMismatch))
        ));
    }
}
