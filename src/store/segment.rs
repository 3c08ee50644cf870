//! Contains the data segment files and their manager.
//!
//! Bucket records live in a log of fixed size segment files under segs/ in the home
//! directory.  Records are only ever appended; a bucket update appends the new record and
//! republishes the buckets locator, leaving the old bytes dead.  Per segment live byte
//! counts drive compaction: a sealed segment whose live share falls below the compact
//! factor has its surviving records moved forward and its file deleted.
//!
//! Each record is framed as bucket:u32, scn:u64, len:u32, payload, crc32.  The crc32
//! covers the record header and payload so torn or misaddressed reads are caught.

use crate::crc::{add_crc32, check_crc};
use crate::error::write::WriteError;
use crate::error::{LoadHeaderError, OpenError, ReadError};
use crate::files::StoreFiles;
use crate::store::addr_array::AddrArray;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs;
use std::fs::{File, OpenOptions};
use std::io;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Size of a segment file header: magic, version, uid, segment id and crc32.
pub(crate) const SEGMENT_HEADER_BYTES: usize = 26;
/// Size of a record header: bucket, scn and payload length.
const RECORD_HEADER_BYTES: usize = 16;
/// Bytes added to every payload: the record header and the trailing crc32.
pub(crate) const RECORD_OVERHEAD: usize = RECORD_HEADER_BYTES + 4;
/// On disk format version.
const FORMAT_VERSION: u16 = 0;

/// Pack a segment id and byte offset into one 64 bit locator.  0 is never produced (real
/// offsets start past the segment header) so it can mean "no record".
pub(crate) fn locator(seg_id: u32, offset: u32) -> u64 {
    ((seg_id as u64) << 32) | offset as u64
}

/// Split a locator back into (segment id, offset).
pub(crate) fn locator_parts(locator: u64) -> (u32, u32) {
    ((locator >> 32) as u32, locator as u32)
}

/// One segment file.  The reader handle is shared by concurrent gets; appends go through
/// the managers writer handle.
pub(crate) struct Segment {
    id: u32,
    path: PathBuf,
    reader: Mutex<File>,
    /// Committed bytes.  Published after the append so readers never see a torn tail.
    len: AtomicU64,
    /// Bytes of records still referenced from the address array.
    live: AtomicU64,
}

impl Segment {
    /// Create a new empty segment file and return it with its append handle.
    fn create(files: &StoreFiles, uid: u64, id: u32) -> io::Result<(Arc<Segment>, File)> {
        let path = files.segment_path(id);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        let mut header = [0_u8; SEGMENT_HEADER_BYTES];
        header[0..8].copy_from_slice(b"lhdb.seg");
        header[8..10].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        header[10..18].copy_from_slice(&uid.to_le_bytes());
        header[18..22].copy_from_slice(&id.to_le_bytes());
        add_crc32(&mut header);
        file.write_all(&header)?;
        let reader = OpenOptions::new().read(true).open(&path)?;
        let segment = Arc::new(Segment {
            id,
            path,
            reader: Mutex::new(reader),
            len: AtomicU64::new(SEGMENT_HEADER_BYTES as u64),
            live: AtomicU64::new(0),
        });
        Ok((segment, file))
    }

    /// Open an existing segment file and validate its header.
    fn open(path: &Path, uid: u64, id: u32) -> Result<Segment, LoadHeaderError> {
        let mut file = OpenOptions::new().read(true).open(path)?;
        let file_end = file.seek(SeekFrom::End(0))?;
        if (file_end as usize) < SEGMENT_HEADER_BYTES {
            return Err(LoadHeaderError::CrcFailed);
        }
        file.seek(SeekFrom::Start(0))?;
        let mut header = [0_u8; SEGMENT_HEADER_BYTES];
        file.read_exact(&mut header)?;
        if !check_crc(&header) {
            return Err(LoadHeaderError::CrcFailed);
        }
        if &header[0..8] != b"lhdb.seg" {
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
        let mut buf32 = [0_u8; 4];
        buf32.copy_from_slice(&header[18..22]);
        if u32::from_le_bytes(buf32) != id {
            return Err(LoadHeaderError::InvalidType);
        }
        Ok(Segment {
            id,
            path: path.to_path_buf(),
            reader: Mutex::new(file),
            len: AtomicU64::new(file_end),
            live: AtomicU64::new(0),
        })
    }

    /// Read and verify the record at offset.
    /// Returns (bucket, scn, payload, offset of the next record).
    fn read_at(&self, offset: u64) -> Result<(u32, u64, Vec<u8>, u64), ReadError> {
        let end = self.len.load(Ordering::Acquire);
        if offset + RECORD_OVERHEAD as u64 > end {
            return Err(ReadError::CrcFailed);
        }
        let mut header = [0_u8; RECORD_HEADER_BYTES];
        let mut rest;
        {
            let mut file = self.reader.lock();
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut header)?;
            let mut buf32 = [0_u8; 4];
            buf32.copy_from_slice(&header[12..16]);
            let len = u32::from_le_bytes(buf32) as u64;
            if offset + RECORD_OVERHEAD as u64 + len > end {
                return Err(ReadError::CrcFailed);
            }
            rest = vec![0_u8; len as usize + 4];
            file.read_exact(&mut rest[..])?;
        }
        let mut buf32 = [0_u8; 4];
        let mut buf64 = [0_u8; 8];
        buf32.copy_from_slice(&header[0..4]);
        let bucket = u32::from_le_bytes(buf32);
        buf64.copy_from_slice(&header[4..12]);
        let scn = u64::from_le_bytes(buf64);
        let payload_len = rest.len() - 4;
        let mut crc32_hasher = crc32fast::Hasher::new();
        crc32_hasher.update(&header);
        crc32_hasher.update(&rest[..payload_len]);
        let calc_crc32 = crc32_hasher.finalize();
        buf32.copy_from_slice(&rest[payload_len..]);
        if calc_crc32 != u32::from_le_bytes(buf32) {
            return Err(ReadError::CrcFailed);
        }
        rest.truncate(payload_len);
        let next = offset + RECORD_OVERHEAD as u64 + payload_len as u64;
        Ok((bucket, scn, rest, next))
    }

    /// Total on disk size of the record at offset (header + payload + crc).
    fn record_total(&self, offset: u32) -> io::Result<u64> {
        let mut file = self.reader.lock();
        file.seek(SeekFrom::Start(offset as u64))?;
        let mut header = [0_u8; RECORD_HEADER_BYTES];
        file.read_exact(&mut header)?;
        let mut buf32 = [0_u8; 4];
        buf32.copy_from_slice(&header[12..16]);
        Ok(RECORD_OVERHEAD as u64 + u32::from_le_bytes(buf32) as u64)
    }
}

/// The append side state, only touched with the stores writer lock held.
struct SegmentWriter {
    segment: Arc<Segment>,
    file: File,
    offset: u64,
}

/// Owns the segment files of one store.
pub(crate) struct SegmentManager {
    files: StoreFiles,
    uid: u64,
    segment_size: u64,
    compact_factor: f64,
    map: RwLock<HashMap<u32, Arc<Segment>>>,
    writer: Mutex<SegmentWriter>,
    next_id: AtomicU32,
}

impl SegmentManager {
    /// Open the segment files under files, continuing to append to the newest one.
    pub fn open(
        files: StoreFiles,
        uid: u64,
        segment_size: u64,
        compact_factor: f64,
        truncate: bool,
    ) -> Result<Self, OpenError> {
        let mut map = HashMap::new();
        let mut newest: Option<Arc<Segment>> = None;
        for entry in fs::read_dir(files.segs_dir()).map_err(OpenError::IO)? {
            let entry = entry.map_err(OpenError::IO)?;
            let path = entry.path();
            if path.extension().map(|ext| ext == "seg").unwrap_or(false) {
                if truncate {
                    let _ = fs::remove_file(&path);
                    continue;
                }
                let id = path
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .and_then(|stem| stem.parse::<u32>().ok());
                let Some(id) = id else { continue };
                let segment =
                    Arc::new(Segment::open(&path, uid, id).map_err(OpenError::SegmentOpen)?);
                if newest.as_ref().map(|s| s.id < id).unwrap_or(true) {
                    newest = Some(segment.clone());
                }
                map.insert(id, segment);
            }
        }
        let (segment, file) = match newest {
            Some(segment) => {
                let file = OpenOptions::new()
                    .append(true)
                    .open(&segment.path)
                    .map_err(OpenError::IO)?;
                (segment, file)
            }
            None => {
                let (segment, file) =
                    Segment::create(&files, uid, 0).map_err(OpenError::IO)?;
                map.insert(0, segment.clone());
                (segment, file)
            }
        };
        let offset = segment.len.load(Ordering::Acquire);
        let next_id = segment.id + 1;
        Ok(Self {
            files,
            uid,
            segment_size,
            compact_factor,
            map: RwLock::new(map),
            writer: Mutex::new(SegmentWriter {
                segment,
                file,
                offset,
            }),
            next_id: AtomicU32::new(next_id),
        })
    }

    /// Append a record, rotating to a new segment when the current one is full.
    /// Returns the (segment id, offset) the record landed at.
    pub fn append(
        &self,
        bucket: u32,
        scn: u64,
        payload: &[u8],
    ) -> Result<(u32, u32), WriteError> {
        let total = RECORD_OVERHEAD + payload.len();
        if (SEGMENT_HEADER_BYTES + total) as u64 > self.segment_size {
            return Err(WriteError::RecordTooLarge(payload.len()));
        }
        let mut writer = self.writer.lock();
        if writer.offset + total as u64 > self.segment_size {
            self.rotate(&mut writer).map_err(WriteError::SegmentWrite)?;
        }
        let offset = writer.offset as u32;
        let mut buffer = Vec::with_capacity(total);
        buffer.extend_from_slice(&bucket.to_le_bytes());
        buffer.extend_from_slice(&scn.to_le_bytes());
        buffer.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buffer.extend_from_slice(payload);
        buffer.extend_from_slice(&[0_u8; 4]);
        add_crc32(&mut buffer[..]);
        writer
            .file
            .write_all(&buffer)
            .map_err(WriteError::SegmentWrite)?;
        writer.offset += total as u64;
        writer.segment.len.store(writer.offset, Ordering::Release);
        writer.segment.live.fetch_add(total as u64, Ordering::Relaxed);
        Ok((writer.segment.id, offset))
    }

    /// Seal the current segment and start a new one.
    fn rotate(&self, writer: &mut SegmentWriter) -> io::Result<()> {
        writer.file.sync_all()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (segment, file) = Segment::create(&self.files, self.uid, id)?;
        self.map.write().insert(id, segment.clone());
        *writer = SegmentWriter {
            segment,
            file,
            offset: SEGMENT_HEADER_BYTES as u64,
        };
        Ok(())
    }

    /// Read the record at (seg_id, offset).  Returns None if the segment is gone, the
    /// caller should reload the locator (compaction moved the record).
    pub fn read(
        &self,
        seg_id: u32,
        offset: u32,
    ) -> Result<Option<(u32, u64, Vec<u8>)>, ReadError> {
        let segment = { self.map.read().get(&seg_id).cloned() };
        match segment {
            None => Ok(None),
            Some(segment) => {
                let (bucket, scn, payload, _next) = segment.read_at(offset as u64)?;
                Ok(Some((bucket, scn, payload)))
            }
        }
    }

    /// Subtract the record at (seg_id, offset) from its segments live bytes.
    /// Accounting only, failures are ignored.
    pub fn mark_dead(&self, seg_id: u32, offset: u32) {
        let segment = { self.map.read().get(&seg_id).cloned() };
        if let Some(segment) = segment {
            if let Ok(total) = segment.record_total(offset) {
                segment.live.fetch_sub(total, Ordering::Relaxed);
            }
        }
    }

    /// Rebuild the live byte counts from the address array.  Used once at open.
    pub fn rebuild_live(&self, addr: &AddrArray) {
        for index in 0..addr.capacity() {
            let loc = addr.get(index);
            if loc == 0 {
                continue;
            }
            let (seg_id, offset) = locator_parts(loc);
            let segment = { self.map.read().get(&seg_id).cloned() };
            if let Some(segment) = segment {
                if let Ok(total) = segment.record_total(offset) {
                    segment.live.fetch_add(total, Ordering::Relaxed);
                }
            }
        }
    }

    /// Compact sealed segments whose live share fell below the compact factor: move the
    /// records still referenced by the address array forward and delete the file.
    /// Returns the number of segments reclaimed.
    pub fn compact(&self, addr: &AddrArray) -> Result<usize, WriteError> {
        let current_id = self.writer.lock().segment.id;
        let candidates: Vec<Arc<Segment>> = {
            self.map
                .read()
                .values()
                .filter(|segment| segment.id != current_id)
                .cloned()
                .collect()
        };
        let mut removed = 0;
        'segments: for segment in candidates {
            let live = segment.live.load(Ordering::Relaxed);
            if live > 0 && live as f64 / self.segment_size as f64 >= self.compact_factor {
                continue;
            }
            if live > 0 {
                let mut offset = SEGMENT_HEADER_BYTES as u64;
                let end = segment.len.load(Ordering::Acquire);
                while offset < end {
                    let (bucket, scn, payload, next) = match segment.read_at(offset) {
                        Ok(record) => record,
                        // Leave a segment we can not fully read alone.
                        Err(_) => continue 'segments,
                    };
                    if addr.get(bucket) == locator(segment.id, offset as u32) {
                        let (new_seg, new_offset) = self.append(bucket, scn, &payload)?;
                        addr.set(bucket, locator(new_seg, new_offset), scn)
                            .map_err(WriteError::AddrUpdate)?;
                    }
                    offset = next;
                }
            }
            self.map.write().remove(&segment.id);
            let _ = fs::remove_file(&segment.path);
            removed += 1;
        }
        Ok(removed)
    }

    /// Sync the current segment file to disk.
    pub fn sync(&self) -> io::Result<()> {
        self.writer.lock().file.sync_all()
    }

    /// Delete every segment and start over with a fresh one.
    pub fn clear(&self) -> io::Result<()> {
        let mut writer = self.writer.lock();
        let old: Vec<Arc<Segment>> = {
            let mut map = self.map.write();
            let old = map.values().cloned().collect();
            map.clear();
            old
        };
        for segment in old {
            let _ = fs::remove_file(&segment.path);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (segment, file) = Segment::create(&self.files, self.uid, id)?;
        self.map.write().insert(id, segment.clone());
        *writer = SegmentWriter {
            segment,
            file,
            offset: SEGMENT_HEADER_BYTES as u64,
        };
        Ok(())
    }

    #[cfg(test)]
    pub fn segment_count(&self) -> usize {
        self.map.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn manager(files: &StoreFiles, segment_size: u64) -> SegmentManager {
        files.create_dirs().unwrap();
        SegmentManager::open(files.clone(), 7, segment_size, 0.5, false).unwrap()
    }

    #[test]
    fn test_append_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let files = StoreFiles::new(dir.path().join("db"));
        let segments = manager(&files, 1024 * 1024);
        let (seg, offset) = segments.append(3, 10, b"some payload").unwrap();
        let (bucket, scn, payload) = segments.read(seg, offset).unwrap().unwrap();
        assert_eq!(bucket, 3);
        assert_eq!(scn, 10);
        assert_eq!(payload, b"some payload");
        // A missing segment reads as None.
        assert!(segments.read(seg + 10, offset).unwrap().is_none());
    }

    #[test]
    fn test_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let files = StoreFiles::new(dir.path().join("db"));
        // Room for only a couple of records per segment.
        let segments = manager(&files, 128);
        let mut located = Vec::new();
        for i in 0..20_u32 {
            let payload = vec![i as u8; 20];
            located.push((segments.append(i, i as u64, &payload).unwrap(), payload));
        }
        assert!(segments.segment_count() > 1);
        for ((seg, offset), payload) in located {
            let (_, _, read) = segments.read(seg, offset).unwrap().unwrap();
            assert_eq!(read, payload);
        }
    }

    #[test]
    fn test_record_too_large() {
        let dir = tempfile::tempdir().unwrap();
        let files = StoreFiles::new(dir.path().join("db"));
        let segments = manager(&files, 64);
        let result = segments.append(0, 1, &[0_u8; 128]);
        assert!(matches!(result, Err(WriteError::RecordTooLarge(128))));
    }

    #[test]
    fn test_reopen_appends_to_newest() {
        let dir = tempfile::tempdir().unwrap();
        let files = StoreFiles::new(dir.path().join("db"));
        let (seg1, off1);
        {
            let segments = manager(&files, 1024 * 1024);
            (seg1, off1) = segments.append(1, 1, b"first").unwrap();
            segments.sync().unwrap();
        }
        let segments = manager(&files, 1024 * 1024);
        let (seg2, off2) = segments.append(2, 2, b"second").unwrap();
        assert_eq!(seg1, seg2);
        assert!(off2 > off1);
        assert_eq!(segments.read(seg1, off1).unwrap().unwrap().2, b"first");
        assert_eq!(segments.read(seg2, off2).unwrap().unwrap().2, b"second");
    }
}
