//! Encode and decode the packed record stored in a bucket.
//!
//! A bucket holds all the key/value pairs that hash to it concatenated into one record:
//!
//! count:i32, then count times: keyLen:i32, key, valueLen:i32, value
//!
//! All framing integers are big endian.  Keys within a record are unique.  An empty bucket
//! is represented by the absence of a record, never by a count of zero.

use crate::error::codec::CodecError;

/// Bytes used by the leading entry count.
const COUNT_BYTES: usize = 4;
/// Bytes used by each key or value length.
const LEN_BYTES: usize = 4;

/// Read a non-negative i32 length at pos.
fn read_len(record: &[u8], pos: usize) -> Result<usize, CodecError> {
    let end = pos.checked_add(LEN_BYTES).ok_or(CodecError::Truncated)?;
    if end > record.len() {
        return Err(CodecError::Truncated);
    }
    let mut buf32 = [0_u8; 4];
    buf32.copy_from_slice(&record[pos..end]);
    let len = i32::from_be_bytes(buf32);
    if len < 0 {
        return Err(CodecError::BadLength);
    }
    Ok(len as usize)
}

/// Return end = start + len, checked against the record end.
fn entry_end(record: &[u8], start: usize, len: usize) -> Result<usize, CodecError> {
    let end = start.checked_add(len).ok_or(CodecError::Truncated)?;
    if end > record.len() {
        return Err(CodecError::Truncated);
    }
    Ok(end)
}

/// Return the entry count of a packed record.
pub(crate) fn entry_count(record: &[u8]) -> Result<u32, CodecError> {
    if record.len() < COUNT_BYTES {
        return Err(CodecError::Truncated);
    }
    let mut buf32 = [0_u8; 4];
    buf32.copy_from_slice(&record[0..COUNT_BYTES]);
    let count = i32::from_be_bytes(buf32);
    if count < 0 {
        return Err(CodecError::BadCount);
    }
    Ok(count as u32)
}

/// Overwrite the entry count of a packed record.
fn write_count(record: &mut [u8], count: u32) {
    record[0..COUNT_BYTES].copy_from_slice(&(count as i32).to_be_bytes());
}

/// Append one (key, value) entry to a record being assembled.
fn push_entry(record: &mut Vec<u8>, key: &[u8], value: &[u8]) {
    record.extend_from_slice(&(key.len() as i32).to_be_bytes());
    record.extend_from_slice(key);
    record.extend_from_slice(&(value.len() as i32).to_be_bytes());
    record.extend_from_slice(value);
}

/// Iterates the (key, value) entries of a packed record.  Yields borrowed slices so the
/// caller decides what to copy.  Stops after the first decode error.
pub(crate) struct Entries<'rec> {
    record: &'rec [u8],
    pos: usize,
    remaining: u32,
}

impl<'rec> Entries<'rec> {
    /// Create an entry iterator over record.  Fails if the count itself is malformed.
    pub fn new(record: &'rec [u8]) -> Result<Self, CodecError> {
        let remaining = entry_count(record)?;
        Ok(Self {
            record,
            pos: COUNT_BYTES,
            remaining,
        })
    }

    fn step(&mut self) -> Result<(&'rec [u8], &'rec [u8]), CodecError> {
        let key_len = read_len(self.record, self.pos)?;
        let key_start = self.pos + LEN_BYTES;
        let key_end = entry_end(self.record, key_start, key_len)?;
        let value_len = read_len(self.record, key_end)?;
        let value_start = key_end + LEN_BYTES;
        let value_end = entry_end(self.record, value_start, value_len)?;
        self.pos = value_end;
        Ok((
            &self.record[key_start..key_end],
            &self.record[value_start..value_end],
        ))
    }
}

impl<'rec> Iterator for Entries<'rec> {
    type Item = Result<(&'rec [u8], &'rec [u8]), CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        match self.step() {
            Ok(entry) => {
                self.remaining -= 1;
                Some(Ok(entry))
            }
            Err(err) => {
                self.remaining = 0;
                Some(Err(err))
            }
        }
    }
}

/// Scan record for key and return a copy of its value, or None if the key is not present.
pub(crate) fn extract_by_key(key: &[u8], record: &[u8]) -> Result<Option<Vec<u8>>, CodecError> {
    for entry in Entries::new(record)? {
        let (entry_key, entry_value) = entry?;
        if entry_key == key {
            return Ok(Some(entry_value.to_vec()));
        }
    }
    Ok(None)
}

/// Produce a record holding the single entry (key, value).
pub(crate) fn assemble(key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut record = Vec::with_capacity(COUNT_BYTES + 2 * LEN_BYTES + key.len() + value.len());
    record.extend_from_slice(&1_i32.to_be_bytes());
    push_entry(&mut record, key, value);
    record
}

/// Insert-or-replace: rebuild existing with (key, value) replacing the entry for key if it
/// is already present, appended otherwise.  The count is updated to match.
pub(crate) fn assemble_with(
    key: &[u8],
    value: &[u8],
    existing: &[u8],
) -> Result<Vec<u8>, CodecError> {
    let count = entry_count(existing)?;
    let mut record =
        Vec::with_capacity(existing.len() + 2 * LEN_BYTES + key.len() + value.len());
    record.extend_from_slice(&existing[0..COUNT_BYTES]);
    let mut replaced = false;
    for entry in Entries::new(existing)? {
        let (entry_key, entry_value) = entry?;
        if entry_key == key {
            push_entry(&mut record, key, value);
            replaced = true;
        } else {
            push_entry(&mut record, entry_key, entry_value);
        }
    }
    if !replaced {
        push_entry(&mut record, key, value);
        write_count(&mut record, count + 1);
    }
    Ok(record)
}

/// Remove the entry for key from record in place, shifting the tail left over it and
/// decrementing the count.  Returns the new byte length, record.len() if the key was not
/// present (record unchanged), or 0 if the removed entry was the last one (the caller
/// should delete the bucket).
pub(crate) fn remove_by_key(key: &[u8], record: &mut [u8]) -> Result<usize, CodecError> {
    let count = entry_count(record)?;
    let mut pos = COUNT_BYTES;
    let mut found: Option<(usize, usize)> = None;
    for _ in 0..count {
        let key_len = read_len(record, pos)?;
        let key_start = pos + LEN_BYTES;
        let key_end = entry_end(record, key_start, key_len)?;
        let value_len = read_len(record, key_end)?;
        let value_start = key_end + LEN_BYTES;
        let value_end = entry_end(record, value_start, value_len)?;
        if &record[key_start..key_end] == key {
            found = Some((pos, value_end));
            break;
        }
        pos = value_end;
    }
    match found {
        None => Ok(record.len()),
        Some(_) if count == 1 => Ok(0),
        Some((start, end)) => {
            record.copy_within(end.., start);
            let new_len = record.len() - (end - start);
            write_count(record, count - 1);
            Ok(new_len)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assemble_extract() {
        let record = assemble(b"key one", b"value one");
        assert_eq!(entry_count(&record).unwrap(), 1);
        assert_eq!(
            extract_by_key(b"key one", &record).unwrap().unwrap(),
            b"value one"
        );
        assert!(extract_by_key(b"key two", &record).unwrap().is_none());
    }

    #[test]
    fn test_assemble_with_appends() {
        let record = assemble(b"k1", b"v1");
        let record = assemble_with(b"k2", b"v2", &record).unwrap();
        let record = assemble_with(b"k3", b"v3", &record).unwrap();
        assert_eq!(entry_count(&record).unwrap(), 3);
        assert_eq!(extract_by_key(b"k1", &record).unwrap().unwrap(), b"v1");
        assert_eq!(extract_by_key(b"k2", &record).unwrap().unwrap(), b"v2");
        assert_eq!(extract_by_key(b"k3", &record).unwrap().unwrap(), b"v3");
    }

    #[test]
    fn test_assemble_with_replaces() {
        let record = assemble(b"k1", b"v1");
        let record = assemble_with(b"k2", b"v2", &record).unwrap();
        let record = assemble_with(b"k1", b"v1 again", &record).unwrap();
        assert_eq!(entry_count(&record).unwrap(), 2);
        assert_eq!(
            extract_by_key(b"k1", &record).unwrap().unwrap(),
            b"v1 again"
        );
        assert_eq!(extract_by_key(b"k2", &record).unwrap().unwrap(), b"v2");
    }

    #[test]
    fn test_remove_middle() {
        let record = assemble(b"k1", b"v1");
        let record = assemble_with(b"k2", b"v2", &record).unwrap();
        let mut record = assemble_with(b"k3", b"v3", &record).unwrap();
        let old_len = record.len();
        let new_len = remove_by_key(b"k2", &mut record).unwrap();
        assert!(new_len < old_len);
        assert!(new_len > 0);
        record.truncate(new_len);
        assert_eq!(entry_count(&record).unwrap(), 2);
        assert_eq!(extract_by_key(b"k1", &record).unwrap().unwrap(), b"v1");
        assert!(extract_by_key(b"k2", &record).unwrap().is_none());
        assert_eq!(extract_by_key(b"k3", &record).unwrap().unwrap(), b"v3");
    }

    #[test]
    fn test_remove_last_entry_empties() {
        let mut record = assemble(b"k1", b"v1");
        assert_eq!(remove_by_key(b"k1", &mut record).unwrap(), 0);
    }

    #[test]
    fn test_remove_absent_is_unchanged() {
        let mut record = assemble(b"k1", b"v1");
        let before = record.clone();
        assert_eq!(remove_by_key(b"nope", &mut record).unwrap(), record.len());
        assert_eq!(record, before);
    }

    #[test]
    fn test_empty_values_round_trip() {
        let record = assemble(b"k1", b"");
        let record = assemble_with(b"k2", b"", &record).unwrap();
        assert_eq!(extract_by_key(b"k1", &record).unwrap().unwrap(), b"");
        assert_eq!(extract_by_key(b"k2", &record).unwrap().unwrap(), b"");
    }

    #[test]
    fn test_truncated_record_errors() {
        let mut record = assemble(b"key one", b"value one");
        record.truncate(record.len() - 3);
        assert!(matches!(
            extract_by_key(b"key one", &record),
            Err(CodecError::Truncated)
        ));
        assert!(matches!(
            remove_by_key(b"key one", &mut record),
            Err(CodecError::Truncated)
        ));
    }

    #[test]
    fn test_negative_count_errors() {
        let mut record = assemble(b"k", b"v");
        record[0..4].copy_from_slice(&(-1_i32).to_be_bytes());
        assert!(matches!(entry_count(&record), Err(CodecError::BadCount)));
        assert!(matches!(
            assemble_with(b"k2", b"v2", &record),
            Err(CodecError::BadCount)
        ));
    }

    #[test]
    fn test_count_overstates_entries() {
        let mut record = assemble(b"k", b"v");
        // Claim two entries while only one is present.
        record[0..4].copy_from_slice(&2_i32.to_be_bytes());
        assert!(matches!(
            extract_by_key(b"other", &record),
            Err(CodecError::Truncated)
        ));
    }

    #[test]
    fn test_entries_iterates_in_order() {
        let record = assemble(b"k1", b"v1");
        let record = assemble_with(b"k2", b"v2", &record).unwrap();
        let entries: Vec<_> = Entries::new(&record)
            .unwrap()
            .map(|e| e.unwrap())
            .collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], (&b"k1"[..], &b"v1"[..]));
        assert_eq!(entries[1], (&b"k2"[..], &b"v2"[..]));
    }
}
