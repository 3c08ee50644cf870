//! Helpers for the trailing CRC32 code carried by every on disk header, redo batch and
//! data record.  The code always occupies the last four bytes, little endian, and covers
//! everything before it.

/// True if the last four bytes of buffer hold the crc32 of everything before them.
/// A buffer too small to hold a code plus at least one byte of content never verifies.
pub(crate) fn check_crc(buffer: &[u8]) -> bool {
    let Some(body_len) = buffer.len().checked_sub(4) else {
        return false;
    };
    if body_len == 0 {
        return false;
    }
    let (body, code) = buffer.split_at(body_len);
    let mut stored = [0_u8; 4];
    stored.copy_from_slice(code);
    crc32fast::hash(body) == u32::from_le_bytes(stored)
}

/// Overwrite the last four bytes of buffer with the crc32 of everything before them.
/// Buffers without room for the code are left alone.
pub(crate) fn add_crc32(buffer: &mut [u8]) {
    let Some(body_len) = buffer.len().checked_sub(4) else {
        return;
    };
    let (body, code) = buffer.split_at_mut(body_len);
    code.copy_from_slice(&crc32fast::hash(body).to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc_round_trip() {
        let mut buffer = vec![1_u8, 2, 3, 4, 5, 0, 0, 0, 0];
        add_crc32(&mut buffer[..]);
        assert!(check_crc(&buffer[..]));
        buffer[0] = 2;
        assert!(!check_crc(&buffer[..]));
    }

    #[test]
    fn test_crc_code_only_never_verifies() {
        let mut buffer = vec![0_u8; 4];
        add_crc32(&mut buffer[..]);
        assert!(!check_crc(&buffer[..]));
        assert!(!check_crc(&[] as &[u8]));
    }
}
