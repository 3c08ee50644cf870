//! Contains the error for the put() and delete() functions.

use crate::error::codec::CodecError;
use crate::error::ReadError;
use std::error::Error;
use std::fmt;
use std::io;

/// Custom error type for writes.
#[derive(Debug)]
pub enum WriteError {
    /// Error reading the buckets existing record.
    Read(ReadError),
    /// An io error appending the record to a segment.
    SegmentWrite(io::Error),
    /// An io error updating the address array.
    AddrUpdate(io::Error),
    /// The record is larger than a single segment file can hold.
    RecordTooLarge(usize),
    /// A bucket record failed to decode while its bucket was being split.
    SplitCodec(CodecError),
}

impl Error for WriteError {}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self {
            Self::Read(e) => write!(f, "read bucket: {}", e),
            Self::SegmentWrite(e) => write!(f, "segment write: {}", e),
            Self::AddrUpdate(e) => write!(f, "address update: {}", e),
            Self::RecordTooLarge(size) => write!(f, "record of {} bytes exceeds segment size", size),
            Self::SplitCodec(e) => write!(f, "record decode during split: {}", e),
        }
    }
}

impl From<ReadError> for WriteError {
    fn from(err: ReadError) -> Self {
        Self::Read(err)
    }
}
