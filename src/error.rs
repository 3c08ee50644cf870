//! Implements the errors for a store.  Each public operation gets its own error enum so a
//! caller can see exactly which layer failed.

pub mod close;
pub mod codec;
pub mod write;

use crate::error::codec::CodecError;
use crate::error::write::WriteError;
use std::error::Error;
use std::fmt;
use std::io;

/// Error on loading a file header (address checkpoint, redo log or segment).
#[derive(Debug)]
pub enum LoadHeaderError {
    /// The type string for the header was invalid- corrupted or incorrect file type.
    InvalidType,
    /// The calculated and recorded crc32 codes do not match.
    CrcFailed,
    /// The on disk format version is not supported.
    InvalidVersion,
    /// The file does not belong to this store (uid mismatch).
    InvalidUid,
    /// The file was built with a different sub array length than the config asks for.
    UnitMismatch,
    /// An underlying IO error while loading the header.
    IO(io::Error),
}

impl Error for LoadHeaderError {}

impl fmt::Display for LoadHeaderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self {
            Self::InvalidType => write!(f, "invalid type id"),
            Self::CrcFailed => write!(f, "crc32 mismatch"),
            Self::InvalidVersion => write!(f, "unsupported format version"),
            Self::InvalidUid => write!(f, "store uid mismatch"),
            Self::UnitMismatch => write!(f, "sub array length mismatch"),
            Self::IO(e) => write!(f, "io: {}", e),
        }
    }
}

impl From<io::Error> for LoadHeaderError {
    fn from(io_err: io::Error) -> Self {
        Self::IO(io_err)
    }
}

/// Error on opening a store.
#[derive(Debug)]
pub enum OpenError {
    /// The home directory is missing (and create was not requested) or could not be created.
    HomeDir(io::Error),
    /// Error opening the address array files.
    AddrOpen(LoadHeaderError),
    /// Error opening a data segment file.
    SegmentOpen(LoadHeaderError),
    /// Error re-splitting the trailing unit while deriving the hash state.
    Bootstrap(WriteError),
    /// An underlying IO error while opening the store.
    IO(io::Error),
}

impl Error for OpenError {}

impl fmt::Display for OpenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self {
            Self::HomeDir(e) => write!(f, "home directory: {}", e),
            Self::AddrOpen(e) => write!(f, "address array open failed: {}", e),
            Self::SegmentOpen(e) => write!(f, "segment open failed: {}", e),
            Self::Bootstrap(e) => write!(f, "bootstrap split failed: {}", e),
            Self::IO(e) => write!(f, "io: {}", e),
        }
    }
}

/// Error on reading a bucket record.
#[derive(Debug)]
pub enum ReadError {
    /// An IO error reading from a segment.
    IO(io::Error),
    /// The calculated and recorded crc32 codes do not match for the record.
    CrcFailed,
    /// The bucket record did not decode.
    Codec(CodecError),
    /// The records locator points at a segment that no longer exists.
    SegmentMissing,
}

impl Error for ReadError {}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self {
            Self::IO(e) => write!(f, "io: {}", e),
            Self::CrcFailed => write!(f, "crc32 mismatch"),
            Self::Codec(e) => write!(f, "record decode: {}", e),
            Self::SegmentMissing => write!(f, "segment no longer exists"),
        }
    }
}

impl From<io::Error> for ReadError {
    fn from(io_err: io::Error) -> Self {
        Self::IO(io_err)
    }
}

impl From<CodecError> for ReadError {
    fn from(err: CodecError) -> Self {
        Self::Codec(err)
    }
}

/// Error from sync(), persist() or clear().
#[derive(Debug)]
pub enum CommitError {
    /// An io error flushing or syncing segment data.
    DataFileSync(io::Error),
    /// An io error flushing or checkpointing the address array.
    AddrSync(io::Error),
    /// Error compacting under used segments.
    Compact(WriteError),
    /// An io error clearing the store.
    Clear(io::Error),
}

impl Error for CommitError {}

impl fmt::Display for CommitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self {
            Self::DataFileSync(e) => write!(f, "data sync: {}", e),
            Self::AddrSync(e) => write!(f, "address array sync: {}", e),
            Self::Compact(e) => write!(f, "compact: {}", e),
            Self::Clear(e) => write!(f, "clear: {}", e),
        }
    }
}

/// Error from rehash().
#[derive(Debug)]
pub enum RehashError {
    /// A bucket split failed.
    Split(WriteError),
    /// The sync after the split pass failed.
    Sync(CommitError),
}

impl Error for RehashError {}

impl fmt::Display for RehashError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self {
            Self::Split(e) => write!(f, "split: {}", e),
            Self::Sync(e) => write!(f, "sync: {}", e),
        }
    }
}
