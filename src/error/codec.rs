//! Contains the error for decoding a packed bucket record.

use std::error::Error;
use std::fmt;

/// Error decoding the packed record stored in a bucket.
#[derive(Debug)]
pub enum CodecError {
    /// The record ended before the bytes its counts and lengths promised.
    Truncated,
    /// The entry count was negative.
    BadCount,
    /// A key or value length was negative.
    BadLength,
}

impl Error for CodecError {}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self {
            Self::Truncated => write!(f, "truncated record"),
            Self::BadCount => write!(f, "invalid entry count"),
            Self::BadLength => write!(f, "invalid entry length"),
        }
    }
}
