//! Contains the error for the close() function.

use std::error::Error;
use std::fmt;
use std::io;

/// Custom error type for close.  Both halves of the store are always closed; if both fail
/// the two failures are reported together.
#[derive(Debug)]
pub enum CloseError {
    /// Error flushing and closing the data segments.
    Data(io::Error),
    /// Error checkpointing and closing the address array.
    Addr(io::Error),
    /// Both closes failed.
    Both(io::Error, io::Error),
}

impl Error for CloseError {}

impl fmt::Display for CloseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self {
            Self::Data(e) => write!(f, "data close failed: {}", e),
            Self::Addr(e) => write!(f, "address array close failed: {}", e),
            Self::Both(d, a) => write!(f, "data close failed: {} / address array close failed: {}", d, a),
        }
    }
}
