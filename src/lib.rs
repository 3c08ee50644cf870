#![deny(missing_docs)]

//! Crate to implement a persistent key/value store that grows with linear hashing
//! (https://en.wikipedia.org/wiki/Linear_hashing).
//! Keys and values are opaque byte sequences.  Records live in a log of fixed size
//! segment files and are addressed through a dynamic array of 64 bit locators, one per
//! hash bucket; each bucket packs its key/value pairs into a single record.  The bucket
//! space grows one bucket at a time as the load factor crosses its threshold, so there is
//! never a stop-the-world rehash.
//!
//! One store instance may be shared across threads.  Writes serialize on an internal
//! lock; reads and iteration never take it, they re-check the bucket index against the
//! published (level, split) state instead.
//!
//! The default hash function is 64 bit FNV-1a.  Note that the store requires a stable
//! hash function so the default Rust hasher is NOT appropriate (it is randomized per
//! process, which would make the buckets invalid when reopened).
//!
//! It uses CRC32 checksums to verify all file headers and records
//! (See https://github.com/srijs/rust-crc32fast).

pub(crate) mod codec;
pub mod config;
pub(crate) mod crc;
pub mod error;
pub mod files;
pub mod hasher;
pub mod store;
pub mod store_iter;
