//! # chunkwire Files
//!
//! File engine for chunkwire.
//!
//! This crate provides:
//! - Chunk planning that tiles a file exactly (last chunk absorbs the remainder)
//! - BLAKE3-derived chunk and whole-file checksums
//! - Offset-addressed reassembly for out-of-order chunk arrival
//! - The shareable-file catalog and its line-oriented wire form

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod catalog;
pub mod chunker;
pub mod hasher;

use serde::Serialize;

/// Default chunk size (1 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Catalog entry for one shareable file.
///
/// An immutable snapshot taken when the catalog is generated; the server does
/// not track later changes to the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileDescriptor {
    /// File name, relative to the shared directory
    pub name: String,
    /// File size in bytes
    pub size_bytes: u64,
    /// Whole-file checksum (lowercase hex)
    pub checksum: String,
}
