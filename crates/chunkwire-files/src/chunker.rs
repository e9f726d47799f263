//! Chunk planning, ranged reads, and offset-addressed reassembly.
//!
//! A file is split into [`ChunkSpec`]s that tile `[0, size)` exactly: ordered
//! by sequence, pairwise disjoint, contiguous. The final chunk absorbs the
//! remainder (`size mod chunk_size`) instead of becoming a short trailing
//! chunk, so every chunk but the last has the nominal size and the last is at
//! least that large.
//!
//! Reassembly writes each chunk at its own offset, so the order in which
//! chunks arrive never affects the output.

use crate::DEFAULT_CHUNK_SIZE;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use thiserror::Error;

/// One contiguous byte range of a file, the atomic unit of transfer and retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSpec {
    /// File the chunk belongs to
    pub file_name: String,
    /// Position of the chunk in the plan (0-based)
    pub sequence: u32,
    /// Byte offset of the first byte
    pub start: u64,
    /// Number of bytes in the chunk
    pub length: u64,
}

impl ChunkSpec {
    /// Exclusive end offset
    #[must_use]
    pub fn end(&self) -> u64 {
        self.start + self.length
    }
}

/// How a file is divided into chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkSizing {
    /// Nominal chunk size in bytes
    Fixed(u64),
    /// Fixed number of chunks, regardless of file size
    Count(u32),
}

impl Default for ChunkSizing {
    fn default() -> Self {
        Self::Fixed(DEFAULT_CHUNK_SIZE)
    }
}

/// Errors from chunk planning
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    /// Chunk size or chunk count of zero
    #[error("Chunk sizing must be non-zero")]
    ZeroSizing,

    /// More chunks than a 32-bit sequence number can address
    #[error("File of {size} bytes needs {chunks} chunks (max {max})", max = u32::MAX)]
    TooManyChunks {
        /// File size in bytes
        size: u64,
        /// Chunks the plan would need
        chunks: u64,
    },

    /// A chunk length does not fit the 32-bit length field
    #[error("Chunk of {0} bytes exceeds the 32-bit length field")]
    ChunkTooLarge(u64),
}

/// Compute the chunk plan for a file.
///
/// An empty file has an empty plan. A file smaller than one nominal chunk
/// becomes a single chunk. With [`ChunkSizing::Count`] a file smaller than the
/// requested count gets one chunk per byte rather than zero-length chunks.
///
/// # Errors
///
/// Returns `PlanError` if the sizing is zero or the plan cannot be expressed
/// with 32-bit sequence and length fields.
pub fn plan_chunks(
    file_name: &str,
    total_size: u64,
    sizing: ChunkSizing,
) -> Result<Vec<ChunkSpec>, PlanError> {
    if total_size == 0 {
        return match sizing {
            ChunkSizing::Fixed(0) | ChunkSizing::Count(0) => Err(PlanError::ZeroSizing),
            _ => Ok(Vec::new()),
        };
    }

    let (count, nominal) = match sizing {
        ChunkSizing::Fixed(0) | ChunkSizing::Count(0) => return Err(PlanError::ZeroSizing),
        ChunkSizing::Fixed(size) => ((total_size / size).max(1), size),
        ChunkSizing::Count(n) => {
            let count = u64::from(n).min(total_size);
            (count, total_size / count)
        }
    };

    if count > u64::from(u32::MAX) {
        return Err(PlanError::TooManyChunks {
            size: total_size,
            chunks: count,
        });
    }

    let last_length = total_size - (count - 1) * nominal;
    if last_length > u64::from(u32::MAX) {
        return Err(PlanError::ChunkTooLarge(last_length));
    }

    let specs = (0..count)
        .map(|i| {
            let start = i * nominal;
            let length = if i + 1 == count { last_length } else { nominal };
            ChunkSpec {
                file_name: file_name.to_string(),
                sequence: i as u32,
                start,
                length,
            }
        })
        .collect();

    Ok(specs)
}

/// Read up to `length` bytes starting at `start` from a freshly opened handle.
///
/// Returns fewer bytes when the range runs past the end of the file, and an
/// empty buffer when `start` is at or beyond it.
///
/// # Errors
///
/// Returns an error if the file cannot be opened, seeked, or read.
pub fn read_range<P: AsRef<Path>>(path: P, start: u64, length: u64) -> io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(start))?;

    let capacity = usize::try_from(length.min(1 << 24)).unwrap_or(0);
    let mut buffer = Vec::with_capacity(capacity);
    file.take(length).read_to_end(&mut buffer)?;
    Ok(buffer)
}

/// File reassembler for the receiving side
///
/// Supports out-of-order chunk writing for parallel downloads. Each chunk is
/// written at its own offset and tracked by sequence number in a bitmap.
pub struct FileReassembler {
    file: File,
    total_size: u64,
    total_chunks: u64,
    /// Bitmap tracking received chunks (bit = 1 means received)
    chunk_bitmap: Vec<u64>,
    received_count: u64,
}

impl FileReassembler {
    /// Create a new reassembler, truncating and pre-sizing the output file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or pre-allocated.
    pub fn new<P: AsRef<Path>>(path: P, total_size: u64, total_chunks: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        file.set_len(total_size)?;

        let bitmap_words = total_chunks.div_ceil(64) as usize;

        Ok(Self {
            file,
            total_size,
            total_chunks,
            chunk_bitmap: vec![0u64; bitmap_words],
            received_count: 0,
        })
    }

    /// Write one chunk at the offset its `ChunkSpec` names.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the sequence is out of range, the data length
    /// differs from the `ChunkSpec`, or the range runs past the file size.
    pub fn write_chunk(&mut self, spec: &ChunkSpec, data: &[u8]) -> io::Result<()> {
        let sequence = u64::from(spec.sequence);
        if sequence >= self.total_chunks {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Chunk sequence {sequence} out of bounds"),
            ));
        }
        if data.len() as u64 != spec.length || spec.end() > self.total_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "Chunk {sequence} of {} bytes does not fit range {}..{} of {}",
                    data.len(),
                    spec.start,
                    spec.end(),
                    self.total_size
                ),
            ));
        }

        self.file.seek(SeekFrom::Start(spec.start))?;
        self.file.write_all(data)?;

        if !Self::bitmap_test(&self.chunk_bitmap, sequence) {
            Self::bitmap_set(&mut self.chunk_bitmap, sequence);
            self.received_count += 1;
        }

        Ok(())
    }

    /// Sequences not yet written, ascending
    fn missing_chunks(&self) -> Vec<u32> {
        let mut missing = Vec::with_capacity((self.total_chunks - self.received_count) as usize);

        for (word_idx, &word) in self.chunk_bitmap.iter().enumerate() {
            if word == u64::MAX {
                continue;
            }
            let mut unset = !word;
            while unset != 0 {
                let bit = u64::from(unset.trailing_zeros());
                let idx = (word_idx as u64) * 64 + bit;
                if idx < self.total_chunks {
                    missing.push(idx as u32);
                }
                unset &= unset - 1;
            }
        }

        missing
    }

    /// Check if every chunk has been written
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.received_count == self.total_chunks
    }

    /// Sync and close the file
    ///
    /// # Errors
    ///
    /// Returns an error if not all chunks are received or syncing fails.
    pub fn finalize(self) -> io::Result<()> {
        if !self.is_complete() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Reassembly incomplete: {}/{} chunks received, missing {:?}",
                    self.received_count,
                    self.total_chunks,
                    self.missing_chunks()
                ),
            ));
        }

        self.file.sync_all()
    }

    fn bitmap_set(bitmap: &mut [u64], idx: u64) {
        bitmap[(idx / 64) as usize] |= 1u64 << (idx % 64);
    }

    fn bitmap_test(bitmap: &[u64], idx: u64) -> bool {
        (bitmap[(idx / 64) as usize] >> (idx % 64)) & 1 == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn assert_tiles(specs: &[ChunkSpec], size: u64) {
        let mut cursor = 0;
        for (i, spec) in specs.iter().enumerate() {
            assert_eq!(spec.sequence as usize, i);
            assert_eq!(spec.start, cursor);
            assert!(spec.length > 0);
            cursor = spec.end();
        }
        assert_eq!(cursor, size);
    }

    #[test]
    fn test_plan_exact_multiple() {
        let specs = plan_chunks("a.bin", 4 * DEFAULT_CHUNK_SIZE, ChunkSizing::default()).unwrap();
        assert_eq!(specs.len(), 4);
        assert!(specs.iter().all(|s| s.length == DEFAULT_CHUNK_SIZE));
    }

    #[test]
    fn test_plan_last_chunk_absorbs_remainder() {
        let specs = plan_chunks("a.bin", 10, ChunkSizing::Fixed(4)).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!((specs[0].start, specs[0].length), (0, 4));
        assert_eq!((specs[1].start, specs[1].length), (4, 6));
    }

    #[test]
    fn test_plan_smaller_than_one_chunk() {
        let specs = plan_chunks("tiny", 3, ChunkSizing::Fixed(1024)).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].length, 3);
    }

    #[test]
    fn test_plan_empty_file() {
        assert!(plan_chunks("empty", 0, ChunkSizing::Fixed(16)).unwrap().is_empty());
        assert!(plan_chunks("empty", 0, ChunkSizing::Count(4)).unwrap().is_empty());
    }

    #[test]
    fn test_plan_by_count() {
        let size = 5 * 1024 * 1024;
        let specs = plan_chunks("5MB.zip", size, ChunkSizing::Count(4)).unwrap();
        assert_eq!(specs.len(), 4);
        assert!(specs.iter().all(|s| s.length == size / 4));
        assert_tiles(&specs, size);
    }

    #[test]
    fn test_plan_count_larger_than_size() {
        let specs = plan_chunks("small", 3, ChunkSizing::Count(8)).unwrap();
        assert_eq!(specs.len(), 3);
        assert_tiles(&specs, 3);
    }

    #[test]
    fn test_plan_zero_sizing_rejected() {
        assert_eq!(
            plan_chunks("x", 10, ChunkSizing::Fixed(0)),
            Err(PlanError::ZeroSizing)
        );
        assert_eq!(
            plan_chunks("x", 10, ChunkSizing::Count(0)),
            Err(PlanError::ZeroSizing)
        );
    }

    #[test]
    fn test_plan_too_many_chunks() {
        let err = plan_chunks("huge", u64::MAX, ChunkSizing::Fixed(1)).unwrap_err();
        assert!(matches!(err, PlanError::TooManyChunks { .. }));
    }

    #[test]
    fn test_plan_chunk_too_large() {
        let err = plan_chunks("huge", 1 << 40, ChunkSizing::Count(1)).unwrap_err();
        assert_eq!(err, PlanError::ChunkTooLarge(1 << 40));
    }

    proptest! {
        #[test]
        fn prop_fixed_plan_tiles_file(size in 0u64..10_000_000, chunk in 1_000u64..2_000_000) {
            let specs = plan_chunks("p", size, ChunkSizing::Fixed(chunk)).unwrap();
            assert_tiles(&specs, size);
            if let Some((last, rest)) = specs.split_last() {
                prop_assert!(rest.iter().all(|s| s.length == chunk));
                prop_assert!(last.length >= chunk.min(size));
            }
        }

        #[test]
        fn prop_count_plan_tiles_file(size in 0u64..10_000_000, count in 1u32..64) {
            let specs = plan_chunks("p", size, ChunkSizing::Count(count)).unwrap();
            assert_tiles(&specs, size);
            prop_assert!(specs.len() as u64 <= u64::from(count));
        }
    }

    #[test]
    fn test_read_range_middle_and_eof() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(b"0123456789").unwrap();
        temp.flush().unwrap();

        assert_eq!(read_range(temp.path(), 2, 3).unwrap(), b"234");
        assert_eq!(read_range(temp.path(), 8, 10).unwrap(), b"89");
        assert!(read_range(temp.path(), 20, 5).unwrap().is_empty());
    }

    #[test]
    fn test_reassembly_out_of_order() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 256) as u8).collect();
        let specs = plan_chunks("f", data.len() as u64, ChunkSizing::Fixed(3000)).unwrap();

        let output = NamedTempFile::new().unwrap();
        let mut reassembler =
            FileReassembler::new(output.path(), data.len() as u64, specs.len() as u64).unwrap();

        for spec in specs.iter().rev() {
            let range = spec.start as usize..spec.end() as usize;
            reassembler.write_chunk(spec, &data[range]).unwrap();
        }

        assert!(reassembler.is_complete());
        reassembler.finalize().unwrap();
        assert_eq!(std::fs::read(output.path()).unwrap(), data);
    }

    #[test]
    fn test_finalize_names_missing_chunks() {
        let specs = plan_chunks("f", 100, ChunkSizing::Fixed(10)).unwrap();
        let output = NamedTempFile::new().unwrap();
        let mut reassembler = FileReassembler::new(output.path(), 100, 10).unwrap();

        for seq in [0usize, 2, 5] {
            reassembler.write_chunk(&specs[seq], &[0u8; 10]).unwrap();
        }

        assert!(!reassembler.is_complete());
        let err = reassembler.finalize().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(
            err.to_string().ends_with("3/10 chunks received, missing [1, 3, 4, 6, 7, 8, 9]"),
            "{err}"
        );
    }

    #[test]
    fn test_write_chunk_length_mismatch_rejected() {
        let specs = plan_chunks("f", 20, ChunkSizing::Fixed(10)).unwrap();
        let output = NamedTempFile::new().unwrap();
        let mut reassembler = FileReassembler::new(output.path(), 20, 2).unwrap();

        let err = reassembler.write_chunk(&specs[0], &[0u8; 9]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_incomplete_finalize_fails() {
        let output = NamedTempFile::new().unwrap();
        let reassembler = FileReassembler::new(output.path(), 100, 10).unwrap();
        assert!(reassembler.finalize().is_err());
    }

    #[test]
    fn test_zero_byte_reassembly_is_complete() {
        let output = NamedTempFile::new().unwrap();
        let reassembler = FileReassembler::new(output.path(), 0, 0).unwrap();
        assert!(reassembler.is_complete());
        reassembler.finalize().unwrap();
        assert_eq!(std::fs::metadata(output.path()).unwrap().len(), 0);
    }
}
