//! Chunk and whole-file checksums.
//!
//! Both checksums come from the same BLAKE3 digest. A chunk checksum is the
//! first [`CHECKSUM_SIZE`] hex characters of the digest of the chunk payload,
//! sized to fit the fixed checksum field of the chunk header. A file checksum
//! is the full 64-character hex digest of the file contents.
//!
//! Collision resistance is not a goal here; the checksums only detect
//! corruption in transit.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Width of the chunk checksum field in bytes (ASCII hex characters).
pub const CHECKSUM_SIZE: usize = 16;

/// Read buffer used when hashing whole files.
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Errors produced when decoding a checksum field
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChecksumError {
    /// Field has the wrong number of characters
    #[error("Invalid checksum length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Expected number of characters
        expected: usize,
        /// Actual number of characters
        actual: usize,
    },

    /// Field contains a non-hex character
    #[error("Checksum is not ASCII hex: {0:?}")]
    NotHex(String),
}

/// Fixed-width checksum carried in every chunk header.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkChecksum([u8; CHECKSUM_SIZE]);

impl ChunkChecksum {
    /// Compute the checksum of a chunk payload.
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        let digest = blake3::hash(data).to_hex();
        let mut field = [0u8; CHECKSUM_SIZE];
        field.copy_from_slice(&digest.as_bytes()[..CHECKSUM_SIZE]);
        Self(field)
    }

    /// Build a checksum from a raw header field.
    ///
    /// # Errors
    ///
    /// Returns `ChecksumError::NotHex` if any byte is not an ASCII hex digit.
    pub fn from_field(field: [u8; CHECKSUM_SIZE]) -> Result<Self, ChecksumError> {
        if !field.iter().all(u8::is_ascii_hexdigit) {
            return Err(ChecksumError::NotHex(
                String::from_utf8_lossy(&field).into_owned(),
            ));
        }
        let mut normalized = field;
        normalized.make_ascii_lowercase();
        Ok(Self(normalized))
    }

    /// Raw header field bytes
    #[must_use]
    pub fn as_field(&self) -> &[u8; CHECKSUM_SIZE] {
        &self.0
    }

    /// Checksum as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        // Only ASCII hex is ever stored.
        std::str::from_utf8(&self.0).unwrap_or_default()
    }

    /// Check whether `data` hashes to this checksum
    #[must_use]
    pub fn matches(&self, data: &[u8]) -> bool {
        Self::compute(data) == *self
    }
}

impl FromStr for ChunkChecksum {
    type Err = ChecksumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let field: [u8; CHECKSUM_SIZE] =
            s.as_bytes()
                .try_into()
                .map_err(|_| ChecksumError::InvalidLength {
                    expected: CHECKSUM_SIZE,
                    actual: s.len(),
                })?;
        Self::from_field(field)
    }
}

impl fmt::Display for ChunkChecksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for ChunkChecksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkChecksum({})", self.as_str())
    }
}

/// Whole-file checksum of an in-memory buffer (64 lowercase hex chars).
#[must_use]
pub fn data_checksum(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Whole-file checksum of a file on disk, streamed in fixed-size reads.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read.
pub fn file_checksum<P: AsRef<Path>>(path: P) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let n = match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize().to_hex().to_string())
}

/// Compare two whole-file checksums, ignoring hex case.
#[must_use]
pub fn checksums_match(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_chunk_checksum_is_prefix_of_file_checksum() {
        let data = b"chunkwire payload";
        let chunk = ChunkChecksum::compute(data);
        let full = data_checksum(data);
        assert_eq!(full.len(), 64);
        assert!(full.starts_with(chunk.as_str()));
    }

    #[test]
    fn test_chunk_checksum_detects_single_bit_flip() {
        let mut data = vec![0x5Au8; 4096];
        let checksum = ChunkChecksum::compute(&data);
        assert!(checksum.matches(&data));

        data[1234] ^= 0x01;
        assert!(!checksum.matches(&data));
    }

    #[test]
    fn test_from_field_rejects_non_hex() {
        let err = ChunkChecksum::from_field(*b"zzzzzzzzzzzzzzzz").unwrap_err();
        assert!(matches!(err, ChecksumError::NotHex(_)));
    }

    #[test]
    fn test_from_field_normalizes_case() {
        let upper = ChunkChecksum::from_field(*b"ABCDEF0123456789").unwrap();
        assert_eq!(upper.as_str(), "abcdef0123456789");
    }

    #[test]
    fn test_parse_wrong_length() {
        let err = "abc".parse::<ChunkChecksum>().unwrap_err();
        assert_eq!(
            err,
            ChecksumError::InvalidLength {
                expected: CHECKSUM_SIZE,
                actual: 3
            }
        );
    }

    #[test]
    fn test_file_checksum_matches_buffer_checksum() {
        let mut temp = NamedTempFile::new().unwrap();
        // Larger than one hash buffer so the streaming path loops.
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        temp.write_all(&data).unwrap();
        temp.flush().unwrap();

        assert_eq!(file_checksum(temp.path()).unwrap(), data_checksum(&data));
    }

    #[test]
    fn test_file_checksum_missing_file() {
        let err = file_checksum("/definitely/not/here.bin").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_checksums_match_ignores_case() {
        assert!(checksums_match("ABCdef", "abcDEF"));
        assert!(!checksums_match("abc", "abd"));
    }
}
