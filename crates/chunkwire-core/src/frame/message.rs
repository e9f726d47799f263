//! Length-prefixed control messages.

use super::{read_exact_framed, read_full};
use crate::error::FrameError;
use std::io::{self, Read, Write};

/// Width of the ASCII length field in bytes.
pub const HEADER_SIZE: usize = 64;

/// Largest control message accepted (16 MiB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Encode `text` as a 64-byte decimal length field followed by its UTF-8 bytes.
///
/// The number is left-aligned and padded with spaces to the field width.
#[must_use]
pub fn encode_message(text: &str) -> Vec<u8> {
    let payload = text.as_bytes();
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(format!("{:<width$}", payload.len(), width = HEADER_SIZE).as_bytes());
    out.extend_from_slice(payload);
    out
}

/// Parse a length field, ignoring surrounding whitespace and NUL padding.
///
/// # Errors
///
/// Returns `FrameError::InvalidLength` if the trimmed field is not a decimal
/// integer, or `FrameError::TooLarge` if it exceeds [`MAX_MESSAGE_SIZE`].
pub fn parse_length_field(field: &[u8]) -> Result<usize, FrameError> {
    let text = String::from_utf8_lossy(field);
    let trimmed = text.trim_matches(|c: char| c.is_ascii_whitespace() || c == '\0');

    let len: u64 = trimmed
        .parse()
        .map_err(|_| FrameError::InvalidLength(trimmed.to_string()))?;

    if len > MAX_MESSAGE_SIZE as u64 {
        return Err(FrameError::TooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE as u64,
        });
    }
    Ok(len as usize)
}

/// Read exactly one control message.
///
/// # Errors
///
/// Returns `FrameError::Closed` if the stream ends before the first header
/// byte, `FrameError::TooShort` if it ends mid-message, and the errors of
/// [`parse_length_field`] for a bad header.
pub fn decode_message<R: Read>(reader: &mut R) -> Result<String, FrameError> {
    let mut header = [0u8; HEADER_SIZE];
    match read_full(reader, &mut header)? {
        0 => return Err(FrameError::Closed),
        n if n < HEADER_SIZE => {
            return Err(FrameError::TooShort {
                expected: HEADER_SIZE,
                actual: n,
            });
        }
        _ => {}
    }

    let len = parse_length_field(&header)?;
    let mut payload = vec![0u8; len];
    read_exact_framed(reader, &mut payload)?;

    String::from_utf8(payload).map_err(|_| FrameError::InvalidUtf8)
}

/// Read one control message, mapping a clean close to `None`.
///
/// # Errors
///
/// Same as [`decode_message`], except that `FrameError::Closed` becomes
/// `Ok(None)`.
pub fn read_message<R: Read>(reader: &mut R) -> Result<Option<String>, FrameError> {
    match decode_message(reader) {
        Ok(text) => Ok(Some(text)),
        Err(FrameError::Closed) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Encode and write one control message in a single `write_all`.
///
/// # Errors
///
/// Returns any error from the underlying writer.
pub fn write_message<W: Write>(writer: &mut W, text: &str) -> io::Result<()> {
    writer.write_all(&encode_message(text))?;
    writer.flush()
}
