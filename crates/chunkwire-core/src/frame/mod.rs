//! Wire framing for the control and chunk channels.
//!
//! Control messages are UTF-8 text behind a fixed 64-byte ASCII length field:
//!
//! ```text
//! +------------------------------+------------------+
//! | Length (64 ASCII bytes)      | Payload (N bytes)|
//! +------------------------------+------------------+
//! ```
//!
//! Chunk packets carry a fixed 24-byte binary header followed by the raw
//! payload:
//!
//! ```text
//!  Offset  Size  Field
//!  0       4     Sequence (big-endian u32)
//!  4       4     Payload length (big-endian u32)
//!  8       16    Checksum (ASCII hex)
//! ```
//!
//! The encoders and decoders are pure transforms; the `read_*`/`write_*`
//! helpers wrap them over blocking `Read`/`Write` streams.

pub mod chunk;
pub mod command;
pub mod message;

pub use chunk::{
    CHUNK_HEADER_SIZE, ChunkHeader, ChunkPacket, decode_chunk_header, encode_chunk_header,
};
pub use command::{AckMode, ErrorKind, Reply, Request};
pub use message::{
    HEADER_SIZE, MAX_MESSAGE_SIZE, decode_message, encode_message, read_message, write_message,
};

use crate::error::FrameError;
use std::io::{self, Read};

/// Fill `buf` from `reader`, returning how many bytes arrived before EOF.
///
/// A read timeout before the first byte is `FrameError::Timeout`; a timeout
/// after some bytes have arrived leaves the stream desynchronized and is
/// reported as `FrameError::TooShort`.
pub(crate) fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize, FrameError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if chunkwire_transport::tcp::is_timeout(&e) => {
                return Err(if filled == 0 {
                    FrameError::Timeout
                } else {
                    FrameError::TooShort {
                        expected: buf.len(),
                        actual: filled,
                    }
                });
            }
            Err(e) => return Err(FrameError::Io(e)),
        }
    }
    Ok(filled)
}

/// Fill `buf` completely; any shortfall is `FrameError::TooShort`.
pub(crate) fn read_exact_framed<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<(), FrameError> {
    let filled = read_full(reader, buf)?;
    if filled < buf.len() {
        return Err(FrameError::TooShort {
            expected: buf.len(),
            actual: filled,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Reader that yields some bytes, then a timeout error.
    struct StallingReader {
        data: Cursor<Vec<u8>>,
    }

    impl Read for StallingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.data.read(buf)?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "stalled"));
            }
            Ok(n)
        }
    }

    #[test]
    fn test_read_full_reports_eof_count() {
        let mut reader = Cursor::new(vec![1u8, 2, 3]);
        let mut buf = [0u8; 8];
        assert_eq!(read_full(&mut reader, &mut buf).unwrap(), 3);
    }

    #[test]
    fn test_timeout_before_any_byte() {
        let mut reader = StallingReader {
            data: Cursor::new(Vec::new()),
        };
        let mut buf = [0u8; 4];
        assert!(matches!(
            read_full(&mut reader, &mut buf),
            Err(FrameError::Timeout)
        ));
    }

    #[test]
    fn test_timeout_midway_is_short_read() {
        let mut reader = StallingReader {
            data: Cursor::new(vec![9u8; 2]),
        };
        let mut buf = [0u8; 4];
        assert!(matches!(
            read_exact_framed(&mut reader, &mut buf),
            Err(FrameError::TooShort {
                expected: 4,
                actual: 2
            })
        ));
    }
}
