//! Chunk packet header and payload (24-byte header).

use super::{read_exact_framed, read_full};
use crate::error::FrameError;
use chunkwire_files::hasher::{CHECKSUM_SIZE, ChunkChecksum};
use std::io::{self, Read, Write};

/// Size of the chunk packet header in bytes.
pub const CHUNK_HEADER_SIZE: usize = 8 + CHECKSUM_SIZE;

/// Fixed header in front of every chunk payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Chunk sequence number
    pub sequence: u32,
    /// Payload length in bytes
    pub length: u32,
    /// Checksum of the payload as computed by the sender
    pub checksum: ChunkChecksum,
}

impl ChunkHeader {
    /// Encode the header into a 24-byte buffer.
    #[must_use]
    pub fn encode(&self) -> [u8; CHUNK_HEADER_SIZE] {
        let mut buf = [0u8; CHUNK_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.sequence.to_be_bytes());
        buf[4..8].copy_from_slice(&self.length.to_be_bytes());
        buf[8..].copy_from_slice(self.checksum.as_field());
        buf
    }

    /// Decode a header from a byte buffer.
    ///
    /// # Errors
    ///
    /// Returns `FrameError::TooShort` if the buffer is smaller than 24 bytes.
    /// Returns `FrameError::InvalidChecksum` if the checksum field is not hex.
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < CHUNK_HEADER_SIZE {
            return Err(FrameError::TooShort {
                expected: CHUNK_HEADER_SIZE,
                actual: buf.len(),
            });
        }

        let sequence = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let length = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let mut field = [0u8; CHECKSUM_SIZE];
        field.copy_from_slice(&buf[8..CHUNK_HEADER_SIZE]);
        let checksum = ChunkChecksum::from_field(field)?;

        Ok(Self {
            sequence,
            length,
            checksum,
        })
    }

    /// Read a header from a stream.
    ///
    /// # Errors
    ///
    /// Returns `FrameError::Closed` if the stream ends before the first byte,
    /// otherwise the errors of [`Self::decode`].
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, FrameError> {
        let mut buf = [0u8; CHUNK_HEADER_SIZE];
        match read_full(reader, &mut buf)? {
            0 => Err(FrameError::Closed),
            n => Self::decode(&buf[..n]),
        }
    }
}

/// Encode a chunk header from its parts.
#[must_use]
pub fn encode_chunk_header(
    sequence: u32,
    length: u32,
    checksum: &ChunkChecksum,
) -> [u8; CHUNK_HEADER_SIZE] {
    ChunkHeader {
        sequence,
        length,
        checksum: *checksum,
    }
    .encode()
}

/// Decode a chunk header into `(sequence, length, checksum)`.
///
/// # Errors
///
/// Same as [`ChunkHeader::decode`].
pub fn decode_chunk_header(buf: &[u8]) -> Result<(u32, u32, ChunkChecksum), FrameError> {
    let header = ChunkHeader::decode(buf)?;
    Ok((header.sequence, header.length, header.checksum))
}

/// A chunk as it travels on the wire.
///
/// `checksum` is whatever the sender declared; it only proves integrity once
/// [`ChunkPacket::is_valid`] has been checked on the receiving side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPacket {
    /// Chunk sequence number
    pub sequence: u32,
    /// Declared payload length
    pub length: u32,
    /// Declared payload checksum
    pub checksum: ChunkChecksum,
    /// Raw payload bytes
    pub payload: Vec<u8>,
}

impl ChunkPacket {
    /// Build a packet whose checksum and length describe `payload`.
    ///
    /// # Errors
    ///
    /// Returns `FrameError::TooLarge` if the payload does not fit the 32-bit
    /// length field.
    pub fn new(sequence: u32, payload: Vec<u8>) -> Result<Self, FrameError> {
        let length = u32::try_from(payload.len()).map_err(|_| FrameError::TooLarge {
            size: payload.len() as u64,
            max: u64::from(u32::MAX),
        })?;
        Ok(Self {
            sequence,
            length,
            checksum: ChunkChecksum::compute(&payload),
            payload,
        })
    }

    /// Header describing this packet
    #[must_use]
    pub fn header(&self) -> ChunkHeader {
        ChunkHeader {
            sequence: self.sequence,
            length: self.length,
            checksum: self.checksum,
        }
    }

    /// Whether the payload matches both the declared length and checksum
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.payload.len() as u64 == u64::from(self.length) && self.checksum.matches(&self.payload)
    }

    /// Write header and payload.
    ///
    /// # Errors
    ///
    /// Returns any error from the underlying writer.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.header().encode())?;
        writer.write_all(&self.payload)?;
        writer.flush()
    }

    /// Read one packet, refusing payloads larger than `max_payload`.
    ///
    /// The checksum is not verified here.
    ///
    /// # Errors
    ///
    /// Returns `FrameError::TooLarge` if the declared length exceeds
    /// `max_payload`, `FrameError::TooShort` if the stream ends before the
    /// declared payload has arrived, and the errors of [`ChunkHeader::read_from`].
    pub fn read_from<R: Read>(reader: &mut R, max_payload: u64) -> Result<Self, FrameError> {
        let header = ChunkHeader::read_from(reader)?;
        if u64::from(header.length) > max_payload {
            return Err(FrameError::TooLarge {
                size: u64::from(header.length),
                max: max_payload,
            });
        }

        let mut payload = vec![0u8; header.length as usize];
        read_exact_framed(reader, &mut payload)?;

        Ok(Self {
            sequence: header.sequence,
            length: header.length,
            checksum: header.checksum,
            payload,
        })
    }
}
