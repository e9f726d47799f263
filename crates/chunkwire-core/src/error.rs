//! Error types for chunkwire
//!
//! Errors are layered the way failures propagate: framing errors abort one
//! exchange, [`AttemptError`]s are absorbed by the chunk fetcher's retry loop,
//! [`FetchError`]s escalate to a file-level [`DownloadError`], and download
//! errors are finally recorded in the job store.

use crate::token::TokenError;
use chunkwire_files::catalog::CatalogError;
use chunkwire_files::chunker::PlanError;
use chunkwire_files::hasher::{ChecksumError, ChunkChecksum};
use std::io;
use thiserror::Error;

/// Malformed or truncated data on the wire
#[derive(Debug, Error)]
pub enum FrameError {
    /// Peer closed the connection cleanly before a new message began
    #[error("Connection closed")]
    Closed,

    /// Peer closed or stalled partway through a header or payload
    #[error("Short read: expected {expected} bytes, got {actual}")]
    TooShort {
        /// Bytes expected
        expected: usize,
        /// Bytes received before the stream ended
        actual: usize,
    },

    /// Length field is not a decimal integer
    #[error("Invalid length field: {0:?}")]
    InvalidLength(String),

    /// Declared length exceeds the permitted maximum
    #[error("Frame too large: {size} bytes (max {max})")]
    TooLarge {
        /// Declared size
        size: u64,
        /// Permitted maximum
        max: u64,
    },

    /// Control message payload is not UTF-8
    #[error("Message is not valid UTF-8")]
    InvalidUtf8,

    /// Checksum field is not ASCII hex
    #[error("Invalid checksum field: {0}")]
    InvalidChecksum(#[from] ChecksumError),

    /// No data arrived before the socket read timeout
    #[error("Timed out waiting for data")]
    Timeout,

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Control message that does not parse into a known request or reply
#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
    /// Unrecognized verb
    #[error("Unknown command: {0:?}")]
    Unknown(String),

    /// Recognized verb with bad arguments
    #[error("Malformed {verb} command: {reason}")]
    Malformed {
        /// Command verb
        verb: &'static str,
        /// What was wrong
        reason: String,
    },

    /// Session token argument does not parse
    #[error("Invalid session token: {0}")]
    Token(#[from] TokenError),
}

/// Server start-up and run-time errors
#[derive(Debug, Error)]
pub enum ServerError {
    /// Listener could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// Requested address
        addr: std::net::SocketAddr,
        /// Underlying error
        source: io::Error,
    },

    /// Shared directory is missing or not a directory
    #[error("Shared directory {0} is not a directory")]
    SharedDir(String),

    /// Accept loop failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Chunk dispatch failures, reported to the client as `ERROR` replies
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Requested file does not exist or is not servable
    #[error("File not found: {0}")]
    NotFound(String),

    /// Range is inverted or too large for one chunk
    #[error("Invalid range {start}..{end}")]
    InvalidRange {
        /// Start offset
        start: u64,
        /// End offset
        end: u64,
    },

    /// Reading the file failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Control-session errors seen by the client
#[derive(Debug, Error)]
pub enum SessionError {
    /// Another client already holds the session
    #[error("Server busy: another client holds the session")]
    Busy,

    /// Server refused a request on this session
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// Reply did not fit the request
    #[error("Unexpected reply: {0:?}")]
    UnexpectedReply(String),

    /// Connecting to the server failed
    #[error("Connection failed: {0}")]
    Connect(io::Error),

    /// Framing failure on the control channel
    #[error("Framing error: {0}")]
    Frame(#[from] FrameError),

    /// Reply failed to parse
    #[error("Protocol error: {0}")]
    Command(#[from] CommandError),

    /// Catalog listing failed to parse
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),
}

/// Outcome of one failed chunk attempt
///
/// Every variant except [`AttemptError::NotFound`] and
/// [`AttemptError::Rejected`] is retried by the chunk fetcher.
#[derive(Debug, Error)]
pub enum AttemptError {
    /// No response before the socket timeout
    #[error("Timed out")]
    Timeout,

    /// Fewer payload bytes than declared or requested
    #[error("Short read: expected {expected} bytes, got {actual}")]
    ShortRead {
        /// Bytes expected
        expected: u64,
        /// Bytes received
        actual: u64,
    },

    /// Payload does not hash to the declared checksum
    #[error("Checksum mismatch: declared {declared}, computed {computed}")]
    ChecksumMismatch {
        /// Checksum in the chunk header
        declared: ChunkChecksum,
        /// Checksum of the received payload
        computed: ChunkChecksum,
    },

    /// Packet carries a different sequence number than requested
    #[error("Sequence mismatch: requested {requested}, received {received}")]
    SequenceMismatch {
        /// Requested sequence
        requested: u32,
        /// Sequence in the packet header
        received: u32,
    },

    /// Malformed header or reply
    #[error("Framing error: {0}")]
    Framing(String),

    /// Server reports the file missing
    #[error("File not found on server: {0}")]
    NotFound(String),

    /// Server refused the request (bad session or bad request)
    #[error("Rejected by server: {0}")]
    Rejected(String),

    /// Connect or socket failure
    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl AttemptError {
    /// Whether the chunk fetcher should try the same chunk again
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::NotFound(_) | Self::Rejected(_))
    }
}

impl From<FrameError> for AttemptError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Timeout => Self::Timeout,
            FrameError::TooShort { expected, actual } => Self::ShortRead {
                expected: expected as u64,
                actual: actual as u64,
            },
            FrameError::Io(e) if chunkwire_transport::tcp::is_timeout(&e) => Self::Timeout,
            FrameError::Io(e) => Self::Io(e),
            other => Self::Framing(other.to_string()),
        }
    }
}

/// Terminal result of a chunk fetch
#[derive(Debug, Error)]
pub enum FetchError {
    /// Every attempt failed
    #[error("Chunk {sequence} failed after {attempts} attempts: {last}")]
    Exhausted {
        /// Chunk sequence
        sequence: u32,
        /// Attempts made
        attempts: u32,
        /// Failure of the final attempt
        last: AttemptError,
    },

    /// File missing on the server
    #[error("File not found on server: {0}")]
    NotFound(String),

    /// Server refused the request
    #[error("Rejected by server: {0}")]
    Rejected(String),

    /// Cancellation was requested
    #[error("Cancelled")]
    Cancelled,
}

/// File-level download failures
#[derive(Debug, Error)]
pub enum DownloadError {
    /// File is not in the catalog
    #[error("File not in catalog: {0}")]
    NotInCatalog(String),

    /// Chunk plan could not be built
    #[error("Cannot plan chunks: {0}")]
    Plan(#[from] PlanError),

    /// File missing on the server
    #[error("File not found on server: {0}")]
    NotFound(String),

    /// A chunk exhausted its retries
    #[error("Chunk {sequence} of {file} exhausted after {attempts} attempts: {reason}")]
    ChunkExhausted {
        /// File name
        file: String,
        /// Failed chunk
        sequence: u32,
        /// Attempts made for that chunk
        attempts: u32,
        /// Final attempt failure
        reason: String,
    },

    /// Reassembled file never matched the catalog checksum
    #[error("Checksum of {file} mismatched after {attempts} attempts: expected {expected}, got {actual}")]
    FileChecksumMismatch {
        /// File name
        file: String,
        /// Whole-file attempts made
        attempts: u32,
        /// Catalog checksum
        expected: String,
        /// Checksum of the last assembled file
        actual: String,
    },

    /// Server refused the request
    #[error("Rejected by server: {0}")]
    Rejected(String),

    /// Cancellation was requested
    #[error("Cancelled")]
    Cancelled,

    /// Local file I/O failure
    #[error("File I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Job store failures
#[derive(Debug, Error)]
pub enum StoreError {
    /// File name cannot be stored as a single-token record
    #[error("Invalid job name: {0:?}")]
    InvalidName(String),

    /// Only `done` and `failed` may be set through `mark`
    #[error("Invalid status transition to {0}")]
    InvalidTransition(String),

    /// Reading or writing the job file failed
    #[error("Job store I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Download agent failures
#[derive(Debug, Error)]
pub enum AgentError {
    /// Control session failed
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Job store failed
    #[error("Job store error: {0}")]
    Store(#[from] StoreError),
}
