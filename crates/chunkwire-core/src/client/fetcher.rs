//! Per-chunk fetch with bounded automatic re-request.
//!
//! Every attempt opens its own socket, sends one `GET`, and validates the
//! packet it gets back. Any recoverable failure (timeout, short read,
//! framing error, checksum mismatch) re-requests the same chunk from scratch
//! after a fixed delay, up to `max_retries` attempts in total. A missing file
//! or a refused session ends the fetch immediately.

use crate::cancel::CancellationToken;
use crate::error::{AttemptError, FetchError};
use crate::frame::{AckMode, ChunkPacket, ErrorKind, Reply, Request, read_message, write_message};
use crate::token::SessionToken;
use chunkwire_files::chunker::ChunkSpec;
use chunkwire_files::hasher::ChunkChecksum;
use chunkwire_transport::TcpConfig;
use chunkwire_transport::tcp::{connect, shutdown_quietly};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry policy for chunk fetches
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Total attempts per chunk, including the first
    pub max_retries: u32,
    /// Pause before re-requesting a failed chunk
    pub retry_delay: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay: Duration::from_millis(200),
        }
    }
}

/// Performs a single attempt at one chunk.
///
/// Implementations must return the payload only after it has passed
/// [`verify_packet`].
pub trait ChunkSource: Send + Sync {
    /// Request `spec` once
    ///
    /// # Errors
    ///
    /// Returns the `AttemptError` describing why this attempt failed.
    fn attempt(&self, spec: &ChunkSpec) -> Result<Vec<u8>, AttemptError>;
}

/// Check a received packet against the chunk that was requested.
///
/// # Errors
///
/// Returns `AttemptError::SequenceMismatch`, `AttemptError::ShortRead`, or
/// `AttemptError::ChecksumMismatch`.
pub fn verify_packet(spec: &ChunkSpec, packet: &ChunkPacket) -> Result<(), AttemptError> {
    if packet.sequence != spec.sequence {
        return Err(AttemptError::SequenceMismatch {
            requested: spec.sequence,
            received: packet.sequence,
        });
    }

    let declared = u64::from(packet.length);
    let received = packet.payload.len() as u64;
    if received != declared || declared != spec.length {
        return Err(AttemptError::ShortRead {
            expected: spec.length,
            actual: received.min(declared),
        });
    }

    if !packet.checksum.matches(&packet.payload) {
        return Err(AttemptError::ChecksumMismatch {
            declared: packet.checksum,
            computed: ChunkChecksum::compute(&packet.payload),
        });
    }
    Ok(())
}

/// Fetches chunks from a chunkwire server over TCP
#[derive(Debug, Clone)]
pub struct TcpChunkSource {
    server: SocketAddr,
    token: Option<SessionToken>,
    tcp: TcpConfig,
    ack_mode: AckMode,
}

impl TcpChunkSource {
    /// Create a source for `server`, authenticating with `token`
    #[must_use]
    pub fn new(
        server: SocketAddr,
        token: Option<SessionToken>,
        tcp: TcpConfig,
        ack_mode: AckMode,
    ) -> Self {
        Self {
            server,
            token,
            tcp,
            ack_mode,
        }
    }
}

impl ChunkSource for TcpChunkSource {
    fn attempt(&self, spec: &ChunkSpec) -> Result<Vec<u8>, AttemptError> {
        let mut stream = connect(self.server, &self.tcp).map_err(AttemptError::Io)?;

        let request = Request::GetChunk {
            file: spec.file_name.clone(),
            start: spec.start,
            end: spec.end(),
            sequence: spec.sequence,
            token: self.token.clone(),
        };
        write_message(&mut stream, &request.to_string()).map_err(AttemptError::Io)?;

        let status = read_message(&mut stream)?
            .ok_or_else(|| AttemptError::Framing("closed before reply".to_string()))?;
        match status.parse::<Reply>() {
            Ok(Reply::Ok) => {}
            Ok(Reply::Error {
                kind: ErrorKind::NotFound,
                detail,
            }) => return Err(AttemptError::NotFound(detail)),
            Ok(Reply::Error {
                kind: ErrorKind::Unauthorized | ErrorKind::BadRequest,
                detail,
            }) => return Err(AttemptError::Rejected(detail)),
            _ => return Err(AttemptError::Framing(format!("unexpected reply {status:?}"))),
        }

        let packet = ChunkPacket::read_from(&mut stream, spec.length)?;
        let verdict = verify_packet(spec, &packet);

        if self.ack_mode == AckMode::PerChunk {
            let reply = if verdict.is_ok() {
                Request::Ack {
                    sequence: spec.sequence,
                }
            } else {
                Request::Nak {
                    sequence: spec.sequence,
                }
            };
            if let Err(e) = write_message(&mut stream, &reply.to_string()) {
                debug!(sequence = spec.sequence, "Failed to send {}: {}", reply, e);
            }
        }
        shutdown_quietly(&stream);

        verdict.map(|()| packet.payload)
    }
}

/// A verified chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedChunk {
    /// Chunk sequence
    pub sequence: u32,
    /// Verified payload
    pub payload: Vec<u8>,
    /// Attempts it took
    pub attempts: u32,
}

/// Retry loop around a [`ChunkSource`]
#[derive(Debug, Clone)]
pub struct ChunkFetcher<S> {
    source: S,
    config: FetchConfig,
}

impl<S: ChunkSource> ChunkFetcher<S> {
    /// Create a fetcher
    pub fn new(source: S, config: FetchConfig) -> Self {
        Self { source, config }
    }

    /// Underlying chunk source
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Retry policy in use
    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Fetch one chunk, retrying recoverable failures.
    ///
    /// # Errors
    ///
    /// Returns `FetchError::Exhausted` after `max_retries` failed attempts,
    /// `FetchError::NotFound`/`FetchError::Rejected` immediately on a terminal
    /// server reply, and `FetchError::Cancelled` if `cancel` fires before an
    /// attempt or during the retry delay.
    pub fn fetch(
        &self,
        spec: &ChunkSpec,
        cancel: &CancellationToken,
    ) -> Result<FetchedChunk, FetchError> {
        let max_attempts = self.config.max_retries.max(1);
        let mut attempts = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            attempts += 1;

            let err = match self.source.attempt(spec) {
                Ok(payload) => {
                    debug!(
                        file = %spec.file_name,
                        sequence = spec.sequence,
                        attempts,
                        bytes = payload.len(),
                        "Chunk verified"
                    );
                    return Ok(FetchedChunk {
                        sequence: spec.sequence,
                        payload,
                        attempts,
                    });
                }
                Err(e) => e,
            };

            if !err.is_retryable() {
                warn!(file = %spec.file_name, sequence = spec.sequence, "Terminal failure: {}", err);
                return Err(match err {
                    AttemptError::NotFound(name) => FetchError::NotFound(name),
                    other => FetchError::Rejected(other.to_string()),
                });
            }

            if attempts >= max_attempts {
                warn!(
                    file = %spec.file_name,
                    sequence = spec.sequence,
                    attempts,
                    "Chunk exhausted: {}", err
                );
                return Err(FetchError::Exhausted {
                    sequence: spec.sequence,
                    attempts,
                    last: err,
                });
            }

            warn!(
                file = %spec.file_name,
                sequence = spec.sequence,
                attempt = attempts,
                "Re-requesting chunk: {}", err
            );
            if !cancel.sleep(self.config.retry_delay) {
                return Err(FetchError::Cancelled);
            }
        }
    }
}
