//! # chunkwire Core
//!
//! Reliable chunked transfer between one server and one bound client.
//!
//! This crate provides:
//! - Wire framing: length-prefixed control messages and binary chunk packets
//! - A closed request/reply grammar for the control channel
//! - Server side: single-session admission control, a chunk dispatcher with
//!   optional fault injection, and a thread-per-connection listener
//! - Client side: a retrying chunk fetcher, a parallel download orchestrator,
//!   a durable job store, and the scanner/drainer agent that ties them together
//!
//! All I/O is blocking and thread-based. Every blocking read carries a socket
//! timeout so a shared [`CancellationToken`] can interrupt work between
//! operations.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cancel;
pub mod client;
pub mod error;
pub mod frame;
pub mod server;
pub mod token;

pub use cancel::CancellationToken;
pub use token::SessionToken;

/// Default TCP port for the chunkwire server.
pub const DEFAULT_PORT: u16 = 12345;
