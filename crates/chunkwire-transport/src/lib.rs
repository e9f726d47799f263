//! # chunkwire Transport
//!
//! Blocking TCP plumbing shared by the chunkwire server and client.
//!
//! Every socket handed out by this crate carries read and write timeouts, so
//! a blocked receive always returns within a bounded time and callers can
//! poll their cancellation token between attempts.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod tcp;

use std::time::Duration;

/// TCP socket configuration
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Maximum time to wait for a connection to be established
    pub connect_timeout: Duration,
    /// Timeout applied to each blocking read
    pub read_timeout: Duration,
    /// Timeout applied to each blocking write
    pub write_timeout: Duration,
    /// Disable Nagle's algorithm
    pub nodelay: bool,
    /// Enable TCP keepalive probes
    pub keepalive: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            nodelay: true,
            keepalive: true,
        }
    }
}
