//! Server counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Server statistics, updated lock-free from connection threads
#[derive(Debug, Default)]
pub struct ServerStats {
    /// Connections accepted
    pub connections: AtomicU64,

    /// `!CONNECT` requests granted a session
    pub sessions_granted: AtomicU64,

    /// `!CONNECT` requests answered `BUSY`
    pub busy_rejections: AtomicU64,

    /// Catalog listings served
    pub catalogs_served: AtomicU64,

    /// Chunk packets sent
    pub chunks_served: AtomicU64,

    /// Payload bytes sent
    pub bytes_served: AtomicU64,

    /// Requests answered with `ERROR`
    pub errors_sent: AtomicU64,

    /// Packets deliberately corrupted by the fault injector
    pub faults_injected: AtomicU64,

    /// `ACK` messages received
    pub acks: AtomicU64,

    /// `NAK` messages received
    pub naks: AtomicU64,
}

impl ServerStats {
    /// Create zeroed stats
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_chunk(&self, bytes: u64) {
        self.chunks_served.fetch_add(1, Ordering::Relaxed);
        self.bytes_served.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Get snapshot of current stats
    #[must_use]
    pub fn snapshot(&self) -> ServerStatsSnapshot {
        ServerStatsSnapshot {
            connections: self.connections.load(Ordering::Relaxed),
            sessions_granted: self.sessions_granted.load(Ordering::Relaxed),
            busy_rejections: self.busy_rejections.load(Ordering::Relaxed),
            catalogs_served: self.catalogs_served.load(Ordering::Relaxed),
            chunks_served: self.chunks_served.load(Ordering::Relaxed),
            bytes_served: self.bytes_served.load(Ordering::Relaxed),
            errors_sent: self.errors_sent.load(Ordering::Relaxed),
            faults_injected: self.faults_injected.load(Ordering::Relaxed),
            acks: self.acks.load(Ordering::Relaxed),
            naks: self.naks.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ServerStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServerStatsSnapshot {
    /// Connections accepted
    pub connections: u64,
    /// Sessions granted
    pub sessions_granted: u64,
    /// `BUSY` replies
    pub busy_rejections: u64,
    /// Catalog listings served
    pub catalogs_served: u64,
    /// Chunk packets sent
    pub chunks_served: u64,
    /// Payload bytes sent
    pub bytes_served: u64,
    /// `ERROR` replies
    pub errors_sent: u64,
    /// Corrupted packets
    pub faults_injected: u64,
    /// `ACK`s received
    pub acks: u64,
    /// `NAK`s received
    pub naks: u64,
}
