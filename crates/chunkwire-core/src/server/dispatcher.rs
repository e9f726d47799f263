//! Chunk dispatch: read a byte range, checksum it, packetize it.

use super::fault::FaultInjector;
use super::stats::ServerStats;
use crate::error::DispatchError;
use crate::frame::ChunkPacket;
use chunkwire_files::catalog::is_shareable_name;
use chunkwire_files::chunker::read_range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Serves chunk packets from the shared directory.
///
/// Every call opens its own file handle; the only shared mutable state is
/// the fault injector.
#[derive(Debug)]
pub struct ChunkDispatcher {
    root: PathBuf,
    excludes: Vec<String>,
    faults: FaultInjector,
    stats: Arc<ServerStats>,
}

impl ChunkDispatcher {
    /// Create a dispatcher rooted at `root`
    pub fn new(
        root: impl Into<PathBuf>,
        excludes: Vec<String>,
        faults: FaultInjector,
        stats: Arc<ServerStats>,
    ) -> Self {
        Self {
            root: root.into(),
            excludes,
            faults,
            stats,
        }
    }

    /// Shared directory
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a requested name to a path inside the shared directory.
    ///
    /// Names that could escape the directory, or that the catalog would never
    /// list, resolve to nothing.
    fn resolve(&self, file_name: &str) -> Option<PathBuf> {
        if file_name.is_empty()
            || file_name.contains(['/', '\\', '\0'])
            || file_name.contains("..")
            || !is_shareable_name(file_name, &self.excludes)
        {
            return None;
        }
        let path = self.root.join(file_name);
        path.is_file().then_some(path)
    }

    /// Build the packet for `[start, start + length)` of `file_name`.
    ///
    /// Reads fewer than `length` bytes when the range runs past the end of the
    /// file; the packet always describes exactly the bytes read.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::NotFound` for unknown or unsafe names,
    /// `DispatchError::InvalidRange` when the length cannot be framed, and
    /// `DispatchError::Io` if reading fails.
    pub fn serve_chunk(
        &self,
        file_name: &str,
        sequence: u32,
        start: u64,
        length: u64,
    ) -> Result<ChunkPacket, DispatchError> {
        let Some(path) = self.resolve(file_name) else {
            warn!(file = %file_name, "Requested file not servable");
            return Err(DispatchError::NotFound(file_name.to_string()));
        };

        if length > u64::from(u32::MAX) {
            return Err(DispatchError::InvalidRange {
                start,
                end: start.saturating_add(length),
            });
        }

        let payload = read_range(&path, start, length).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => DispatchError::NotFound(file_name.to_string()),
            _ => DispatchError::Io(e),
        })?;

        let mut packet = ChunkPacket::new(sequence, payload)
            .map_err(|e| DispatchError::Io(std::io::Error::other(e.to_string())))?;

        if self.faults.apply(file_name, sequence, &mut packet.payload) {
            ServerStats::incr(&self.stats.faults_injected);
            warn!(file = %file_name, sequence, "Injected payload corruption");
        }

        debug!(
            file = %file_name,
            sequence,
            start,
            requested = length,
            sent = packet.length,
            "Chunk prepared"
        );
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::fault::{FaultPlan, ScriptedFault};
    use std::fs;
    use tempfile::TempDir;

    fn dispatcher(dir: &TempDir, plan: FaultPlan) -> ChunkDispatcher {
        ChunkDispatcher::new(
            dir.path(),
            vec!["server.toml".to_string()],
            FaultInjector::with_seed(plan, 42),
            Arc::new(ServerStats::new()),
        )
    }

    fn fixture() -> TempDir {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        fs::write(dir.path().join("data.bin"), data).unwrap();
        fs::write(dir.path().join("server.toml"), b"secret").unwrap();
        dir
    }

    #[test]
    fn test_serves_exact_range() {
        let dir = fixture();
        let d = dispatcher(&dir, FaultPlan::None);
        let packet = d.serve_chunk("data.bin", 4, 100, 50).unwrap();

        assert_eq!(packet.sequence, 4);
        assert_eq!(packet.length, 50);
        assert!(packet.is_valid());
        let expected: Vec<u8> = (100..150u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(packet.payload, expected);
    }

    #[test]
    fn test_range_past_eof_is_truncated() {
        let dir = fixture();
        let d = dispatcher(&dir, FaultPlan::None);
        let packet = d.serve_chunk("data.bin", 0, 900, 500).unwrap();
        assert_eq!(packet.length, 100);
        assert!(packet.is_valid());

        let empty = d.serve_chunk("data.bin", 1, 5000, 10).unwrap();
        assert_eq!(empty.length, 0);
    }

    #[test]
    fn test_missing_and_unsafe_names() {
        let dir = fixture();
        let d = dispatcher(&dir, FaultPlan::None);
        for name in [
            "nope.bin",
            "../data.bin",
            "sub/data.bin",
            "..",
            "",
            ".hidden",
            "server.toml",
        ] {
            assert!(
                matches!(
                    d.serve_chunk(name, 0, 0, 10),
                    Err(DispatchError::NotFound(_))
                ),
                "{name:?} should be refused"
            );
        }
    }

    #[test]
    fn test_fault_corrupts_payload_not_header() {
        let dir = fixture();
        let d = dispatcher(
            &dir,
            FaultPlan::Scripted(vec![ScriptedFault {
                file: None,
                sequence: 2,
                times: 1,
            }]),
        );

        let bad = d.serve_chunk("data.bin", 2, 0, 200).unwrap();
        assert_eq!(bad.length, 200);
        assert_eq!(bad.payload.len(), 200);
        assert!(!bad.is_valid());
        assert_eq!(d.stats.snapshot().faults_injected, 1);

        let good = d.serve_chunk("data.bin", 2, 0, 200).unwrap();
        assert!(good.is_valid());
        assert_eq!(good.checksum, bad.checksum);
    }
}
