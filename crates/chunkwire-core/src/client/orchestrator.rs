//! Whole-file download: plan, fetch in parallel, merge, verify.
//!
//! Chunks are fetched by a bounded pool of scoped worker threads fed from a
//! channel. Verified payloads land in one [`ChunkResults`] map; the first
//! terminal chunk failure cancels the remaining workers and nothing is
//! merged. A complete set of chunks is written by offset into `<name>.part`,
//! checksummed against the catalog, and renamed into place. A whole-file
//! checksum mismatch discards the file and starts over, up to
//! `max_file_retries` attempts.

use super::fetcher::{ChunkFetcher, ChunkSource};
use crate::cancel::CancellationToken;
use crate::error::{DownloadError, FetchError};
use chunkwire_files::FileDescriptor;
use chunkwire_files::catalog::{Catalog, PARTIAL_SUFFIX, is_shareable_name};
use chunkwire_files::chunker::{ChunkSizing, ChunkSpec, FileReassembler, plan_chunks};
use chunkwire_files::hasher::{checksums_match, file_checksum};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

/// Download settings
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Where finished files are written
    pub output_dir: PathBuf,
    /// How files are split into chunks
    pub sizing: ChunkSizing,
    /// Chunks fetched in parallel
    pub concurrency: usize,
    /// Total whole-file attempts, including the first
    pub max_file_retries: u32,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            sizing: ChunkSizing::default(),
            concurrency: 5,
            max_file_retries: 3,
        }
    }
}

/// Progress callbacks. Called from worker threads.
pub trait DownloadObserver: Send + Sync {
    /// A download attempt is starting
    fn on_file_start(&self, _file: &str, _size: u64, _chunks: usize, _attempt: u32) {}

    /// One chunk was verified
    fn on_chunk_complete(&self, _file: &str, _sequence: u32, _bytes: u64, _attempts: u32) {}

    /// The file was verified and moved into place
    fn on_file_complete(&self, _file: &str, _path: &Path) {}

    /// The download failed for good
    fn on_file_failed(&self, _file: &str, _error: &DownloadError) {}
}

/// Observer that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl DownloadObserver for NoopObserver {}

/// Verified chunk payloads keyed by sequence, filled concurrently
#[derive(Debug, Default)]
pub struct ChunkResults {
    chunks: Mutex<BTreeMap<u32, Vec<u8>>>,
}

impl ChunkResults {
    /// Create an empty map
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a verified payload
    pub fn insert(&self, sequence: u32, payload: Vec<u8>) {
        self.chunks.lock().insert(sequence, payload);
    }

    /// Number of chunks stored
    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.lock().len()
    }

    /// Whether nothing has been stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take the collected payloads
    #[must_use]
    pub fn into_inner(self) -> BTreeMap<u32, Vec<u8>> {
        self.chunks.into_inner()
    }
}

/// Write chunks into `path` by offset, in whatever order they arrive.
///
/// `plan[i]` must describe sequence `i`.
///
/// # Errors
///
/// Returns `InvalidData` if a sequence is unknown or any planned chunk is
/// missing, and any I/O error from writing.
pub fn merge_chunks<I>(path: &Path, total_size: u64, plan: &[ChunkSpec], chunks: I) -> io::Result<()>
where
    I: IntoIterator<Item = (u32, Vec<u8>)>,
{
    let mut assembler = FileReassembler::new(path, total_size, plan.len() as u64)?;
    for (sequence, payload) in chunks {
        let spec = plan.get(sequence as usize).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Chunk {sequence} is not in the plan"),
            )
        })?;
        assembler.write_chunk(spec, &payload)?;
    }
    assembler.finalize()
}

fn remove_partial(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Removed partial file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "Failed to remove partial file: {}", e),
    }
}

/// Downloads whole files through a [`ChunkFetcher`]
pub struct Downloader<S> {
    fetcher: ChunkFetcher<S>,
    config: DownloadConfig,
    observer: Arc<dyn DownloadObserver>,
}

impl<S: ChunkSource> Downloader<S> {
    /// Create a downloader with no progress reporting
    pub fn new(fetcher: ChunkFetcher<S>, config: DownloadConfig) -> Self {
        Self::with_observer(fetcher, config, Arc::new(NoopObserver))
    }

    /// Create a downloader reporting to `observer`
    pub fn with_observer(
        fetcher: ChunkFetcher<S>,
        config: DownloadConfig,
        observer: Arc<dyn DownloadObserver>,
    ) -> Self {
        Self {
            fetcher,
            config,
            observer,
        }
    }

    /// Download settings
    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// Download `file_name` into the output directory.
    ///
    /// Returns the final path. On any failure no file is left at the final
    /// path and the partial file is removed.
    ///
    /// # Errors
    ///
    /// See [`DownloadError`].
    pub fn download(
        &self,
        file_name: &str,
        catalog: &Catalog,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, DownloadError> {
        let result = self.try_download(file_name, catalog, cancel);
        match &result {
            Ok(path) => self.observer.on_file_complete(file_name, path),
            Err(e) => self.observer.on_file_failed(file_name, e),
        }
        result
    }

    fn try_download(
        &self,
        file_name: &str,
        catalog: &Catalog,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, DownloadError> {
        let descriptor = catalog
            .get(file_name)
            .ok_or_else(|| DownloadError::NotInCatalog(file_name.to_string()))?;
        if descriptor.name.contains(['/', '\\']) || !is_shareable_name(&descriptor.name, &[]) {
            return Err(DownloadError::Rejected(format!(
                "unsafe file name {:?}",
                descriptor.name
            )));
        }
        let plan = plan_chunks(&descriptor.name, descriptor.size_bytes, self.config.sizing)?;

        fs::create_dir_all(&self.config.output_dir)?;
        let final_path = self.config.output_dir.join(&descriptor.name);
        let part_path = self
            .config
            .output_dir
            .join(format!("{}{PARTIAL_SUFFIX}", descriptor.name));

        let max_attempts = self.config.max_file_retries.max(1);
        let mut last_checksum = String::new();

        for attempt in 1..=max_attempts {
            info!(
                file = %file_name,
                size = descriptor.size_bytes,
                chunks = plan.len(),
                attempt,
                "Downloading"
            );
            self.observer
                .on_file_start(file_name, descriptor.size_bytes, plan.len(), attempt);

            match self.assemble(descriptor, &plan, &part_path, cancel) {
                Ok(checksum) if checksums_match(&checksum, &descriptor.checksum) => {
                    fs::rename(&part_path, &final_path).inspect_err(|_| remove_partial(&part_path))?;
                    info!(file = %file_name, path = %final_path.display(), "Download verified");
                    return Ok(final_path);
                }
                Ok(checksum) => {
                    warn!(
                        file = %file_name,
                        attempt,
                        expected = %descriptor.checksum,
                        actual = %checksum,
                        "Whole-file checksum mismatch; discarding"
                    );
                    remove_partial(&part_path);
                    last_checksum = checksum;
                }
                Err(e) => {
                    remove_partial(&part_path);
                    if !matches!(e, DownloadError::Cancelled) {
                        error!(file = %file_name, "Download failed: {}", e);
                    }
                    return Err(e);
                }
            }
        }

        Err(DownloadError::FileChecksumMismatch {
            file: file_name.to_string(),
            attempts: max_attempts,
            expected: descriptor.checksum.clone(),
            actual: last_checksum,
        })
    }

    /// One whole-file attempt; returns the checksum of the assembled file.
    fn assemble(
        &self,
        descriptor: &FileDescriptor,
        plan: &[ChunkSpec],
        part_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<String, DownloadError> {
        let results = self.fetch_all(&descriptor.name, plan, cancel)?;
        merge_chunks(part_path, descriptor.size_bytes, plan, results.into_inner())?;
        Ok(file_checksum(part_path)?)
    }

    fn fetch_all(
        &self,
        file_name: &str,
        plan: &[ChunkSpec],
        cancel: &CancellationToken,
    ) -> Result<ChunkResults, DownloadError> {
        let results = ChunkResults::new();
        if plan.is_empty() {
            return Ok(results);
        }

        let abort = cancel.child();
        let failure: Mutex<Option<DownloadError>> = Mutex::new(None);
        let (tx, rx) = crossbeam_channel::unbounded::<&ChunkSpec>();
        for spec in plan {
            // The receiver is alive until the end of this function.
            let _ = tx.send(spec);
        }
        drop(tx);

        let workers = self.config.concurrency.clamp(1, plan.len());
        debug!(file = %file_name, workers, "Starting chunk workers");

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    while let Ok(spec) = rx.recv() {
                        if abort.is_cancelled() {
                            break;
                        }
                        match self.fetcher.fetch(spec, &abort) {
                            Ok(chunk) => {
                                self.observer.on_chunk_complete(
                                    file_name,
                                    chunk.sequence,
                                    chunk.payload.len() as u64,
                                    chunk.attempts,
                                );
                                results.insert(chunk.sequence, chunk.payload);
                            }
                            Err(FetchError::Cancelled) => break,
                            Err(e) => {
                                let mut slot = failure.lock();
                                if slot.is_none() {
                                    *slot = Some(escalate(file_name, e));
                                }
                                abort.cancel();
                                break;
                            }
                        }
                    }
                });
            }
        });

        if let Some(err) = failure.into_inner() {
            return Err(err);
        }
        if cancel.is_cancelled() || results.len() < plan.len() {
            return Err(DownloadError::Cancelled);
        }
        Ok(results)
    }
}

fn escalate(file_name: &str, err: FetchError) -> DownloadError {
    match err {
        FetchError::Exhausted {
            sequence,
            attempts,
            last,
        } => DownloadError::ChunkExhausted {
            file: file_name.to_string(),
            sequence,
            attempts,
            reason: last.to_string(),
        },
        FetchError::NotFound(name) => DownloadError::NotFound(name),
        FetchError::Rejected(reason) => DownloadError::Rejected(reason),
        FetchError::Cancelled => DownloadError::Cancelled,
    }
}
