//! Queue-driven download agent.
//!
//! A scanner thread polls the job store, claims pending names, and pushes
//! them into a channel. The drainer (the calling thread) pops names, runs the
//! downloader, and records the outcome. On cancellation claimed jobs stay
//! `in progress` so the next run can resume them.

use super::fetcher::ChunkSource;
use super::job_store::{JobStatus, JobStore};
use super::orchestrator::Downloader;
use super::session::CatalogSource;
use crate::cancel::CancellationToken;
use crate::error::{AgentError, DownloadError, StoreError};
use chunkwire_files::catalog::Catalog;
use crossbeam_channel::{RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Agent settings
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// How often the scanner polls the job store
    pub poll_interval: Duration,
    /// Stop once the queue is empty and nothing is in flight
    pub exit_when_idle: bool,
    /// Finish jobs left `in progress` by an agent that is no longer running
    pub resume_in_progress: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            exit_when_idle: true,
            resume_in_progress: true,
        }
    }
}

/// What a run accomplished
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentSummary {
    /// Files downloaded and verified
    pub completed: Vec<String>,
    /// Files that failed, with the reason
    pub failed: Vec<(String, String)>,
    /// Orphaned jobs adopted from an earlier run
    pub resumed: Vec<String>,
    /// Whether the run ended by cancellation
    pub cancelled: bool,
}

/// Scanner/drainer loop over a [`JobStore`]
///
/// A run holds an [`AgentLease`](super::job_store::AgentLease) on the store
/// from start to finish, so other agents never adopt the jobs it claimed.
pub struct DownloadAgent<S> {
    store: JobStore,
    downloader: Downloader<S>,
    config: AgentConfig,
}

impl<S: ChunkSource> DownloadAgent<S> {
    /// Create an agent
    pub fn new(store: JobStore, downloader: Downloader<S>, config: AgentConfig) -> Self {
        Self {
            store,
            downloader,
            config,
        }
    }

    /// Job store in use
    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Run until idle (when `exit_when_idle`) or until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::Store` if the job store fails and
    /// `AgentError::Session` if the catalog cannot be fetched.
    pub fn run(
        &self,
        catalogs: &mut dyn CatalogSource,
        cancel: &CancellationToken,
    ) -> Result<AgentSummary, AgentError> {
        let mut summary = AgentSummary::default();
        if cancel.is_cancelled() {
            summary.cancelled = true;
            return Ok(summary);
        }
        let (_lease, adopted) = self.store.register(self.config.resume_in_progress)?;
        if !adopted.is_empty() {
            info!(jobs = adopted.len(), "Resuming interrupted jobs");
        }

        let stop = cancel.child();
        let in_flight = AtomicUsize::new(adopted.len());
        let (tx, rx) = crossbeam_channel::unbounded::<String>();
        for name in &adopted {
            // Unbounded, and the receiver is alive.
            let _ = tx.send(name.clone());
        }
        summary.resumed = adopted;

        let (scanned, drained) = thread::scope(|scope| {
            let scanner = scope.spawn(|| {
                let result = self.scan(tx, &in_flight, &stop);
                if result.is_err() {
                    stop.cancel();
                }
                result
            });

            let mut catalog: Option<Catalog> = None;
            let drained = loop {
                let name = match rx.recv_timeout(self.config.poll_interval) {
                    Ok(name) => name,
                    Err(RecvTimeoutError::Timeout) if stop.is_cancelled() => break Ok(()),
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break Ok(()),
                };
                if stop.is_cancelled() {
                    // Claimed but never started; leave it in progress.
                    break Ok(());
                }

                let outcome = self.process(&name, catalogs, &mut catalog, &stop, &mut summary);
                in_flight.fetch_sub(1, Ordering::AcqRel);
                if let Err(e) = outcome {
                    break Err(e);
                }
            };

            stop.cancel();
            let scanned = scanner
                .join()
                .unwrap_or_else(|_| Err(StoreError::Io(std::io::Error::other("scanner panicked"))));
            (scanned, drained)
        });

        drained?;
        scanned?;
        summary.cancelled = cancel.is_cancelled();
        info!(
            completed = summary.completed.len(),
            failed = summary.failed.len(),
            cancelled = summary.cancelled,
            "Agent finished"
        );
        Ok(summary)
    }

    fn scan(
        &self,
        tx: Sender<String>,
        in_flight: &AtomicUsize,
        stop: &CancellationToken,
    ) -> Result<(), StoreError> {
        while !stop.is_cancelled() {
            let claimed = self.store.claim_pending()?;
            if claimed.is_empty() {
                if self.config.exit_when_idle && in_flight.load(Ordering::Acquire) == 0 {
                    debug!("Queue idle; scanner exiting");
                    return Ok(());
                }
            } else {
                info!(jobs = claimed.len(), "Claimed jobs");
            }

            for name in claimed {
                in_flight.fetch_add(1, Ordering::AcqRel);
                if tx.send(name).is_err() {
                    return Ok(());
                }
            }

            if !stop.sleep(self.config.poll_interval) {
                break;
            }
        }
        Ok(())
    }

    fn process(
        &self,
        name: &str,
        catalogs: &mut dyn CatalogSource,
        catalog: &mut Option<Catalog>,
        stop: &CancellationToken,
        summary: &mut AgentSummary,
    ) -> Result<(), AgentError> {
        let cached = match catalog.take() {
            Some(c) if c.get(name).is_some() => c,
            Some(_) => {
                debug!(file = %name, "Not in cached catalog; refreshing");
                catalogs.catalog()?
            }
            None => catalogs.catalog()?,
        };
        let current = catalog.insert(cached);

        match self.downloader.download(name, current, stop) {
            Ok(path) => {
                self.store.mark(name, JobStatus::Done)?;
                info!(file = %name, path = %path.display(), "Job done");
                summary.completed.push(name.to_string());
            }
            Err(DownloadError::Cancelled) => {
                warn!(file = %name, "Download interrupted; job left in progress");
            }
            Err(e) => {
                self.store.mark(name, JobStatus::Failed)?;
                error!(file = %name, "Job failed: {}", e);
                summary.failed.push((name.to_string(), e.to_string()));
            }
        }
        Ok(())
    }
}
