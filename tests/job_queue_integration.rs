//! Job queue driven downloads: the agent against a live server.

use chunkwire_core::CancellationToken;
use chunkwire_core::client::{
    AgentConfig, CatalogSource, DownloadAgent, JobEntry, JobStatus, JobStore, NoopObserver,
};
use chunkwire_core::error::{DownloadError, SessionError};
use chunkwire_core::frame::AckMode;
use chunkwire_files::catalog::Catalog;
use chunkwire_files::chunker::ChunkSizing;
use chunkwire_integration_tests::{
    RecordingObserver, TestServer, has_partial_files, pattern, tcp_downloader,
};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Replays a catalog captured earlier, however the server has changed since
struct Snapshot(Catalog);

impl CatalogSource for Snapshot {
    fn catalog(&mut self) -> Result<Catalog, SessionError> {
        Ok(self.0.clone())
    }
}

fn agent_config() -> AgentConfig {
    AgentConfig {
        poll_interval: Duration::from_millis(10),
        ..AgentConfig::default()
    }
}

fn entry(name: &str, status: JobStatus) -> JobEntry {
    JobEntry {
        name: name.to_string(),
        status,
    }
}

#[test]
fn test_agent_drains_queue_against_server() {
    let alpha = pattern(5 * 1024 * 1024, 10);
    let beta = pattern(70_001, 11);
    let server = TestServer::start(&[("alpha.bin", &alpha[..]), ("beta.bin", &beta[..])]);
    let work = TempDir::new().unwrap();
    let out = work.path().join("out");

    let mut session = server.connect();
    let store = JobStore::open(work.path().join("jobs.txt")).unwrap();
    store.enqueue(["alpha.bin", "beta.bin"]).unwrap();

    let downloader = tcp_downloader(
        &session,
        &out,
        ChunkSizing::Count(4),
        5,
        AckMode::None,
        Arc::new(NoopObserver),
    );
    let agent = DownloadAgent::new(store, downloader, agent_config());
    let summary = agent.run(&mut session, &CancellationToken::new()).unwrap();
    session.disconnect().unwrap();

    assert_eq!(summary.completed, vec!["alpha.bin".to_string(), "beta.bin".to_string()]);
    assert!(summary.failed.is_empty());
    assert!(!summary.cancelled);
    assert_eq!(fs::read(out.join("alpha.bin")).unwrap(), alpha);
    assert_eq!(fs::read(out.join("beta.bin")).unwrap(), beta);
    assert_eq!(
        agent.store().entries().unwrap(),
        vec![
            entry("alpha.bin", JobStatus::Done),
            entry("beta.bin", JobStatus::Done)
        ]
    );
}

#[test]
fn test_file_removed_after_listing_fails_job() {
    let data = pattern(30_000, 12);
    let server = TestServer::start(&[("vanishing.bin", &data[..])]);
    let work = TempDir::new().unwrap();
    let out = work.path().join("out");

    let mut session = server.connect();
    let mut stale = Snapshot(session.catalog().unwrap());
    assert!(stale.0.get("vanishing.bin").is_some());
    fs::remove_file(server.shared_path("vanishing.bin")).unwrap();

    let store = JobStore::open(work.path().join("jobs.txt")).unwrap();
    store.enqueue(["vanishing.bin"]).unwrap();

    let observer = Arc::new(RecordingObserver::default());
    let downloader = tcp_downloader(
        &session,
        &out,
        ChunkSizing::Count(4),
        4,
        AckMode::None,
        observer.clone(),
    );
    let agent = DownloadAgent::new(store, downloader, agent_config());
    let summary = agent.run(&mut stale, &CancellationToken::new()).unwrap();
    session.disconnect().unwrap();

    assert!(summary.completed.is_empty());
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].0, "vanishing.bin");
    let failures = observer.failed.lock().clone();
    assert_eq!(
        failures[0].1,
        DownloadError::NotFound("vanishing.bin".to_string()).to_string()
    );

    // Terminal on the first attempt: no chunk retried, nothing left behind.
    assert_eq!(server.stats().chunks_served, 0);
    assert!(!out.join("vanishing.bin").exists());
    assert!(!has_partial_files(&out));
    assert_eq!(
        agent.store().entries().unwrap(),
        vec![entry("vanishing.bin", JobStatus::Failed)]
    );
}

#[test]
fn test_interrupted_job_stays_in_progress_and_resumes() {
    let data = pattern(64_000, 13);
    let server = TestServer::start(&[("resume.bin", &data[..])]);
    let work = TempDir::new().unwrap();
    let out = work.path().join("out");
    let jobs = work.path().join("jobs.txt");

    JobStore::open(&jobs)
        .unwrap()
        .enqueue(["resume.bin"])
        .unwrap();

    // First run: cancelled as soon as one chunk lands.
    {
        let cancel = CancellationToken::new();
        let mut session = server.connect();
        let observer = Arc::new(RecordingObserver {
            cancel_after_first_chunk: Some(cancel.clone()),
            ..RecordingObserver::default()
        });
        let downloader = tcp_downloader(
            &session,
            &out,
            ChunkSizing::Count(4),
            1,
            AckMode::None,
            observer,
        );
        let agent = DownloadAgent::new(JobStore::open(&jobs).unwrap(), downloader, agent_config());
        let summary = agent.run(&mut session, &cancel).unwrap();
        session.disconnect().unwrap();

        assert!(summary.cancelled);
        assert!(summary.completed.is_empty());
        assert!(summary.failed.is_empty());
        assert_eq!(agent.store().in_progress().unwrap(), vec!["resume.bin".to_string()]);
        assert!(!out.join("resume.bin").exists());
        assert!(!has_partial_files(&out));
    }

    // Second run picks the job back up.
    let mut session = server.connect();
    let downloader = tcp_downloader(
        &session,
        &out,
        ChunkSizing::Count(4),
        4,
        AckMode::None,
        Arc::new(NoopObserver),
    );
    let agent = DownloadAgent::new(JobStore::open(&jobs).unwrap(), downloader, agent_config());
    let summary = agent.run(&mut session, &CancellationToken::new()).unwrap();
    session.disconnect().unwrap();

    assert_eq!(summary.resumed, vec!["resume.bin".to_string()]);
    assert_eq!(summary.completed, vec!["resume.bin".to_string()]);
    assert_eq!(fs::read(out.join("resume.bin")).unwrap(), data);
    assert_eq!(
        fs::read_to_string(&jobs).unwrap(),
        "resume.bin done\n".to_string()
    );
}

#[test]
fn test_reset_allows_redownload() {
    let data = pattern(9_000, 14);
    let server = TestServer::start(&[("again.bin", &data[..])]);
    let work = TempDir::new().unwrap();
    let out = work.path().join("out");
    let store = JobStore::open(work.path().join("jobs.txt")).unwrap();
    store.enqueue(["again.bin"]).unwrap();

    let mut session = server.connect();
    let downloader = tcp_downloader(
        &session,
        &out,
        ChunkSizing::Count(3),
        3,
        AckMode::None,
        Arc::new(NoopObserver),
    );
    let agent = DownloadAgent::new(store.clone(), downloader, agent_config());

    agent.run(&mut session, &CancellationToken::new()).unwrap();
    assert_eq!(server.stats().chunks_served, 3);

    // Terminal jobs are not re-run without an explicit reset.
    let summary = agent.run(&mut session, &CancellationToken::new()).unwrap();
    assert!(summary.completed.is_empty());
    assert_eq!(server.stats().chunks_served, 3);

    assert!(store.reset("again.bin").unwrap());
    let summary = agent.run(&mut session, &CancellationToken::new()).unwrap();
    assert_eq!(summary.completed, vec!["again.bin".to_string()]);
    assert_eq!(server.stats().chunks_served, 6);
    session.disconnect().unwrap();
}
