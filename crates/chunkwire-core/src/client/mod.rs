//! Client side: control session, chunk fetcher, download orchestrator, job
//! store, and the agent that drives them.

pub mod agent;
pub mod fetcher;
pub mod job_store;
pub mod orchestrator;
pub mod session;

pub use agent::{AgentConfig, AgentSummary, DownloadAgent};
pub use fetcher::{
    ChunkFetcher, ChunkSource, FetchConfig, FetchedChunk, TcpChunkSource, verify_packet,
};
pub use job_store::{AgentLease, JobEntry, JobStatus, JobStore};
pub use orchestrator::{
    ChunkResults, DownloadConfig, DownloadObserver, Downloader, NoopObserver, merge_chunks,
};
pub use session::{CatalogSource, ControlSession};
