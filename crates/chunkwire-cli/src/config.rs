//! CLI configuration file.
//!
//! Lives at `~/.config/chunkwire/config.toml` by default. Every field has a
//! default, so a partial file (or none at all) is valid.

use anyhow::Context;
use chunkwire_core::client::{AgentConfig, DownloadConfig, FetchConfig};
use chunkwire_core::frame::AckMode;
use chunkwire_core::server::{FaultPlan, ServerConfig};
use chunkwire_files::DEFAULT_CHUNK_SIZE;
use chunkwire_files::chunker::ChunkSizing;
use chunkwire_transport::TcpConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Settings for `chunkwire serve`
    pub server: ServerSection,
    /// Settings for the client commands
    pub client: ClientSection,
}

/// `[server]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Listen address
    pub bind_addr: String,
    /// Directory whose files are offered
    pub shared_dir: PathBuf,
    /// File names never listed or served
    pub excludes: Vec<String>,
    /// Must match the client's `ack_mode`
    pub ack_mode: AckMode,
    /// Wait for `ACK`/`NAK` after each packet, in milliseconds
    pub ack_timeout_ms: u64,
    /// Probability of corrupting a served chunk (testing only)
    pub fault_probability: f64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{}", chunkwire_core::DEFAULT_PORT),
            shared_dir: PathBuf::from("."),
            excludes: Vec::new(),
            ack_mode: AckMode::None,
            ack_timeout_ms: 2000,
            fault_probability: 0.0,
        }
    }
}

/// `[client]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    /// Server address
    pub server_addr: String,
    /// Where downloaded files are written
    pub output_dir: PathBuf,
    /// Persisted job list
    pub jobs_file: PathBuf,
    /// Nominal chunk size in bytes
    pub chunk_size: u64,
    /// Split every file into this many chunks instead (overrides `chunk_size`)
    pub chunk_count: Option<u32>,
    /// Chunks fetched in parallel
    pub concurrency: usize,
    /// Total attempts per chunk
    pub max_retries: u32,
    /// Pause before re-requesting a chunk, in milliseconds
    pub retry_delay_ms: u64,
    /// Total whole-file attempts
    pub max_file_retries: u32,
    /// Socket connect/read/write timeout, in milliseconds
    pub timeout_ms: u64,
    /// Must match the server's `ack_mode`
    pub ack_mode: AckMode,
    /// How often the job list is polled, in milliseconds
    pub poll_interval_ms: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            server_addr: format!("127.0.0.1:{}", chunkwire_core::DEFAULT_PORT),
            output_dir: PathBuf::from("downloads"),
            jobs_file: PathBuf::from("jobs.txt"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_count: None,
            concurrency: 5,
            max_retries: 5,
            retry_delay_ms: 200,
            max_file_retries: 3,
            timeout_ms: 5000,
            ack_mode: AckMode::None,
            poll_interval_ms: 1000,
        }
    }
}

impl Config {
    /// Default config file location
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chunkwire")
            .join("config.toml")
    }

    /// Load from `path`
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Load from the default path, or fall back to defaults if it is absent
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Write to `path`, creating parent directories
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let text = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, text)
            .with_context(|| format!("Failed to write config file {}", path.display()))
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        self.server
            .bind_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid server.bind_addr: {}", self.server.bind_addr))?;
        if !(0.0..=1.0).contains(&self.server.fault_probability) {
            anyhow::bail!(
                "server.fault_probability must be within 0.0..=1.0, got {}",
                self.server.fault_probability
            );
        }
        if self.server.excludes.iter().any(|e| e.is_empty()) {
            anyhow::bail!("server.excludes must not contain empty names");
        }

        let client = &self.client;
        if client.server_addr.trim().is_empty() {
            anyhow::bail!("client.server_addr must not be empty");
        }
        if client.chunk_size == 0 {
            anyhow::bail!("client.chunk_size must be greater than 0");
        }
        if client.chunk_count == Some(0) {
            anyhow::bail!("client.chunk_count must be greater than 0");
        }
        if client.chunk_size > u64::from(u32::MAX) {
            anyhow::bail!("client.chunk_size must fit in 32 bits");
        }
        if client.concurrency == 0 {
            anyhow::bail!("client.concurrency must be greater than 0");
        }
        if client.max_retries == 0 || client.max_file_retries == 0 {
            anyhow::bail!("client.max_retries and client.max_file_retries must be at least 1");
        }
        if client.timeout_ms == 0 {
            anyhow::bail!("client.timeout_ms must be greater than 0");
        }
        Ok(())
    }

    /// Engine settings for `serve`
    pub fn server_config(&self) -> anyhow::Result<ServerConfig> {
        let faults = if self.server.fault_probability > 0.0 {
            FaultPlan::Random {
                probability: self.server.fault_probability,
            }
        } else {
            FaultPlan::None
        };
        Ok(ServerConfig {
            bind_addr: self
                .server
                .bind_addr
                .parse()
                .with_context(|| format!("Invalid bind address: {}", self.server.bind_addr))?,
            shared_dir: self.server.shared_dir.clone(),
            excludes: self.server.excludes.clone(),
            ack_mode: self.server.ack_mode,
            ack_timeout: Duration::from_millis(self.server.ack_timeout_ms),
            faults,
            ..ServerConfig::default()
        })
    }

    /// Socket settings for the client
    pub fn tcp_config(&self) -> TcpConfig {
        let timeout = Duration::from_millis(self.client.timeout_ms);
        TcpConfig {
            connect_timeout: timeout,
            read_timeout: timeout,
            write_timeout: timeout,
            ..TcpConfig::default()
        }
    }

    /// Chunk retry policy
    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            max_retries: self.client.max_retries,
            retry_delay: Duration::from_millis(self.client.retry_delay_ms),
        }
    }

    /// Download settings
    pub fn download_config(&self) -> DownloadConfig {
        let sizing = match self.client.chunk_count {
            Some(count) => ChunkSizing::Count(count),
            None => ChunkSizing::Fixed(self.client.chunk_size),
        };
        DownloadConfig {
            output_dir: self.client.output_dir.clone(),
            sizing,
            concurrency: self.client.concurrency,
            max_file_retries: self.client.max_file_retries,
        }
    }

    /// Agent settings; `watch` keeps the agent polling after the queue drains
    pub fn agent_config(&self, watch: bool) -> AgentConfig {
        AgentConfig {
            poll_interval: Duration::from_millis(self.client.poll_interval_ms),
            exit_when_idle: !watch,
            ..AgentConfig::default()
        }
    }
}
