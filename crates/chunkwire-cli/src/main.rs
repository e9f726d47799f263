//! chunkwire CLI
//!
//! Serve a directory, or pull files from a server through a persistent job
//! queue with per-chunk verification and retry.

mod config;
mod progress;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use config::Config;
use progress::DownloadProgress;

use chunkwire_core::CancellationToken;
use chunkwire_core::client::{
    ChunkFetcher, ControlSession, DownloadAgent, Downloader, JobStatus, JobStore, TcpChunkSource,
};
use chunkwire_core::frame::AckMode;
use chunkwire_core::server::{FaultPlan, ScriptedFault, Server};
use chunkwire_files::catalog::format_bytes;

/// chunkwire - chunked, checksummed, resumable file distribution
#[derive(Parser)]
#[command(name = "chunkwire")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug output (implies --verbose)
    #[arg(short, long)]
    debug: bool,

    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/chunkwire/config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by the client commands
#[derive(Args, Debug, Clone, Default)]
struct ClientOpts {
    /// Server address (overrides client.server_addr)
    #[arg(short, long)]
    server: Option<String>,

    /// Job list file (overrides client.jobs_file)
    #[arg(short, long)]
    jobs: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the files of a directory
    Serve {
        /// Directory to share (overrides server.shared_dir)
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Listen address (overrides server.bind_addr)
        #[arg(short, long)]
        bind: Option<String>,

        /// File name never listed or served (repeatable)
        #[arg(long)]
        exclude: Vec<String>,

        /// Acknowledgement mode: "none" or "per-chunk"
        #[arg(long, value_parser = parse_ack_mode)]
        ack: Option<AckMode>,

        /// Corrupt each served chunk with this probability (testing only)
        #[arg(long)]
        fault_probability: Option<f64>,

        /// Corrupt chunk SEQ the next TIMES times it is served, as SEQ[:TIMES] (repeatable)
        #[arg(long, value_parser = parse_scripted_fault)]
        corrupt: Vec<ScriptedFault>,

        /// Print final statistics as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the files a server offers
    List {
        #[command(flatten)]
        client: ClientOpts,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Add file names to the job list
    Enqueue {
        /// File names to download
        names: Vec<String>,

        /// Enqueue every file in the server's catalog
        #[arg(long, conflicts_with = "names")]
        all: bool,

        #[command(flatten)]
        client: ClientOpts,
    },

    /// Download queued files
    Fetch {
        #[command(flatten)]
        client: ClientOpts,

        /// Output directory (overrides client.output_dir)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Chunks fetched in parallel (overrides client.concurrency)
        #[arg(long)]
        concurrency: Option<usize>,

        /// Split each file into this many chunks (overrides client.chunk_count)
        #[arg(long)]
        chunks: Option<u32>,

        /// Acknowledgement mode: "none" or "per-chunk"
        #[arg(long, value_parser = parse_ack_mode)]
        ack: Option<AckMode>,

        /// Keep polling the job list after it drains
        #[arg(long)]
        watch: bool,
    },

    /// Inspect or edit the job list
    Jobs {
        #[command(subcommand)]
        action: JobsAction,

        /// Job list file (overrides client.jobs_file)
        #[arg(short, long, global = true)]
        jobs: Option<PathBuf>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum JobsAction {
    /// Show every job and its status
    List,

    /// Return a finished or failed job to pending
    Reset {
        /// File name
        name: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show configuration
    Show {
        /// Dotted key to show, e.g. client.concurrency
        key: Option<String>,
    },

    /// Write the default configuration to the config path
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn parse_ack_mode(s: &str) -> Result<AckMode, String> {
    match s {
        "none" => Ok(AckMode::None),
        "per-chunk" => Ok(AckMode::PerChunk),
        _ => Err(format!("unknown ack mode {s:?} (expected none or per-chunk)")),
    }
}

fn parse_scripted_fault(s: &str) -> Result<ScriptedFault, String> {
    let (seq, times) = match s.split_once(':') {
        Some((seq, times)) => (seq, times),
        None => (s, "1"),
    };
    let sequence = seq
        .trim()
        .parse()
        .map_err(|_| format!("invalid chunk sequence {seq:?}"))?;
    let times = times
        .trim()
        .parse()
        .map_err(|_| format!("invalid repeat count {times:?}"))?;
    Ok(ScriptedFault {
        file: None,
        sequence,
        times,
    })
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(rest),
        None => PathBuf::from(path),
    }
}

fn apply_client_opts(config: &mut Config, opts: &ClientOpts) {
    if let Some(server) = &opts.server {
        config.client.server_addr.clone_from(server);
    }
    if let Some(jobs) = &opts.jobs {
        config.client.jobs_file.clone_from(jobs);
    }
}

/// Run blocking engine work off the async runtime. Ctrl-C cancels `cancel`
/// and waits for the work to wind down.
async fn run_until_interrupted<T, F>(cancel: CancellationToken, work: F) -> anyhow::Result<T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let mut handle = tokio::task::spawn_blocking(work);
    tokio::select! {
        joined = &mut handle => joined.context("Worker thread panicked")?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            println!("\nInterrupted, shutting down...");
            cancel.cancel();
            handle.await.context("Worker thread panicked")?
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.debug {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_writer(std::io::stderr)
        .init();

    let config_path = expand_home(&cli.config);
    let config = if config_path.exists() {
        Config::load(&config_path)?
    } else if config_path == Config::default_path() {
        Config::load_or_default()?
    } else {
        Config::load(&config_path)?
    };

    config.validate()?;

    match cli.command {
        Commands::Serve {
            dir,
            bind,
            exclude,
            ack,
            fault_probability,
            corrupt,
            json,
        } => {
            let mut config = config;
            if let Some(dir) = dir {
                config.server.shared_dir = dir;
            }
            if let Some(bind) = bind {
                config.server.bind_addr = bind;
            }
            config.server.excludes.extend(exclude);
            if let Some(ack) = ack {
                config.server.ack_mode = ack;
            }
            if let Some(p) = fault_probability {
                config.server.fault_probability = p;
            }
            config.validate()?;
            serve(&config, corrupt, json).await?;
        }
        Commands::List { client, json } => {
            let mut config = config;
            apply_client_opts(&mut config, &client);
            list_remote(&config, json).await?;
        }
        Commands::Enqueue { names, all, client } => {
            let mut config = config;
            apply_client_opts(&mut config, &client);
            enqueue(&config, names, all).await?;
        }
        Commands::Fetch {
            client,
            output,
            concurrency,
            chunks,
            ack,
            watch,
        } => {
            let mut config = config;
            apply_client_opts(&mut config, &client);
            if let Some(output) = output {
                config.client.output_dir = output;
            }
            if let Some(concurrency) = concurrency {
                config.client.concurrency = concurrency;
            }
            if chunks.is_some() {
                config.client.chunk_count = chunks;
            }
            if let Some(ack) = ack {
                config.client.ack_mode = ack;
            }
            config.validate()?;
            fetch(&config, watch).await?;
        }
        Commands::Jobs { action, jobs } => {
            let mut config = config;
            if let Some(jobs) = jobs {
                config.client.jobs_file = jobs;
            }
            match action {
                JobsAction::List => jobs_list(&config)?,
                JobsAction::Reset { name } => jobs_reset(&config, &name)?,
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Show { key } => config_show(key.as_deref(), &config)?,
            ConfigAction::Init { force } => config_init(&config_path, force)?,
        },
    }

    Ok(())
}

/// Serve until Ctrl-C
async fn serve(config: &Config, corrupt: Vec<ScriptedFault>, json: bool) -> anyhow::Result<()> {
    let mut server_config = config.server_config()?;
    if !corrupt.is_empty() {
        server_config.faults = FaultPlan::Scripted(corrupt);
    }
    let shared_dir = server_config.shared_dir.clone();
    let server = Server::bind(server_config)?;

    println!("chunkwire server");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Listening on: {}", server.local_addr());
    println!("Sharing: {}", shared_dir.display());
    println!();
    println!("Ready. Press Ctrl+C to stop");
    println!();

    let stats = Arc::clone(server.stats());
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    run_until_interrupted(cancel, move || {
        server.run(&token)?;
        Ok(())
    })
    .await?;

    let snapshot = stats.snapshot();
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        println!("Connections: {}", snapshot.connections);
        println!(
            "Sessions granted: {} (busy rejections: {})",
            snapshot.sessions_granted, snapshot.busy_rejections
        );
        println!(
            "Chunks served: {} ({})",
            snapshot.chunks_served,
            format_bytes(snapshot.bytes_served)
        );
        println!("Errors sent: {}", snapshot.errors_sent);
        if snapshot.faults_injected > 0 {
            println!("Faults injected: {}", snapshot.faults_injected);
        }
        if snapshot.acks + snapshot.naks > 0 {
            println!("ACK/NAK: {}/{}", snapshot.acks, snapshot.naks);
        }
    }
    println!("Server stopped");
    Ok(())
}

/// Print the server's catalog
async fn list_remote(config: &Config, json: bool) -> anyhow::Result<()> {
    let addr = config.client.server_addr.clone();
    let tcp = config.tcp_config();
    let files = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
        let mut session = ControlSession::connect(addr.as_str(), &tcp)
            .with_context(|| format!("Failed to open a session with {addr}"))?;
        let files = session.list_files()?;
        session.disconnect()?;
        Ok(files)
    })
    .await
    .context("Worker thread panicked")??;

    if json {
        println!("{}", serde_json::to_string_pretty(&files)?);
        return Ok(());
    }
    if files.is_empty() {
        println!("No files offered");
        return Ok(());
    }
    println!("{:<40} {:>12} CHECKSUM", "NAME", "SIZE");
    for file in &files {
        println!(
            "{:<40} {:>12} {}",
            file.name,
            format_bytes(file.size_bytes),
            file.checksum
        );
    }
    println!();
    println!(
        "{} file(s), {} total",
        files.len(),
        format_bytes(files.iter().map(|f| f.size_bytes).sum())
    );
    Ok(())
}

/// Add names (or the whole catalog) to the job list
async fn enqueue(config: &Config, names: Vec<String>, all: bool) -> anyhow::Result<()> {
    let names = if all {
        let addr = config.client.server_addr.clone();
        let tcp = config.tcp_config();
        tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<String>> {
            let mut session = ControlSession::connect(addr.as_str(), &tcp)
                .with_context(|| format!("Failed to open a session with {addr}"))?;
            let files = session.list_files()?;
            session.disconnect()?;
            Ok(files.into_iter().map(|f| f.name).collect())
        })
        .await
        .context("Worker thread panicked")??
    } else {
        names
    };
    if names.is_empty() {
        anyhow::bail!("Nothing to enqueue: give file names or --all");
    }

    let store = JobStore::open(&config.client.jobs_file)?;
    let added = store.enqueue(&names)?;
    println!(
        "Queued {added} new job(s) ({} already listed) in {}",
        names.len() - added,
        store.path().display()
    );
    Ok(())
}

/// Drain the job list
async fn fetch(config: &Config, watch: bool) -> anyhow::Result<()> {
    let addr = config.client.server_addr.clone();
    let tcp = config.tcp_config();
    let ack_mode = config.client.ack_mode;
    let fetch_config = config.fetch_config();
    let download_config = config.download_config();
    let agent_config = config.agent_config(watch);
    let jobs_file = config.client.jobs_file.clone();

    println!("Server: {addr}");
    println!("Output directory: {}", download_config.output_dir.display());
    println!("Job list: {}", jobs_file.display());
    println!();

    let started = Instant::now();
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let summary = run_until_interrupted(cancel, move || {
        let store = JobStore::open(&jobs_file)?;
        let mut session = ControlSession::connect(addr.as_str(), &tcp)
            .with_context(|| format!("Failed to open a session with {addr}"))?;

        let source = TcpChunkSource::new(
            session.server_addr(),
            Some(session.token().clone()),
            tcp,
            ack_mode,
        );
        let downloader = Downloader::with_observer(
            ChunkFetcher::new(source, fetch_config),
            download_config,
            Arc::new(DownloadProgress::new()),
        );
        let agent = DownloadAgent::new(store, downloader, agent_config);

        let summary = agent.run(&mut session, &token);
        session.disconnect()?;
        Ok(summary?)
    })
    .await?;

    println!();
    println!(
        "Completed: {}, failed: {} in {:.1}s",
        summary.completed.len(),
        summary.failed.len(),
        started.elapsed().as_secs_f64()
    );
    for (name, reason) in &summary.failed {
        println!("  {name}: {reason}");
    }
    if summary.cancelled {
        println!("Interrupted; unfinished jobs stay in progress and resume on the next fetch");
    }
    Ok(())
}

fn jobs_list(config: &Config) -> anyhow::Result<()> {
    let store = JobStore::open(&config.client.jobs_file)?;
    let entries = store.entries()?;
    if entries.is_empty() {
        println!("No jobs in {}", store.path().display());
        return Ok(());
    }
    for entry in &entries {
        println!("{:<12} {}", entry.status.to_string(), entry.name);
    }
    let count = |status: JobStatus| entries.iter().filter(|e| e.status == status).count();
    println!();
    println!(
        "{} pending, {} in progress, {} done, {} failed",
        count(JobStatus::Pending),
        count(JobStatus::InProgress),
        count(JobStatus::Done),
        count(JobStatus::Failed)
    );
    Ok(())
}

fn jobs_reset(config: &Config, name: &str) -> anyhow::Result<()> {
    let store = JobStore::open(&config.client.jobs_file)?;
    if store.reset(name)? {
        println!("{name} reset to pending");
        Ok(())
    } else {
        anyhow::bail!("No job named {name} in {}", store.path().display())
    }
}

fn config_show(key: Option<&str>, config: &Config) -> anyhow::Result<()> {
    let Some(key) = key else {
        print!("{}", toml::to_string_pretty(config)?);
        return Ok(());
    };
    println!("{}", lookup_key(config, key)?);
    Ok(())
}

/// Resolve a dotted key such as `client.concurrency` to its rendered value
fn lookup_key(config: &Config, key: &str) -> anyhow::Result<String> {
    let tree = serde_json::to_value(config)?;
    let pointer = format!("/{}", key.trim().to_lowercase().replace('.', "/"));
    match tree.pointer(&pointer) {
        Some(serde_json::Value::String(s)) => Ok(s.clone()),
        Some(serde_json::Value::Null) => Ok("(not set)".to_string()),
        Some(value) => Ok(value.to_string()),
        None => anyhow::bail!("Unknown configuration key: {key}"),
    }
}

fn config_init(path: &std::path::Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    Config::default().save(path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}
