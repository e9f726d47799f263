//! Server side: admission control, catalog, and chunk dispatch over TCP.
//!
//! One thread per accepted connection. The accept loop polls a non-blocking
//! listener so it can notice cancellation; connection threads use blocking
//! sockets with read timeouts for the same reason.

pub mod dispatcher;
pub mod fault;
pub mod session;
pub mod stats;

pub use dispatcher::ChunkDispatcher;
pub use fault::{FaultInjector, FaultPlan, ScriptedFault};
pub use session::{Admission, ClientSession, SessionManager};
pub use stats::{ServerStats, ServerStatsSnapshot};

use crate::cancel::CancellationToken;
use crate::error::{DispatchError, FrameError, ServerError};
use crate::frame::{AckMode, ErrorKind, Reply, Request, read_message, write_message};
use crate::token::SessionToken;
use chunkwire_files::catalog::{list_files, render_catalog};
use chunkwire_transport::TcpConfig;
use chunkwire_transport::tcp::{bind_listener, configure_stream, is_timeout, shutdown_quietly};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on
    pub bind_addr: SocketAddr,
    /// Directory whose files are offered
    pub shared_dir: PathBuf,
    /// File names never listed or served
    pub excludes: Vec<String>,
    /// Per-connection socket settings
    pub tcp: TcpConfig,
    /// Must match the client's setting
    pub ack_mode: AckMode,
    /// How long to wait for `ACK`/`NAK` after a packet
    pub ack_timeout: Duration,
    /// Fault injection plan
    pub faults: FaultPlan,
    /// Sleep between polls of an idle listener
    pub accept_poll: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], crate::DEFAULT_PORT)),
            shared_dir: PathBuf::from("."),
            excludes: Vec::new(),
            tcp: TcpConfig::default(),
            ack_mode: AckMode::None,
            ack_timeout: Duration::from_secs(2),
            faults: FaultPlan::None,
            accept_poll: Duration::from_millis(20),
        }
    }
}

/// State shared by every connection thread
struct Shared {
    config: ServerConfig,
    sessions: Arc<SessionManager>,
    stats: Arc<ServerStats>,
    dispatcher: ChunkDispatcher,
}

/// A bound chunkwire server
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    shared: Arc<Shared>,
}

impl Server {
    /// Validate the shared directory and bind the listener.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::SharedDir` if the shared directory does not exist
    /// and `ServerError::Bind` if the address cannot be bound.
    pub fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        if !config.shared_dir.is_dir() {
            return Err(ServerError::SharedDir(
                config.shared_dir.display().to_string(),
            ));
        }

        let listener = bind_listener(config.bind_addr).map_err(|source| ServerError::Bind {
            addr: config.bind_addr,
            source,
        })?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let stats = Arc::new(ServerStats::new());
        let dispatcher = ChunkDispatcher::new(
            config.shared_dir.clone(),
            config.excludes.clone(),
            FaultInjector::new(config.faults.clone()),
            Arc::clone(&stats),
        );

        info!(
            addr = %local_addr,
            dir = %config.shared_dir.display(),
            ack_mode = ?config.ack_mode,
            "Server listening"
        );

        Ok(Self {
            listener,
            local_addr,
            shared: Arc::new(Shared {
                config,
                sessions: Arc::new(SessionManager::new()),
                stats,
                dispatcher,
            }),
        })
    }

    /// Address the listener is bound to
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Admission controller
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.shared.sessions
    }

    /// Live counters
    #[must_use]
    pub fn stats(&self) -> &Arc<ServerStats> {
        &self.shared.stats
    }

    /// Accept connections until `cancel` fires, then wait for every
    /// connection thread to finish.
    ///
    /// # Errors
    ///
    /// Accept errors are logged and retried; this only fails if the listener
    /// itself becomes unusable.
    pub fn run(&self, cancel: &CancellationToken) -> Result<(), ServerError> {
        let mut workers: Vec<JoinHandle<()>> = Vec::new();

        while !cancel.is_cancelled() {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    ServerStats::incr(&self.shared.stats.connections);
                    let shared = Arc::clone(&self.shared);
                    let cancel = cancel.clone();
                    let spawned = thread::Builder::new()
                        .name(format!("chunkwire-conn-{peer}"))
                        .spawn(move || handle_connection(&shared, stream, peer, &cancel));
                    match spawned {
                        Ok(handle) => workers.push(handle),
                        Err(e) => error!(peer = %peer, "Failed to spawn connection thread: {}", e),
                    }
                    workers.retain(|h| !h.is_finished());
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    cancel.sleep(self.shared.config.accept_poll);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    cancel.sleep(self.shared.config.accept_poll);
                }
            }
        }

        info!(connections = workers.len(), "Server stopping");
        for handle in workers {
            if handle.join().is_err() {
                error!("Connection thread panicked");
            }
        }
        Ok(())
    }
}

/// Per-connection state
struct Connection<'a> {
    shared: &'a Shared,
    stream: TcpStream,
    peer: SocketAddr,
    /// Token this connection bound, if any; released when the connection ends
    bound: Option<SessionToken>,
}

enum Flow {
    Continue,
    Close,
}

fn handle_connection(shared: &Shared, stream: TcpStream, peer: SocketAddr, cancel: &CancellationToken) {
    if let Err(e) = configure_stream(&stream, &shared.config.tcp) {
        warn!(peer = %peer, "Failed to configure connection: {}", e);
        return;
    }
    debug!(peer = %peer, "Connection opened");

    let mut conn = Connection {
        shared,
        stream,
        peer,
        bound: None,
    };

    while !cancel.is_cancelled() {
        let text = match read_message(&mut conn.stream) {
            Ok(Some(text)) => text,
            Ok(None) => break,
            Err(FrameError::Timeout) => continue,
            Err(e) => {
                debug!(peer = %peer, "Dropping connection: {}", e);
                break;
            }
        };

        match conn.handle(&text) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Close) => break,
            Err(e) => {
                debug!(peer = %peer, "Write failed: {}", e);
                break;
            }
        }
    }

    if let Some(token) = conn.bound.take()
        && shared.sessions.release(&token)
    {
        info!(peer = %peer, "Binding connection closed; session released");
    }
    shutdown_quietly(&conn.stream);
    debug!(peer = %peer, "Connection closed");
}

impl Connection<'_> {
    fn reply(&mut self, reply: &Reply) -> io::Result<()> {
        if matches!(reply, Reply::Error { .. }) {
            ServerStats::incr(&self.shared.stats.errors_sent);
        }
        write_message(&mut self.stream, &reply.to_string())
    }

    /// Whether this connection may use the session, either because it bound
    /// it or because it presents the bound token.
    fn authorized(&self, token: Option<&SessionToken>) -> bool {
        let sessions = &self.shared.sessions;
        token.is_some_and(|t| sessions.is_bound(t))
            || self.bound.as_ref().is_some_and(|t| sessions.is_bound(t))
    }

    fn handle(&mut self, text: &str) -> io::Result<Flow> {
        let request = match text.parse::<Request>() {
            Ok(request) => request,
            Err(e) => {
                debug!(peer = %self.peer, "Bad request: {}", e);
                self.reply(&Reply::error(ErrorKind::BadRequest, e.to_string()))?;
                return Ok(Flow::Continue);
            }
        };

        match request {
            Request::Connect => self.connect()?,
            Request::Disconnect { token } => {
                if let Some(token) = token.or_else(|| self.bound.clone()) {
                    self.shared.sessions.release(&token);
                    if self.bound.as_ref() == Some(&token) {
                        self.bound = None;
                    }
                }
                self.reply(&Reply::Bye)?;
                return Ok(Flow::Close);
            }
            Request::ListFiles => self.list_files()?,
            Request::GetChunk {
                file,
                start,
                end,
                sequence,
                token,
            } => self.get_chunk(&file, start, end, sequence, token.as_ref())?,
            Request::Ack { sequence } => {
                debug!(peer = %self.peer, sequence, "Late ACK");
                ServerStats::incr(&self.shared.stats.acks);
            }
            Request::Nak { sequence } => {
                debug!(peer = %self.peer, sequence, "Late NAK");
                ServerStats::incr(&self.shared.stats.naks);
            }
        }
        Ok(Flow::Continue)
    }

    fn connect(&mut self) -> io::Result<()> {
        if let Some(token) = self.bound.clone()
            && self.shared.sessions.is_bound(&token)
        {
            return self.reply(&Reply::Welcome(token));
        }

        match self.shared.sessions.try_bind(self.peer) {
            Ok(Admission::Granted(token)) => {
                ServerStats::incr(&self.shared.stats.sessions_granted);
                self.bound = Some(token.clone());
                self.reply(&Reply::Welcome(token))
            }
            Ok(Admission::Busy) => {
                ServerStats::incr(&self.shared.stats.busy_rejections);
                info!(peer = %self.peer, "Rejected: session busy");
                self.reply(&Reply::Busy)
            }
            Err(e) => {
                error!(peer = %self.peer, "Cannot issue session token: {}", e);
                self.reply(&Reply::error(ErrorKind::Internal, e.to_string()))
            }
        }
    }

    fn list_files(&mut self) -> io::Result<()> {
        if !self.authorized(None) {
            return self.reply(&Reply::error(
                ErrorKind::Unauthorized,
                "connect before listing files",
            ));
        }

        let config = &self.shared.config;
        let files = list_files(&config.shared_dir, &config.excludes);
        info!(peer = %self.peer, files = files.len(), "Serving catalog");
        ServerStats::incr(&self.shared.stats.catalogs_served);

        self.reply(&Reply::Ok)?;
        write_message(&mut self.stream, &render_catalog(&files))
    }

    fn get_chunk(
        &mut self,
        file: &str,
        start: u64,
        end: u64,
        sequence: u32,
        token: Option<&SessionToken>,
    ) -> io::Result<()> {
        if !self.authorized(token) {
            return self.reply(&Reply::error(ErrorKind::Unauthorized, "no bound session"));
        }
        if end < start {
            return self.reply(&Reply::error(
                ErrorKind::BadRequest,
                format!("inverted range {start}..{end}"),
            ));
        }

        let packet = match self.shared.dispatcher.serve_chunk(file, sequence, start, end - start) {
            Ok(packet) => packet,
            Err(DispatchError::NotFound(name)) => {
                return self.reply(&Reply::error(ErrorKind::NotFound, name));
            }
            Err(e @ DispatchError::InvalidRange { .. }) => {
                return self.reply(&Reply::error(ErrorKind::BadRequest, e.to_string()));
            }
            Err(DispatchError::Io(e)) => {
                error!(peer = %self.peer, file = %file, "Read failed: {}", e);
                return self.reply(&Reply::error(ErrorKind::Internal, e.to_string()));
            }
        };

        self.shared.stats.record_chunk(u64::from(packet.length));
        self.reply(&Reply::Ok)?;
        packet.write_to(&mut self.stream)?;

        if self.shared.config.ack_mode == AckMode::PerChunk {
            self.await_ack(sequence)?;
        }
        Ok(())
    }

    /// Wait a bounded time for the client's verdict on the packet just sent.
    fn await_ack(&mut self, sequence: u32) -> io::Result<()> {
        self.stream
            .set_read_timeout(Some(self.shared.config.ack_timeout))?;
        let verdict = read_message(&mut self.stream);
        configure_stream(&self.stream, &self.shared.config.tcp)?;

        match verdict.map(|m| m.map(|t| t.parse::<Request>())) {
            Ok(Some(Ok(Request::Ack { sequence: acked }))) if acked == sequence => {
                ServerStats::incr(&self.shared.stats.acks);
                debug!(peer = %self.peer, sequence, "ACK");
            }
            Ok(Some(Ok(Request::Nak { sequence: naked }))) if naked == sequence => {
                ServerStats::incr(&self.shared.stats.naks);
                warn!(peer = %self.peer, sequence, "NAK: client will re-request");
            }
            Ok(Some(other)) => {
                debug!(peer = %self.peer, sequence, "Expected ACK/NAK, got {:?}", other);
            }
            Ok(None) => debug!(peer = %self.peer, sequence, "Closed without ACK"),
            Err(FrameError::Timeout) => debug!(peer = %self.peer, sequence, "No ACK before timeout"),
            Err(FrameError::Io(e)) if !is_timeout(&e) => return Err(e),
            Err(e) => debug!(peer = %self.peer, sequence, "Unreadable ACK: {}", e),
        }
        Ok(())
    }
}
