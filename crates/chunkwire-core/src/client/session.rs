//! Client control session.

use crate::error::{FrameError, SessionError};
use crate::frame::{ErrorKind, Reply, Request, read_message, write_message};
use crate::token::SessionToken;
use chunkwire_files::FileDescriptor;
use chunkwire_files::catalog::{Catalog, parse_catalog};
use chunkwire_transport::TcpConfig;
use chunkwire_transport::tcp::{connect, shutdown_quietly};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use tracing::{debug, info, warn};

/// Anything that can produce a fresh catalog
pub trait CatalogSource {
    /// Fetch the current catalog
    ///
    /// # Errors
    ///
    /// Returns `SessionError` if the catalog cannot be obtained.
    fn catalog(&mut self) -> Result<Catalog, SessionError>;
}

/// The bound client's control connection.
///
/// Holding the connection open keeps the session bound; dropping it without
/// [`ControlSession::disconnect`] still sends a best-effort `!DISCONNECT`.
pub struct ControlSession {
    stream: TcpStream,
    server: SocketAddr,
    token: SessionToken,
    closed: bool,
}

impl ControlSession {
    /// Connect and request the session.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Busy` if another client holds the session,
    /// `SessionError::Connect` if the server is unreachable, and framing or
    /// protocol errors for anything unexpected.
    pub fn connect<A: ToSocketAddrs>(addr: A, tcp: &TcpConfig) -> Result<Self, SessionError> {
        let mut stream = connect(addr, tcp).map_err(SessionError::Connect)?;
        let server = stream.peer_addr().map_err(SessionError::Connect)?;

        let reply = exchange(&mut stream, &Request::Connect)?;
        match reply {
            Reply::Welcome(token) => {
                info!(server = %server, token = ?token, "Session established");
                Ok(Self {
                    stream,
                    server,
                    token,
                    closed: false,
                })
            }
            Reply::Busy => {
                warn!(server = %server, "Server busy");
                shutdown_quietly(&stream);
                Err(SessionError::Busy)
            }
            other => Err(reply_error(other)),
        }
    }

    /// Session token
    #[must_use]
    pub fn token(&self) -> &SessionToken {
        &self.token
    }

    /// Address of the connected server
    #[must_use]
    pub fn server_addr(&self) -> SocketAddr {
        self.server
    }

    /// Fetch and parse the catalog listing.
    ///
    /// # Errors
    ///
    /// Returns `SessionError` on I/O, framing, or parse failures, or if the
    /// server rejects the request.
    pub fn list_files(&mut self) -> Result<Vec<FileDescriptor>, SessionError> {
        match exchange(&mut self.stream, &Request::ListFiles)? {
            Reply::Ok => {}
            other => return Err(reply_error(other)),
        }
        let listing = read_message(&mut self.stream)?
            .ok_or(SessionError::Frame(FrameError::Closed))?;
        let files = parse_catalog(&listing)?;
        debug!(files = files.len(), "Catalog received");
        Ok(files)
    }

    /// Release the session and close the connection.
    ///
    /// # Errors
    ///
    /// Returns `SessionError` if the server does not acknowledge with `BYE`.
    pub fn disconnect(mut self) -> Result<(), SessionError> {
        self.closed = true;
        let request = Request::Disconnect {
            token: Some(self.token.clone()),
        };
        let reply = exchange(&mut self.stream, &request);
        shutdown_quietly(&self.stream);
        match reply? {
            Reply::Bye => {
                info!(server = %self.server, "Session closed");
                Ok(())
            }
            other => Err(reply_error(other)),
        }
    }
}

impl CatalogSource for ControlSession {
    fn catalog(&mut self) -> Result<Catalog, SessionError> {
        Ok(Catalog::new(self.list_files()?))
    }
}

impl Drop for ControlSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let request = Request::Disconnect {
            token: Some(self.token.clone()),
        };
        if let Err(e) = write_message(&mut self.stream, &request.to_string()) {
            debug!("Best-effort disconnect failed: {}", e);
        }
        shutdown_quietly(&self.stream);
    }
}

impl std::fmt::Debug for ControlSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlSession")
            .field("server", &self.server)
            .field("token", &self.token)
            .finish()
    }
}

fn exchange(stream: &mut TcpStream, request: &Request) -> Result<Reply, SessionError> {
    write_message(stream, &request.to_string()).map_err(|e| SessionError::Frame(e.into()))?;
    let text = read_message(stream)?.ok_or(SessionError::Frame(FrameError::Closed))?;
    match text.parse::<Reply>() {
        Ok(reply) => Ok(reply),
        Err(_) => Err(SessionError::UnexpectedReply(text)),
    }
}

fn reply_error(reply: Reply) -> SessionError {
    match reply {
        Reply::Busy => SessionError::Busy,
        Reply::Error {
            kind: ErrorKind::Unauthorized | ErrorKind::BadRequest,
            detail,
        } => SessionError::Rejected(detail),
        other => SessionError::UnexpectedReply(other.to_string()),
    }
}
