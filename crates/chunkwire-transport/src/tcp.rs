//! Blocking TCP connect, listen, and stream configuration.

use crate::TcpConfig;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Listen backlog for server sockets.
const LISTEN_BACKLOG: i32 = 128;

/// Resolve `addr` and connect to the first address that accepts within the
/// configured timeout.
///
/// # Errors
///
/// Returns the last connect error, or `InvalidInput` if the address does not
/// resolve to anything.
pub fn connect<A: ToSocketAddrs>(addr: A, config: &TcpConfig) -> io::Result<TcpStream> {
    let mut last_err = None;

    for target in addr.to_socket_addrs()? {
        match connect_one(target, config) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                tracing::debug!("Connect to {} failed: {}", target, e);
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "Address resolved to nothing")
    }))
}

fn connect_one(target: SocketAddr, config: &TcpConfig) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(target), Type::STREAM, Some(Protocol::TCP))?;
    socket.connect_timeout(&target.into(), config.connect_timeout)?;
    let stream: TcpStream = socket.into();
    configure_stream(&stream, config)?;
    Ok(stream)
}

/// Bind a listening socket with address reuse enabled.
///
/// # Errors
///
/// Returns an error if the socket cannot be created, bound, or put into the
/// listening state.
pub fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}

/// Apply timeouts, nodelay, and keepalive to a connected stream.
///
/// Accepted streams inherit the listener's non-blocking flag on some
/// platforms, so the stream is forced back into blocking mode first.
///
/// # Errors
///
/// Returns an error if any socket option cannot be set.
pub fn configure_stream(stream: &TcpStream, config: &TcpConfig) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(non_zero(config.read_timeout))?;
    stream.set_write_timeout(non_zero(config.write_timeout))?;
    stream.set_nodelay(config.nodelay)?;
    SockRef::from(stream).set_keepalive(config.keepalive)?;
    Ok(())
}

/// Whether an I/O error is a socket timeout.
///
/// Blocking sockets report an expired read timeout as `WouldBlock` on Unix
/// and `TimedOut` on Windows.
#[must_use]
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Shut down both halves of a stream, ignoring errors from an already
/// closed peer.
pub fn shutdown_quietly(stream: &TcpStream) {
    if let Err(e) = stream.shutdown(Shutdown::Both)
        && e.kind() != io::ErrorKind::NotConnected
    {
        tracing::trace!("Shutdown failed: {}", e);
    }
}

// A zero duration is rejected by set_read_timeout; treat it as "no timeout".
fn non_zero(d: Duration) -> Option<Duration> {
    (!d.is_zero()).then_some(d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::thread;

    #[test]
    fn test_bind_listener_assigns_port() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.is_ipv4());
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn test_connect_and_exchange() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).unwrap();
            stream.write_all(&buf).unwrap();
        });

        let mut client = connect(addr, &TcpConfig::default()).unwrap();
        client.write_all(b"hello").unwrap();
        let mut echo = [0u8; 5];
        client.read_exact(&mut echo).unwrap();
        assert_eq!(&echo, b"hello");

        server.join().unwrap();
    }

    #[test]
    fn test_read_timeout_is_reported_as_timeout() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        let config = TcpConfig {
            read_timeout: Duration::from_millis(50),
            ..TcpConfig::default()
        };
        let mut client = connect(addr, &config).unwrap();
        let (_held, _) = listener.accept().unwrap();

        let mut buf = [0u8; 1];
        let err = client.read(&mut buf).unwrap_err();
        assert!(is_timeout(&err));
    }

    #[test]
    fn test_connect_refused() {
        // Bind then drop to get a port with nothing listening.
        let addr = bind_listener("127.0.0.1:0".parse().unwrap())
            .unwrap()
            .local_addr()
            .unwrap();

        let config = TcpConfig {
            connect_timeout: Duration::from_millis(200),
            ..TcpConfig::default()
        };
        assert!(connect(addr, &config).is_err());
    }

    #[test]
    fn test_non_zero() {
        assert_eq!(non_zero(Duration::ZERO), None);
        assert_eq!(
            non_zero(Duration::from_secs(1)),
            Some(Duration::from_secs(1))
        );
    }
}
