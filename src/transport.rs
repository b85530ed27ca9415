// s7audit - S7comm diagnostic client for Siemens PLCs.
// Copyright 2025 - Davide Nardella

//! Raw byte-stream connection to the device.
//!
//! The transport knows nothing about TPKT, COTP or S7: it only moves bytes and
//! applies timeouts. Framing lives in [`crate::cotp`].

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::debug;

use crate::config::ClientConfig;
use crate::error::{S7Error, S7Result};

/// Byte stream a session runs over.
///
/// Implementations must report an elapsed read timeout as
/// `io::ErrorKind::WouldBlock` or `io::ErrorKind::TimedOut`, like
/// `std::net::TcpStream` does.
pub trait Transport: Read + Write + Send {
    /// Deadline for every subsequent `read` call. `None` blocks forever.
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;

    /// Deadline of `write` calls, `None` when writes never time out.
    fn write_timeout(&self) -> Option<Duration> {
        None
    }

    /// Closes both directions. Must be safe to call more than once.
    fn shutdown(&mut self) -> io::Result<()>;
}

/// Factory of fresh transports towards one target.
///
/// The session pool calls `open` once per attempt, possibly from several
/// threads at the same time.
pub trait Connector: Send + Sync {
    type Transport: Transport + 'static;

    fn open(&self) -> S7Result<Self::Transport>;

    /// Human readable target, for logs and reports.
    fn target(&self) -> String;
}

/// Whether an I/O error is an elapsed socket timeout.
pub(crate) fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// TCP transport (ISO-on-TCP, port 102 by default).
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    /// Opens the TCP connection and applies the write timeout.
    ///
    /// Nagle is disabled: every telegram is a single small write followed by
    /// a read, buffering it would only add latency.
    pub fn connect(addr: &SocketAddr, connect_timeout: Duration, write_timeout: Duration) -> S7Result<Self> {
        let stream = TcpStream::connect_timeout(addr, connect_timeout).map_err(|e| {
            if is_timeout(&e) {
                S7Error::timeout(format!("TCP connect to {}", addr), connect_timeout.as_millis() as u64)
            } else {
                S7Error::Transport(e)
            }
        })?;
        stream.set_write_timeout(Some(write_timeout))?;
        stream.set_nodelay(true)?;
        debug!(%addr, "TCP connection established");
        Ok(TcpTransport { stream })
    }
}

impl Read for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for TcpTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Transport for TcpTransport {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    fn write_timeout(&self) -> Option<Duration> {
        self.stream.write_timeout().ok().flatten()
    }

    fn shutdown(&mut self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

/// Opens [`TcpTransport`]s towards an address resolved once, up front.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: SocketAddr,
    target: String,
    connect_timeout: Duration,
    write_timeout: Duration,
}

impl TcpConnector {
    /// Resolves `config.host:config.port`.
    ///
    /// ### Errors
    /// - `S7Error::Resolve`: the host name cannot be resolved. Unlike a refused
    ///   connection this never heals by retrying.
    pub fn resolve(config: &ClientConfig) -> S7Result<Self> {
        let target = config.target();
        let addr = target
            .to_socket_addrs()
            .map_err(|e| S7Error::Resolve {
                target: target.clone(),
                message: e.to_string(),
            })?
            .next()
            .ok_or_else(|| S7Error::Resolve {
                target: target.clone(),
                message: "no address found".to_string(),
            })?;
        Ok(TcpConnector {
            addr,
            target,
            connect_timeout: config.connect_timeout(),
            write_timeout: config.write_timeout(),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Connector for TcpConnector {
    type Transport = TcpTransport;

    fn open(&self) -> S7Result<TcpTransport> {
        TcpTransport::connect(&self.addr, self.connect_timeout, self.write_timeout)
    }

    fn target(&self) -> String {
        self.target.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn timeout_kinds_are_recognised() {
        assert!(is_timeout(&io::ErrorKind::WouldBlock.into()));
        assert!(is_timeout(&io::ErrorKind::TimedOut.into()));
        assert!(!is_timeout(&io::ErrorKind::ConnectionReset.into()));
    }

    #[test]
    fn resolve_literal_address() {
        let config = ClientConfig::new("127.0.0.1").with_port(1102);
        let connector = TcpConnector::resolve(&config).unwrap();
        assert_eq!(connector.addr(), "127.0.0.1:1102".parse().unwrap());
        assert_eq!(connector.target(), "127.0.0.1:1102");
    }

    #[test]
    fn resolve_failure_is_fatal_for_pool() {
        let config = ClientConfig::new("not a host name");
        let err = TcpConnector::resolve(&config).unwrap_err();
        assert!(matches!(err, S7Error::Resolve { .. }));
        assert!(err.is_fatal_for_pool());
    }

    #[test]
    fn tcp_transport_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut peer, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4];
            peer.read_exact(&mut buf).unwrap();
            peer.write_all(&buf).unwrap();
        });

        let mut transport =
            TcpTransport::connect(&addr, Duration::from_secs(1), Duration::from_secs(1)).unwrap();
        transport.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(transport.write_timeout(), Some(Duration::from_secs(1)));
        transport.write_all(&[0x03, 0x00, 0x00, 0x04]).unwrap();
        let mut echo = [0u8; 4];
        transport.read_exact(&mut echo).unwrap();
        assert_eq!(echo, [0x03, 0x00, 0x00, 0x04]);
        transport.shutdown().unwrap();
        server.join().unwrap();
    }
}
