// Copyright 2020 Joyent, Inc.

//! The byte-stream abstraction underneath every `AsyncConnection`.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use mio::event::Source;
use mio::net::TcpStream;

/// A non-blocking, pollable byte stream.
///
/// Implementations are registered with a thread context's `mio::Poll` and are
/// only ever touched from that thread once registered.
pub trait Transport: Source + Read + Write + Send {
    /// Tear down the stream in both directions.
    fn shutdown(&mut self) -> io::Result<()>;

    /// Fetch and clear a pending socket error, such as a failed connect.
    fn take_error(&self) -> io::Result<Option<io::Error>>;

    /// Description of the remote end, used in logs.
    fn peer(&self) -> String;
}

impl Transport for TcpStream {
    fn shutdown(&mut self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        TcpStream::take_error(self)
    }

    fn peer(&self) -> String {
        match self.peer_addr() {
            Ok(addr) => addr.to_string(),
            Err(_) => String::from("unconnected"),
        }
    }
}

/// Builds a fresh transport on the thread context that will own it.
pub type SocketFactory =
    Arc<dyn Fn() -> io::Result<Box<dyn Transport>> + Send + Sync>;

/// A factory opening non-blocking TCP connections to `addr`.
pub fn tcp_socket_factory(addr: SocketAddr) -> SocketFactory {
    Arc::new(move || {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream) as Box<dyn Transport>)
    })
}

/// Resolve a `host:port` string to the first address it names.
pub fn resolve_address(address: &str) -> io::Result<SocketAddr> {
    address.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("{} did not resolve to any address", address),
        )
    })
}

impl fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Transport({})", self.peer())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_loopback() {
        let addr = resolve_address("127.0.0.1:4100").unwrap();
        assert_eq!(addr.port(), 4100);
        assert!(resolve_address("no-port-given").is_err());
    }
}
