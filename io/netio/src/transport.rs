//! Byte-stream transports beneath a connection.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};

/// A nonblocking byte stream.
///
/// `read` returning `Ok(0)` means the peer closed its write side; it does
/// not make the transport unusable for writes. Registration hooks default
/// to no-ops so in-memory transports need not implement them.
pub trait Transport: Send {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Shut the stream down in both directions.
    fn shutdown(&mut self);

    fn peer_addr(&self) -> Option<SocketAddr>;

    fn register(
        &mut self,
        _registry: &Registry,
        _token: Token,
        _interests: Interest,
    ) -> io::Result<()> {
        Ok(())
    }

    fn reregister(
        &mut self,
        _registry: &Registry,
        _token: Token,
        _interests: Interest,
    ) -> io::Result<()> {
        Ok(())
    }

    fn deregister(&mut self, _registry: &Registry) -> io::Result<()> {
        Ok(())
    }
}

/// Plain TCP transport over a mio stream.
pub struct TcpTransport {
    stream: TcpStream,
    peer: Option<SocketAddr>,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        TcpTransport { stream, peer }
    }
}

impl Transport for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.stream.write(data)
    }

    fn shutdown(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        registry.register(&mut self.stream, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        registry.reregister(&mut self.stream, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.stream)
    }
}

/// In-memory transport for protocol tests and loopback harnesses.
///
/// Incoming bytes are scripted with [`MemTransport::feed`]; written bytes
/// accumulate and can be inspected with [`MemTransport::take_sent`]. The
/// write side can be stalled to exercise back-pressure paths, and an EOF
/// can be scripted to simulate a peer half-close. Cloning yields a handle
/// to the same stream, so a harness can keep scripting after handing the
/// transport to a connection.
#[derive(Clone)]
pub struct MemTransport {
    inner: std::sync::Arc<std::sync::Mutex<MemInner>>,
}

#[derive(Default)]
struct MemInner {
    incoming: Vec<u8>,
    sent: Vec<u8>,
    eof: bool,
    writable: bool,
    shutdown: bool,
}

impl Default for MemTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemTransport {
    pub fn new() -> Self {
        MemTransport {
            inner: std::sync::Arc::new(std::sync::Mutex::new(MemInner {
                writable: true,
                ..MemInner::default()
            })),
        }
    }

    /// Queue bytes for the next reads.
    pub fn feed(&self, data: &[u8]) {
        self.inner.lock().unwrap().incoming.extend_from_slice(data);
    }

    /// Script a peer half-close after the queued bytes are drained.
    pub fn set_eof(&self) {
        self.inner.lock().unwrap().eof = true;
    }

    /// Stall or resume the write side.
    pub fn set_writable(&self, writable: bool) {
        self.inner.lock().unwrap().writable = writable;
    }

    pub fn sent(&self) -> Vec<u8> {
        self.inner.lock().unwrap().sent.clone()
    }

    pub fn take_sent(&self) -> Vec<u8> {
        std::mem::take(&mut self.inner.lock().unwrap().sent)
    }

    /// Whether the owning side shut the stream down.
    pub fn is_shutdown(&self) -> bool {
        self.inner.lock().unwrap().shutdown
    }
}

impl Transport for MemTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        if inner.incoming.is_empty() {
            if inner.eof {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(inner.incoming.len());
        buf[..n].copy_from_slice(&inner.incoming[..n]);
        inner.incoming.drain(..n);
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.writable {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        inner.sent.extend_from_slice(data);
        Ok(data.len())
    }

    fn shutdown(&mut self) {
        let mut inner = self.inner.lock().unwrap();
        inner.shutdown = true;
        inner.eof = true;
        inner.writable = false;
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some("203.0.113.9:51515".parse().unwrap())
    }
}
