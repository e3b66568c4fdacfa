//! One network connection: transport plus buffers, read-ahead, and timer.

use std::io;
use std::time::{Duration, Instant};

use mio::{Interest, Registry, Token};

use crate::buffer::IoBuffer;
use crate::transport::Transport;

/// A connection's I/O state.
///
/// `NetConn` owns the transport, the input and output buffers, the
/// read-ahead limit, and the inactivity deadline. It performs reads and
/// writes when told to; it never decides *when* — that is the reactor's
/// and the state machine's job.
pub struct NetConn {
    transport: Box<dyn Transport>,
    in_buf: IoBuffer,
    out_buf: IoBuffer,
    good: bool,
    /// Set when a write hit would-block; cleared by the next writable
    /// edge. While set, flush attempts are pointless and are skipped.
    write_blocked: bool,
    max_read_ahead: usize,
    inactivity_timeout: Option<Duration>,
    last_activity: Instant,
    peer: String,
}

impl NetConn {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        let peer = transport
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        NetConn {
            transport,
            in_buf: IoBuffer::new(),
            out_buf: IoBuffer::new(),
            good: true,
            write_blocked: false,
            max_read_ahead: 0,
            inactivity_timeout: None,
            last_activity: Instant::now(),
            peer,
        }
    }

    /// Peer address as `ip:port`, or `unknown`.
    pub fn peer_name(&self) -> &str {
        &self.peer
    }

    #[inline]
    pub fn is_good(&self) -> bool {
        self.good
    }

    /// Shut the transport down. Buffers are left to the caller; the state
    /// machine decides what happens to unread input.
    pub fn close(&mut self) {
        if self.good {
            self.good = false;
            self.transport.shutdown();
        }
    }

    #[inline]
    pub fn in_buffer(&self) -> &IoBuffer {
        &self.in_buf
    }

    #[inline]
    pub fn in_buffer_mut(&mut self) -> &mut IoBuffer {
        &mut self.in_buf
    }

    #[inline]
    pub fn out_buffer(&self) -> &IoBuffer {
        &self.out_buf
    }

    #[inline]
    pub fn out_buffer_mut(&mut self) -> &mut IoBuffer {
        &mut self.out_buf
    }

    /// Bytes read from the socket but not yet consumed.
    #[inline]
    pub fn bytes_to_read(&self) -> usize {
        self.in_buf.bytes_consumable()
    }

    /// Bytes queued for the socket but not yet written.
    #[inline]
    pub fn bytes_to_write(&self) -> usize {
        self.out_buf.bytes_consumable()
    }

    /// Whether the reactor is asked to deliver reads for this connection.
    #[inline]
    pub fn is_read_ready(&self) -> bool {
        self.good && self.max_read_ahead != 0
    }

    /// Whether unflushed output remains.
    #[inline]
    pub fn is_write_ready(&self) -> bool {
        self.bytes_to_write() != 0
    }

    #[inline]
    pub fn can_start_flush(&self) -> bool {
        self.good && self.bytes_to_write() != 0 && !self.write_blocked
    }

    /// The socket reported writable again; flush attempts may resume.
    pub fn socket_writable(&mut self) {
        self.write_blocked = false;
    }

    /// Write queued output to the transport until it blocks or drains.
    ///
    /// Returns the bytes written now. A hard write error marks the
    /// connection not good; the caller observes that through `is_good`.
    pub fn start_flush(&mut self) -> usize {
        let mut total = 0;
        while self.good && !self.write_blocked {
            let Some(front) = self.out_buf.front_slice() else {
                break;
            };
            match self.transport.write(front) {
                Ok(0) => break,
                Ok(n) => {
                    self.out_buf.consume(n);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.write_blocked = true;
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!(peer = %self.peer, error = %e, "write failed, closing connection");
                    self.good = false;
                    self.transport.shutdown();
                    break;
                }
            }
        }
        if total > 0 {
            self.touch();
        }
        total
    }

    /// Read from the transport into the input buffer, bounded by the
    /// read-ahead limit.
    ///
    /// Returns `(bytes_read, eof)`. A peer half-close surfaces as
    /// `eof == true` with the connection still good, so the caller can run
    /// its half-close handling. A hard read error marks the connection not
    /// good and is returned.
    pub fn do_read(&mut self, scratch: &mut [u8]) -> io::Result<(usize, bool)> {
        let mut total = 0;
        if !self.good {
            return Ok((0, false));
        }
        while total < self.max_read_ahead {
            let want = scratch.len().min(self.max_read_ahead - total);
            match self.transport.read(&mut scratch[..want]) {
                Ok(0) => {
                    if total > 0 {
                        self.touch();
                    }
                    return Ok((total, true));
                }
                Ok(n) => {
                    self.in_buf.extend_from_slice(&scratch[..n]);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.good = false;
                    self.transport.shutdown();
                    return Err(e);
                }
            }
        }
        if total > 0 {
            self.touch();
        }
        Ok((total, false))
    }

    /// Upper bound on bytes the reactor may buffer before delivering a
    /// read event. Zero stops read delivery entirely.
    pub fn set_max_read_ahead(&mut self, n: usize) {
        self.max_read_ahead = n;
    }

    #[inline]
    pub fn max_read_ahead(&self) -> usize {
        self.max_read_ahead
    }

    /// A non-positive value disables the inactivity timer.
    pub fn set_inactivity_timeout(&mut self, secs: i64) {
        self.inactivity_timeout = if secs > 0 {
            Some(Duration::from_secs(secs as u64))
        } else {
            None
        };
        self.touch();
    }

    /// Record activity, pushing the inactivity deadline out.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn inactivity_expired(&self, now: Instant) -> bool {
        self.good
            && self
                .inactivity_timeout
                .is_some_and(|t| now.duration_since(self.last_activity) >= t)
    }

    pub fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.transport.register(registry, token, interests)
    }

    pub fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.transport.reregister(registry, token, interests)
    }

    pub fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.transport.deregister(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemTransport;

    fn conn_with(feed: &[u8]) -> NetConn {
        let t = MemTransport::new();
        t.feed(feed);
        let mut conn = NetConn::new(Box::new(t));
        conn.set_max_read_ahead(4096);
        conn
    }

    #[test]
    fn read_respects_read_ahead_limit() {
        let mut conn = conn_with(&[b'x'; 1000]);
        conn.set_max_read_ahead(64);
        let mut scratch = [0u8; 512];
        let (n, eof) = conn.do_read(&mut scratch).unwrap();
        assert_eq!(n, 64);
        assert!(!eof);
        assert_eq!(conn.bytes_to_read(), 64);
    }

    #[test]
    fn read_ahead_zero_reads_nothing() {
        let mut conn = conn_with(b"data");
        conn.set_max_read_ahead(0);
        let mut scratch = [0u8; 512];
        let (n, eof) = conn.do_read(&mut scratch).unwrap();
        assert_eq!(n, 0);
        assert!(!eof);
    }

    #[test]
    fn eof_reported_with_connection_still_good() {
        let t = MemTransport::new();
        t.feed(b"tail");
        t.set_eof();
        let mut conn = NetConn::new(Box::new(t));
        conn.set_max_read_ahead(4096);
        let mut scratch = [0u8; 512];
        let (n, eof) = conn.do_read(&mut scratch).unwrap();
        assert_eq!(n, 4);
        assert!(eof);
        assert!(conn.is_good());
    }

    #[test]
    fn flush_drains_output() {
        let mut conn = conn_with(b"");
        conn.out_buffer_mut().extend_from_slice(b"response");
        assert!(conn.can_start_flush());
        let n = conn.start_flush();
        assert_eq!(n, 8);
        assert_eq!(conn.bytes_to_write(), 0);
    }

    #[test]
    fn flush_stops_when_transport_blocks() {
        let t = MemTransport::new();
        t.set_writable(false);
        let mut conn = NetConn::new(Box::new(t.clone()));
        conn.out_buffer_mut().extend_from_slice(b"stuck");
        assert_eq!(conn.start_flush(), 0);
        assert_eq!(conn.bytes_to_write(), 5);
        assert!(conn.is_good());
        // Blocked until the next writable edge, even if the transport
        // recovers in the meantime.
        t.set_writable(true);
        assert!(!conn.can_start_flush());
        assert_eq!(conn.start_flush(), 0);
        conn.socket_writable();
        assert!(conn.can_start_flush());
        assert_eq!(conn.start_flush(), 5);
        assert_eq!(conn.bytes_to_write(), 0);
    }

    #[test]
    fn close_makes_connection_not_good() {
        let mut conn = conn_with(b"");
        conn.close();
        assert!(!conn.is_good());
        assert!(!conn.is_read_ready());
        assert!(!conn.can_start_flush());
    }

    #[test]
    fn inactivity_deadline() {
        let mut conn = conn_with(b"");
        conn.set_inactivity_timeout(0);
        assert!(!conn.inactivity_expired(Instant::now() + Duration::from_secs(3600)));
        conn.set_inactivity_timeout(1);
        assert!(!conn.inactivity_expired(Instant::now()));
        assert!(conn.inactivity_expired(Instant::now() + Duration::from_secs(2)));
    }
}
