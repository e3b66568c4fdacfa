//! Per-connection client protocol state machine.
//!
//! One `ClientSm` exists per accepted socket. The reactor worker that owns
//! the connection delivers events through [`ClientSm::handle_event`]; the
//! machine extracts framed requests from the input buffer, submits them to
//! the executor, serializes completed responses into the output buffer, and
//! applies flow control throughout: request extraction pauses while the
//! client has too much unread response data or too many requests in flight,
//! and read-ahead collapses to zero so the reactor stops reading ahead of a
//! stalled client.
//!
//! The handler re-enters itself to drain the input buffer after a write and
//! to report errors discovered mid-event; a depth counter keeps flushes,
//! compaction, and teardown on the outermost frame only. The machine cannot
//! free itself, so teardown is a [`Disposition::Destroy`] return; the owner
//! drops the machine, and its `Drop` leaves the roster.

use std::sync::Arc;

use netio::NetConn;
use protocol_meta::{MAX_HEADER_LEN, PROTO_VERSION, Request, message_len_in};
use tracing::{debug, error, info, warn};

use crate::executor::{Affinity, Executor};
use crate::metrics;
use crate::roster::{ConnId, Roster};
use crate::tunables::Tunables;

/// Most lines of a malformed frame echoed into the log.
const MAX_LOGGED_LINES: usize = 16;

/// Most bytes of one malformed line echoed into the log.
const MAX_LOGGED_LINE_BYTES: usize = 128;

/// Events the reactor and executor deliver to a connection.
#[derive(Debug)]
pub enum Event {
    /// Bytes arrived in the connection's input buffer.
    NetRead,
    /// Queued output made it onto the socket.
    NetWrote,
    /// The socket failed or the peer closed its write side.
    NetError,
    /// The inactivity timer expired.
    InactivityTimeout,
    /// A submitted request finished executing; ownership returns here.
    CmdDone(Box<Request>),
}

/// What the owner must do with the machine after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Keep,
    /// Drop the machine now. Returned exactly once, only from the
    /// outermost handler frame, and only with nothing left in flight.
    Destroy,
}

pub struct ClientSm<E: Executor> {
    id: ConnId,
    /// `None` once the network handle is released while completions are
    /// still outstanding.
    conn: Option<NetConn>,
    peer: String,
    client_ip: String,
    in_flight: usize,
    recursion: u32,
    client_proto_vers: i32,
    disconnect_pending: bool,
    last_read_left: usize,
    affinity: Affinity,
    executor: Arc<E>,
    parse_scratch: Vec<u8>,
    tunables: &'static Tunables,
    roster: &'static Roster,
}

impl<E: Executor> ClientSm<E> {
    pub fn new(
        mut conn: NetConn,
        affinity: Affinity,
        executor: Arc<E>,
        tunables: &'static Tunables,
        roster: &'static Roster,
    ) -> Self {
        debug_assert!(conn.is_good());
        let peer = conn.peer_name().to_string();
        let client_ip = strip_port(&peer).to_string();
        conn.set_inactivity_timeout(tunables.inactivity_timeout());
        conn.set_max_read_ahead(tunables.max_read_ahead());

        let id = ConnId::next();
        roster.register(id);
        metrics::CLIENTS_ACTIVE.increment();

        ClientSm {
            id,
            conn: Some(conn),
            peer,
            client_ip,
            in_flight: 0,
            recursion: 0,
            client_proto_vers: PROTO_VERSION,
            disconnect_pending: false,
            last_read_left: 0,
            affinity,
            executor,
            parse_scratch: Vec::new(),
            tunables,
            roster,
        }
    }

    #[inline]
    pub fn id(&self) -> ConnId {
        self.id
    }

    #[inline]
    pub fn conn(&self) -> Option<&NetConn> {
        self.conn.as_ref()
    }

    #[inline]
    pub fn conn_mut(&mut self) -> Option<&mut NetConn> {
        self.conn.as_mut()
    }

    #[inline]
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    #[inline]
    pub fn disconnect_pending(&self) -> bool {
        self.disconnect_pending
    }

    #[inline]
    pub fn client_proto_vers(&self) -> i32 {
        self.client_proto_vers
    }

    #[inline]
    fn is_over_pending_ops(&self) -> bool {
        self.in_flight >= self.tunables.max_pending_ops()
    }

    /// Single entry point for all five events.
    pub fn handle_event(&mut self, event: Event) -> Disposition {
        // A completion may surface on the wrong thread; offer it back to
        // the executor first. Accepted means it will be re-delivered on
        // this connection's worker.
        let event = match event {
            Event::CmdDone(req) => {
                debug_assert!(self.in_flight > 0);
                match self.executor.reroute(&self.affinity, req) {
                    Some(req) => Event::CmdDone(req),
                    None => return Disposition::Keep,
                }
            }
            other => other,
        };

        debug_assert!(
            self.conn.is_some()
                || (matches!(event, Event::CmdDone(_)) && self.in_flight > 0)
        );
        self.recursion += 1;

        match event {
            Event::NetRead => self.on_net_read(),
            Event::CmdDone(req) => {
                if self.on_cmd_done(req) {
                    self.on_net_wrote(true);
                }
            }
            Event::NetWrote => self.on_net_wrote(false),
            Event::NetError => self.on_net_error(),
            Event::InactivityTimeout => {
                metrics::INACTIVITY_TIMEOUTS.increment();
                self.close_and_discard();
            }
        }

        if self.recursion <= 1 {
            let mut good = self.conn.as_ref().is_some_and(|c| c.is_good());
            if good {
                let flushed_by_executor =
                    self.in_flight > 0 && self.executor.flush_after(&self.affinity, self.id);
                if !flushed_by_executor {
                    let conn = self.conn.as_mut().expect("good connection present");
                    conn.start_flush();
                    good = conn.is_good();
                }
            }
            if good && self.disconnect_pending {
                let conn = self.conn.as_mut().expect("good connection present");
                if self.in_flight == 0 && !conn.is_write_ready() {
                    conn.close();
                    good = false;
                } else {
                    conn.set_max_read_ahead(0);
                }
            }
            if good {
                let in_threshold = self.tunables.in_buf_compaction_threshold();
                let out_threshold = self.tunables.out_buf_compaction_threshold();
                let max_write_behind = self.tunables.max_write_behind();
                let max_pending_bytes = self.tunables.max_pending_bytes();
                let over_pending = self.is_over_pending_ops();
                let conn = self.conn.as_mut().expect("good connection present");

                let n = conn.in_buffer().bytes_consumable();
                if n > 0 && n <= in_threshold {
                    conn.in_buffer_mut().make_buffers_full();
                }
                let n = conn.out_buffer().bytes_consumable();
                if n > 0 && n <= out_threshold {
                    conn.out_buffer_mut().make_buffers_full();
                }

                // Back-pressure: stop the reactor from reading ahead of a
                // client that is not keeping up.
                if conn.is_read_ready()
                    && (over_pending
                        || conn.bytes_to_write() >= max_write_behind
                        || conn.bytes_to_read() >= max_pending_bytes)
                {
                    self.last_read_left = 0;
                    conn.set_max_read_ahead(0);
                }
            } else if self.in_flight > 0 {
                // Outstanding completions still reference this connection;
                // release the network handle and wait for them.
                self.conn = None;
            } else {
                self.recursion -= 1;
                return Disposition::Destroy;
            }
        }

        debug_assert!(
            self.recursion > 0
                && (self.recursion > 1
                    || self.in_flight > 0
                    || self.conn.as_ref().is_some_and(|c| c.is_good()))
        );
        self.recursion -= 1;
        Disposition::Keep
    }

    fn on_net_read(&mut self) {
        self.last_read_left = 0;
        if self.disconnect_pending {
            // Winding down; further client bytes are discarded.
            let conn = self.conn.as_mut().expect("read event without connection");
            conn.in_buffer_mut().clear();
        }
        let max_write_behind = self.tunables.max_write_behind();
        let mut over_write_behind = false;
        loop {
            loop {
                let conn = self.conn.as_mut().expect("read event without connection");
                over_write_behind = conn.bytes_to_write() >= max_write_behind;
                if !(over_write_behind && self.recursion <= 1 && conn.can_start_flush()) {
                    break;
                }
                conn.start_flush();
            }
            if over_write_behind || self.is_over_pending_ops() {
                break;
            }
            let frame_len = {
                let conn = self.conn.as_ref().expect("read event without connection");
                match message_len_in(conn.in_buffer().chunks()) {
                    Some(n) => n,
                    None => break,
                }
            };
            self.ingest_command(frame_len);
        }
        if over_write_behind {
            // A later write completion resumes extraction.
            return;
        }
        if !self.is_over_pending_ops() && !self.disconnect_pending {
            let max_read_ahead = self.tunables.max_read_ahead();
            let conn = self.conn.as_mut().expect("read event without connection");
            self.last_read_left = conn.bytes_to_read();
            if self.last_read_left <= MAX_HEADER_LEN {
                conn.set_max_read_ahead(max_read_ahead);
                return;
            }
            error!(
                peer = %self.peer,
                buffered = self.last_read_left,
                limit = MAX_HEADER_LEN,
                "request header exceeds size limit, closing connection"
            );
            metrics::OVERSIZED_HEADERS.increment();
            self.last_read_left = 0;
            conn.in_buffer_mut().clear();
            conn.close();
            self.handle_event(Event::NetError);
        }
    }

    /// Extract one framed request from the input buffer and submit it.
    fn ingest_command(&mut self, frame_len: usize) {
        debug_assert!(!self.is_over_pending_ops() && self.conn.is_some());
        let parsed = {
            let conn = self.conn.as_ref().expect("ingest without connection");
            let scratch = &mut self.parse_scratch;
            protocol_meta::parse(conn.in_buffer().contiguous_prefix(frame_len, scratch))
        };
        let mut req = match parsed {
            Ok(req) => req,
            Err(err) => {
                metrics::PROTOCOL_ERRORS.increment();
                {
                    let conn = self.conn.as_ref().expect("ingest without connection");
                    let scratch = &mut self.parse_scratch;
                    let frame = conn.in_buffer().contiguous_prefix(frame_len, scratch);
                    for line in frame.split(|&b| b == b'\n').take(MAX_LOGGED_LINES) {
                        let line = line.strip_suffix(b"\r").unwrap_or(line);
                        let shown = &line[..line.len().min(MAX_LOGGED_LINE_BYTES)];
                        error!(
                            peer = %self.peer,
                            error = %err,
                            line = %String::from_utf8_lossy(shown),
                            "invalid request"
                        );
                    }
                }
                let conn = self.conn.as_mut().expect("ingest without connection");
                conn.in_buffer_mut().clear();
                conn.close();
                self.handle_event(Event::NetError);
                return;
            }
        };

        if req.proto_version < self.client_proto_vers {
            self.client_proto_vers = req.proto_version;
            metrics::PROTO_VERSION_DOWNGRADES.increment();
            warn!(
                peer = %self.peer,
                version = req.proto_version,
                request = %req,
                "request with old protocol version"
            );
        }

        // The frame is committed; take it out of the input buffer. With
        // audit logging on, the raw bytes ride along on the request.
        let conn = self.conn.as_mut().expect("ingest without connection");
        if self.tunables.audit_logging() {
            req.raw_headers = Some(conn.in_buffer_mut().take_prefix(frame_len));
        } else {
            conn.in_buffer_mut().consume(frame_len);
        }

        debug!(
            peer = %self.peer,
            seq = req.seq,
            request = %req,
            pending_read = conn.bytes_to_read(),
            pending_write = conn.bytes_to_write(),
            "request submitted"
        );

        req.client_ip = self.client_ip.clone();
        req.from_client = true;
        req.conn_id = self.id.0;
        self.in_flight += 1;
        metrics::REQUESTS_SUBMITTED.increment();
        self.executor.submit(&self.affinity, req);
    }

    /// Process one completion. Returns false when the connection handle is
    /// gone and the write-side follow-up must be skipped.
    fn on_cmd_done(&mut self, mut req: Box<Request>) -> bool {
        debug_assert!(self.in_flight > 0);
        if self.tunables.audit_logging() && req.raw_headers.is_some() {
            crate::audit::log(&req);
        }
        self.send_response(&mut req);
        drop(req);
        self.in_flight -= 1;
        metrics::REQUESTS_COMPLETED.increment();
        if self.conn.is_none() {
            return false;
        }
        if self.recursion <= 1 {
            let flushed_by_executor =
                self.in_flight > 0 && self.executor.flush_after(&self.affinity, self.id);
            if !flushed_by_executor {
                self.conn
                    .as_mut()
                    .expect("connection checked above")
                    .start_flush();
            }
        }
        true
    }

    /// Serialize a completed request's response into the output buffer.
    fn send_response(&mut self, req: &mut Request) {
        if req.always_log()
            || req.status < 0
            || tracing::enabled!(tracing::Level::DEBUG)
        {
            info!(
                peer = %self.peer,
                seq = req.seq,
                status = req.status,
                msg = %req.status_msg,
                request = %req,
                "response"
            );
        }
        let Some(conn) = self.conn.as_mut() else {
            metrics::RESPONSES_DROPPED.increment();
            return;
        };
        if req.is_disconnect() {
            self.disconnect_pending = true;
        }
        req.respond(conn.out_buffer_mut())
            .expect("in-memory buffer writes cannot fail");
        if self.recursion == 0 {
            conn.start_flush();
        }
    }

    /// Write-side follow-up, shared by the write event and the completion
    /// fall-through: resume parsing parked input, or re-open the read
    /// window once output has drained enough.
    fn on_net_wrote(&mut self, from_cmd_done: bool) {
        if self.is_over_pending_ops() || self.recursion > 1 {
            return;
        }
        let max_write_behind = self.tunables.max_write_behind();
        let max_read_ahead = self.tunables.max_read_ahead();
        let resume = {
            let Some(conn) = self.conn.as_mut() else {
                return;
            };
            if !(from_cmd_done || !conn.is_read_ready()) {
                return;
            }
            if conn.bytes_to_write() >= max_write_behind {
                return;
            }
            if conn.bytes_to_read() > self.last_read_left || self.disconnect_pending {
                true
            } else {
                if !conn.is_read_ready() {
                    conn.set_max_read_ahead(max_read_ahead);
                }
                false
            }
        };
        if resume {
            self.handle_event(Event::NetRead);
        }
    }

    fn on_net_error(&mut self) {
        let conn = self.conn.as_mut().expect("socket event without connection");
        if conn.is_good() && (self.in_flight > 0 || conn.is_write_ready()) {
            // Fin from the peer while work is still pending: finish what is
            // queued, then close.
            self.disconnect_pending = true;
            return;
        }
        self.close_and_discard();
    }

    fn close_and_discard(&mut self) {
        let conn = self.conn.as_mut().expect("socket event without connection");
        debug!(peer = %self.peer, "closing connection");
        conn.close();
        conn.in_buffer_mut().clear();
    }
}

impl<E: Executor> Drop for ClientSm<E> {
    fn drop(&mut self) {
        self.roster.unregister(self.id);
        metrics::CLIENTS_ACTIVE.decrement();
    }
}

/// Client address without the port, for request annotation.
fn strip_port(peer: &str) -> &str {
    match peer.rfind(':') {
        Some(i) => &peer[..i],
        None => peer,
    }
}
