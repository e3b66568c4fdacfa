//! Reactor workers.
//!
//! Each worker owns a mio poll, a SO_REUSEPORT listener on the shared
//! client address, and the state machines of the connections the kernel
//! hands it. The worker translates socket readiness, timer expiry, and
//! executor completions into [`Event`]s, delivers them through each
//! machine's single entry point, and drops machines that ask to be
//! destroyed.
//!
//! mio is edge-triggered, so the worker keeps a `socket_readable` flag per
//! connection and pumps reads until the socket would block or the
//! connection's read-ahead collapses to zero; a connection that suspended
//! its read-ahead picks up where it left off once a completion or write
//! re-opens the window.

use std::cell::Cell;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use tracing::{debug, error, info};

use netio::{NetConn, TcpTransport};

use crate::client_sm::{ClientSm, Disposition, Event};
use crate::executor::{Affinity, Completion, Executor};
use crate::metrics;
use crate::roster::Roster;
use crate::tunables::Tunables;

/// Token the executor's waker fires on.
pub const WAKER_TOKEN: Token = Token(usize::MAX - 1);
const LISTENER_TOKEN: Token = Token(usize::MAX - 2);

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const TIMER_INTERVAL: Duration = Duration::from_secs(1);
const READ_SCRATCH_SIZE: usize = 64 * 1024;

thread_local! {
    static CURRENT_WORKER: Cell<Option<usize>> = const { Cell::new(None) };
}

/// The reactor worker running on the current thread, if any. Completions
/// delivered on the wrong thread are detected through this.
pub fn current_worker() -> Option<usize> {
    CURRENT_WORKER.get()
}

/// Per-worker state built on the main thread before spawning, so the
/// executor can hold each worker's completion sink.
pub struct WorkerContext {
    pub worker_id: usize,
    pub poll: Poll,
    pub completion_rx: Receiver<Completion>,
}

struct ConnEntry<E: Executor> {
    sm: ClientSm<E>,
    /// Raw connection id, kept beside the machine so teardown can clean
    /// the id map after the machine is gone.
    id: u64,
    /// Set on every readable edge; cleared when a read drains the socket.
    socket_readable: bool,
    /// A half-close was already delivered; do not deliver it again.
    eof_delivered: bool,
}

/// Run one reactor worker until shutdown completes.
pub fn run_worker<E: Executor>(
    ctx: WorkerContext,
    addr: SocketAddr,
    backlog: u32,
    executor: Arc<E>,
    tunables: &'static Tunables,
    roster: &'static Roster,
    shutdown: Arc<AtomicBool>,
    drain_timeout: Duration,
) -> io::Result<()> {
    CURRENT_WORKER.set(Some(ctx.worker_id));
    Worker {
        worker_id: ctx.worker_id,
        poll: ctx.poll,
        completion_rx: ctx.completion_rx,
        listener: None,
        conns: Slab::with_capacity(1024),
        by_id: HashMap::new(),
        scratch: vec![0u8; READ_SCRATCH_SIZE],
        executor,
        tunables,
        roster,
        shutdown,
        drain_timeout,
        draining_since: None,
        last_timer_check: Instant::now(),
    }
    .run(addr, backlog)
}

struct Worker<E: Executor> {
    worker_id: usize,
    poll: Poll,
    completion_rx: Receiver<Completion>,
    listener: Option<TcpListener>,
    conns: Slab<ConnEntry<E>>,
    by_id: HashMap<u64, usize>,
    scratch: Vec<u8>,
    executor: Arc<E>,
    tunables: &'static Tunables,
    roster: &'static Roster,
    shutdown: Arc<AtomicBool>,
    drain_timeout: Duration,
    draining_since: Option<Instant>,
    last_timer_check: Instant,
}

impl<E: Executor> Worker<E> {
    fn run(mut self, addr: SocketAddr, backlog: u32) -> io::Result<()> {
        let mut listener = bind_reuseport(addr, backlog)?;
        self.poll
            .registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        self.listener = Some(listener);
        info!(worker = self.worker_id, %addr, "reactor worker listening");

        let mut events = Events::with_capacity(1024);
        loop {
            match self.poll.poll(&mut events, Some(POLL_INTERVAL)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            // Snapshot the batch; dispatching needs the worker mutably.
            let batch: Vec<(Token, bool, bool, bool)> = events
                .iter()
                .map(|e| {
                    (
                        e.token(),
                        e.is_readable() || e.is_read_closed(),
                        e.is_writable(),
                        e.is_error(),
                    )
                })
                .collect();

            for (token, readable, writable, errored) in batch {
                match token {
                    LISTENER_TOKEN => self.accept_ready(),
                    WAKER_TOKEN => {}
                    Token(slot) => self.socket_event(slot, readable, writable, errored),
                }
            }

            self.drain_completions();
            self.pump_reads();

            let now = Instant::now();
            if now.duration_since(self.last_timer_check) >= TIMER_INTERVAL {
                self.last_timer_check = now;
                self.check_inactivity(now);
            }

            if self.shutdown.load(Ordering::Relaxed) && self.drain_for_shutdown() {
                return Ok(());
            }
        }
    }

    fn accept_ready(&mut self) {
        loop {
            let listener = match self.listener.as_ref() {
                Some(l) => l,
                None => return,
            };
            match listener.accept() {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    metrics::CONNECTIONS_ACCEPTED.increment();

                    let mut conn = NetConn::new(Box::new(TcpTransport::new(stream)));
                    let entry = self.conns.vacant_entry();
                    let slot = entry.key();
                    if let Err(e) = conn.register(
                        self.poll.registry(),
                        Token(slot),
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        error!(worker = self.worker_id, %peer, error = %e, "failed to register connection");
                        continue;
                    }
                    let sm = ClientSm::new(
                        conn,
                        Affinity {
                            worker: self.worker_id,
                        },
                        self.executor.clone(),
                        self.tunables,
                        self.roster,
                    );
                    let id = sm.id().0;
                    self.by_id.insert(id, slot);
                    entry.insert(ConnEntry {
                        sm,
                        id,
                        socket_readable: true,
                        eof_delivered: false,
                    });
                    debug!(worker = self.worker_id, %peer, "accepted connection");
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(worker = self.worker_id, error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn socket_event(&mut self, slot: usize, readable: bool, writable: bool, errored: bool) {
        if !self.conns.contains(slot) {
            // Stale event for a slot already torn down.
            return;
        }

        if errored {
            if self.dispatch(slot, Event::NetError) {
                return;
            }
        }

        if writable {
            let flushed = self
                .conns
                .get_mut(slot)
                .and_then(|e| e.sm.conn_mut())
                .map(|c| {
                    c.socket_writable();
                    (c.start_flush(), c.is_good())
                });
            match flushed {
                Some((_, false)) => {
                    // The write side failed; let the machine tear down.
                    if self.dispatch(slot, Event::NetError) {
                        return;
                    }
                }
                Some((n, true)) if n > 0 => {
                    if self.dispatch(slot, Event::NetWrote) {
                        return;
                    }
                }
                _ => {}
            }
        }

        if readable {
            if let Some(entry) = self.conns.get_mut(slot) {
                entry.socket_readable = true;
            }
        }
    }

    /// Read every connection with a readable socket and an open read-ahead
    /// window, delivering the resulting events.
    fn pump_reads(&mut self) {
        loop {
            let ready: Vec<usize> = self
                .conns
                .iter()
                .filter(|(_, e)| {
                    e.socket_readable
                        && e.sm
                            .conn()
                            .is_some_and(|c| c.is_read_ready())
                })
                .map(|(slot, _)| slot)
                .collect();
            if ready.is_empty() {
                return;
            }
            for slot in ready {
                self.pump_one(slot);
            }
        }
    }

    fn pump_one(&mut self, slot: usize) {
        let Some(entry) = self.conns.get_mut(slot) else {
            return;
        };
        let Some(conn) = entry.sm.conn_mut() else {
            entry.socket_readable = false;
            return;
        };
        let budget = conn.max_read_ahead();
        match conn.do_read(&mut self.scratch) {
            Ok((n, eof)) => {
                if n < budget {
                    // Drained to would-block (or hit EOF): nothing more to
                    // pull until the next readable edge.
                    entry.socket_readable = false;
                }
                let deliver_eof = eof && !entry.eof_delivered;
                if deliver_eof {
                    entry.eof_delivered = true;
                    entry.socket_readable = false;
                }
                if n > 0 && self.dispatch(slot, Event::NetRead) {
                    return;
                }
                // The read dispatch may have released the handle (e.g. a
                // parse failure with work in flight); the half-close is
                // moot then.
                if deliver_eof
                    && self
                        .conns
                        .get(slot)
                        .is_some_and(|e| e.sm.conn().is_some())
                {
                    self.dispatch(slot, Event::NetError);
                }
            }
            Err(e) => {
                debug!(worker = self.worker_id, error = %e, "read failed");
                entry.socket_readable = false;
                self.dispatch(slot, Event::NetError);
            }
        }
    }

    fn drain_completions(&mut self) {
        while let Ok(done) = self.completion_rx.try_recv() {
            match self.by_id.get(&done.conn.0).copied() {
                Some(slot) => {
                    self.dispatch(slot, Event::CmdDone(done.req));
                }
                None => {
                    // A machine never outlives its in-flight requests, so a
                    // missing id means the completion crossed a teardown
                    // that should not have happened.
                    debug_assert!(false, "completion for unknown connection");
                }
            }
        }
    }

    fn check_inactivity(&mut self, now: Instant) {
        let expired: Vec<usize> = self
            .conns
            .iter()
            .filter(|(_, e)| e.sm.conn().is_some_and(|c| c.inactivity_expired(now)))
            .map(|(slot, _)| slot)
            .collect();
        for slot in expired {
            self.dispatch(slot, Event::InactivityTimeout);
        }
    }

    /// Deliver one event. Returns true when the machine was destroyed and
    /// the slot is gone.
    fn dispatch(&mut self, slot: usize, event: Event) -> bool {
        let Some(entry) = self.conns.get_mut(slot) else {
            return true;
        };
        match entry.sm.handle_event(event) {
            Disposition::Keep => false,
            Disposition::Destroy => {
                let entry = self.conns.remove(slot);
                self.by_id.remove(&entry.id);
                true
            }
        }
    }

    /// Begin draining on the first call; report completion once every
    /// connection is gone or the drain timeout has passed.
    fn drain_for_shutdown(&mut self) -> bool {
        let now = Instant::now();
        match self.draining_since {
            None => {
                self.draining_since = Some(now);
                info!(
                    worker = self.worker_id,
                    connections = self.conns.len(),
                    "draining for shutdown"
                );
                // Stop accepting, then wind every connection down the same
                // way a peer half-close would.
                if let Some(mut listener) = self.listener.take() {
                    let _ = self.poll.registry().deregister(&mut listener);
                }
                // Connections whose handle is already released are waiting
                // on completions and need no nudge.
                let slots: Vec<usize> = self
                    .conns
                    .iter()
                    .filter(|(_, e)| e.sm.conn().is_some())
                    .map(|(slot, _)| slot)
                    .collect();
                for slot in slots {
                    self.dispatch(slot, Event::NetError);
                }
            }
            Some(start) => {
                if now.duration_since(start) >= self.drain_timeout && !self.conns.is_empty() {
                    info!(
                        worker = self.worker_id,
                        abandoned = self.conns.len(),
                        "drain timeout, dropping remaining connections"
                    );
                    self.conns.clear();
                    self.by_id.clear();
                }
            }
        }
        self.conns.is_empty()
    }
}

/// Bind the shared client address with SO_REUSEPORT so every worker can
/// listen on it and the kernel balances accepts.
fn bind_reuseport(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => socket2::Domain::IPV4,
        SocketAddr::V6(_) => socket2::Domain::IPV6,
    };
    let socket = socket2::Socket::new(
        domain,
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog as i32)?;
    Ok(TcpListener::from_std(socket.into()))
}
