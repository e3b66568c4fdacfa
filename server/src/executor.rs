//! Request execution.
//!
//! The state machine hands parsed requests to an [`Executor`] and gets them
//! back as completion events. Requests may execute on any pool thread, but
//! each completion must be delivered on the reactor worker that owns the
//! connection; the per-worker completion channel plus waker guarantees
//! that, and [`Executor::reroute`] re-queues a completion that surfaces on
//! the wrong thread.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, unbounded};
use mio::Waker;
use protocol_meta::Request;
use tracing::warn;

use crate::namespace::Namespace;
use crate::reactor;
use crate::roster::ConnId;

/// Which reactor worker owns a connection. Chosen at accept time and fixed
/// for the connection's lifetime.
#[derive(Debug, Clone)]
pub struct Affinity {
    pub worker: usize,
}

/// The execution interface the connection state machine depends on.
pub trait Executor: Send + Sync + 'static {
    /// Take ownership of a request, run it eventually, and deliver exactly
    /// one completion for it.
    fn submit(&self, affinity: &Affinity, req: Box<Request>);

    /// Route a completion onto the connection's worker. `Some` hands the
    /// request back for local processing; `None` means it was re-queued and
    /// the caller must not touch it again.
    fn reroute(&self, affinity: &Affinity, req: Box<Request>) -> Option<Box<Request>>;

    /// Whether the executor will arrange the output flush itself. `false`
    /// tells the caller to flush locally.
    fn flush_after(&self, affinity: &Affinity, conn: ConnId) -> bool;
}

/// A completed request on its way back to its connection.
pub struct Completion {
    pub conn: ConnId,
    pub req: Box<Request>,
}

/// Sending end of one reactor worker's completion queue.
pub struct CompletionSink {
    tx: Sender<Completion>,
    waker: Waker,
}

impl CompletionSink {
    pub fn new(tx: Sender<Completion>, waker: Waker) -> Self {
        CompletionSink { tx, waker }
    }

    fn deliver(&self, completion: Completion) {
        if self.tx.send(completion).is_ok() {
            let _ = self.waker.wake();
        }
    }
}

/// Fixed thread pool applying requests to the namespace.
///
/// Jobs shard across the pool by connection id, so one connection's
/// requests run on one thread in submission order; completions for a
/// connection are therefore delivered in the same order its requests were
/// submitted.
pub struct PoolExecutor {
    job_txs: Vec<Sender<(Affinity, Box<Request>)>>,
    sinks: Arc<Vec<CompletionSink>>,
}

impl PoolExecutor {
    /// Spawn `threads` executor threads. `sinks[w]` must be the completion
    /// queue of reactor worker `w`. The pool drains and exits once every
    /// clone of the returned executor is dropped.
    pub fn spawn(
        namespace: Arc<Namespace>,
        threads: usize,
        sinks: Vec<CompletionSink>,
    ) -> (Arc<Self>, Vec<JoinHandle<()>>) {
        let sinks = Arc::new(sinks);
        let threads = threads.max(1);

        let mut job_txs = Vec::with_capacity(threads);
        let mut handles = Vec::with_capacity(threads);
        for i in 0..threads {
            let (tx, rx): (
                Sender<(Affinity, Box<Request>)>,
                Receiver<(Affinity, Box<Request>)>,
            ) = unbounded();
            job_txs.push(tx);
            let namespace = namespace.clone();
            let sinks = sinks.clone();
            let handle = std::thread::Builder::new()
                .name(format!("executor-{i}"))
                .spawn(move || {
                    while let Ok((affinity, mut req)) = rx.recv() {
                        namespace.apply(&mut req);
                        let conn = ConnId(req.conn_id);
                        sinks[affinity.worker].deliver(Completion { conn, req });
                    }
                })
                .expect("failed to spawn executor thread");
            handles.push(handle);
        }

        (Arc::new(PoolExecutor { job_txs, sinks }), handles)
    }

    fn shard(&self, req: &Request) -> usize {
        (req.conn_id % self.job_txs.len() as u64) as usize
    }
}

impl Executor for PoolExecutor {
    fn submit(&self, affinity: &Affinity, req: Box<Request>) {
        let shard = self.shard(&req);
        if self.job_txs[shard].send((affinity.clone(), req)).is_err() {
            // Only reachable during teardown, when the pool is gone.
            warn!("executor pool is down, dropping request");
        }
    }

    fn reroute(&self, affinity: &Affinity, req: Box<Request>) -> Option<Box<Request>> {
        if reactor::current_worker() == Some(affinity.worker) {
            return Some(req);
        }
        let conn = ConnId(req.conn_id);
        self.sinks[affinity.worker].deliver(Completion { conn, req });
        None
    }

    fn flush_after(&self, _affinity: &Affinity, _conn: ConnId) -> bool {
        // Flushes happen on the connection's worker as responses land; a
        // batching executor could claim them here instead.
        false
    }
}
