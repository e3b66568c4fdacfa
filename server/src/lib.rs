//! strata metadata server: client protocol front end.
//!
//! Accepted connections are spread across reactor workers; each worker
//! drives its connections' protocol state machines, which hand parsed
//! requests to a shared executor pool and serialize the responses.

pub mod audit;
pub mod banner;
pub mod client_sm;
pub mod config;
pub mod executor;
pub mod logging;
pub mod metrics;
pub mod namespace;
pub mod reactor;
pub mod roster;
pub mod signal;
pub mod tunables;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use crossbeam_channel::unbounded;
use mio::{Poll, Waker};
use tracing::error;

use crate::config::Config;
use crate::executor::{CompletionSink, PoolExecutor};
use crate::namespace::Namespace;
use crate::reactor::{WAKER_TOKEN, WorkerContext};
use crate::roster::ROSTER;
use crate::tunables::TUNABLES;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),
}

/// Run the server until `shutdown` flips and the workers drain.
pub fn run(config: &Config, shutdown: Arc<AtomicBool>) -> Result<(), ServerError> {
    let threads = config.threads();
    TUNABLES.update(&config.client, false, threads);

    // Polls and completion channels are built up front so the executor can
    // wake any worker.
    let mut contexts = Vec::with_capacity(threads);
    let mut sinks = Vec::with_capacity(threads);
    for worker_id in 0..threads {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let (tx, rx) = unbounded();
        sinks.push(CompletionSink::new(tx, waker));
        contexts.push(WorkerContext {
            worker_id,
            poll,
            completion_rx: rx,
        });
    }

    let namespace = Arc::new(Namespace::new());
    let (executor, pool_handles) =
        PoolExecutor::spawn(namespace, config.server.executor_threads, sinks);

    let addr = config.server.address;
    let backlog = config.server.backlog;
    let drain_timeout = Duration::from_secs(config.server.drain_timeout_secs);

    let mut handles = Vec::with_capacity(threads);
    for ctx in contexts {
        let executor = executor.clone();
        let shutdown = shutdown.clone();
        let handle = std::thread::Builder::new()
            .name(format!("reactor-{}", ctx.worker_id))
            .spawn(move || {
                if let Err(e) = reactor::run_worker(
                    ctx,
                    addr,
                    backlog,
                    executor,
                    &TUNABLES,
                    &ROSTER,
                    shutdown,
                    drain_timeout,
                ) {
                    error!(error = %e, "reactor worker failed");
                }
            })
            .expect("failed to spawn reactor thread");
        handles.push(handle);
    }

    for handle in handles {
        let _ = handle.join();
    }

    // Workers are gone; dropping the executor closes the job channel and
    // the pool threads exit.
    drop(executor);
    for handle in pool_handles {
        let _ = handle.join();
    }

    Ok(())
}
