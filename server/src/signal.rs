//! Signal handling for graceful shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::roster::ROSTER;

/// What a shutdown signal should do, given how many came before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalAction {
    /// First signal: flag the reactors, let connections drain.
    Drain,
    /// Repeat signal: the operator is done waiting.
    Exit,
}

fn note_signal(flag: &AtomicBool) -> SignalAction {
    if flag.swap(true, Ordering::SeqCst) {
        SignalAction::Exit
    } else {
        SignalAction::Drain
    }
}

/// Install SIGINT/SIGTERM handlers.
///
/// The first signal flips the returned flag; each reactor worker notices
/// it within a poll interval, stops accepting, and winds its connections
/// down, bounded by the configured drain timeout. A second signal skips
/// the drain and exits at once.
pub fn install_signal_handler() -> Arc<AtomicBool> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();

    ctrlc::set_handler(move || match note_signal(&flag) {
        SignalAction::Drain => {
            tracing::info!(
                clients = ROSTER.count(),
                "shutdown signal, draining client connections"
            );
        }
        SignalAction::Exit => {
            tracing::warn!(
                clients = ROSTER.count(),
                "second shutdown signal, exiting without drain"
            );
            std::process::exit(1);
        }
    })
    .expect("failed to install signal handler");

    shutdown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_signal_drains_later_signals_exit() {
        let flag = AtomicBool::new(false);
        assert_eq!(note_signal(&flag), SignalAction::Drain);
        assert!(flag.load(Ordering::SeqCst), "drain flag must be visible to workers");
        assert_eq!(note_signal(&flag), SignalAction::Exit);
        assert_eq!(note_signal(&flag), SignalAction::Exit);
        assert!(flag.load(Ordering::SeqCst));
    }
}
