//! Process-wide client connection tunables.
//!
//! Every connection reads these on its hot path, so they are plain atomics
//! with relaxed ordering. Updates are rare (startup, config reload) and a
//! torn read of a soft threshold is harmless.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

use crate::config::ClientConfig;

/// Connection limits and thresholds.
pub struct Tunables {
    max_pending_ops: AtomicUsize,
    max_pending_bytes: AtomicUsize,
    max_read_ahead: AtomicUsize,
    inactivity_timeout: AtomicI64,
    max_write_behind: AtomicUsize,
    in_buf_compaction_threshold: AtomicUsize,
    out_buf_compaction_threshold: AtomicUsize,
    audit_logging: AtomicBool,
}

/// The server-wide instance. Connections hold a reference rather than
/// reaching for this directly so tests can run with their own set.
pub static TUNABLES: Tunables = Tunables::new();

impl Tunables {
    pub const fn new() -> Self {
        Tunables {
            max_pending_ops: AtomicUsize::new(1),
            max_pending_bytes: AtomicUsize::new(3 << 10),
            max_read_ahead: AtomicUsize::new(3 << 10),
            inactivity_timeout: AtomicI64::new(8 * 60),
            max_write_behind: AtomicUsize::new(3 << 10),
            in_buf_compaction_threshold: AtomicUsize::new(1 << 10),
            out_buf_compaction_threshold: AtomicUsize::new(8 << 10),
            audit_logging: AtomicBool::new(false),
        }
    }

    /// Apply a configuration section.
    ///
    /// An absent `max_pending_ops` defaults to 16 when more than one reactor
    /// worker is configured and the reactor has not started yet; otherwise
    /// the previous value stands. The byte thresholds clamp to sane floors.
    /// Settings also propagate to the audit collaborator.
    pub fn update(&self, cfg: &ClientConfig, reactor_running: bool, worker_threads: usize) {
        match cfg.max_pending_ops {
            Some(n) if n > 0 => self.max_pending_ops.store(n as usize, Ordering::Relaxed),
            _ if !reactor_running && worker_threads > 1 => {
                self.max_pending_ops.store(16, Ordering::Relaxed)
            }
            _ => {}
        }
        if let Some(n) = cfg.max_pending_bytes {
            self.max_pending_bytes.store(n.max(1), Ordering::Relaxed);
        }
        if let Some(n) = cfg.max_read_ahead {
            self.max_read_ahead.store(n.max(256), Ordering::Relaxed);
        }
        if let Some(n) = cfg.inactivity_timeout {
            self.inactivity_timeout.store(n, Ordering::Relaxed);
        }
        if let Some(n) = cfg.max_write_behind {
            self.max_write_behind.store(n.max(1), Ordering::Relaxed);
        }
        if let Some(n) = cfg.in_buf_compaction_threshold {
            self.in_buf_compaction_threshold.store(n, Ordering::Relaxed);
        }
        if let Some(n) = cfg.out_buf_compaction_threshold {
            self.out_buf_compaction_threshold.store(n, Ordering::Relaxed);
        }
        if let Some(b) = cfg.audit_logging {
            self.audit_logging.store(b, Ordering::Relaxed);
        }
        crate::audit::set_parameters(cfg);
    }

    /// Most requests a connection may have in flight through the executor.
    #[inline]
    pub fn max_pending_ops(&self) -> usize {
        self.max_pending_ops.load(Ordering::Relaxed)
    }

    /// Input-buffer byte count at which read-ahead is suspended.
    #[inline]
    pub fn max_pending_bytes(&self) -> usize {
        self.max_pending_bytes.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn max_read_ahead(&self) -> usize {
        self.max_read_ahead.load(Ordering::Relaxed)
    }

    /// Seconds of idleness before the connection is closed; non-positive
    /// disables the timer.
    #[inline]
    pub fn inactivity_timeout(&self) -> i64 {
        self.inactivity_timeout.load(Ordering::Relaxed)
    }

    /// Output-buffer byte count at which request extraction pauses.
    #[inline]
    pub fn max_write_behind(&self) -> usize {
        self.max_write_behind.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn in_buf_compaction_threshold(&self) -> usize {
        self.in_buf_compaction_threshold.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn out_buf_compaction_threshold(&self) -> usize {
        self.out_buf_compaction_threshold.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn audit_logging(&self) -> bool {
        self.audit_logging.load(Ordering::Relaxed)
    }
}

impl Default for Tunables {
    fn default() -> Self {
        Tunables::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;

    #[test]
    fn defaults() {
        let t = Tunables::new();
        assert_eq!(t.max_pending_ops(), 1);
        assert_eq!(t.max_pending_bytes(), 3 << 10);
        assert_eq!(t.max_read_ahead(), 3 << 10);
        assert_eq!(t.inactivity_timeout(), 480);
        assert_eq!(t.max_write_behind(), 3 << 10);
        assert!(!t.audit_logging());
    }

    #[test]
    fn pending_ops_defaults_to_16_with_multiple_workers() {
        let t = Tunables::new();
        t.update(&ClientConfig::default(), false, 4);
        assert_eq!(t.max_pending_ops(), 16);
    }

    #[test]
    fn pending_ops_keeps_previous_when_single_worker() {
        let t = Tunables::new();
        t.update(&ClientConfig::default(), false, 1);
        assert_eq!(t.max_pending_ops(), 1);
    }

    #[test]
    fn pending_ops_keeps_previous_once_reactor_runs() {
        let t = Tunables::new();
        t.update(&ClientConfig::default(), true, 4);
        assert_eq!(t.max_pending_ops(), 1);
    }

    #[test]
    fn explicit_pending_ops_wins() {
        let t = Tunables::new();
        let cfg = ClientConfig {
            max_pending_ops: Some(7),
            ..ClientConfig::default()
        };
        t.update(&cfg, true, 1);
        assert_eq!(t.max_pending_ops(), 7);
    }

    #[test]
    fn nonpositive_pending_ops_is_ignored() {
        let t = Tunables::new();
        let cfg = ClientConfig {
            max_pending_ops: Some(0),
            ..ClientConfig::default()
        };
        t.update(&cfg, true, 1);
        assert_eq!(t.max_pending_ops(), 1);
    }

    #[test]
    fn byte_thresholds_clamp() {
        let t = Tunables::new();
        let cfg = ClientConfig {
            max_pending_bytes: Some(0),
            max_read_ahead: Some(10),
            max_write_behind: Some(0),
            ..ClientConfig::default()
        };
        t.update(&cfg, true, 1);
        assert_eq!(t.max_pending_bytes(), 1);
        assert_eq!(t.max_read_ahead(), 256);
        assert_eq!(t.max_write_behind(), 1);
    }

    #[test]
    fn negative_inactivity_timeout_recorded() {
        let t = Tunables::new();
        let cfg = ClientConfig {
            inactivity_timeout: Some(-1),
            ..ClientConfig::default()
        };
        t.update(&cfg, true, 1);
        assert_eq!(t.inactivity_timeout(), -1);
    }
}
