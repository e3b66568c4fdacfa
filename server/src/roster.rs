//! Registry of live client connections.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Identity of one client connection, unique for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(pub u64);

impl ConnId {
    /// Allocate the next identity.
    pub fn next() -> ConnId {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ConnId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// All live connections, behind a single mutex.
///
/// The roster exists for operational introspection (the live-client count);
/// nothing iterates it. The lock is held only for the insert or remove.
pub struct Roster {
    conns: Mutex<BTreeSet<ConnId>>,
}

/// The server-wide roster. Connections hold a reference so tests can use
/// private instances.
pub static ROSTER: Roster = Roster::new();

impl Roster {
    pub const fn new() -> Self {
        Roster {
            conns: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn register(&self, id: ConnId) {
        let inserted = self.conns.lock().insert(id);
        debug_assert!(inserted, "connection registered twice");
    }

    pub fn unregister(&self, id: ConnId) {
        let removed = self.conns.lock().remove(&id);
        debug_assert!(removed, "connection unregistered twice");
    }

    /// Number of live connections.
    pub fn count(&self) -> usize {
        self.conns.lock().len()
    }
}

impl Default for Roster {
    fn default() -> Self {
        Roster::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_unregister_track_count() {
        let roster = Roster::new();
        assert_eq!(roster.count(), 0);
        let a = ConnId::next();
        let b = ConnId::next();
        roster.register(a);
        roster.register(b);
        assert_eq!(roster.count(), 2);
        roster.unregister(a);
        assert_eq!(roster.count(), 1);
        roster.unregister(b);
        assert_eq!(roster.count(), 0);
    }

    #[test]
    fn ids_are_unique() {
        let a = ConnId::next();
        let b = ConnId::next();
        assert_ne!(a, b);
    }
}
