//! Audit records for completed client requests.
//!
//! When audit logging is on, command ingest retains each request's raw
//! header bytes; on completion the record lands on the dedicated `audit`
//! tracing target so it can be routed separately from operational logs.

use std::sync::atomic::{AtomicUsize, Ordering};

use protocol_meta::Request;

use crate::config::ClientConfig;

static MAX_RECORD_BYTES: AtomicUsize = AtomicUsize::new(1024);

/// Apply audit settings from the client configuration section. Called from
/// `Tunables::update` so one reload path covers both.
pub fn set_parameters(cfg: &ClientConfig) {
    if let Some(n) = cfg.audit_max_record_bytes {
        MAX_RECORD_BYTES.store(n.max(16), Ordering::Relaxed);
    }
}

/// Render one audit record for a request that retained its raw headers.
pub fn log(req: &Request) {
    let Some(raw) = req.raw_headers.as_deref() else {
        return;
    };
    let cap = MAX_RECORD_BYTES.load(Ordering::Relaxed);
    let shown = &raw[..raw.len().min(cap)];
    let headers = String::from_utf8_lossy(shown);
    tracing::info!(
        target: "audit",
        client = %req.client_ip,
        seq = req.seq,
        status = req.status,
        headers = %headers.escape_debug(),
    );
}
