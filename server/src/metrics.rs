//! Server metrics.

use metriken::{Counter, Gauge, metric};

#[metric(
    name = "connections_accepted",
    description = "Total client connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "clients_active",
    description = "Client connections currently alive"
)]
pub static CLIENTS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "requests_submitted",
    description = "Requests handed to the executor"
)]
pub static REQUESTS_SUBMITTED: Counter = Counter::new();

#[metric(
    name = "requests_completed",
    description = "Request completions processed"
)]
pub static REQUESTS_COMPLETED: Counter = Counter::new();

#[metric(
    name = "protocol_errors",
    description = "Frames that failed to parse"
)]
pub static PROTOCOL_ERRORS: Counter = Counter::new();

#[metric(
    name = "oversized_headers",
    description = "Connections closed for exceeding the header size limit"
)]
pub static OVERSIZED_HEADERS: Counter = Counter::new();

#[metric(
    name = "proto_version_downgrades",
    description = "Requests that lowered a connection's protocol version"
)]
pub static PROTO_VERSION_DOWNGRADES: Counter = Counter::new();

#[metric(
    name = "inactivity_timeouts",
    description = "Connections closed by the inactivity timer"
)]
pub static INACTIVITY_TIMEOUTS: Counter = Counter::new();

#[metric(
    name = "responses_dropped",
    description = "Completions whose connection was already gone"
)]
pub static RESPONSES_DROPPED: Counter = Counter::new();
