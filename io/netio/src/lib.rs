//! Buffered nonblocking I/O for the strata metadata server.
//!
//! The pieces here are deliberately small: a chunked [`IoBuffer`] that can
//! compact itself, a [`Transport`] trait over a nonblocking byte stream, and
//! [`NetConn`] tying one transport to an input buffer, an output buffer, a
//! read-ahead limit, and an inactivity deadline. Event delivery and all
//! protocol decisions live above this crate.

pub mod buffer;
pub mod conn;
pub mod transport;

pub use buffer::{CHUNK_SIZE, IoBuffer};
pub use conn::NetConn;
pub use transport::{MemTransport, TcpTransport, Transport};
