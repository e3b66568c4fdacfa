//! Client RPC grammar for the strata metadata server.
//!
//! Requests arrive as header blocks: a verb line followed by `Key: value`
//! lines and terminated by a blank line. This crate owns frame detection,
//! parsing into [`Request`] objects, and response serialization. It never
//! touches sockets or buffers beyond the byte slices handed to it; the
//! server decides when bytes are consumed.

pub mod framer;
pub mod parse;
pub mod request;

pub use framer::{MAX_HEADER_LEN, message_len_in};
pub use parse::{ParseError, parse};
pub use request::{PROTO_VERSION, Request, RequestKind};
