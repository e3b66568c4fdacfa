//! Parsed client requests and their response serialization.

use std::fmt;
use std::io::{self, Write};

/// Highest client protocol version this server speaks.
pub const PROTO_VERSION: i32 = 12;

/// The operation a request asks for, with its operation-specific fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    Ping,
    Lookup { path: String },
    Stat { path: String },
    Mkdir { path: String },
    Rmdir { path: String },
    Create { path: String },
    Remove { path: String },
    Rename { old_path: String, new_path: String },
    Readdir { path: String },
    /// Synthetic request a client sends to wind the connection down.
    Disconnect,
}

impl RequestKind {
    pub fn verb(&self) -> &'static str {
        match self {
            RequestKind::Ping => "PING",
            RequestKind::Lookup { .. } => "LOOKUP",
            RequestKind::Stat { .. } => "STAT",
            RequestKind::Mkdir { .. } => "MKDIR",
            RequestKind::Rmdir { .. } => "RMDIR",
            RequestKind::Create { .. } => "CREATE",
            RequestKind::Remove { .. } => "REMOVE",
            RequestKind::Rename { .. } => "RENAME",
            RequestKind::Readdir { .. } => "READDIR",
            RequestKind::Disconnect => "DISCONNECT",
        }
    }
}

/// One client request, from parse through execution to response.
///
/// Ownership follows the request around: the connection state machine owns
/// it between parse and submit, the executor owns it while it runs, and
/// ownership returns with the completion event. After the response is
/// serialized the request is dropped.
#[derive(Debug)]
pub struct Request {
    pub kind: RequestKind,
    /// Client-assigned sequence number, echoed in the response.
    pub seq: i64,
    /// Protocol version the client advertised on this request.
    pub proto_version: i32,
    /// Zero on success, negative errno-style value on failure.
    pub status: i32,
    pub status_msg: String,
    /// Extra response lines (attribute or listing output), `\r\n` separated,
    /// never containing a blank line.
    pub body: String,
    /// Annotations applied at ingest time.
    pub client_ip: String,
    pub from_client: bool,
    pub conn_id: u64,
    /// Raw frame bytes, retained only when audit logging is enabled.
    pub raw_headers: Option<Vec<u8>>,
}

impl Request {
    pub fn new(kind: RequestKind, seq: i64, proto_version: i32) -> Self {
        Request {
            kind,
            seq,
            proto_version,
            status: 0,
            status_msg: String::new(),
            body: String::new(),
            client_ip: String::new(),
            from_client: false,
            conn_id: 0,
            raw_headers: None,
        }
    }

    pub fn is_disconnect(&self) -> bool {
        matches!(self.kind, RequestKind::Disconnect)
    }

    /// Whether responses to this request are logged regardless of level.
    /// File creations are; their placement matters for later debugging.
    pub fn always_log(&self) -> bool {
        matches!(self.kind, RequestKind::Create { .. })
    }

    pub fn fail(&mut self, status: i32, msg: impl Into<String>) {
        self.status = status;
        self.status_msg = msg.into();
    }

    /// Serialize the response header block into `out`.
    pub fn respond<W: Write>(&self, out: &mut W) -> io::Result<()> {
        write!(out, "OK\r\nCseq: {}\r\nStatus: {}\r\n", self.seq, self.status)?;
        if !self.status_msg.is_empty() {
            write!(out, "Status-message: {}\r\n", self.status_msg)?;
        }
        if !self.body.is_empty() {
            out.write_all(self.body.as_bytes())?;
        }
        out.write_all(b"\r\n")
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            RequestKind::Ping | RequestKind::Disconnect => write!(f, "{}", self.kind.verb()),
            RequestKind::Lookup { path }
            | RequestKind::Stat { path }
            | RequestKind::Mkdir { path }
            | RequestKind::Rmdir { path }
            | RequestKind::Create { path }
            | RequestKind::Remove { path }
            | RequestKind::Readdir { path } => write!(f, "{} {}", self.kind.verb(), path),
            RequestKind::Rename { old_path, new_path } => {
                write!(f, "RENAME {} -> {}", old_path, new_path)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn respond_minimal() {
        let req = Request::new(RequestKind::Ping, 7, PROTO_VERSION);
        let mut out = Vec::new();
        req.respond(&mut out).unwrap();
        assert_eq!(out, b"OK\r\nCseq: 7\r\nStatus: 0\r\n\r\n");
    }

    #[test]
    fn respond_failure_carries_message() {
        let mut req = Request::new(
            RequestKind::Lookup {
                path: "/a/b".into(),
            },
            3,
            PROTO_VERSION,
        );
        req.fail(-2, "no such entry");
        let mut out = Vec::new();
        req.respond(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Status: -2\r\n"));
        assert!(text.contains("Status-message: no such entry\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn respond_body_precedes_terminator() {
        let mut req = Request::new(
            RequestKind::Readdir {
                path: "/".into(),
            },
            1,
            PROTO_VERSION,
        );
        req.body = "Entries: 2\r\na\r\nb\r\n".into();
        let mut out = Vec::new();
        req.respond(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.ends_with("a\r\nb\r\n\r\n"));
    }

    #[test]
    fn display_names_the_operation() {
        let req = Request::new(
            RequestKind::Rename {
                old_path: "/x".into(),
                new_path: "/y".into(),
            },
            1,
            PROTO_VERSION,
        );
        assert_eq!(req.to_string(), "RENAME /x -> /y");
    }
}
