//! Request parsing.

use std::fmt;

use crate::request::{PROTO_VERSION, Request, RequestKind};

/// Why a frame failed to parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Frame contained no verb line.
    EmptyFrame,
    /// Verb line named no known operation.
    UnknownVerb(String),
    /// A header line was not `Key: value`, or was not UTF-8.
    BadHeader,
    /// A required header was absent.
    MissingField(&'static str),
    /// A header value failed numeric conversion.
    BadValue(&'static str),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::EmptyFrame => write!(f, "empty request frame"),
            ParseError::UnknownVerb(v) => write!(f, "unknown verb: {v}"),
            ParseError::BadHeader => write!(f, "malformed header line"),
            ParseError::MissingField(k) => write!(f, "missing field: {k}"),
            ParseError::BadValue(k) => write!(f, "bad value for field: {k}"),
        }
    }
}

impl std::error::Error for ParseError {}

#[derive(Default)]
struct Fields {
    cseq: Option<i64>,
    proto_version: Option<i32>,
    pathname: Option<String>,
    old_path: Option<String>,
    new_path: Option<String>,
}

/// Parse one complete frame into a request.
///
/// The caller hands in exactly the frame bytes (terminator included) and
/// remains responsible for consuming them from its input buffer; parsing
/// never consumes.
pub fn parse(frame: &[u8]) -> Result<Box<Request>, ParseError> {
    let text = std::str::from_utf8(frame).map_err(|_| ParseError::BadHeader)?;
    let mut lines = text.lines().map(str::trim_end);

    let verb = loop {
        match lines.next() {
            Some("") => continue,
            Some(line) => break line,
            None => return Err(ParseError::EmptyFrame),
        }
    };

    let mut fields = Fields::default();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (key, value) = line.split_once(':').ok_or(ParseError::BadHeader)?;
        let value = value.trim();
        match key.trim() {
            "Cseq" => {
                fields.cseq = Some(value.parse().map_err(|_| ParseError::BadValue("Cseq"))?);
            }
            "Client-Protocol-Version" => {
                fields.proto_version = Some(
                    value
                        .parse()
                        .map_err(|_| ParseError::BadValue("Client-Protocol-Version"))?,
                );
            }
            "Pathname" => fields.pathname = Some(value.to_string()),
            "Old-Path" => fields.old_path = Some(value.to_string()),
            "New-Path" => fields.new_path = Some(value.to_string()),
            // Unknown keys are ignored so newer clients keep working.
            _ => {}
        }
    }

    let kind = match verb {
        "PING" => RequestKind::Ping,
        "LOOKUP" => RequestKind::Lookup {
            path: fields.pathname.take().ok_or(ParseError::MissingField("Pathname"))?,
        },
        "STAT" => RequestKind::Stat {
            path: fields.pathname.take().ok_or(ParseError::MissingField("Pathname"))?,
        },
        "MKDIR" => RequestKind::Mkdir {
            path: fields.pathname.take().ok_or(ParseError::MissingField("Pathname"))?,
        },
        "RMDIR" => RequestKind::Rmdir {
            path: fields.pathname.take().ok_or(ParseError::MissingField("Pathname"))?,
        },
        "CREATE" => RequestKind::Create {
            path: fields.pathname.take().ok_or(ParseError::MissingField("Pathname"))?,
        },
        "REMOVE" => RequestKind::Remove {
            path: fields.pathname.take().ok_or(ParseError::MissingField("Pathname"))?,
        },
        "RENAME" => RequestKind::Rename {
            old_path: fields.old_path.take().ok_or(ParseError::MissingField("Old-Path"))?,
            new_path: fields.new_path.take().ok_or(ParseError::MissingField("New-Path"))?,
        },
        "READDIR" => RequestKind::Readdir {
            path: fields.pathname.take().ok_or(ParseError::MissingField("Pathname"))?,
        },
        "DISCONNECT" => RequestKind::Disconnect,
        other => return Err(ParseError::UnknownVerb(other.to_string())),
    };

    let seq = fields.cseq.ok_or(ParseError::MissingField("Cseq"))?;
    let proto_version = fields.proto_version.unwrap_or(PROTO_VERSION);
    Ok(Box::new(Request::new(kind, seq, proto_version)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ping() {
        let req = parse(b"PING\r\nCseq: 42\r\n\r\n").unwrap();
        assert_eq!(req.kind, RequestKind::Ping);
        assert_eq!(req.seq, 42);
        assert_eq!(req.proto_version, PROTO_VERSION);
    }

    #[test]
    fn parse_lookup_with_version() {
        let req = parse(
            b"LOOKUP\r\nCseq: 9\r\nClient-Protocol-Version: 4\r\nPathname: /usr/data\r\n\r\n",
        )
        .unwrap();
        assert_eq!(
            req.kind,
            RequestKind::Lookup {
                path: "/usr/data".into()
            }
        );
        assert_eq!(req.proto_version, 4);
    }

    #[test]
    fn parse_rename() {
        let req =
            parse(b"RENAME\r\nCseq: 1\r\nOld-Path: /a\r\nNew-Path: /b\r\n\r\n").unwrap();
        assert_eq!(
            req.kind,
            RequestKind::Rename {
                old_path: "/a".into(),
                new_path: "/b".into()
            }
        );
    }

    #[test]
    fn unknown_headers_are_ignored() {
        let req = parse(b"PING\r\nCseq: 1\r\nX-Future: yes\r\n\r\n").unwrap();
        assert_eq!(req.kind, RequestKind::Ping);
    }

    #[test]
    fn rejects_unknown_verb() {
        assert_eq!(
            parse(b"EXPLODE\r\nCseq: 1\r\n\r\n").unwrap_err(),
            ParseError::UnknownVerb("EXPLODE".into())
        );
    }

    #[test]
    fn rejects_missing_cseq() {
        assert_eq!(
            parse(b"PING\r\n\r\n").unwrap_err(),
            ParseError::MissingField("Cseq")
        );
    }

    #[test]
    fn rejects_missing_path() {
        assert_eq!(
            parse(b"MKDIR\r\nCseq: 1\r\n\r\n").unwrap_err(),
            ParseError::MissingField("Pathname")
        );
    }

    #[test]
    fn rejects_bad_cseq() {
        assert_eq!(
            parse(b"PING\r\nCseq: banana\r\n\r\n").unwrap_err(),
            ParseError::BadValue("Cseq")
        );
    }

    #[test]
    fn rejects_header_without_colon() {
        assert_eq!(
            parse(b"PING\r\nCseq 1\r\n\r\n").unwrap_err(),
            ParseError::BadHeader
        );
    }

    #[test]
    fn rejects_empty_frame() {
        assert_eq!(parse(b"\r\n").unwrap_err(), ParseError::EmptyFrame);
    }
}
