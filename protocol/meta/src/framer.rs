//! Frame detection over chunked input.

/// Most bytes that may accumulate in a connection's input buffer without a
/// frame boundary before the connection is treated as errored.
pub const MAX_HEADER_LEN: usize = 16 * 1024;

/// Scan chunked input for a complete header block.
///
/// A frame ends at the first blank line; both `\r\n\r\n` and bare `\n\n`
/// terminate (as does the mixed `\n\r\n`). Returns the frame length in
/// bytes, terminator included, or `None` when no full frame has arrived.
///
/// The input is an iterator of byte chunks so the caller's buffer does not
/// need to be contiguous.
pub fn message_len_in<'a, I>(chunks: I) -> Option<usize>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut idx = 0usize;
    // After a '\n' we are at a line start; an optional '\r' may precede the
    // terminating '\n' of a blank line.
    let mut at_line_start = false;
    let mut pending_cr = false;
    for chunk in chunks {
        for &b in chunk {
            idx += 1;
            match b {
                b'\n' if at_line_start => return Some(idx),
                b'\n' => {
                    at_line_start = true;
                    pending_cr = false;
                }
                b'\r' if at_line_start && !pending_cr => pending_cr = true,
                _ => {
                    at_line_start = false;
                    pending_cr = false;
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_len(data: &[u8]) -> Option<usize> {
        message_len_in(std::iter::once(data))
    }

    #[test]
    fn incomplete_frame() {
        assert_eq!(message_len(b""), None);
        assert_eq!(message_len(b"PING\r\n"), None);
        assert_eq!(message_len(b"PING\r\nCseq: 1\r\n"), None);
    }

    #[test]
    fn crlf_terminated() {
        let frame = b"PING\r\nCseq: 1\r\n\r\n";
        assert_eq!(message_len(frame), Some(frame.len()));
    }

    #[test]
    fn bare_lf_terminated() {
        let frame = b"PING\nCseq: 1\n\n";
        assert_eq!(message_len(frame), Some(frame.len()));
    }

    #[test]
    fn mixed_terminator() {
        let frame = b"PING\nCseq: 1\n\r\n";
        assert_eq!(message_len(frame), Some(frame.len()));
    }

    #[test]
    fn frame_length_excludes_following_bytes() {
        let first = b"PING\r\n\r\n";
        let mut data = first.to_vec();
        data.extend_from_slice(b"LOOKUP\r\n");
        assert_eq!(message_len(&data), Some(first.len()));
    }

    #[test]
    fn split_across_chunks() {
        let chunks: [&[u8]; 3] = [b"PING\r\nCseq: 7\r", b"\n\r", b"\n"];
        assert_eq!(message_len_in(chunks), Some(17));
    }

    #[test]
    fn carriage_return_line_is_not_blank() {
        // "\r\r\n" is a one-character line, not a terminator.
        assert_eq!(message_len(b"PING\n\r\r\n"), None);
    }
}
