//! Chunked byte buffer with explicit consumption and compaction.

use std::collections::VecDeque;
use std::io::{self, Write};

use bytes::{Buf, BufMut, BytesMut};

/// Allocation unit for buffer chunks.
pub const CHUNK_SIZE: usize = 4096;

/// A FIFO byte buffer built from page-sized chunks.
///
/// Data is appended at the tail and consumed from the head. Consumption
/// leaves head chunks partially used; once the live byte count drops below
/// a caller-chosen threshold, [`IoBuffer::make_buffers_full`] repacks the
/// data into the minimum number of chunks and releases the rest.
#[derive(Debug, Default)]
pub struct IoBuffer {
    chunks: VecDeque<BytesMut>,
    len: usize,
}

impl IoBuffer {
    pub fn new() -> Self {
        IoBuffer {
            chunks: VecDeque::new(),
            len: 0,
        }
    }

    /// Bytes available for consumption.
    #[inline]
    pub fn bytes_consumable(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of chunk allocations currently held.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Append bytes, filling the tail chunk before allocating another.
    pub fn extend_from_slice(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let spare = match self.chunks.back() {
                Some(chunk) => chunk.capacity() - chunk.len(),
                None => 0,
            };
            if spare == 0 {
                self.chunks.push_back(BytesMut::with_capacity(CHUNK_SIZE));
                continue;
            }
            let take = spare.min(data.len());
            let chunk = self.chunks.back_mut().unwrap();
            chunk.put_slice(&data[..take]);
            self.len += take;
            data = &data[take..];
        }
    }

    /// Drop `n` bytes from the head.
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.len, "consume past end of buffer");
        let mut left = n;
        while left > 0 {
            let chunk = self.chunks.front_mut().expect("length accounting broken");
            let take = left.min(chunk.len());
            chunk.advance(take);
            left -= take;
            if chunk.is_empty() {
                self.chunks.pop_front();
            }
        }
        self.len -= n;
    }

    /// Remove and return the first `n` bytes.
    pub fn take_prefix(&mut self, n: usize) -> Vec<u8> {
        assert!(n <= self.len, "take past end of buffer");
        let mut out = Vec::with_capacity(n);
        let mut left = n;
        while left > 0 {
            let chunk = self.chunks.front_mut().expect("length accounting broken");
            let take = left.min(chunk.len());
            out.extend_from_slice(&chunk[..take]);
            chunk.advance(take);
            left -= take;
            if chunk.is_empty() {
                self.chunks.pop_front();
            }
        }
        self.len -= n;
        out
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.len = 0;
    }

    /// The head chunk's readable bytes, if any.
    #[inline]
    pub fn front_slice(&self) -> Option<&[u8]> {
        self.chunks.front().map(|c| &c[..])
    }

    /// Iterate the readable bytes chunk by chunk.
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> {
        self.chunks.iter().map(|c| &c[..])
    }

    /// Borrow the first `n` bytes contiguously.
    ///
    /// When the head chunk already holds `n` bytes this is free; otherwise
    /// the prefix is assembled into `scratch`.
    pub fn contiguous_prefix<'a>(&'a self, n: usize, scratch: &'a mut Vec<u8>) -> &'a [u8] {
        assert!(n <= self.len, "prefix past end of buffer");
        if let Some(front) = self.chunks.front() {
            if front.len() >= n {
                return &front[..n];
            }
        }
        scratch.clear();
        let mut left = n;
        for chunk in &self.chunks {
            if left == 0 {
                break;
            }
            let take = left.min(chunk.len());
            scratch.extend_from_slice(&chunk[..take]);
            left -= take;
        }
        &scratch[..n]
    }

    /// Repack the live bytes into the minimum number of chunks.
    ///
    /// Partially consumed head chunks and underfilled tails accumulate
    /// during steady-state traffic; repacking returns their pages to the
    /// allocator.
    pub fn make_buffers_full(&mut self) {
        if self.chunks.len() <= 1 {
            return;
        }
        let mut packed: VecDeque<BytesMut> = VecDeque::new();
        for chunk in self.chunks.drain(..) {
            let mut data = &chunk[..];
            while !data.is_empty() {
                let spare = match packed.back() {
                    Some(c) => c.capacity() - c.len(),
                    None => 0,
                };
                if spare == 0 {
                    packed.push_back(BytesMut::with_capacity(CHUNK_SIZE));
                    continue;
                }
                let take = spare.min(data.len());
                packed.back_mut().unwrap().put_slice(&data[..take]);
                data = &data[take..];
            }
        }
        self.chunks = packed;
    }
}

impl Write for IoBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extend_and_consume() {
        let mut buf = IoBuffer::new();
        buf.extend_from_slice(b"hello world");
        assert_eq!(buf.bytes_consumable(), 11);
        buf.consume(6);
        assert_eq!(buf.bytes_consumable(), 5);
        assert_eq!(buf.front_slice().unwrap(), b"world");
    }

    #[test]
    fn fills_chunks_before_allocating() {
        let mut buf = IoBuffer::new();
        buf.extend_from_slice(&[b'a'; CHUNK_SIZE]);
        assert_eq!(buf.chunk_count(), 1);
        buf.extend_from_slice(b"b");
        assert_eq!(buf.chunk_count(), 2);
    }

    #[test]
    fn consume_across_chunk_boundary() {
        let mut buf = IoBuffer::new();
        buf.extend_from_slice(&[b'a'; CHUNK_SIZE]);
        buf.extend_from_slice(&[b'b'; 10]);
        buf.consume(CHUNK_SIZE + 4);
        assert_eq!(buf.bytes_consumable(), 6);
        assert_eq!(buf.front_slice().unwrap(), &[b'b'; 6]);
    }

    #[test]
    fn take_prefix_removes_bytes() {
        let mut buf = IoBuffer::new();
        buf.extend_from_slice(b"REQUESTrest");
        let head = buf.take_prefix(7);
        assert_eq!(head, b"REQUEST");
        assert_eq!(buf.front_slice().unwrap(), b"rest");
    }

    #[test]
    fn contiguous_prefix_fast_path_and_copy_path() {
        let mut buf = IoBuffer::new();
        buf.extend_from_slice(&[b'x'; CHUNK_SIZE]);
        buf.extend_from_slice(b"tail");

        let mut scratch = Vec::new();
        // Within the first chunk: no copy, scratch untouched.
        let p = buf.contiguous_prefix(8, &mut scratch);
        assert_eq!(p, &[b'x'; 8]);
        assert!(scratch.is_empty());

        // Across the boundary: assembled into scratch.
        let p = buf.contiguous_prefix(CHUNK_SIZE + 2, &mut scratch);
        assert_eq!(p.len(), CHUNK_SIZE + 2);
        assert_eq!(&p[CHUNK_SIZE..], b"ta");
    }

    #[test]
    fn compaction_releases_chunks() {
        let mut buf = IoBuffer::new();
        buf.extend_from_slice(&[b'a'; 3 * CHUNK_SIZE]);
        buf.consume(3 * CHUNK_SIZE - 100);
        assert!(buf.chunk_count() >= 1);
        buf.extend_from_slice(&[b'b'; 50]);
        let before = buf.chunk_count();
        buf.make_buffers_full();
        assert!(buf.chunk_count() <= before);
        assert_eq!(buf.chunk_count(), 1);
        assert_eq!(buf.bytes_consumable(), 150);
        // Contents survive repacking in order.
        let all = buf.take_prefix(150);
        assert_eq!(&all[..100], &[b'a'; 100]);
        assert_eq!(&all[100..], &[b'b'; 50]);
    }

    #[test]
    fn write_impl_appends() {
        let mut buf = IoBuffer::new();
        write!(buf, "Cseq: {}\r\n", 42).unwrap();
        assert_eq!(buf.front_slice().unwrap(), b"Cseq: 42\r\n");
    }
}
