//! Byte staging for connection I/O.
//!
//! A `Buffer` is a contiguous region with a read cursor and a write
//! cursor: bytes in `[read, write)` are readable and `[write, len)` is
//! writable. Appending compacts or grows as needed, so the readable
//! window stays contiguous and cheap to slice.

use std::io::{self, IoSliceMut, Read};

const INITIAL_SIZE: usize = 1024;

pub struct Buffer {
    buf: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            read_pos: 0,
            write_pos: 0,
        }
    }

    pub fn readable(&self) -> usize {
        self.write_pos - self.read_pos
    }

    pub fn writable(&self) -> usize {
        self.buf.len() - self.write_pos
    }

    /// The readable window, without consuming it.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.read_pos..self.write_pos]
    }

    /// Consume up to `n` readable bytes.
    pub fn retrieve(&mut self, n: usize) {
        self.read_pos += n.min(self.readable());
        if self.read_pos == self.write_pos {
            self.read_pos = 0;
            self.write_pos = 0;
        }
    }

    /// Pop one CRLF-terminated line, without the terminator. Returns
    /// `None` until a full line is buffered; a bare LF does not end a
    /// line.
    pub fn read_line(&mut self) -> Option<String> {
        let window = self.peek();
        let at = window.windows(2).position(|w| w == b"\r\n")?;
        let line = String::from_utf8_lossy(&window[..at]).into_owned();
        self.retrieve(at + 2);
        Some(line)
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
        self.write_pos += data.len();
    }

    pub fn clear(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }

    /// One scatter read from `r`: the buffer tail plus a stack region,
    /// so a single syscall can pick up more than the spare capacity.
    /// Overflow into the stack region is appended afterwards. Returns
    /// the byte count from the underlying read.
    pub fn read_from<R: Read>(&mut self, r: &mut R) -> io::Result<usize> {
        let mut extra = [0u8; 65536];
        let writable = self.writable();
        let n = {
            let tail = &mut self.buf[self.write_pos..];
            let mut iov = [IoSliceMut::new(tail), IoSliceMut::new(&mut extra)];
            r.read_vectored(&mut iov)?
        };
        if n <= writable {
            self.write_pos += n;
        } else {
            self.write_pos = self.buf.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }

    // Make room for n more bytes: shift the readable window down if
    // that frees enough, otherwise grow.
    fn ensure_writable(&mut self, n: usize) {
        if self.writable() >= n {
            return;
        }
        if self.read_pos + self.writable() >= n {
            let readable = self.readable();
            self.buf.copy_within(self.read_pos..self.write_pos, 0);
            self.read_pos = 0;
            self.write_pos = readable;
        } else {
            self.buf.resize(self.write_pos + n, 0);
        }
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn append_and_retrieve_move_cursors_exactly() {
        let mut buf = Buffer::new();
        assert_eq!(buf.readable(), 0);

        buf.append(b"hello");
        assert_eq!(buf.readable(), 5);
        assert_eq!(buf.peek(), b"hello");

        buf.retrieve(2);
        assert_eq!(buf.readable(), 3);
        assert_eq!(buf.peek(), b"llo");

        buf.retrieve(100);
        assert_eq!(buf.readable(), 0);
    }

    #[test]
    fn read_line_waits_for_crlf() {
        let mut buf = Buffer::new();
        buf.append(b"GET / HTTP/1.1");
        assert_eq!(buf.read_line(), None);

        buf.append(b"\r\nHost: x\nstill-same-line\r\n");
        assert_eq!(buf.read_line().as_deref(), Some("GET / HTTP/1.1"));
        assert_eq!(buf.read_line().as_deref(), Some("Host: x\nstill-same-line"));
        assert_eq!(buf.read_line(), None);
    }

    #[test]
    fn compacts_before_growing() {
        let mut buf = Buffer::with_capacity(8);
        buf.append(b"abcdef");
        buf.retrieve(4);
        // 2 readable, 2 writable, 4 reclaimable: fits after compaction
        buf.append(b"ghijk");
        assert_eq!(buf.peek(), b"efghijk");
    }

    #[test]
    fn grows_when_compaction_is_not_enough() {
        let mut buf = Buffer::with_capacity(4);
        buf.append(b"ab");
        buf.append(&[b'x'; 100]);
        assert_eq!(buf.readable(), 102);
        assert_eq!(&buf.peek()[..2], b"ab");
    }

    #[test]
    fn read_from_drains_a_reader() {
        let src: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let mut cursor = Cursor::new(src.clone());
        let mut buf = Buffer::with_capacity(16);
        loop {
            match buf.read_from(&mut cursor) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) => panic!("read failed: {err}"),
            }
        }
        assert_eq!(buf.peek(), &src[..]);
    }
}
