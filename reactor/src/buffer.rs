//! Application-level byte buffer backing connection input and output.
//!
//! Layout is a single allocation split by two indices:
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! +-------------------+------------------+------------------+
//! 0        <=       reader      <=     writer      <=     len
//! ```
//!
//! The prepend region lets a framing header be stitched in front of queued
//! data without reallocating. Reads from a socket go through `read_fd`,
//! which scatter-reads into the writable region plus a 64 KiB stack spill
//! buffer so one syscall can absorb a large burst while the common case
//! stays allocation-free.

use std::io;
use std::os::unix::io::RawFd;

/// Space reserved in front of the readable region for cheap prepends.
pub const CHEAP_PREPEND: usize = 8;
/// Initial capacity of the readable+writable region.
pub const INITIAL_SIZE: usize = 1024;

/// Size of the stack spill buffer used by [`Buffer::read_fd`].
const EXTRA_BUF_SIZE: usize = 65536;

pub struct Buffer {
    buf: Vec<u8>,
    reader: usize,
    writer: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a buffer with `initial` bytes of usable capacity in addition
    /// to the prepend region.
    pub fn with_capacity(initial: usize) -> Self {
        Self {
            buf: vec![0; CHEAP_PREPEND + initial],
            reader: CHEAP_PREPEND,
            writer: CHEAP_PREPEND,
        }
    }

    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.writer - self.reader
    }

    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer
    }

    #[inline]
    pub fn prependable_bytes(&self) -> usize {
        self.reader
    }

    /// View of the readable bytes without consuming them.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader..self.writer]
    }

    /// Consume `n` readable bytes. Consuming everything resets both indices
    /// so the full capacity becomes writable again.
    pub fn retrieve(&mut self, n: usize) {
        assert!(
            n <= self.readable_bytes(),
            "retrieve({}) exceeds readable bytes ({})",
            n,
            self.readable_bytes()
        );
        if n < self.readable_bytes() {
            self.reader += n;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.reader = CHEAP_PREPEND;
        self.writer = CHEAP_PREPEND;
    }

    /// Copy `n` readable bytes out and consume them.
    pub fn retrieve_as_bytes(&mut self, n: usize) -> Vec<u8> {
        assert!(
            n <= self.readable_bytes(),
            "retrieve_as_bytes({}) exceeds readable bytes ({})",
            n,
            self.readable_bytes()
        );
        let out = self.peek()[..n].to_vec();
        self.retrieve(n);
        out
    }

    pub fn retrieve_all_as_bytes(&mut self) -> Vec<u8> {
        self.retrieve_as_bytes(self.readable_bytes())
    }

    /// Lossy UTF-8 convenience over [`Buffer::retrieve_all_as_bytes`].
    pub fn retrieve_all_as_string(&mut self) -> String {
        String::from_utf8_lossy(&self.retrieve_all_as_bytes()).into_owned()
    }

    /// Append `data` after the readable region, growing or compacting as
    /// needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.writer..self.writer + data.len()].copy_from_slice(data);
        self.writer += data.len();
    }

    /// Stitch `data` immediately in front of the readable region.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(
            data.len() <= self.prependable_bytes(),
            "prepend({}) exceeds prependable bytes ({})",
            data.len(),
            self.prependable_bytes()
        );
        self.reader -= data.len();
        self.buf[self.reader..self.reader + data.len()].copy_from_slice(data);
    }

    fn ensure_writable(&mut self, n: usize) {
        if self.writable_bytes() < n {
            self.make_space(n);
        }
        debug_assert!(self.writable_bytes() >= n);
    }

    /// Reclaim already-consumed space by sliding the readable bytes back to
    /// the prepend boundary; only grow the allocation when the total free
    /// space still cannot fit `n`.
    fn make_space(&mut self, n: usize) {
        if self.writable_bytes() + self.prependable_bytes() < n + CHEAP_PREPEND {
            self.buf.resize(self.writer + n, 0);
        } else {
            let readable = self.readable_bytes();
            self.buf.copy_within(self.reader..self.writer, CHEAP_PREPEND);
            self.reader = CHEAP_PREPEND;
            self.writer = self.reader + readable;
        }
    }

    /// Scatter-read from `fd` into the writable region and a stack spill
    /// buffer with a single `readv` call. `Ok(0)` means the peer closed.
    ///
    /// If the kernel returned more than the writable region could hold, the
    /// overflow is appended from the spill buffer (growing the allocation);
    /// otherwise only the writer index advances.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();

        let mut iov = [
            libc::iovec {
                iov_base: self.buf[self.writer..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut libc::c_void,
                iov_len: extra.len(),
            },
        ];
        let iovcnt = if writable < extra.len() { 2 } else { 1 };

        let n = unsafe { libc::readv(fd, iov.as_mut_ptr(), iovcnt) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n <= writable {
            self.writer += n;
        } else {
            self.writer = self.buf.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }

    /// Write the readable span to `fd` with a single `write` call.
    ///
    /// The readable bytes are not consumed here; the caller retrieves the
    /// returned count once it has decided the write stuck.
    pub fn write_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let readable = self.readable_bytes();
        let n = unsafe {
            libc::write(
                fd,
                self.buf[self.reader..].as_ptr() as *const libc::c_void,
                readable,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom, Write};
    use std::os::unix::io::AsRawFd;

    #[test]
    fn fresh_buffer_indices() {
        let buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn append_then_retrieve_round_trip() {
        let mut buf = Buffer::new();
        buf.append(b"hello world");
        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(buf.peek(), b"hello world");

        assert_eq!(buf.retrieve_as_bytes(6), b"hello ");
        assert_eq!(buf.readable_bytes(), 5);
        assert_eq!(buf.retrieve_all_as_bytes(), b"world");

        // full retrieval resets to the prepend boundary
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn retrieve_all_as_string_round_trip() {
        let mut buf = Buffer::new();
        buf.append(b"hello\n");
        assert_eq!(buf.retrieve_all_as_string(), "hello\n");
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn prepend_uses_reserved_space() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        let readable = buf.readable_bytes();

        buf.prepend(&[0, 7]);
        assert_eq!(buf.readable_bytes(), readable + 2);
        assert_eq!(&buf.peek()[..2], &[0, 7]);
        assert_eq!(&buf.peek()[2..], b"payload");
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND - 2);
    }

    #[test]
    fn grows_when_space_is_short() {
        let mut buf = Buffer::with_capacity(16);
        let data = vec![b'x'; 100];
        buf.append(&data);
        assert_eq!(buf.readable_bytes(), 100);
        assert_eq!(buf.peek(), &data[..]);
    }

    #[test]
    fn compacts_instead_of_growing() {
        let mut buf = Buffer::with_capacity(64);
        buf.append(&[b'a'; 48]);
        buf.retrieve(40);
        // 8 readable bytes remain; 40 reclaimed + 16 writable is enough for
        // 50 more without touching the allocation.
        let len_before = buf.buf.len();
        buf.append(&[b'b'; 50]);
        assert_eq!(buf.buf.len(), len_before);
        assert_eq!(buf.readable_bytes(), 58);
        assert_eq!(&buf.peek()[..8], &[b'a'; 8]);
        assert_eq!(&buf.peek()[8..], &[b'b'; 50]);
    }

    #[test]
    fn invariants_hold_across_mixed_operations() {
        let mut buf = Buffer::with_capacity(32);
        for round in 0..50usize {
            buf.append(&vec![round as u8; round % 97 + 1]);
            let take = buf.readable_bytes() / 2;
            buf.retrieve(take);
            assert!(buf.reader >= CHEAP_PREPEND || buf.reader == buf.writer);
            assert!(buf.reader <= buf.writer);
            assert!(buf.writer <= buf.buf.len());
            assert_eq!(buf.readable_bytes(), buf.writer - buf.reader);
        }
    }

    #[test]
    #[should_panic(expected = "exceeds readable bytes")]
    fn retrieve_past_readable_panics() {
        let mut buf = Buffer::new();
        buf.append(b"abc");
        buf.retrieve(4);
    }

    #[test]
    fn read_fd_burst_overflows_into_spill_buffer() {
        // 200 KiB behind the fd but only ~4 KiB writable: a single readv
        // absorbs writable + 64 KiB, the rest arrives on later calls.
        let total = 200 * 1024;
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&vec![b'z'; total]).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();

        let mut buf = Buffer::with_capacity(4096);
        let first = buf.read_fd(file.as_raw_fd()).unwrap();
        assert_eq!(first, 4096 + EXTRA_BUF_SIZE);
        assert_eq!(buf.readable_bytes(), first);

        let mut got = first;
        loop {
            match buf.read_fd(file.as_raw_fd()).unwrap() {
                0 => break,
                n => got += n,
            }
        }
        assert_eq!(got, total);
        assert_eq!(buf.readable_bytes(), total);
        assert!(buf.peek().iter().all(|&b| b == b'z'));
    }

    #[test]
    fn write_fd_flushes_readable_span() {
        let mut file = tempfile::tempfile().unwrap();
        let mut buf = Buffer::new();
        buf.append(b"flush me");

        let n = buf.write_fd(file.as_raw_fd()).unwrap();
        assert_eq!(n, 8);
        buf.retrieve(n);
        assert_eq!(buf.readable_bytes(), 0);

        file.seek(SeekFrom::Start(0)).unwrap();
        let mut out = String::new();
        use std::io::Read;
        file.read_to_string(&mut out).unwrap();
        assert_eq!(out, "flush me");
    }
}
