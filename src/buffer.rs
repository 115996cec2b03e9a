//! A growable byte buffer with a reserved prepend area.
//!
//! ```text
//! +-----------------------+-------------------------------+---------------------------+
//! |    prependable bytes  |       readable bytes          |      writable bytes      |
//! +-----------------------+-------------------------------+---------------------------+
//! 0          <=       reader          <=              writer         <=            size
//! ```

use std::io;
use std::os::unix::io::RawFd;

/// Bytes reserved at the front of the buffer so callers can cheaply
/// prepend a length header without reallocating.
pub const CHEAP_PREPEND: usize = 8;
/// Initial capacity of the readable+writable region.
pub const INITIAL_SIZE: usize = 1024;

/// The scatter-read overflow extent: large reads are absorbed here in one
/// `readv` and then appended, bounding the buffer's own growth to what was
/// actually needed for the common small-message case.
const EXTRA_BUF_SIZE: usize = 65536;

/// A growable byte buffer used for both a connection's input and output.
#[derive(Debug, Clone)]
pub struct Buffer {
    buf: Vec<u8>,
    reader: usize,
    writer: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    /// Creates a buffer with [`INITIAL_SIZE`] bytes of writable capacity.
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_SIZE)
    }

    /// Creates a buffer with `initial_size` bytes of writable capacity.
    pub fn with_capacity(initial_size: usize) -> Buffer {
        Buffer {
            buf: vec![0u8; CHEAP_PREPEND + initial_size],
            reader: CHEAP_PREPEND,
            writer: CHEAP_PREPEND,
        }
    }

    /// Number of bytes available to read.
    pub fn readable_bytes(&self) -> usize {
        self.writer - self.reader
    }

    /// Number of bytes that can be appended without growing the buffer.
    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer
    }

    /// Number of bytes available in the prepend area.
    pub fn prependable_bytes(&self) -> usize {
        self.reader
    }

    /// Pointer to the first readable byte, without consuming it.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader..self.writer]
    }

    /// Advances the read cursor by `len` bytes (or resets to empty if `len`
    /// reaches or exceeds what's readable).
    pub fn retrieve(&mut self, len: usize) {
        if len < self.readable_bytes() {
            self.reader += len;
        } else {
            self.retrieve_all();
        }
    }

    /// Resets both cursors to the start of the readable region, restoring
    /// the full prepend + writable capacity.
    pub fn retrieve_all(&mut self) {
        self.reader = CHEAP_PREPEND;
        self.writer = CHEAP_PREPEND;
    }

    /// Consumes all readable bytes and returns them as a `String`.
    ///
    /// Invalid UTF-8 is replaced, matching the common "best effort" use of
    /// this call in message callbacks; callers needing strict validation
    /// should use [`Buffer::retrieve_all_bytes`] instead.
    pub fn retrieve_all_as_string(&mut self) -> String {
        let len = self.readable_bytes();
        self.retrieve_as_string(len)
    }

    /// Consumes `len` readable bytes and returns them as a `String`.
    pub fn retrieve_as_string(&mut self, len: usize) -> String {
        let bytes = self.retrieve_bytes(len);
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Consumes all readable bytes and returns them as a `Vec<u8>`.
    pub fn retrieve_all_bytes(&mut self) -> Vec<u8> {
        let len = self.readable_bytes();
        self.retrieve_bytes(len)
    }

    /// Consumes `len` readable bytes and returns them as a `Vec<u8>`.
    pub fn retrieve_bytes(&mut self, len: usize) -> Vec<u8> {
        let result = self.peek()[..len].to_vec();
        self.retrieve(len);
        result
    }

    /// Ensures at least `len` writable bytes are available, growing the
    /// buffer if necessary (see [`Buffer::make_space`]).
    pub fn ensure_writable_bytes(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    /// Appends `data` to the writable tail, growing first if needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable_bytes(data.len());
        let start = self.writer;
        self.buf[start..start + data.len()].copy_from_slice(data);
        self.writer += data.len();
    }

    /// Grows the buffer: first tries to reclaim space by shifting the
    /// readable region down to [`CHEAP_PREPEND`]; only if that's still not
    /// enough does the backing `Vec` actually grow.
    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.buf.resize(self.writer + len, 0);
        } else {
            let readable = self.readable_bytes();
            self.buf.copy_within(self.reader..self.writer, CHEAP_PREPEND);
            self.reader = CHEAP_PREPEND;
            self.writer = self.reader + readable;
        }
    }

    /// Reads as much as is available from `fd` into the buffer's writable
    /// tail, using a 64 KiB stack-allocated overflow extent via `readv` so
    /// a single large burst doesn't force a buffer resize.
    ///
    /// Returns the number of bytes read, `0` on orderly peer close, or an
    /// `io::Error` (including `WouldBlock` on `EAGAIN`) on failure.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra_buf = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();

        let n = {
            let iov = [
                iovec_mut(&mut self.buf[self.writer..]),
                iovec_mut(&mut extra_buf),
            ];
            readv(fd, &iov)?
        };

        if n as usize <= writable {
            self.writer += n as usize;
        } else {
            self.writer = self.buf.len();
            self.append(&extra_buf[..n as usize - writable]);
        }
        Ok(n as usize)
    }

    /// Writes as many readable bytes as the kernel will accept, advancing
    /// the read cursor by the amount actually written.
    ///
    /// Returns the number of bytes written, or an `io::Error` (including
    /// `WouldBlock` on `EAGAIN`) on failure. A partial write is not an
    /// error — the caller is expected to buffer the remainder.
    pub fn write_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let n = crate::sys::syscall!(write(
            fd,
            self.buf[self.reader..self.writer].as_ptr() as *const libc::c_void,
            self.readable_bytes(),
        ))?;
        self.retrieve(n as usize);
        Ok(n as usize)
    }
}

fn iovec_mut(buf: &mut [u8]) -> libc::iovec {
    libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    }
}

fn readv(fd: RawFd, iov: &[libc::iovec]) -> io::Result<isize> {
    crate::sys::syscall!(readv(fd, iov.as_ptr(), iov.len() as libc::c_int))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty_with_full_prepend() {
        let buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
    }

    #[test]
    fn append_then_retrieve_roundtrips() {
        let mut buf = Buffer::new();
        buf.append(b"hello");
        assert_eq!(buf.readable_bytes(), 5);
        assert_eq!(buf.peek(), b"hello");
        assert_eq!(buf.retrieve_as_string(5), "hello");
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn retrieve_all_restores_prepend() {
        let mut buf = Buffer::new();
        buf.append(b"abcdef");
        buf.retrieve_all();
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn retrieve_partial_advances_reader() {
        let mut buf = Buffer::new();
        buf.append(b"abcdef");
        buf.retrieve(2);
        assert_eq!(buf.peek(), b"cdef");
    }

    #[test]
    fn sequence_of_appends_and_retrieves_matches_prefix() {
        let mut buf = Buffer::new();
        let chunks: [&[u8]; 3] = [b"foo", b"bar", b"baz"];
        for c in chunks {
            buf.append(c);
        }
        let mut out = Vec::new();
        out.extend(buf.retrieve_bytes(4));
        out.extend(buf.retrieve_all_bytes());
        assert_eq!(out, b"foobarbaz");
    }

    #[test]
    fn grows_by_shifting_before_reallocating() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(&[1u8; 10]);
        buf.retrieve(8);
        let cap_before = buf.buf.len();
        // 6 writable + 8 reclaimable prependable >= 10 + CHEAP_PREPEND(8)? no:
        // writable(6) + prependable(16) >= 10 + 8 -> shifts, no resize.
        buf.append(&[2u8; 10]);
        assert_eq!(buf.buf.len(), cap_before);
        assert_eq!(buf.readable_bytes(), 12);
    }

    #[test]
    fn grows_buffer_when_shifting_is_not_enough() {
        let mut buf = Buffer::with_capacity(8);
        buf.append(&[1u8; 8]);
        let cap_before = buf.buf.len();
        buf.append(&[2u8; 100]);
        assert!(buf.buf.len() > cap_before);
        assert_eq!(buf.readable_bytes(), 108);
    }
}
