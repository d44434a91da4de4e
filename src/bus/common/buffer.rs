use crate::bus::common::{Error, Result};

/// A growable byte container with stable append/truncate (§3, §4.1 C1).
///
/// Unlike the teacher crate's direct use of `bytes::BytesMut` (which panics
/// on allocation failure, same as `Vec::reserve`), `ByteBuffer` models the
/// recoverable-OOM contract `spec.md` §7.1 requires: every growth path goes
/// through `Vec::try_reserve` and surfaces failure as `Error::low_mem()`
/// instead of aborting the process.
///
/// `borrow_tail`/`return_tail` implement the get-buffer/return-buffer
/// protocol the auth engine and loader use to let a reader fill the tail of
/// the buffer directly, without an intermediate copy: `borrow_tail` hands
/// out (uninitialized-but-zeroed) spare capacity as a mutable slice,
/// `return_tail` commits however many bytes were actually written and
/// discards the rest.
#[derive(Default)]
pub struct ByteBuffer {
    data: Vec<u8>,
    tail_start: Option<usize>,
}

impl ByteBuffer {
    pub fn new() -> Self {
        Self { data: Vec::new(), tail_start: None }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self { data: Vec::with_capacity(cap), tail_start: None }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Appends `bytes` to the end of the buffer. Fails with a recoverable
    /// OOM error rather than aborting if allocation fails.
    pub fn append_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        debug_assert!(self.tail_start.is_none(), "append_bytes while a borrow_tail is outstanding");
        self.data.try_reserve(bytes.len()).map_err(|_| Error::low_mem())?;
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Truncates the buffer to `n` bytes, or extends it with zero bytes if
    /// `n > length`. Invariant: `0 <= length <= capacity` always holds.
    pub fn set_length(&mut self, n: usize) -> Result<()> {
        if n > self.data.len() {
            self.data.try_reserve(n - self.data.len()).map_err(|_| Error::low_mem())?;
        }
        self.data.resize(n, 0);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.tail_start = None;
    }

    /// Lends the tail of the buffer as a mutable slice of at least
    /// `min_bytes` bytes (and usually more, to amortize future growth).
    /// Must be followed by exactly one call to `return_tail` before the
    /// buffer is used for anything else.
    pub fn borrow_tail(&mut self, min_bytes: usize) -> Result<&mut [u8]> {
        assert!(self.tail_start.is_none(), "borrow_tail called while a previous borrow is outstanding");
        let start = self.data.len();
        let spare = self.data.capacity() - start;
        if spare < min_bytes {
            self.data.try_reserve(min_bytes - spare).map_err(|_| Error::low_mem())?;
        }
        let cap = self.data.capacity();
        self.data.resize(cap, 0);
        self.tail_start = Some(start);
        Ok(&mut self.data[start..])
    }

    /// Commits `written` bytes of the most recent `borrow_tail`, discarding
    /// the unused remainder of the lent slice.
    pub fn return_tail(&mut self, written: usize) {
        let start = self.tail_start.take().expect("return_tail without a matching borrow_tail");
        assert!(start + written <= self.data.len());
        self.data.truncate(start + written);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_slice() {
        let mut buf = ByteBuffer::new();
        buf.append_bytes(b"hello").unwrap();
        buf.append_bytes(b" world").unwrap();
        assert_eq!(buf.as_slice(), b"hello world");
        assert_eq!(buf.len(), 11);
    }

    #[test]
    fn set_length_truncates_and_extends() {
        let mut buf = ByteBuffer::new();
        buf.append_bytes(b"abcdef").unwrap();
        buf.set_length(3).unwrap();
        assert_eq!(buf.as_slice(), b"abc");
        buf.set_length(5).unwrap();
        assert_eq!(buf.as_slice(), b"abc\0\0");
    }

    #[test]
    fn borrow_tail_then_return_tail_commits_partial_write() {
        let mut buf = ByteBuffer::new();
        buf.append_bytes(b"head-").unwrap();
        {
            let tail = buf.borrow_tail(16).unwrap();
            assert!(tail.len() >= 16);
            tail[..4].copy_from_slice(b"body");
        }
        buf.return_tail(4);
        assert_eq!(buf.as_slice(), b"head-body");
    }

    #[test]
    #[should_panic]
    fn borrow_tail_without_return_tail_panics_on_reborrow() {
        let mut buf = ByteBuffer::new();
        {
            let _a = buf.borrow_tail(8).unwrap();
        }
        // tail_start is still Some: the caller dropped the slice without
        // committing via return_tail, which is a programmer error.
        let _b = buf.borrow_tail(8).unwrap();
    }
}
