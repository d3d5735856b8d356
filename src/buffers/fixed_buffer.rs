//! A fixed-capacity buffer for reuse. Its main purpose is to allow pooling of I/O buffers
//!  without reallocation: the backing storage is allocated once, and the buffer can be
//!  handed to socket reads (via `maximize_len` / `as_mut`) as well as filled incrementally
//!  through the `bytes` ecosystem's `BufMut`.

use bytes::buf::UninitSlice;
use std::borrow::Borrow;
use std::fmt::{Debug, Formatter};

/// A fixed-capacity, dynamically allocated buffer
#[derive(Eq)]
pub struct FixedBuf {
    buf: Vec<u8>,
    len: usize,
}
impl FixedBuf {
    /// create a new FixedBuf instance with the given capacity
    pub fn new(capacity: usize) -> FixedBuf {
        FixedBuf {
            // buffers are reused aggressively, so we trade the overhead of initial
            //  zero-initialization for simplicity
            buf: vec![0; capacity],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// make the entire underlying buffer available through as_mut() etc. - this is how a
    ///  socket read borrows the full capacity as its target
    pub fn maximize_len(&mut self) {
        self.len = self.capacity();
    }

    pub fn truncate(&mut self, len: usize) {
        assert!(len <= self.capacity());
        self.len = len;
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// This is a convenience function for test code. It derives the buffer's capacity from
    ///  the slice used for initialization, which is a shortcut not intended for production
    ///  usage.
    #[cfg(test)]
    pub fn from_slice(capacity: usize, data: &[u8]) -> FixedBuf {
        let mut result = FixedBuf::new(capacity);
        bytes::BufMut::put_slice(&mut result, data);
        result
    }
}

impl PartialEq for FixedBuf {
    fn eq(&self, other: &Self) -> bool {
        self.as_ref().eq(other.as_ref())
    }
}

impl Debug for FixedBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.as_ref().fmt(f)
    }
}

impl Borrow<[u8]> for FixedBuf {
    fn borrow(&self) -> &[u8] {
        self.as_ref()
    }
}

impl AsRef<[u8]> for FixedBuf {
    fn as_ref(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}
impl AsMut<[u8]> for FixedBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }
}

unsafe impl bytes::BufMut for FixedBuf {
    fn remaining_mut(&self) -> usize {
        self.buf.len() - self.len
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        assert!(self.len + cnt <= self.capacity());
        self.len += cnt;
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        UninitSlice::new(&mut self.buf[self.len..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use rstest::rstest;

    #[rstest]
    #[case::empty(FixedBuf::from_slice(100, b""), 0)]
    #[case::simple(FixedBuf::from_slice(100, b"abc"), 3)]
    fn test_len(#[case] buf: FixedBuf, #[case] expected: usize) {
        assert_eq!(buf.len(), expected);
        assert_eq!(buf.is_empty(), expected == 0);
    }

    #[rstest]
    #[case::empty(FixedBuf::from_slice(3, b""), b"\0\0\0")]
    #[case::data(FixedBuf::from_slice(4, b"abc"), b"abc\0")]
    #[case::full(FixedBuf::from_slice(5, b"abcde"), b"abcde")]
    fn test_maximize_len(#[case] mut buf: FixedBuf, #[case] expected: &[u8]) {
        buf.maximize_len();
        assert_eq!(buf.as_ref(), expected);
    }

    #[rstest]
    #[case::l5(5, b"hello")]
    #[case::l3(3, b"hel")]
    #[case::l1(1, b"h")]
    #[case::l0(0, b"")]
    fn test_truncate(#[case] len: usize, #[case] expected: &[u8]) {
        let mut buf = FixedBuf::from_slice(1000, b"hello");
        buf.truncate(len);
        assert_eq!(buf.as_ref(), expected);
    }

    #[rstest]
    #[case::empty(FixedBuf::from_slice(100, b""))]
    #[case::data(FixedBuf::from_slice(200, b"123"))]
    #[case::full(FixedBuf::from_slice(5, b"12345"))]
    fn test_clear(#[case] mut buf: FixedBuf) {
        let capacity = buf.capacity();

        buf.clear();

        assert_eq!(0, buf.len());
        assert_eq!(b"", buf.as_ref());
        assert_eq!(capacity, buf.capacity());
    }

    #[test]
    fn test_buf_mut() {
        let mut buffer = FixedBuf::new(1000);
        buffer.put_slice(b"hello");

        assert_eq!(buffer.remaining_mut(), 1000 - 5);
        assert_eq!(buffer.as_ref(), b"hello");

        let chunk = buffer.chunk_mut();
        chunk[..7].copy_from_slice(b" world!");
        assert_eq!(buffer.as_ref(), b"hello");

        unsafe { buffer.advance_mut(6); }
        assert_eq!(buffer.as_ref(), b"hello world");
        assert_eq!(buffer.remaining_mut(), 1000 - 11);
    }

    #[test]
    fn test_as_mut_modification() {
        let mut buf = FixedBuf::from_slice(20, b"abc");
        buf.as_mut()[0] = 65;
        assert_eq!(buf.as_ref(), b"Abc");
    }
}
