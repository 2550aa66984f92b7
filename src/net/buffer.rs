//! An append-mostly byte deque with explicit `peek`/`consume`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Inbound/outbound byte buffer for a [`crate::net::connection::Connection`].
///
/// Reads append to the tail via [`Buffer::push_data`]; the connection's
/// on-message callback inspects the head via [`Buffer::peek`] and drops
/// consumed bytes via [`Buffer::consume`]. Writes work the other way: bytes
/// queued with [`Buffer::push_data`] are drained from the head as the socket
/// becomes writable.
#[derive(Debug, Default)]
pub struct Buffer {
    data: BytesMut,
}

impl Buffer {
    pub fn new() -> Self {
        Self {
            data: BytesMut::new(),
        }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(cap),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Appends bytes to the tail.
    pub fn push_data(&mut self, bytes: &[u8]) {
        self.data.put_slice(bytes);
    }

    /// Returns up to `n` bytes from the head without removing them.
    pub fn peek(&self, n: usize) -> &[u8] {
        let n = n.min(self.data.len());
        &self.data[..n]
    }

    /// Returns the whole readable region without removing it.
    pub fn peek_all(&self) -> &[u8] {
        &self.data[..]
    }

    /// Drops `n` bytes from the head. `n` is clamped to the buffer length.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.data.len());
        self.data.advance(n);
    }

    /// Removes and returns `n` bytes from the head as an owned `Bytes`.
    pub fn split_to(&mut self, n: usize) -> Bytes {
        let n = n.min(self.data.len());
        self.data.split_to(n).freeze()
    }

    /// A mutable spare-capacity tail, used by the read loop to read directly
    /// into the buffer without an intermediate copy.
    pub fn reserve(&mut self, additional: usize) {
        self.data.reserve(additional);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_peek_consume_roundtrip() {
        let mut buf = Buffer::new();
        buf.push_data(b"hello world");
        assert_eq!(buf.peek(5), b"hello");
        buf.consume(6);
        assert_eq!(buf.peek_all(), b"world");
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn consume_more_than_len_clamps() {
        let mut buf = Buffer::new();
        buf.push_data(b"ab");
        buf.consume(100);
        assert!(buf.is_empty());
    }

    #[test]
    fn split_to_returns_owned_bytes() {
        let mut buf = Buffer::new();
        buf.push_data(b"abcdef");
        let head = buf.split_to(3);
        assert_eq!(&head[..], b"abc");
        assert_eq!(buf.peek_all(), b"def");
    }
}
