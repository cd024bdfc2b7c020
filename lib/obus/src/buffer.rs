//! A growable, double-ended byte queue with big-endian cursor helpers,
//! plus a pool that hands out reference-counted buffers.
//!
//! Grounded in `neutronium::net::buffer::Buffer`: data is appended at
//! the head and consumed from the tail end of a `SliceDeque`, which
//! gives contiguous read/write slices without a modulo-indexed ring.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use byteorder::{BigEndian, ByteOrder};
use slice_deque::SliceDeque;

/// Default growth increment new buffers are allocated with.
pub const DEFAULT_BUF_SIZE: usize = 65536;

/// A dynamically sized, FIFO byte queue. Data is appended at the head
/// and read from the tail.
pub struct Buffer {
    data: SliceDeque<u8>,
}

impl Buffer {
    #[inline]
    pub fn new(capacity: usize) -> Buffer {
        let mut data = SliceDeque::new();
        data.reserve(capacity);
        Buffer { data }
    }

    /// The number of bytes currently queued.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Advance the head (drop `count` bytes from the front).
    #[inline]
    pub fn consume(&mut self, count: usize) {
        unsafe { self.data.move_head(count as isize) }
    }

    /// Slice containing all queued data.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        self.data.as_slice()
    }

    #[inline]
    pub fn clear(&mut self) {
        let len = self.len();
        self.consume(len);
    }

    /// Append `bytes` to the tail of the queue.
    #[inline]
    pub fn extend(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Pull as many bytes as are available (without blocking forever) in
    /// from `reader`, appending them to the tail. Returns the number of
    /// bytes read; `Ok(0)` means the reader reported EOF.
    #[inline]
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> io::Result<usize> {
        let mut total = 0;
        loop {
            self.data.reserve(DEFAULT_BUF_SIZE);
            let slice = unsafe { self.data.tail_head_slice() };
            let slice_len = slice.len();
            match reader.read(slice) {
                Ok(0) => return Ok(total),
                Ok(n) => {
                    unsafe { self.data.move_tail(n as isize) };
                    total += n;
                    if n < slice_len {
                        return Ok(total);
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock && total > 0 => {
                    return Ok(total);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Write the contents of the queue to `writer`, advancing the head.
    /// Returns the number of bytes actually written before the writer
    /// would block or ran out of data.
    #[inline]
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let mut total = 0;
        while !self.data.is_empty() {
            match writer.write(&self.data) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.consume(n);
                    total += n;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock && total > 0 => break,
                Err(err) => return Err(err),
            }
        }
        Ok(total)
    }
}

macro_rules! read_be {
    ($name:ident, $ty:ty, $read_fn:path) => {
        /// Reads a big-endian value at `offset` without consuming it.
        #[inline]
        pub fn $name(&self, offset: usize) -> $ty {
            $read_fn(&self.data.as_slice()[offset..])
        }
    };
}

macro_rules! write_be {
    ($name:ident, $ty:ty, $write_fn:path) => {
        #[inline]
        pub fn $name(&mut self, value: $ty) {
            let mut buf = [0u8; std::mem::size_of::<$ty>()];
            $write_fn(&mut buf, value);
            self.extend(&buf);
        }
    };
}

impl Buffer {
    read_be!(peek_u16, u16, BigEndian::read_u16);
    read_be!(peek_u32, u32, BigEndian::read_u32);

    write_be!(push_u32, u32, BigEndian::write_u32);
}

/// Hands out reference-counted buffers, reclaiming ones nobody else
/// holds a strong reference to. Mirrors the "manual reference counting"
/// design note by using `Rc` (the reactor is single-threaded, so no
/// atomic refcount is needed).
pub struct BufPool {
    capacity: usize,
    free: Vec<Rc<RefCell<Buffer>>>,
}

impl BufPool {
    pub fn new(capacity: usize) -> BufPool {
        BufPool { capacity, free: Vec::new() }
    }

    /// Hands out a buffer with a fresh single reference, reusing a
    /// pooled allocation if one is available.
    pub fn acquire(&mut self) -> Rc<RefCell<Buffer>> {
        match self.free.pop() {
            Some(buf) => {
                buf.borrow_mut().clear();
                buf
            }
            None => Rc::new(RefCell::new(Buffer::new(self.capacity))),
        }
    }

    /// Returns `buf` to the pool if this call holds the only remaining
    /// strong reference.
    pub fn reclaim(&mut self, buf: Rc<RefCell<Buffer>>) {
        if Rc::strong_count(&buf) == 1 {
            self.free.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;

    struct MockChannel {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
    }

    impl MockChannel {
        fn new(data: Vec<u8>, chunk: usize) -> MockChannel {
            MockChannel { data, cursor: 0, chunk }
        }
    }

    impl io::Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let offset = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..offset].copy_from_slice(&self.data[self.cursor..self.cursor + offset]);
            self.cursor += offset;
            Ok(offset)
        }
    }

    #[test]
    fn roundtrip_ingress_egress() {
        let mock: Vec<u8> = (0..1000).map(|i| i as u8).collect();
        let mut channel = MockChannel::new(mock.clone(), 64);
        let mut buffer = Buffer::new(DEFAULT_BUF_SIZE);

        let n = buffer.ingress(&mut channel).unwrap();
        assert_eq!(n, mock.len());
        assert_eq!(buffer.as_slice(), &mock[..]);

        let mut out = Vec::new();
        let n = buffer.egress(&mut out).unwrap();
        assert_eq!(n, mock.len());
        assert_eq!(out, mock);
        assert!(buffer.is_empty());
    }

    #[test]
    fn egress_error_on_zero_write() {
        let mut buffer = Buffer::new(DEFAULT_BUF_SIZE);
        buffer.extend(&[1, 2, 3]);

        let mut zero_vec: &mut [u8] = &mut [];
        let result = buffer.egress(&mut zero_vec);

        assert_eq!(result.err().unwrap().kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn pool_reclaims_sole_owner() {
        let mut pool = BufPool::new(DEFAULT_BUF_SIZE);
        let buf = pool.acquire();
        assert!(pool.free.is_empty());
        pool.reclaim(buf);
        assert_eq!(pool.free.len(), 1);
    }

    #[test]
    fn pool_does_not_reclaim_shared_buffer() {
        let mut pool = BufPool::new(DEFAULT_BUF_SIZE);
        let buf = pool.acquire();
        let _also_held = buf.clone();
        pool.reclaim(buf);
        assert!(pool.free.is_empty());
    }
}
