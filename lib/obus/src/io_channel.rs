//! One connected socket wrapped with the bus's read/decode and
//! write-queue/timeout machinery, implementing the write-timeout
//! requirement that a peer stuck not draining its socket buffer gets
//! disconnected. Grounded in
//! `neutronium::net::channel::Channel`'s receive/send split, generalized
//! from its encrypted single-payload-buffer scheme to a plain
//! [`Buffer`] plus [`PacketDecoder`].

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::rc::Rc;
use std::time::{Duration, Instant};

use mio::Token;

use crate::buffer::{Buffer, DEFAULT_BUF_SIZE};
use crate::codec::PacketDecoder;
use crate::descriptor::BusDescriptor;
use crate::error::{IoOutcome, IoResult};

/// Outgoing data waits at most this long to drain before the channel
/// is considered dead.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Wraps one connected stream (TCP or Unix) with a read buffer feeding
/// a [`PacketDecoder`], and a FIFO queue of pooled write buffers.
pub struct IoChannel<S> {
    stream: S,
    token: Token,
    read_buf: Buffer,
    decoder: PacketDecoder,
    write_queue: VecDeque<Rc<RefCell<Buffer>>>,
    write_deadline: Option<Instant>,
    last_ingress: Instant,
    last_egress: Instant,
}

impl<S: Read + Write> IoChannel<S> {
    pub fn new(stream: S, token: Token) -> IoChannel<S> {
        let now = Instant::now();
        IoChannel {
            stream,
            token,
            read_buf: Buffer::new(DEFAULT_BUF_SIZE),
            decoder: PacketDecoder::new(),
            write_queue: VecDeque::new(),
            write_deadline: None,
            last_ingress: now,
            last_egress: now,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn last_ingress(&self) -> Instant {
        self.last_ingress
    }

    pub fn last_egress(&self) -> Instant {
        self.last_egress
    }

    /// Pulls as much data as is available into the read buffer.
    pub fn receive(&mut self, now: Instant) -> IoResult<usize> {
        let n = self.read_buf.ingress(&mut self.stream).map_err(IoOutcome::from)?;
        if n > 0 {
            self.last_ingress = now;
        }
        Ok(n)
    }

    /// Decodes every full packet currently buffered.
    pub fn drain_packets(&mut self, bus: &BusDescriptor) -> Vec<crate::codec::Packet> {
        let mut packets = Vec::new();
        while let Some(packet) = self.decoder.read_one(&mut self.read_buf, bus) {
            packets.push(packet);
        }
        packets
    }

    /// Queues a buffer to be written out. Arms the write timeout if the
    /// queue was previously empty.
    pub fn queue_write(&mut self, buf: Rc<RefCell<Buffer>>) {
        if self.write_queue.is_empty() {
            self.write_deadline = Some(Instant::now() + WRITE_TIMEOUT);
        }
        self.write_queue.push_back(buf);
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.write_queue.is_empty()
    }

    /// Flushes as much of the write queue as the socket accepts without
    /// blocking, returning completed buffers to `pool`. Clears the write
    /// deadline once the queue drains.
    pub fn flush(&mut self, now: Instant, pool: &mut crate::buffer::BufPool) -> IoResult<usize> {
        let mut total = 0;
        while let Some(front) = self.write_queue.front().cloned() {
            let sent = {
                let mut buf = front.borrow_mut();
                buf.egress(&mut self.stream).map_err(IoOutcome::from)?
            };
            total += sent;
            if sent > 0 {
                self.last_egress = now;
            }
            if front.borrow().is_empty() {
                self.write_queue.pop_front();
                pool.reclaim(front);
            } else {
                break;
            }
        }

        self.write_deadline = if self.write_queue.is_empty() {
            None
        } else {
            self.write_deadline
        };

        Ok(total)
    }

    /// Whether the write queue has exceeded [`WRITE_TIMEOUT`] without
    /// draining — the caller should treat this as a fatal channel error.
    pub fn write_timed_out(&self, now: Instant) -> bool {
        matches!(self.write_deadline, Some(deadline) if now >= deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufPool;
    use std::io;

    struct LoopbackStream {
        inbox: Vec<u8>,
        read_pos: usize,
        outbox: Vec<u8>,
        write_cap: usize,
    }

    impl LoopbackStream {
        fn new(inbox: Vec<u8>, write_cap: usize) -> LoopbackStream {
            LoopbackStream { inbox, read_pos: 0, outbox: Vec::new(), write_cap }
        }
    }

    impl Read for LoopbackStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.read_pos == self.inbox.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = std::cmp::min(buf.len(), self.inbox.len() - self.read_pos);
            buf[..n].copy_from_slice(&self.inbox[self.read_pos..self.read_pos + n]);
            self.read_pos += n;
            Ok(n)
        }
    }

    impl Write for LoopbackStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = std::cmp::min(buf.len(), self.write_cap);
            if n == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.outbox.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn receive_updates_last_ingress_only_on_data() {
        let stream = LoopbackStream::new(vec![1, 2, 3], 1024);
        let mut channel = IoChannel::new(stream, Token(0));
        let before = channel.last_ingress();

        std::thread::sleep(Duration::from_millis(2));
        let n = channel.receive(Instant::now()).unwrap();
        assert_eq!(n, 3);
        assert!(channel.last_ingress() > before);
    }

    #[test]
    fn write_queue_drains_and_reclaims_buffer() {
        let stream = LoopbackStream::new(vec![], 1024);
        let mut channel = IoChannel::new(stream, Token(0));
        let mut pool = BufPool::new(DEFAULT_BUF_SIZE);

        let buf = pool.acquire();
        buf.borrow_mut().extend(&[9, 9, 9]);
        channel.queue_write(buf);
        assert!(channel.has_pending_writes());

        channel.flush(Instant::now(), &mut pool).unwrap();
        assert!(!channel.has_pending_writes());
        assert_eq!(channel.stream().outbox, vec![9, 9, 9]);
    }

    #[test]
    fn stalled_write_reports_timeout() {
        let stream = LoopbackStream::new(vec![], 0);
        let mut channel = IoChannel::new(stream, Token(0));
        let mut pool = BufPool::new(DEFAULT_BUF_SIZE);

        let buf = pool.acquire();
        buf.borrow_mut().extend(&[1]);
        channel.queue_write(buf);

        let future = Instant::now() + WRITE_TIMEOUT + Duration::from_secs(1);
        assert!(channel.write_timed_out(future));
    }
}
