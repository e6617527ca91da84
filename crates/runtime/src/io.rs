//! Low-level transport and the throttled write queue
//!
//! A `Transport` abstracts the byte pipe under a protocol layer: plain
//! descriptors or a TLS session. Reads and writes never block; would-
//! block conditions surface as distinct outcomes so state machines can
//! rearm their monitors.
//!
//! The write queue keeps the ordered residue of partial writes. Direct
//! I/O is attempted first; leftover bytes are queued and drained on the
//! next writable event, FIFO. Once the queued total passes the throttle
//! threshold the stream stops accepting sends until it drains.

use crate::status::{FatalReason, Status, StreamFlag};
use std::collections::VecDeque;
use std::os::unix::io::RawFd;

/// 512 KiB of queued outbound data turns throttling on.
pub const SOCK_THROTTLE_THLD: usize = 1024 * 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOutcome {
    /// That many bytes transferred (never zero).
    Bytes(usize),
    /// The descriptor is not ready.
    WouldBlock,
    /// Orderly end of stream.
    Closed,
    /// Hard failure; the caller should go to `Closing`.
    Failed,
}

pub trait Transport {
    fn read(&mut self, buf: &mut [u8]) -> IoOutcome;
    fn write(&mut self, buf: &[u8]) -> IoOutcome;

    /// Bytes already decrypted and buffered (TLS); a reader should keep
    /// draining while this is true even without a readable event.
    fn pending(&self) -> bool {
        false
    }
}

/// Plain file-descriptor transport.
pub struct PlainTransport {
    pub fd_read: RawFd,
    pub fd_write: RawFd,
}

impl Transport for PlainTransport {
    fn read(&mut self, buf: &mut [u8]) -> IoOutcome {
        loop {
            // Safety: buf is a valid writable region of its stated length
            let n = unsafe { libc::read(self.fd_read, buf.as_mut_ptr().cast(), buf.len()) };
            if n > 0 {
                return IoOutcome::Bytes(n as usize);
            }
            if n == 0 {
                return IoOutcome::Closed;
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => return IoOutcome::WouldBlock,
                _ => return IoOutcome::Failed,
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> IoOutcome {
        loop {
            // Safety: buf is a valid readable region of its stated length
            let n = unsafe { libc::write(self.fd_write, buf.as_ptr().cast(), buf.len()) };
            if n >= 0 {
                return IoOutcome::Bytes(n as usize);
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => return IoOutcome::WouldBlock,
                _ => return IoOutcome::Failed,
            }
        }
    }
}

struct PendingChunk {
    data: Vec<u8>,
    sent: usize,
}

/// Ordered pending-output buffers with throttle accounting.
#[derive(Default)]
pub struct WriteQueue {
    pending: VecDeque<PendingChunk>,
    sz_pending: usize,
}

impl WriteQueue {
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn sz_pending(&self) -> usize {
        self.sz_pending
    }

    fn queue(&mut self, buf: &[u8], status: &mut Status) {
        self.pending.push_back(PendingChunk {
            data: buf.to_vec(),
            sent: 0,
        });
        self.sz_pending += buf.len();
        status.set(StreamFlag::Sending);
        // the connection is probably too slow; stop accepting new sends
        // until everything queued has drained
        if self.sz_pending >= SOCK_THROTTLE_THLD {
            status.set(StreamFlag::Throttling);
        }
    }

    /// Try to send `buf`: direct write first, queue the residue. When
    /// something is already queued, append instead so byte order holds.
    pub fn write_or_queue(
        &mut self,
        transport: &mut dyn Transport,
        buf: &[u8],
        status: &mut Status,
    ) -> Result<usize, ()> {
        if !self.pending.is_empty() {
            if self.sz_pending < SOCK_THROTTLE_THLD {
                self.queue(buf, status);
                return Ok(0);
            }
            self.flush(transport, status)?;
            if status.is_closing() {
                return Err(());
            }
            self.queue(buf, status);
            return Ok(0);
        }

        match transport.write(buf) {
            IoOutcome::Bytes(n) if n < buf.len() => {
                self.queue(&buf[n..], status);
                Ok(n)
            }
            IoOutcome::Bytes(n) => Ok(n),
            IoOutcome::WouldBlock => {
                self.queue(buf, status);
                Ok(0)
            }
            IoOutcome::Closed | IoOutcome::Failed => {
                status.fail(FatalReason::Io);
                Err(())
            }
        }
    }

    /// Drain queued chunks FIFO until the transport pushes back.
    /// Clears `Sending`/`Throttling` as thresholds are crossed.
    pub fn flush(
        &mut self,
        transport: &mut dyn Transport,
        status: &mut Status,
    ) -> Result<usize, ()> {
        let mut total = 0usize;
        while let Some(chunk) = self.pending.front_mut() {
            match transport.write(&chunk.data[chunk.sent..]) {
                IoOutcome::Bytes(n) => {
                    chunk.sent += n;
                    self.sz_pending -= n;
                    total += n;
                    if chunk.sent >= chunk.data.len() {
                        self.pending.pop_front();
                    } else {
                        break;
                    }
                }
                IoOutcome::WouldBlock => break,
                IoOutcome::Closed | IoOutcome::Failed => {
                    status.fail(FatalReason::Io);
                    return Err(());
                }
            }
        }
        if self.pending.is_empty() {
            status.clear(StreamFlag::Sending);
        }
        if self.sz_pending < SOCK_THROTTLE_THLD {
            status.clear(StreamFlag::Throttling);
        }
        Ok(total)
    }

    /// Drop everything queued (terminal cleanup).
    pub fn clear(&mut self, status: &mut Status) {
        self.pending.clear();
        self.sz_pending = 0;
        status.clear(StreamFlag::Sending);
        status.clear(StreamFlag::Throttling);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A transport that accepts a limited number of bytes per write.
    struct ChokedTransport {
        accepted: Vec<u8>,
        per_write: usize,
        choked: bool,
    }

    impl Transport for ChokedTransport {
        fn read(&mut self, _buf: &mut [u8]) -> IoOutcome {
            IoOutcome::WouldBlock
        }

        fn write(&mut self, buf: &[u8]) -> IoOutcome {
            if self.choked {
                return IoOutcome::WouldBlock;
            }
            let n = buf.len().min(self.per_write);
            self.accepted.extend_from_slice(&buf[..n]);
            IoOutcome::Bytes(n)
        }
    }

    #[test]
    fn test_partial_write_queues_residue() {
        let mut t = ChokedTransport {
            accepted: vec![],
            per_write: 4,
            choked: false,
        };
        let mut q = WriteQueue::default();
        let mut st = Status::default();

        q.write_or_queue(&mut t, b"hello world", &mut st).unwrap();
        assert_eq!(t.accepted, b"hell");
        assert_eq!(q.sz_pending(), 7);
        assert!(st.contains(StreamFlag::Sending));

        // drain over several writable rounds
        while !q.is_empty() {
            q.flush(&mut t, &mut st).unwrap();
        }
        assert_eq!(t.accepted, b"hello world");
        assert!(!st.contains(StreamFlag::Sending));
    }

    #[test]
    fn test_fifo_order_when_queued() {
        let mut t = ChokedTransport {
            accepted: vec![],
            per_write: 1024,
            choked: true,
        };
        let mut q = WriteQueue::default();
        let mut st = Status::default();

        q.write_or_queue(&mut t, b"first ", &mut st).unwrap();
        q.write_or_queue(&mut t, b"second", &mut st).unwrap();
        t.choked = false;
        while !q.is_empty() {
            q.flush(&mut t, &mut st).unwrap();
        }
        assert_eq!(t.accepted, b"first second");
    }

    #[test]
    fn test_throttle_threshold() {
        let mut t = ChokedTransport {
            accepted: vec![],
            per_write: 0,
            choked: true,
        };
        let mut q = WriteQueue::default();
        let mut st = Status::default();

        let chunk = vec![0u8; SOCK_THROTTLE_THLD / 2];
        q.write_or_queue(&mut t, &chunk, &mut st).unwrap();
        assert!(!st.contains(StreamFlag::Throttling));
        q.write_or_queue(&mut t, &chunk, &mut st).unwrap();
        assert!(st.contains(StreamFlag::Throttling));

        // draining below the threshold clears throttling
        t.choked = false;
        t.per_write = SOCK_THROTTLE_THLD;
        q.flush(&mut t, &mut st).unwrap();
        assert!(!st.contains(StreamFlag::Throttling));
    }

    #[test]
    fn test_write_failure_is_terminal() {
        struct DeadTransport;
        impl Transport for DeadTransport {
            fn read(&mut self, _: &mut [u8]) -> IoOutcome {
                IoOutcome::Failed
            }
            fn write(&mut self, _: &[u8]) -> IoOutcome {
                IoOutcome::Failed
            }
        }
        let mut q = WriteQueue::default();
        let mut st = Status::default();
        assert!(q.write_or_queue(&mut DeadTransport, b"x", &mut st).is_err());
        assert!(st.is_closing());
    }
}
