//! In-memory duplex transport
//!
//! Two [`PipeEnd`]s share a pair of bounded byte buffers. Writes beyond the
//! capacity fail with `WouldBlock`, reads from an empty buffer fail with
//! `WouldBlock`, and a closed end reads as EOF once drained. Used to drive
//! connections without sockets.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;

#[derive(Debug)]
struct PipeBuffer {
    data: VecDeque<u8>,
    capacity: usize,
    closed: bool,
}

impl PipeBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            data: VecDeque::new(),
            capacity,
            closed: false,
        }
    }

    fn room(&self) -> usize {
        self.capacity.saturating_sub(self.data.len())
    }
}

/// One side of an in-memory duplex pipe
#[derive(Debug, Clone)]
pub struct PipeEnd {
    incoming: Rc<RefCell<PipeBuffer>>,
    outgoing: Rc<RefCell<PipeBuffer>>,
}

/// Create a connected pair, each direction holding at most `capacity` bytes
pub fn pipe(capacity: usize) -> (PipeEnd, PipeEnd) {
    let a_to_b = Rc::new(RefCell::new(PipeBuffer::new(capacity)));
    let b_to_a = Rc::new(RefCell::new(PipeBuffer::new(capacity)));
    let a = PipeEnd {
        incoming: b_to_a.clone(),
        outgoing: a_to_b.clone(),
    };
    let b = PipeEnd {
        incoming: a_to_b,
        outgoing: b_to_a,
    };
    (a, b)
}

impl PipeEnd {
    /// Read buffered bytes; `Ok(0)` means the other end closed
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut incoming = self.incoming.borrow_mut();
        if incoming.data.is_empty() {
            if incoming.closed {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(incoming.data.len());
        for (slot, byte) in buf.iter_mut().zip(incoming.data.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    /// Write as much of `buf` as fits
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut outgoing = self.outgoing.borrow_mut();
        if outgoing.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let n = buf.len().min(outgoing.room());
        if n == 0 && !buf.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        outgoing.data.extend(&buf[..n]);
        Ok(n)
    }

    /// Close both directions
    pub fn close(&self) {
        self.outgoing.borrow_mut().closed = true;
        self.incoming.borrow_mut().closed = true;
    }

    /// Data or EOF is waiting
    pub fn is_readable(&self) -> bool {
        let incoming = self.incoming.borrow();
        !incoming.data.is_empty() || incoming.closed
    }

    /// At least one byte can be written
    pub fn is_writable(&self) -> bool {
        let outgoing = self.outgoing.borrow();
        outgoing.room() > 0 || outgoing.closed
    }
}
