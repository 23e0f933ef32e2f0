//! # Ports and Packet Buffers
//!
//! [`Port`] is the send/receive capability the engines drive. Real
//! deployments back it with a kernel-bypass virtual port; this crate ships
//! an in-process loop-back pair over a lock-free SPSC ring so the whole data
//! path can run without a NIC.
//!
//! Send follows burst semantics: the port takes buffers from the front of
//! the batch and leaves whatever it could not accept in place.

use std::fmt;

use tracing::{debug, trace};

use crate::error::{BufferError, ConfigError};

// ─── PacketBuffer ───────────────────────────────────────────────────────────

/// Fixed-capacity byte region with a settable logical length.
#[derive(Clone, PartialEq, Eq)]
pub struct PacketBuffer {
    data: Box<[u8]>,
    len: usize,
}

impl PacketBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        PacketBuffer {
            data: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    /// Buffer whose declared length equals its capacity.
    pub fn from_slice(bytes: &[u8]) -> Self {
        PacketBuffer {
            data: bytes.into(),
            len: bytes.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn set_len(&mut self, len: usize) -> Result<(), BufferError> {
        if len > self.data.len() {
            return Err(BufferError::LengthExceedsCapacity {
                len,
                capacity: self.data.len(),
            });
        }
        self.len = len;
        Ok(())
    }

    /// Copies `bytes` at `offset`. Fails without touching the buffer if the
    /// copy would run past the declared length.
    pub fn copy_in(&mut self, offset: usize, bytes: &[u8]) -> Result<(), BufferError> {
        let end = offset
            .checked_add(bytes.len())
            .filter(|&end| end <= self.len)
            .ok_or(BufferError::OutOfBounds {
                offset,
                len: bytes.len(),
                bound: self.len,
            })?;
        self.data[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

impl fmt::Debug for PacketBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketBuffer")
            .field("len", &self.len)
            .field("capacity", &self.data.len())
            .finish()
    }
}

// ─── Port ───────────────────────────────────────────────────────────────────

/// Validated port handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PortId(u16);

impl PortId {
    /// Rejects negative and out-of-range handles.
    pub fn new(raw: i64) -> Result<Self, ConfigError> {
        u16::try_from(raw)
            .map(PortId)
            .map_err(|_| ConfigError::InvalidPort(raw))
    }

    pub fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port{}", self.0)
    }
}

pub trait Port: Send {
    fn start(&mut self) {}

    fn stop(&mut self) {}

    /// Takes a free buffer from the port's pool.
    fn alloc(&mut self) -> Option<PacketBuffer>;

    /// Transmits from the front of `batch`, removing what was sent. Returns
    /// the number of packets sent.
    fn send(&mut self, batch: &mut Vec<PacketBuffer>) -> usize;

    /// Appends up to `max` received buffers to `out`. Returns how many.
    fn receive(&mut self, max: usize, out: &mut Vec<PacketBuffer>) -> usize;
}

// ─── Loop-back ──────────────────────────────────────────────────────────────

/// Sending half of a loop-back port.
pub struct LoopbackTx {
    ring: rtrb::Producer<PacketBuffer>,
    capacity: usize,
    buf_capacity: usize,
    drop_every: Option<u64>,
    sent: u64,
    dropped: u64,
}

/// Receiving half of a loop-back port.
pub struct LoopbackRx {
    ring: rtrb::Consumer<PacketBuffer>,
}

/// Creates a loop-back port: everything sent on the TX half is received on
/// the RX half, up to `capacity` packets in flight.
pub fn loopback(capacity: usize, buf_capacity: usize) -> (LoopbackTx, LoopbackRx) {
    let capacity = capacity.max(1);
    let (producer, consumer) = rtrb::RingBuffer::new(capacity);
    (
        LoopbackTx {
            ring: producer,
            capacity,
            buf_capacity,
            drop_every: None,
            sent: 0,
            dropped: 0,
        },
        LoopbackRx { ring: consumer },
    )
}

impl LoopbackTx {
    /// Silently discards every `n`th accepted packet. `0` disables.
    pub fn with_drop_every(mut self, n: u64) -> Self {
        self.drop_every = (n > 0).then_some(n);
        self
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Port for LoopbackTx {
    fn start(&mut self) {
        debug!(capacity = self.capacity, "loopback tx started");
    }

    fn alloc(&mut self) -> Option<PacketBuffer> {
        Some(PacketBuffer::with_capacity(self.buf_capacity))
    }

    fn send(&mut self, batch: &mut Vec<PacketBuffer>) -> usize {
        let accepted = batch.len().min(self.ring.slots());
        for buf in batch.drain(..accepted) {
            self.sent += 1;
            if self.drop_every.is_some_and(|n| self.sent % n == 0) {
                self.dropped += 1;
                trace!(sent = self.sent, "loopback drop");
                continue;
            }
            // Slot availability was checked above and only this half pushes.
            let _ = self.ring.push(buf);
        }
        accepted
    }

    fn receive(&mut self, _max: usize, _out: &mut Vec<PacketBuffer>) -> usize {
        0
    }
}

impl Port for LoopbackRx {
    fn alloc(&mut self) -> Option<PacketBuffer> {
        None
    }

    fn send(&mut self, _batch: &mut Vec<PacketBuffer>) -> usize {
        0
    }

    fn receive(&mut self, max: usize, out: &mut Vec<PacketBuffer>) -> usize {
        let mut n = 0;
        while n < max {
            match self.ring.pop() {
                Ok(buf) => {
                    out.push(buf);
                    n += 1;
                }
                Err(_) => break,
            }
        }
        n
    }
}
