//! # Probe Correlation Tracker
//!
//! Bounded arena of measurement slots indexed `0..N` (N a power of two),
//! with a FIFO free-index queue for O(1) acquire and reclaim.
//!
//! ## Slot state machine
//!
//! ```text
//! FREE ──acquire──▶ WAIT ──mark_sent──▶ SEND ──mark_received──▶ RECV ──▶ FREE
//!                     │                   │
//!                     └──abandon──▶ FREE  └──sweep_timeouts──▶ FREE (lost)
//! ```
//!
//! Any out-of-order call is a protocol violation: it is logged, the slot is
//! force-reclaimed to FREE and the run continues. Completed and timed-out
//! measurements are queued as [`ProbeRecord`]s and drained by the owner.
//!
//! The tracker is owned by the TX role alone; RX hands arrivals over rather
//! than touching the pool.

use std::collections::VecDeque;

use serde::Serialize;
use tracing::{trace, warn};

use crate::clock::cycles_to_duration;
use crate::error::{ConfigError, ProbeError};

// ─── Slots ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotState {
    Free,
    Wait,
    Send,
    Recv,
}

#[derive(Debug, Clone)]
pub struct ProbeSlot {
    pub index: u32,
    pub state: SlotState,
    pub send_cycle: u64,
    pub recv_cycle: u64,
}

impl ProbeSlot {
    fn new(index: u32) -> Self {
        ProbeSlot {
            index,
            state: SlotState::Free,
            send_cycle: 0,
            recv_cycle: 0,
        }
    }

    fn reset(&mut self) {
        self.state = SlotState::Free;
        self.send_cycle = 0;
        self.recv_cycle = 0;
    }
}

// ─── Records ────────────────────────────────────────────────────────────────

/// One finished measurement. `recv_cycle` is `None` for a probe lost to
/// timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProbeRecord {
    pub index: u32,
    pub send_cycle: u64,
    pub recv_cycle: Option<u64>,
}

impl ProbeRecord {
    /// Round-trip latency in cycles, if the probe came back.
    pub fn latency_cycles(&self) -> Option<u64> {
        self.recv_cycle.map(|r| r.saturating_sub(self.send_cycle))
    }

    pub fn is_timeout(&self) -> bool {
        self.recv_cycle.is_none()
    }
}

/// A completed round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencySample {
    pub index: u32,
    pub send_cycle: u64,
    pub recv_cycle: u64,
    pub latency_cycles: u64,
}

impl LatencySample {
    pub fn latency(&self, hz: u64) -> std::time::Duration {
        cycles_to_duration(self.latency_cycles, hz)
    }
}

/// Counters over the lifetime of a tracker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProbeStats {
    pub issued: u64,
    pub completed: u64,
    pub timed_out: u64,
    pub violations: u64,
    pub exhausted: u64,
}

// ─── Tracker ────────────────────────────────────────────────────────────────

pub struct ProbeTracker {
    slots: Vec<ProbeSlot>,
    free: VecDeque<u32>,
    records: Vec<ProbeRecord>,
    stats: ProbeStats,
}

impl ProbeTracker {
    /// Creates a pool of `capacity` slots. `capacity` must be a non-zero
    /// power of two that fits the 32-bit probe index.
    pub fn new(capacity: usize) -> Result<Self, ConfigError> {
        if capacity == 0 || !capacity.is_power_of_two() || capacity > u32::MAX as usize {
            return Err(ConfigError::InvalidPoolSize(capacity));
        }
        Ok(ProbeTracker {
            slots: (0..capacity as u32).map(ProbeSlot::new).collect(),
            free: (0..capacity as u32).collect(),
            records: Vec::with_capacity(capacity.min(1024)),
            stats: ProbeStats::default(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots currently not FREE.
    pub fn outstanding(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn stats(&self) -> &ProbeStats {
        &self.stats
    }

    pub fn slot(&self, index: u32) -> Option<&ProbeSlot> {
        self.slots.get(index as usize)
    }

    /// Takes a FREE slot and moves it to WAIT.
    pub fn acquire_index(&mut self) -> Result<u32, ProbeError> {
        let Some(index) = self.free.pop_front() else {
            self.stats.exhausted += 1;
            return Err(ProbeError::Exhausted);
        };
        let slot = &mut self.slots[index as usize];
        debug_assert_eq!(slot.state, SlotState::Free);
        slot.state = SlotState::Wait;
        Ok(index)
    }

    /// WAIT → SEND, recording the transmit timestamp.
    pub fn mark_sent(&mut self, index: u32, cycle: u64) -> Result<(), ProbeError> {
        self.expect_state(index, SlotState::Wait)?;
        let slot = &mut self.slots[index as usize];
        slot.state = SlotState::Send;
        slot.send_cycle = cycle;
        self.stats.issued += 1;
        trace!(index, cycle, "probe sent");
        Ok(())
    }

    /// SEND → RECV → FREE. Emits a completion record and returns the
    /// measured round trip.
    pub fn mark_received(&mut self, index: u32, cycle: u64) -> Result<LatencySample, ProbeError> {
        self.expect_state(index, SlotState::Send)?;
        let slot = &mut self.slots[index as usize];
        slot.state = SlotState::Recv;
        slot.recv_cycle = cycle;

        let sample = LatencySample {
            index,
            send_cycle: slot.send_cycle,
            recv_cycle: cycle,
            latency_cycles: cycle.saturating_sub(slot.send_cycle),
        };
        self.records.push(ProbeRecord {
            index,
            send_cycle: sample.send_cycle,
            recv_cycle: Some(cycle),
        });
        self.stats.completed += 1;
        self.reclaim(index);
        trace!(index, latency_cycles = sample.latency_cycles, "probe received");
        Ok(sample)
    }

    /// WAIT → FREE for a probe that never made it onto the wire.
    pub fn abandon(&mut self, index: u32) -> Result<(), ProbeError> {
        self.expect_state(index, SlotState::Wait)?;
        self.reclaim(index);
        Ok(())
    }

    /// Reclaims every SEND slot with `send_cycle + timeout_cycles < now_cycle`,
    /// emitting one timeout record per slot. Returns how many were reclaimed.
    pub fn sweep_timeouts(&mut self, now_cycle: u64, timeout_cycles: u64) -> usize {
        let mut reclaimed = 0;
        for i in 0..self.slots.len() {
            let slot = &self.slots[i];
            if slot.state != SlotState::Send
                || slot.send_cycle.saturating_add(timeout_cycles) >= now_cycle
            {
                continue;
            }
            let index = slot.index;
            self.records.push(ProbeRecord {
                index,
                send_cycle: slot.send_cycle,
                recv_cycle: None,
            });
            self.reclaim(index);
            reclaimed += 1;
        }
        if reclaimed > 0 {
            self.stats.timed_out += reclaimed as u64;
            trace!(reclaimed, now_cycle, "probe timeouts swept");
        }
        reclaimed
    }

    /// Pending records, oldest first.
    pub fn drain_records(&mut self) -> std::vec::Drain<'_, ProbeRecord> {
        self.records.drain(..)
    }

    pub fn pending_records(&self) -> usize {
        self.records.len()
    }

    fn expect_state(&mut self, index: u32, expected: SlotState) -> Result<(), ProbeError> {
        let Some(slot) = self.slots.get(index as usize) else {
            self.stats.violations += 1;
            warn!(index, capacity = self.slots.len(), "probe index out of range");
            return Err(ProbeError::OutOfRange {
                index,
                capacity: self.slots.len(),
            });
        };
        if slot.state == expected {
            return Ok(());
        }
        let found = slot.state;
        self.stats.violations += 1;
        warn!(index, ?expected, ?found, "probe slot protocol violation, reclaiming");
        self.reclaim(index);
        Err(ProbeError::ProtocolViolation {
            index,
            expected,
            found,
        })
    }

    /// Returns a slot to FREE. A slot that is already FREE is left alone so
    /// its index is never queued twice.
    fn reclaim(&mut self, index: u32) {
        let slot = &mut self.slots[index as usize];
        if slot.state == SlotState::Free {
            return;
        }
        slot.reset();
        self.free.push_back(index);
    }
}
