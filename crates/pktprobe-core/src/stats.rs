//! # Traffic Statistics
//!
//! Per-direction byte/packet counters plus the STAT role's windowed rate
//! sampling and end-of-run summary.
//!
//! Counters follow a single-writer / single-reader discipline: the role that
//! produces traffic in a direction is the only writer, STAT is the only
//! reader. Each value is a whole `AtomicU64`, so reads never tear and the
//! writer needs no read-modify-write instruction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::clock::cycles_to_duration;

// ─── Counters ───────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct DirectionCounters {
    bytes: AtomicU64,
    packets: AtomicU64,
}

impl DirectionCounters {
    /// Adds one packet of `bytes`. Only the owning role may call this.
    #[inline]
    pub fn record(&self, bytes: u64) {
        let b = self.bytes.load(Ordering::Relaxed);
        let p = self.packets.load(Ordering::Relaxed);
        self.bytes.store(b.wrapping_add(bytes), Ordering::Relaxed);
        self.packets.store(p.wrapping_add(1), Ordering::Relaxed);
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }
}

/// Cumulative counters for both directions, shared between the data-plane
/// roles and STAT.
#[derive(Debug, Default)]
pub struct TrafficCounters {
    pub rx: DirectionCounters,
    pub tx: DirectionCounters,
}

impl TrafficCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[inline]
    pub fn record_rx(&self, bytes: u64) {
        self.rx.record(bytes);
    }

    #[inline]
    pub fn record_tx(&self, bytes: u64) {
        self.tx.record(bytes);
    }
}

// ─── Observations ───────────────────────────────────────────────────────────

/// Rate over one sampling window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RateObservation {
    pub bits_per_sec: f64,
    pub packets_per_sec: f64,
    pub bytes: u64,
    pub packets: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct WindowSample {
    pub rx: RateObservation,
    pub tx: RateObservation,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DirectionSummary {
    pub total_bytes: u64,
    pub total_packets: u64,
    pub avg_bits_per_sec: f64,
    pub avg_packets_per_sec: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub duration_secs: f64,
    pub rx: DirectionSummary,
    pub tx: DirectionSummary,
}

// ─── Aggregator ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
struct Baseline {
    bytes: u64,
    packets: u64,
}

/// Owned by STAT. Samples the shared counters on a fixed period.
pub struct StatsAggregator {
    counters: Arc<TrafficCounters>,
    period: Duration,
    hz: u64,
    last_rx: Baseline,
    last_tx: Baseline,
}

impl StatsAggregator {
    pub fn new(counters: Arc<TrafficCounters>, period: Duration, hz: u64) -> Self {
        StatsAggregator {
            counters,
            period,
            hz,
            last_rx: Baseline::default(),
            last_tx: Baseline::default(),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Delta since the previous sample, scaled by the fixed period. Resets
    /// the baseline.
    pub fn sample_window(&mut self) -> WindowSample {
        let secs = self.period.as_secs_f64();
        WindowSample {
            rx: observe(&self.counters.rx, &mut self.last_rx, secs),
            tx: observe(&self.counters.tx, &mut self.last_tx, secs),
        }
    }

    /// Totals and average rates over a run of `total_cycles`.
    pub fn finalize(&self, total_cycles: u64) -> RunSummary {
        let secs = cycles_to_duration(total_cycles, self.hz).as_secs_f64();
        RunSummary {
            duration_secs: secs,
            rx: summarize(&self.counters.rx, secs),
            tx: summarize(&self.counters.tx, secs),
        }
    }
}

fn observe(counters: &DirectionCounters, last: &mut Baseline, secs: f64) -> RateObservation {
    let now = Baseline {
        bytes: counters.bytes(),
        packets: counters.packets(),
    };
    let bytes = now.bytes.wrapping_sub(last.bytes);
    let packets = now.packets.wrapping_sub(last.packets);
    *last = now;
    if secs <= 0.0 {
        return RateObservation {
            bytes,
            packets,
            ..Default::default()
        };
    }
    RateObservation {
        bits_per_sec: bytes as f64 * 8.0 / secs,
        packets_per_sec: packets as f64 / secs,
        bytes,
        packets,
    }
}

fn summarize(counters: &DirectionCounters, secs: f64) -> DirectionSummary {
    let total_bytes = counters.bytes();
    let total_packets = counters.packets();
    let (avg_bits_per_sec, avg_packets_per_sec) = if secs > 0.0 {
        (total_bytes as f64 * 8.0 / secs, total_packets as f64 / secs)
    } else {
        (0.0, 0.0)
    };
    DirectionSummary {
        total_bytes,
        total_packets,
        avg_bits_per_sec,
        avg_packets_per_sec,
    }
}
