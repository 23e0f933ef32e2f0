//! # Cycle Clocks
//!
//! All timing and rate math runs in hardware-cycle units. [`TscClock`] reads
//! the raw TSC through `quanta` and calibrates its frequency once at
//! construction. [`ManualClock`] is a shared counter that only moves when
//! told to, so pacing, timeout and sampling logic can be driven step by step
//! from a single-threaded test.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Window used to measure the raw counter frequency.
const CALIBRATION_WINDOW: Duration = Duration::from_millis(20);

/// Monotonic cycle-counter source.
pub trait CycleClock: Send {
    /// Current counter value.
    fn cycles(&self) -> u64;

    /// Counter frequency in cycles per second. Never zero.
    fn hz(&self) -> u64;

    /// Cooperative sleep of the calling execution unit.
    fn pause(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    /// One iteration of a busy-wait.
    fn relax(&self) {
        std::hint::spin_loop();
    }
}

/// Converts a wall-clock span to cycles at `hz`.
pub fn duration_to_cycles(duration: Duration, hz: u64) -> u64 {
    let cycles = duration.as_nanos() * hz as u128 / NANOS_PER_SEC;
    cycles.min(u64::MAX as u128) as u64
}

/// Converts a cycle span to wall-clock time at `hz`.
pub fn cycles_to_duration(cycles: u64, hz: u64) -> Duration {
    if hz == 0 {
        return Duration::ZERO;
    }
    let nanos = cycles as u128 * NANOS_PER_SEC / hz as u128;
    Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
}

// ─── TSC ────────────────────────────────────────────────────────────────────

/// Raw TSC reader with a frequency calibrated against `quanta`'s scaled time.
///
/// On hosts without a usable TSC `quanta` falls back to the OS monotonic
/// clock; the calibration then lands near 1 GHz and the math still holds.
#[derive(Clone)]
pub struct TscClock {
    clock: quanta::Clock,
    hz: u64,
}

impl TscClock {
    pub fn new() -> Self {
        let clock = quanta::Clock::new();
        let hz = calibrate(&clock);
        tracing::debug!(hz, "cycle clock calibrated");
        TscClock { clock, hz }
    }
}

impl Default for TscClock {
    fn default() -> Self {
        Self::new()
    }
}

impl CycleClock for TscClock {
    #[inline]
    fn cycles(&self) -> u64 {
        self.clock.raw()
    }

    fn hz(&self) -> u64 {
        self.hz
    }
}

fn calibrate(clock: &quanta::Clock) -> u64 {
    let start = clock.raw();
    std::thread::sleep(CALIBRATION_WINDOW);
    let end = clock.raw();
    let nanos = clock.delta(start, end).as_nanos();
    if nanos == 0 || end <= start {
        return NANOS_PER_SEC as u64;
    }
    let hz = (end - start) as u128 * NANOS_PER_SEC / nanos;
    (hz as u64).max(1)
}

// ─── Manual ─────────────────────────────────────────────────────────────────

/// Deterministic clock for tests and simulation.
///
/// Clones share the same counter. `pause` advances the counter by the
/// requested span instead of sleeping.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
    hz: u64,
}

impl ManualClock {
    pub fn new(hz: u64) -> Self {
        ManualClock {
            now: Arc::new(AtomicU64::new(0)),
            hz: hz.max(1),
        }
    }

    pub fn set(&self, cycles: u64) {
        self.now.store(cycles, Ordering::Release);
    }

    pub fn advance(&self, cycles: u64) {
        self.now.fetch_add(cycles, Ordering::AcqRel);
    }
}

impl CycleClock for ManualClock {
    fn cycles(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }

    fn hz(&self) -> u64 {
        self.hz
    }

    fn pause(&self, duration: Duration) {
        // Zero-length pauses still move time so polling loops make progress.
        self.advance(duration_to_cycles(duration, self.hz).max(1));
    }

    fn relax(&self) {
        self.advance(1);
    }
}
