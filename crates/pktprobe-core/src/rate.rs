//! # Rate Scheduler
//!
//! Converts a configured bitrate into a cycle-domain send gate.
//!
//! The TX role owns one [`RateScheduler`]. After every successfully
//! transmitted packet it calls [`RateScheduler::advance`], which moves the
//! `next_send_cycle` watermark forward by `cycles_per_byte * sent_bytes`.
//! The next packet may only leave once the cycle counter reaches the
//! watermark.
//!
//! ## Rate strings
//!
//! `<digits>[k|K|m|M|g|G]`, binary magnitudes: `k` = 2^10, `m` = 2^20,
//! `g` = 2^40. No suffix means the literal value in bits/second.

use std::time::Duration;

use tracing::{debug, info};

use crate::clock::{cycles_to_duration, CycleClock};
use crate::control::Controller;
use crate::error::ConfigError;

/// Pacing floor applied when the configured rate rounds down to zero
/// packets per second.
pub const MIN_PACKETS_PER_SEC: u64 = 4;

/// Below this remaining span the gate busy-waits instead of sleeping.
const SPIN_MARGIN: Duration = Duration::from_micros(50);

/// Upper bound of a single gate sleep, so a stop request is seen promptly.
const MAX_GATE_SLEEP: Duration = Duration::from_millis(10);

/// Parses a rate string into bits per second.
pub fn parse_rate(input: &str) -> Result<u64, ConfigError> {
    let invalid = || ConfigError::InvalidRate(input.to_string());
    let s = input.trim();

    let (digits, multiplier) = match s.char_indices().last() {
        Some((idx, c)) if c.is_ascii_alphabetic() => {
            let mult: u64 = match c {
                'k' | 'K' => 1 << 10,
                'm' | 'M' => 1 << 20,
                'g' | 'G' => 1 << 40,
                _ => return Err(invalid()),
            };
            (&s[..idx], mult)
        }
        Some(_) => (s, 1),
        None => return Err(invalid()),
    };

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let value: u64 = digits.parse().map_err(|_| invalid())?;
    value.checked_mul(multiplier).ok_or_else(invalid)
}

/// Pacing parameters derived once at TX initialisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateSpec {
    /// Rate as configured, before the pacing floor.
    pub configured_bitrate_bps: u64,
    /// Rate actually paced.
    pub effective_bitrate_bps: u64,
    pub cycles_per_byte: u64,
    /// Packet length on the wire, frame-check sequence included.
    pub wire_size: usize,
}

impl RateSpec {
    pub fn new(bitrate_bps: u64, wire_size: usize, hz: u64) -> Self {
        let wire_bits = (wire_size.max(1) as u64) * 8;
        let effective = if bitrate_bps / wire_bits == 0 {
            MIN_PACKETS_PER_SEC * wire_bits
        } else {
            bitrate_bps
        };
        // Rounded up so the paced rate never exceeds the configured one.
        let cycles_per_byte = (hz as u128 * 8).div_ceil(effective as u128).max(1);
        RateSpec {
            configured_bitrate_bps: bitrate_bps,
            effective_bitrate_bps: effective,
            cycles_per_byte: cycles_per_byte.min(u64::MAX as u128) as u64,
            wire_size,
        }
    }

    pub fn packets_per_sec(&self) -> u64 {
        self.effective_bitrate_bps / (self.wire_size.max(1) as u64 * 8)
    }
}

/// Cycle-accurate constant-bitrate send gate.
pub struct RateScheduler<C> {
    clock: C,
    spec: Option<RateSpec>,
    next_send_cycle: u64,
}

impl<C: CycleClock> RateScheduler<C> {
    /// An unconfigured scheduler keeps the gate permanently open.
    pub fn new(clock: C) -> Self {
        RateScheduler {
            clock,
            spec: None,
            next_send_cycle: 0,
        }
    }

    /// Parses `rate` and derives `cycles_per_byte` for packets of
    /// `wire_size` bytes. Only the first successful call takes effect;
    /// later calls are no-ops.
    pub fn configure(&mut self, rate: &str, wire_size: usize) -> Result<(), ConfigError> {
        if let Some(spec) = &self.spec {
            debug!(rate, current_bps = spec.configured_bitrate_bps, "rate already configured");
            return Ok(());
        }
        let bps = parse_rate(rate)?;
        let spec = RateSpec::new(bps, wire_size, self.clock.hz());
        info!(
            rate,
            bps = spec.effective_bitrate_bps,
            pps = spec.packets_per_sec(),
            cycles_per_byte = spec.cycles_per_byte,
            wire_size,
            "rate configured"
        );
        self.spec = Some(spec);
        Ok(())
    }

    pub fn spec(&self) -> Option<&RateSpec> {
        self.spec.as_ref()
    }

    pub fn cycles_per_byte(&self) -> u64 {
        self.spec.map_or(0, |s| s.cycles_per_byte)
    }

    pub fn next_send_cycle(&self) -> u64 {
        self.next_send_cycle
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Whether the cycle counter has reached the watermark.
    #[inline]
    pub fn next_send_gate(&self) -> bool {
        self.clock.cycles() >= self.next_send_cycle
    }

    /// Moves the watermark past one transmitted packet. Call exactly once per
    /// successfully sent packet.
    #[inline]
    pub fn advance(&mut self, sent_bytes: usize, now_cycles: u64) {
        let gap = self.cycles_per_byte().saturating_mul(sent_bytes as u64);
        self.next_send_cycle = now_cycles.saturating_add(gap);
    }

    /// Blocks the caller until the watermark is reached.
    ///
    /// Sleeps in coarse steps scaled to the remaining span and only spins for
    /// the last few microseconds. Returns `false` if a stop was requested
    /// while waiting.
    pub fn wait_until_gate(&self, ctl: &Controller) -> bool {
        let hz = self.clock.hz();
        loop {
            if ctl.is_stop_requested() {
                return false;
            }
            let now = self.clock.cycles();
            if now >= self.next_send_cycle {
                return true;
            }
            let remaining = cycles_to_duration(self.next_send_cycle - now, hz);
            if remaining > SPIN_MARGIN {
                self.clock.pause((remaining - SPIN_MARGIN).min(MAX_GATE_SLEEP));
            } else {
                self.clock.relax();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const HZ: u64 = 1_000_000_000;

    #[test]
    fn parse_plain_and_suffixed() {
        assert_eq!(parse_rate("1000").unwrap(), 1000);
        assert_eq!(parse_rate("1k").unwrap(), 1024);
        assert_eq!(parse_rate("2K").unwrap(), 2048);
        assert_eq!(parse_rate("1m").unwrap(), 1 << 20);
        assert_eq!(parse_rate("3M").unwrap(), 3 << 20);
        assert_eq!(parse_rate("1g").unwrap(), 1 << 40);
        assert_eq!(parse_rate(" 10m ").unwrap(), 10 << 20);
    }

    #[test]
    fn parse_rejects_malformed() {
        for bad in ["", "m", "-5", "-5m", "1.5m", "10x", "abc", "1 m", "99999999999999999999g"] {
            assert!(
                matches!(parse_rate(bad), Err(ConfigError::InvalidRate(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn one_megabit_at_64_bytes() {
        let spec = RateSpec::new(parse_rate("1m").unwrap(), 64, HZ);
        assert_eq!(spec.packets_per_sec(), 2048);
        assert_eq!(spec.cycles_per_byte, 7630);
    }

    #[test]
    fn pacing_never_exceeds_configured_rate() {
        let spec = RateSpec::new(parse_rate("500m").unwrap(), 64, HZ);
        assert_eq!(spec.cycles_per_byte, 16);
        for rate in ["1k", "1m", "500m", "1g", "7777"] {
            let spec = RateSpec::new(parse_rate(rate).unwrap(), 1518, HZ);
            let paced_bps = HZ * 8 / spec.cycles_per_byte;
            assert!(paced_bps <= spec.effective_bitrate_bps, "{rate} paced at {paced_bps}");
        }
    }

    #[test]
    fn zero_rate_floors_to_four_pps() {
        let spec = RateSpec::new(0, 64, HZ);
        assert_eq!(spec.packets_per_sec(), MIN_PACKETS_PER_SEC);
        assert!(spec.cycles_per_byte > 0);

        let spec = RateSpec::new(100, 64, HZ);
        assert_eq!(spec.effective_bitrate_bps, 4 * 64 * 8);
    }

    #[test]
    fn first_configure_wins() {
        let mut rs = RateScheduler::new(ManualClock::new(HZ));
        rs.configure("1m", 64).unwrap();
        let cpb = rs.cycles_per_byte();
        rs.configure("100m", 64).unwrap();
        assert_eq!(rs.cycles_per_byte(), cpb);
    }

    #[test]
    fn invalid_rate_leaves_scheduler_unconfigured() {
        let mut rs = RateScheduler::new(ManualClock::new(HZ));
        assert!(rs.configure("fast", 64).is_err());
        assert!(rs.spec().is_none());
        rs.configure("1k", 64).unwrap();
        assert!(rs.spec().is_some());
    }

    #[test]
    fn gate_closes_after_send_and_reopens() {
        let clock = ManualClock::new(HZ);
        let mut rs = RateScheduler::new(clock.clone());
        rs.configure("1m", 64).unwrap();
        assert!(rs.next_send_gate());

        rs.advance(64, clock.cycles());
        assert!(!rs.next_send_gate());

        clock.advance(64 * 7630 - 1);
        assert!(!rs.next_send_gate());
        clock.advance(1);
        assert!(rs.next_send_gate());
    }

    #[test]
    fn wait_until_gate_reaches_watermark() {
        let clock = ManualClock::new(1_000_000);
        let ctl = Controller::new();
        let mut rs = RateScheduler::new(clock.clone());
        rs.configure("8k", 64).unwrap();
        rs.advance(64, 0);
        assert!(rs.wait_until_gate(&ctl));
        assert!(clock.cycles() >= rs.next_send_cycle());
    }

    #[test]
    fn wait_until_gate_honours_stop() {
        let clock = ManualClock::new(HZ);
        let ctl = Controller::new();
        let mut rs = RateScheduler::new(clock);
        rs.configure("1k", 64).unwrap();
        rs.advance(64, 0);
        ctl.request_stop();
        assert!(!rs.wait_until_gate(&ctl));
    }
}
