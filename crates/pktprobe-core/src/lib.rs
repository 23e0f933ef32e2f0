//! # pktprobe-core
//!
//! Synthetic traffic generator and round-trip latency prober for
//! kernel-bypass virtual ports.
//!
//! Probe packets are paced at a constant bitrate on a hardware cycle clock,
//! looped back through the data path and correlated against a bounded pool
//! of in-flight measurement slots. RX, TX and STAT roles run on their own
//! execution units and coordinate only through small atomic state values.
//!
//! ## Crate structure
//!
//! - [`control`] — Per-role lifecycle states and the global stop flag
//! - [`clock`] — Cycle-counter sources (TSC via `quanta`, manual for tests)
//! - [`rate`] — Rate string parsing and the cycle-domain send gate
//! - [`probe`] — Probe slot pool, correlation and timeout sweep
//! - [`stats`] — Per-direction counters, windowed rates, run summary
//! - [`port`] — Packet buffers, the port capability, loop-back port
//! - [`template`] — Probe header image, instantiation and classification
//! - [`sink`] — Append-only correlation record sinks
//! - [`config`] — TOML configuration
//! - [`engine`] — RX / TX / RXTX / STAT execution loops
//! - [`error`] — Error taxonomy

pub mod clock;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod port;
pub mod probe;
pub mod rate;
pub mod sink;
pub mod stats;
pub mod template;
