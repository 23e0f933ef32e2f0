//! Error types shared across the core engines.

use thiserror::Error;

use crate::probe::SlotState;

// ─── Configuration ──────────────────────────────────────────────────────────

/// Fatal configuration problems, surfaced before any role starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid rate '{0}': expected <digits>[k|K|m|M|g|G]")]
    InvalidRate(String),
    #[error("invalid port handle {0}")]
    InvalidPort(i64),
    #[error("probe pool size {0} is not a non-zero power of two")]
    InvalidPoolSize(usize),
    #[error("packet length {len} outside {min}..={max}")]
    InvalidPacketLength { len: usize, min: usize, max: usize },
    #[error("invalid MAC address '{0}'")]
    InvalidMac(String),
    #[error("{0} execution units available, at least 2 are required")]
    InvalidUnits(usize),
    #[error("invalid config TOML: {0}")]
    Toml(#[from] toml::de::Error),
}

// ─── Probe slots ────────────────────────────────────────────────────────────

/// Failures reported by the probe correlation tracker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    /// Every slot in the pool is outstanding.
    #[error("probe slot pool exhausted")]
    Exhausted,
    #[error("probe index {index} outside pool of {capacity}")]
    OutOfRange { index: u32, capacity: usize },
    /// The slot state machine was driven out of order. The slot has already
    /// been reclaimed when this is returned.
    #[error("probe slot {index}: expected {expected:?}, found {found:?}")]
    ProtocolViolation {
        index: u32,
        expected: SlotState,
        found: SlotState,
    },
}

// ─── Packet buffers ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("copy of {len} bytes at offset {offset} exceeds buffer length {bound}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        bound: usize,
    },
    #[error("length {len} exceeds buffer capacity {capacity}")]
    LengthExceedsCapacity { len: usize, capacity: usize },
}

// ─── Transmit path ──────────────────────────────────────────────────────────

/// Failures that escalate the TX role to `Error`.
#[derive(Debug, Error)]
pub enum TxError {
    #[error("no free probe slot after {0} attempts")]
    SlotsExhausted(u32),
    #[error("no packet buffer available after {0} attempts")]
    BuffersExhausted(u32),
    #[error("port refused packet after {0} attempts")]
    SendFailed(u32),
    #[error("probe template does not fit packet buffer: {0}")]
    Template(#[from] BufferError),
}

// ─── Engine ─────────────────────────────────────────────────────────────────

/// Failures while assembling or launching a run.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to spawn {role} thread: {source}")]
    Spawn {
        role: &'static str,
        #[source]
        source: std::io::Error,
    },
}
