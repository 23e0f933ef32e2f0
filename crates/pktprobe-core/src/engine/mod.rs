//! # Traffic Engine
//!
//! The RX / TX / RXTX / STAT execution loops and the plumbing that launches
//! them on their own threads.
//!
//! The role plan is chosen once from the number of execution units:
//!
//! | units | plan                          |
//! |-------|-------------------------------|
//! | ≥ 3   | `Stat`, `RxOnly`, `TxOnly`    |
//! | 2     | `Stat`, `RxTx`                |
//!
//! In the split plan RX never touches the probe pool. Each recognised probe
//! is handed to TX as a [`ProbeArrival`] over an SPSC ring, and TX alone
//! acquires, completes and reclaims slots.

mod rx;
mod session;
mod stat;
mod tx;

use std::time::Duration;

use serde::Serialize;

use crate::config::ProbeConfig;
use crate::control::{PollPolicy, Role};
use crate::error::ConfigError;

pub use rx::{RxPath, RxReport, RxTxWorker, RxWorker};
pub use session::{Session, SessionReport};
pub use stat::StatWorker;
pub use tx::{TxPath, TxReport, TxStep, TxWorker};

// ─── Role plan ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RoleBehavior {
    RxOnly,
    TxOnly,
    RxTx,
    Stat,
}

impl RoleBehavior {
    /// Lifecycle records this behaviour drives.
    pub fn roles(self) -> &'static [Role] {
        match self {
            RoleBehavior::RxOnly => &[Role::Rx],
            RoleBehavior::TxOnly => &[Role::Tx],
            RoleBehavior::RxTx => &[Role::Rx, Role::Tx],
            RoleBehavior::Stat => &[Role::Stat],
        }
    }

    pub fn thread_name(self) -> &'static str {
        match self {
            RoleBehavior::RxOnly => "pktprobe-rx",
            RoleBehavior::TxOnly => "pktprobe-tx",
            RoleBehavior::RxTx => "pktprobe-rxtx",
            RoleBehavior::Stat => "pktprobe-stat",
        }
    }
}

/// Selects role behaviours for `units` execution units. STAT always comes
/// first so it is brought up before the data plane.
pub fn plan_roles(units: usize) -> Result<Vec<RoleBehavior>, ConfigError> {
    match units {
        0 | 1 => Err(ConfigError::InvalidUnits(units)),
        2 => Ok(vec![RoleBehavior::Stat, RoleBehavior::RxTx]),
        _ => Ok(vec![
            RoleBehavior::Stat,
            RoleBehavior::RxOnly,
            RoleBehavior::TxOnly,
        ]),
    }
}

// ─── Arrivals ───────────────────────────────────────────────────────────────

/// A probe seen by RX, stamped with its receive cycle. `send_cycle` is the
/// value carried in the packet and tells a late probe apart from the current
/// occupant of a reused slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeArrival {
    pub index: u32,
    pub send_cycle: u64,
    pub recv_cycle: u64,
}

pub type ArrivalProducer = rtrb::Producer<ProbeArrival>;
pub type ArrivalConsumer = rtrb::Consumer<ProbeArrival>;

/// RX → TX hand-off ring. One entry per outstanding slot is enough: a full
/// ring means RX is seeing probes TX never issued.
pub fn arrival_ring(pool_size: usize) -> (ArrivalProducer, ArrivalConsumer) {
    rtrb::RingBuffer::new(pool_size.max(1))
}

// ─── Engine parameters ──────────────────────────────────────────────────────

/// Run-time knobs shared by the workers.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub rate: String,
    pub pool_size: usize,
    pub probe_timeout: Duration,
    pub stat_period: Duration,
    pub retry_limit: u32,
    pub rx_burst: usize,
    /// How data-plane roles poll for STAT readiness.
    pub start_poll: PollPolicy,
}

impl EngineConfig {
    /// Pause between attempts after a resource-exhaustion failure. The whole
    /// retry budget adds up to one probe timeout.
    pub fn exhaustion_backoff(&self) -> Duration {
        self.probe_timeout / self.retry_limit.max(1)
    }
}

impl From<&ProbeConfig> for EngineConfig {
    fn from(cfg: &ProbeConfig) -> Self {
        EngineConfig {
            rate: cfg.rate.clone(),
            pool_size: cfg.pool_size,
            probe_timeout: cfg.probe_timeout,
            stat_period: cfg.stat_period,
            retry_limit: cfg.retry_limit,
            rx_burst: cfg.rx_burst,
            start_poll: PollPolicy::with_backoff(
                Duration::from_micros(10),
                Duration::from_millis(1),
            ),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig::from(&ProbeConfig::default())
    }
}
