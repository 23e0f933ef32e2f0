//! # Worker Lifecycle Coordination
//!
//! Process-wide registry of per-role [`WorkerState`]s plus the global
//! stop-requested flag. Each role's state is written by exactly one
//! execution unit and read by the others; every value is a single atomic
//! byte, so there are no locks and no blocking waits anywhere.
//!
//! A [`Controller`] is an explicit context object: build one per run and
//! hand an `Arc` of it to every worker. Independent controllers never
//! interfere, which keeps tests parallel-safe.
//!
//! ## Start gate
//!
//! RX and TX may only produce traffic once STAT is up. They busy-poll
//! [`Controller::wait_for_stat`] with an explicit [`PollPolicy`]; the poll
//! unwinds as soon as STAT turns terminal or a stop is requested.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use tracing::{info, warn};

use crate::clock::CycleClock;

// ─── Roles & states ─────────────────────────────────────────────────────────

/// A class of work assigned to an execution unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Role {
    Rx = 0,
    Tx = 1,
    Stat = 2,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Rx, Role::Tx, Role::Stat];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Rx => "rx",
            Role::Tx => "tx",
            Role::Stat => "stat",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of one role. Transitions only move forward:
/// `Uninit → Inited → {Stopped | Error}`; `Uninit` may also jump straight to
/// a terminal state when a role aborts before starting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum WorkerState {
    Uninit = 0,
    Inited = 1,
    Stopped = 2,
    Error = 3,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkerState::Uninit,
            1 => WorkerState::Inited,
            2 => WorkerState::Stopped,
            _ => WorkerState::Error,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerState::Stopped | WorkerState::Error)
    }

    /// Whether moving from `self` to `next` respects monotonicity.
    pub fn can_transition_to(self, next: WorkerState) -> bool {
        !self.is_terminal() && next > self
    }
}

// ─── Start gate ─────────────────────────────────────────────────────────────

/// Outcome of polling for STAT readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartGate {
    /// STAT is up; the caller may begin producing traffic.
    Ready,
    /// STAT is not up yet (only returned by bounded polls).
    Pending,
    /// STAT went terminal or a stop was requested; the caller must enter its
    /// terminal state without doing any work.
    Abort,
}

/// Busy-poll cadence for cross-role waits.
///
/// A zero `interval` spins with a CPU hint; a non-zero interval pauses the
/// caller's clock and doubles up to `max_interval` after each miss.
/// `max_polls` bounds the wait, which is how single-threaded tests drive the
/// gate without hanging.
#[derive(Debug, Clone)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_interval: Duration,
    pub max_polls: Option<u64>,
}

impl PollPolicy {
    /// Pure busy-spin, unbounded. The data-plane default.
    pub fn spin() -> Self {
        PollPolicy {
            interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            max_polls: None,
        }
    }

    pub fn with_backoff(interval: Duration, max_interval: Duration) -> Self {
        PollPolicy {
            interval,
            max_interval: max_interval.max(interval),
            max_polls: None,
        }
    }

    pub fn bounded(mut self, max_polls: u64) -> Self {
        self.max_polls = Some(max_polls);
        self
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::spin()
    }
}

// ─── Controller ─────────────────────────────────────────────────────────────

/// Shared lifecycle context for one run.
#[derive(Debug)]
pub struct Controller {
    states: [AtomicU8; 3],
    stop: AtomicBool,
}

impl Controller {
    pub fn new() -> Self {
        Controller {
            states: [
                AtomicU8::new(WorkerState::Uninit as u8),
                AtomicU8::new(WorkerState::Uninit as u8),
                AtomicU8::new(WorkerState::Uninit as u8),
            ],
            stop: AtomicBool::new(false),
        }
    }

    /// Writes the new state for `role`. Only the role's own execution unit
    /// calls this. A regression is logged and ignored.
    pub fn set_state(&self, role: Role, state: WorkerState) {
        let slot = &self.states[role as usize];
        let current = WorkerState::from_u8(slot.load(Ordering::Acquire));
        if current == state {
            return;
        }
        if !current.can_transition_to(state) {
            warn!(%role, from = ?current, to = ?state, "ignoring non-monotonic state transition");
            return;
        }
        slot.store(state as u8, Ordering::Release);
        info!(%role, from = ?current, to = ?state, "worker state");
    }

    /// Current state of `role`. Never blocks.
    pub fn state(&self, role: Role) -> WorkerState {
        WorkerState::from_u8(self.states[role as usize].load(Ordering::Acquire))
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Sets the stop flag. Safe to call from a signal handler context and
    /// idempotent; returns `true` only for the call that actually set it.
    pub fn request_stop(&self) -> bool {
        !self.stop.swap(true, Ordering::AcqRel)
    }

    /// Single non-blocking check of the start gate.
    pub fn poll_start(&self) -> StartGate {
        if self.is_stop_requested() {
            return StartGate::Abort;
        }
        match self.state(Role::Stat) {
            WorkerState::Inited => StartGate::Ready,
            WorkerState::Uninit => StartGate::Pending,
            WorkerState::Stopped | WorkerState::Error => StartGate::Abort,
        }
    }

    /// Busy-polls until STAT is ready, STAT is terminal, a stop is
    /// requested, or the policy's poll budget runs out.
    pub fn wait_for_stat<C: CycleClock + ?Sized>(&self, policy: &PollPolicy, clock: &C) -> StartGate {
        let mut polls = 0u64;
        let mut interval = policy.interval;
        loop {
            match self.poll_start() {
                StartGate::Pending => {}
                decided => return decided,
            }
            polls += 1;
            if policy.max_polls.is_some_and(|max| polls >= max) {
                return StartGate::Pending;
            }
            if interval.is_zero() {
                clock.relax();
            } else {
                clock.pause(interval);
                interval = (interval * 2).min(policy.max_interval);
            }
        }
    }

    /// Gates `roles` on STAT and records the outcome for each of them:
    /// `Inited` on `Ready`, `Stopped` on `Abort`. `Pending` leaves the
    /// states untouched.
    pub fn enter<C: CycleClock + ?Sized>(
        &self,
        roles: &[Role],
        policy: &PollPolicy,
        clock: &C,
    ) -> StartGate {
        let gate = self.wait_for_stat(policy, clock);
        let next = match gate {
            StartGate::Ready => WorkerState::Inited,
            StartGate::Abort => WorkerState::Stopped,
            StartGate::Pending => return gate,
        };
        for &role in roles {
            self.set_state(role, next);
        }
        gate
    }

    /// True once both data-plane roles have left `{Uninit, Inited}`.
    pub fn data_plane_finished(&self) -> bool {
        self.state(Role::Rx).is_terminal() && self.state(Role::Tx).is_terminal()
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}
