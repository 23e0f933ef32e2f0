//! Transmit path: probe issue, rate gating, arrival completion and the
//! timeout sweep. Owns the probe pool and the pacing watermark.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use super::{ArrivalConsumer, EngineConfig, ProbeArrival};
use crate::clock::{duration_to_cycles, CycleClock};
use crate::control::{Controller, PollPolicy, Role, StartGate, WorkerState};
use crate::error::{ConfigError, TxError};
use crate::port::{PacketBuffer, Port};
use crate::probe::{ProbeStats, ProbeTracker, SlotState};
use crate::rate::RateScheduler;
use crate::sink::RecordSink;
use crate::stats::TrafficCounters;
use crate::template::ProbeTemplate;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TxReport {
    pub probes: ProbeStats,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub send_retries: u64,
    /// Probes whose payload did not match the slot's current send cycle.
    pub stale_arrivals: u64,
    /// Slots still in flight when the role stopped.
    pub outstanding: usize,
    pub sink_errors: u64,
    pub error: Option<String>,
}

/// Outcome of one [`TxPath::send_probe`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStep {
    Sent,
    /// A slot or buffer was unavailable; the caller retries next iteration.
    Deferred,
}

pub struct TxPath<C, P> {
    port: P,
    template: ProbeTemplate,
    tracker: ProbeTracker,
    scheduler: RateScheduler<C>,
    sink: Box<dyn RecordSink>,
    counters: Arc<TrafficCounters>,
    timeout_cycles: u64,
    sweep_every: u64,
    next_sweep: u64,
    backoff: Duration,
    retry_limit: u32,
    failures: u32,
    exhausted_since: Option<u64>,
    arrivals: Option<ArrivalConsumer>,
    batch: Vec<PacketBuffer>,
    report: TxReport,
}

impl<C: CycleClock, P: Port> TxPath<C, P> {
    /// Builds the pool and configures pacing for the template's wire size.
    pub fn new(
        port: P,
        template: ProbeTemplate,
        clock: C,
        sink: Box<dyn RecordSink>,
        counters: Arc<TrafficCounters>,
        cfg: &EngineConfig,
    ) -> Result<Self, ConfigError> {
        let tracker = ProbeTracker::new(cfg.pool_size)?;
        let mut scheduler = RateScheduler::new(clock);
        scheduler.configure(&cfg.rate, template.wire_size())?;
        let timeout_cycles = duration_to_cycles(cfg.probe_timeout, scheduler.clock().hz());
        let now = scheduler.clock().cycles();
        let sweep_every = (timeout_cycles / 4).max(1);

        Ok(TxPath {
            port,
            template,
            tracker,
            scheduler,
            sink,
            counters,
            timeout_cycles,
            sweep_every,
            next_sweep: now.saturating_add(sweep_every),
            backoff: cfg.exhaustion_backoff(),
            retry_limit: cfg.retry_limit.max(1),
            failures: 0,
            exhausted_since: None,
            arrivals: None,
            batch: Vec::with_capacity(1),
            report: TxReport::default(),
        })
    }

    /// Attaches the ring RX hands probe arrivals over. Pending arrivals are
    /// completed before every timeout sweep.
    pub fn with_arrivals(mut self, arrivals: ArrivalConsumer) -> Self {
        self.arrivals = Some(arrivals);
        self
    }

    pub fn scheduler(&self) -> &RateScheduler<C> {
        &self.scheduler
    }

    pub fn tracker(&self) -> &ProbeTracker {
        &self.tracker
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    pub fn now(&self) -> u64 {
        self.scheduler.clock().cycles()
    }

    /// Issues one probe. The send gate must already be open.
    ///
    /// Slot exhaustion forces an immediate timeout sweep before giving up on
    /// this iteration. Resource failures back off `probe_timeout /
    /// retry_limit` and return [`TxStep::Deferred`]; they escalate only once
    /// consecutive failures have spanned more than one probe timeout.
    pub fn send_probe(&mut self) -> Result<TxStep, TxError> {
        let index = match self.tracker.acquire_index() {
            Ok(index) => index,
            Err(_) => {
                let now = self.now();
                self.sweep(now);
                match self.tracker.acquire_index() {
                    Ok(index) => index,
                    Err(_) => return self.defer(TxError::SlotsExhausted),
                }
            }
        };

        let Some(mut buf) = self.port.alloc() else {
            self.release(index);
            return self.defer(TxError::BuffersExhausted);
        };

        let now = self.now();
        if let Err(e) = self.template.instantiate(&mut buf, index, now) {
            self.release(index);
            return Err(e.into());
        }
        let wire = buf.len();

        self.batch.push(buf);
        let mut attempts = 0;
        while self.port.send(&mut self.batch) == 0 {
            attempts += 1;
            self.report.send_retries += 1;
            if attempts >= self.retry_limit {
                self.batch.clear();
                self.release(index);
                return Err(TxError::SendFailed(attempts));
            }
            self.scheduler.clock().relax();
        }

        let marked = self.tracker.mark_sent(index, now);
        debug_assert!(marked.is_ok(), "acquired slot {index} not in WAIT: {marked:?}");
        self.scheduler.advance(wire, now);
        self.counters.record_tx(wire as u64);
        self.report.packets_sent += 1;
        self.report.bytes_sent += wire as u64;
        self.failures = 0;
        self.exhausted_since = None;
        Ok(TxStep::Sent)
    }

    /// Completes a probe reported by RX.
    pub fn complete(&mut self, arrival: ProbeArrival) {
        if let Some(slot) = self.tracker.slot(arrival.index) {
            if slot.state == SlotState::Send && slot.send_cycle != arrival.send_cycle {
                self.report.stale_arrivals += 1;
                trace!(index = arrival.index, "stale probe for reused slot");
                return;
            }
        }
        if let Ok(sample) = self.tracker.mark_received(arrival.index, arrival.recv_cycle) {
            trace!(
                index = sample.index,
                latency_us = sample.latency(self.scheduler.clock().hz()).as_micros() as u64,
                "probe completed"
            );
        }
        self.flush_records();
    }

    /// Completes every arrival queued by RX.
    pub fn collect_arrivals(&mut self) {
        let Some(mut ring) = self.arrivals.take() else {
            return;
        };
        while let Ok(arrival) = ring.pop() {
            self.complete(arrival);
        }
        self.arrivals = Some(ring);
    }

    /// Periodic housekeeping: sweeps timed-out probes once per quarter
    /// timeout.
    pub fn maintain(&mut self, now: u64) {
        if now >= self.next_sweep {
            self.sweep(now);
            self.next_sweep = now.saturating_add(self.sweep_every);
        }
    }

    /// Final sweep and flush. Probes still inside their timeout window are
    /// reported as outstanding, not as lost.
    pub fn finish(mut self) -> TxReport {
        let now = self.now();
        self.sweep(now);
        if let Err(e) = self.sink.flush() {
            self.report.sink_errors += 1;
            warn!(error = %e, "record sink flush failed");
        }
        self.report.probes = self.tracker.stats().clone();
        self.report.outstanding = self.tracker.outstanding();
        self.report
    }

    fn sweep(&mut self, now: u64) {
        // A probe already back must not be swept as lost.
        self.collect_arrivals();
        let lost = self.tracker.sweep_timeouts(now, self.timeout_cycles);
        if lost > 0 {
            debug!(lost, outstanding = self.tracker.outstanding(), "probes timed out");
        }
        self.flush_records();
    }

    fn flush_records(&mut self) {
        for record in self.tracker.drain_records() {
            if let Err(e) = self.sink.write(&record) {
                self.report.sink_errors += 1;
                if self.report.sink_errors == 1 {
                    warn!(error = %e, "record sink write failed");
                }
            }
        }
    }

    fn release(&mut self, index: u32) {
        let _ = self.tracker.abandon(index);
    }

    fn defer(&mut self, escalate: fn(u32) -> TxError) -> Result<TxStep, TxError> {
        let now = self.now();
        let since = *self.exhausted_since.get_or_insert(now);
        self.failures += 1;
        if now.saturating_sub(since) > self.timeout_cycles {
            return Err(escalate(self.failures));
        }
        debug!(
            failures = self.failures,
            backoff_ms = self.backoff.as_millis() as u64,
            "tx resources exhausted, backing off"
        );
        self.scheduler.clock().pause(self.backoff);
        Ok(TxStep::Deferred)
    }
}

// ─── TX-only worker ─────────────────────────────────────────────────────────

/// Dedicated TX execution unit. Sleeps in the rate gate between probes and
/// completes arrivals handed over by RX.
pub struct TxWorker<C, P> {
    ctl: Arc<Controller>,
    path: TxPath<C, P>,
    start_poll: PollPolicy,
}

impl<C: CycleClock, P: Port> TxWorker<C, P> {
    pub fn new(ctl: Arc<Controller>, path: TxPath<C, P>, start_poll: PollPolicy) -> Self {
        TxWorker {
            ctl,
            path,
            start_poll,
        }
    }

    pub fn run(self) -> TxReport {
        let TxWorker {
            ctl,
            mut path,
            start_poll,
        } = self;

        let gate = ctl.enter(&[Role::Tx], &start_poll, path.scheduler().clock());
        if gate != StartGate::Ready {
            info!(?gate, "tx not starting");
            return path.finish();
        }

        path.port_mut().start();
        info!(
            pool = path.tracker().capacity(),
            cycles_per_byte = path.scheduler().cycles_per_byte(),
            "tx running"
        );

        let outcome = loop {
            if ctl.is_stop_requested() {
                break Ok(());
            }
            if !path.scheduler().wait_until_gate(&ctl) {
                break Ok(());
            }
            path.collect_arrivals();
            let now = path.now();
            path.maintain(now);
            if let Err(e) = path.send_probe() {
                break Err(e);
            }
        };

        path.collect_arrivals();
        path.port_mut().stop();
        let mut report = path.finish();
        match outcome {
            Ok(()) => ctl.set_state(Role::Tx, WorkerState::Stopped),
            Err(e) => {
                error!(error = %e, "tx failed");
                report.error = Some(e.to_string());
                ctl.set_state(Role::Tx, WorkerState::Error);
            }
        }
        report
    }
}
