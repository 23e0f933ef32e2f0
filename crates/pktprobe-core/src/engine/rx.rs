//! Receive path and the two worker shapes that drive it.

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, trace};

use super::tx::{TxPath, TxReport};
use super::{ArrivalProducer, ProbeArrival};
use crate::clock::CycleClock;
use crate::control::{Controller, PollPolicy, Role, StartGate, WorkerState};
use crate::port::{PacketBuffer, Port};
use crate::stats::TrafficCounters;
use crate::template::ProbeTemplate;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RxReport {
    pub packets: u64,
    pub bytes: u64,
    pub probes: u64,
    /// Non-probe traffic, counted but not correlated.
    pub other: u64,
    /// Probes that could not be handed to TX because the ring was full.
    pub arrivals_dropped: u64,
}

pub struct RxPath<P> {
    port: P,
    template: ProbeTemplate,
    counters: Arc<TrafficCounters>,
    burst: usize,
    batch: Vec<PacketBuffer>,
    report: RxReport,
}

impl<P: Port> RxPath<P> {
    pub fn new(port: P, template: ProbeTemplate, counters: Arc<TrafficCounters>, burst: usize) -> Self {
        let burst = burst.max(1);
        RxPath {
            port,
            template,
            counters,
            burst,
            batch: Vec::with_capacity(burst),
            report: RxReport::default(),
        }
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    pub fn report(&self) -> &RxReport {
        &self.report
    }

    /// Receives one burst, counting every packet and passing each probe to
    /// `on_probe` stamped with the burst's receive cycle. Returns the burst
    /// size.
    pub fn poll<C, F>(&mut self, clock: &C, mut on_probe: F) -> usize
    where
        C: CycleClock + ?Sized,
        F: FnMut(ProbeArrival),
    {
        let n = self.port.receive(self.burst, &mut self.batch);
        if n == 0 {
            return 0;
        }
        let now = clock.cycles();
        for buf in self.batch.drain(..) {
            let len = buf.len() as u64;
            self.counters.record_rx(len);
            self.report.packets += 1;
            self.report.bytes += len;
            match self.template.classify(buf.as_slice()) {
                Some(view) => {
                    self.report.probes += 1;
                    on_probe(ProbeArrival {
                        index: view.index,
                        send_cycle: view.send_cycle,
                        recv_cycle: now,
                    });
                }
                None => self.report.other += 1,
            }
        }
        n
    }

    pub fn finish(self) -> RxReport {
        self.report
    }
}

// ─── RX-only worker ─────────────────────────────────────────────────────────

/// Dedicated RX execution unit. Polls the port continuously and forwards
/// probe arrivals to TX.
pub struct RxWorker<C, P> {
    ctl: Arc<Controller>,
    clock: C,
    path: RxPath<P>,
    arrivals: ArrivalProducer,
    start_poll: PollPolicy,
}

impl<C: CycleClock, P: Port> RxWorker<C, P> {
    pub fn new(
        ctl: Arc<Controller>,
        clock: C,
        path: RxPath<P>,
        arrivals: ArrivalProducer,
        start_poll: PollPolicy,
    ) -> Self {
        RxWorker {
            ctl,
            clock,
            path,
            arrivals,
            start_poll,
        }
    }

    pub fn run(self) -> RxReport {
        let RxWorker {
            ctl,
            clock,
            mut path,
            mut arrivals,
            start_poll,
        } = self;

        let gate = ctl.enter(&[Role::Rx], &start_poll, &clock);
        if gate != StartGate::Ready {
            info!(?gate, "rx not starting");
            return path.finish();
        }

        path.port_mut().start();
        info!("rx running");

        // Nothing is left to correlate once TX is terminal.
        let mut dropped = 0u64;
        while !ctl.is_stop_requested() && !ctl.state(Role::Tx).is_terminal() {
            let received = path.poll(&clock, |arrival| {
                if arrivals.push(arrival).is_err() {
                    dropped += 1;
                    trace!(index = arrival.index, "arrival ring full");
                }
            });
            if received == 0 {
                clock.relax();
            }
        }

        path.port_mut().stop();
        let mut report = path.finish();
        report.arrivals_dropped = dropped;
        ctl.set_state(Role::Rx, WorkerState::Stopped);
        report
    }
}

// ─── Combined worker ────────────────────────────────────────────────────────

/// RX and TX on a single execution unit. Instead of sleeping in the rate
/// gate, it keeps polling RX until the gate opens.
pub struct RxTxWorker<C, T, R> {
    ctl: Arc<Controller>,
    clock: C,
    rx: RxPath<R>,
    tx: TxPath<C, T>,
    start_poll: PollPolicy,
}

impl<C, T, R> RxTxWorker<C, T, R>
where
    C: CycleClock + Clone,
    T: Port,
    R: Port,
{
    pub fn new(ctl: Arc<Controller>, rx: RxPath<R>, tx: TxPath<C, T>, start_poll: PollPolicy) -> Self {
        let clock = tx.scheduler().clock().clone();
        RxTxWorker {
            ctl,
            clock,
            rx,
            tx,
            start_poll,
        }
    }

    pub fn run(self) -> (RxReport, TxReport) {
        let RxTxWorker {
            ctl,
            clock,
            mut rx,
            mut tx,
            start_poll,
        } = self;

        let gate = ctl.enter(&[Role::Rx, Role::Tx], &start_poll, &clock);
        if gate != StartGate::Ready {
            info!(?gate, "rxtx not starting");
            return (rx.finish(), tx.finish());
        }

        rx.port_mut().start();
        tx.port_mut().start();
        info!(
            pool = tx.tracker().capacity(),
            cycles_per_byte = tx.scheduler().cycles_per_byte(),
            "rxtx running"
        );

        let outcome = loop {
            if ctl.is_stop_requested() {
                break Ok(());
            }
            let received = rx.poll(&clock, |arrival| tx.complete(arrival));
            tx.maintain(clock.cycles());
            if tx.scheduler().next_send_gate() {
                if let Err(e) = tx.send_probe() {
                    break Err(e);
                }
            } else if received == 0 {
                clock.relax();
            }
        };

        // Probes already on the wire are still counted.
        rx.poll(&clock, |arrival| tx.complete(arrival));
        tx.port_mut().stop();
        rx.port_mut().stop();

        let rx_report = rx.finish();
        let mut tx_report = tx.finish();
        ctl.set_state(Role::Rx, WorkerState::Stopped);
        match outcome {
            Ok(()) => ctl.set_state(Role::Tx, WorkerState::Stopped),
            Err(e) => {
                error!(error = %e, "rxtx transmit failed");
                tx_report.error = Some(e.to_string());
                ctl.set_state(Role::Tx, WorkerState::Error);
            }
        }
        (rx_report, tx_report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::{arrival_ring, EngineConfig};
    use crate::port::loopback;
    use crate::sink::NullSink;
    use crate::template::PacketConfig;

    fn template() -> ProbeTemplate {
        ProbeTemplate::build(&PacketConfig::default()).unwrap()
    }

    #[test]
    fn poll_classifies_probes_and_plain_traffic() {
        let clock = ManualClock::new(1_000_000);
        clock.set(42);
        let counters = TrafficCounters::new();
        let (mut tx, rx) = loopback(8, 2048);
        let t = template();

        let mut probe = PacketBuffer::with_capacity(2048);
        t.instantiate(&mut probe, 5, 10).unwrap();
        let mut batch = vec![probe, PacketBuffer::from_slice(&[0u8; 80])];
        assert_eq!(tx.send(&mut batch), 2);

        let mut path = RxPath::new(rx, t, counters.clone(), 32);
        let mut seen = Vec::new();
        assert_eq!(path.poll(&clock, |a| seen.push(a)), 2);
        assert_eq!(
            seen,
            vec![ProbeArrival {
                index: 5,
                send_cycle: 10,
                recv_cycle: 42
            }]
        );
        assert_eq!(path.report().probes, 1);
        assert_eq!(path.report().other, 1);
        assert_eq!(counters.rx.packets(), 2);
        assert_eq!(counters.rx.bytes(), 64 + 80);
    }

    #[test]
    fn rx_worker_stops_when_stop_requested_before_start() {
        let clock = ManualClock::new(1_000_000);
        let ctl = Arc::new(Controller::new());
        ctl.request_stop();
        let (_tx, rx) = loopback(8, 2048);
        let (producer, _consumer) = arrival_ring(8);
        let path = RxPath::new(rx, template(), TrafficCounters::new(), 32);

        let report = RxWorker::new(ctl.clone(), clock, path, producer, PollPolicy::spin()).run();
        assert_eq!(report, RxReport::default());
        assert_eq!(ctl.state(Role::Rx), WorkerState::Stopped);
    }

    #[test]
    fn rxtx_worker_never_starts_without_stat() {
        let clock = ManualClock::new(1_000_000_000);
        let ctl = Arc::new(Controller::new());
        let counters = TrafficCounters::new();
        let (tx_port, rx_port) = loopback(8, 2048);
        let tx = TxPath::new(
            tx_port,
            template(),
            clock.clone(),
            Box::new(NullSink),
            counters.clone(),
            &EngineConfig::default(),
        )
        .unwrap();
        let rx = RxPath::new(rx_port, template(), counters, 32);

        let worker = RxTxWorker::new(ctl.clone(), rx, tx, PollPolicy::spin().bounded(1_000));
        let (rx_report, tx_report) = worker.run();
        assert_eq!(rx_report.packets, 0);
        assert_eq!(tx_report.packets_sent, 0);
        assert_eq!(ctl.state(Role::Rx), WorkerState::Uninit);
        assert_eq!(ctl.state(Role::Tx), WorkerState::Uninit);
    }
}
