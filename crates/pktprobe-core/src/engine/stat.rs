//! Statistics role: windowed traffic rates and the end-of-run summary.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::clock::CycleClock;
use crate::control::{Controller, Role, WorkerState};
use crate::stats::{RunSummary, StatsAggregator, TrafficCounters};

/// The STAT execution unit. Brought up first; releases the data plane by
/// reaching `Inited`, then samples on a fixed period until both data-plane
/// roles are terminal.
pub struct StatWorker<C> {
    ctl: Arc<Controller>,
    clock: C,
    aggregator: StatsAggregator,
}

impl<C: CycleClock> StatWorker<C> {
    pub fn new(
        ctl: Arc<Controller>,
        clock: C,
        counters: Arc<TrafficCounters>,
        period: Duration,
    ) -> Self {
        let hz = clock.hz();
        StatWorker {
            ctl,
            clock,
            aggregator: StatsAggregator::new(counters, period, hz),
        }
    }

    pub fn run(mut self) -> RunSummary {
        let start = self.clock.cycles();
        self.ctl.set_state(Role::Stat, WorkerState::Inited);

        let mut window = 0u64;
        loop {
            self.clock.pause(self.aggregator.period());
            if self.ctl.data_plane_finished() {
                break;
            }
            let sample = self.aggregator.sample_window();
            window += 1;
            info!(
                window,
                rx_bps = sample.rx.bits_per_sec,
                rx_pps = sample.rx.packets_per_sec,
                tx_bps = sample.tx.bits_per_sec,
                tx_pps = sample.tx.packets_per_sec,
                "traffic"
            );
        }

        let last = self.aggregator.sample_window();
        debug!(
            rx_packets = last.rx.packets,
            tx_packets = last.tx.packets,
            "final window"
        );

        let elapsed = self.clock.cycles().saturating_sub(start);
        let summary = self.aggregator.finalize(elapsed);
        info!(
            duration_secs = summary.duration_secs,
            rx_packets = summary.rx.total_packets,
            rx_avg_bps = summary.rx.avg_bits_per_sec,
            tx_packets = summary.tx.total_packets,
            tx_avg_bps = summary.tx.avg_bits_per_sec,
            "run summary"
        );
        self.ctl.set_state(Role::Stat, WorkerState::Stopped);
        summary
    }
}
