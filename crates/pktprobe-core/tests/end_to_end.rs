//! # End-to-end runs over the loop-back port
//!
//! The deterministic tests drive a combined RX/TX worker on the calling
//! thread with a [`ManualClock`]; the threaded tests launch a full session on
//! the TSC and stop it after a short window.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use pktprobe_core::clock::{CycleClock, ManualClock, TscClock};
use pktprobe_core::config::ProbeConfig;
use pktprobe_core::control::{Controller, PollPolicy, Role, WorkerState};
use pktprobe_core::engine::{EngineConfig, RxPath, RxTxWorker, Session, TxPath};
use pktprobe_core::error::{ConfigError, EngineError};
use pktprobe_core::port::{loopback, LoopbackTx, PacketBuffer, Port};
use pktprobe_core::sink::{CsvSink, NullSink};
use pktprobe_core::stats::TrafficCounters;
use pktprobe_core::template::{PacketConfig, ProbeTemplate};

// ─── Helpers ────────────────────────────────────────────────────────────────

/// Loop-back sender that raises the stop flag once `remaining` packets went
/// out.
struct StopAfter {
    inner: LoopbackTx,
    ctl: Arc<Controller>,
    remaining: usize,
}

impl Port for StopAfter {
    fn alloc(&mut self) -> Option<PacketBuffer> {
        self.inner.alloc()
    }

    fn send(&mut self, batch: &mut Vec<PacketBuffer>) -> usize {
        let sent = self.inner.send(batch);
        self.remaining = self.remaining.saturating_sub(sent);
        if self.remaining == 0 {
            self.ctl.request_stop();
        }
        sent
    }

    fn receive(&mut self, _max: usize, _out: &mut Vec<PacketBuffer>) -> usize {
        0
    }
}

fn parse_records(text: &str) -> Vec<(u64, u32, u64)> {
    text.lines()
        .map(|line| {
            let mut fields = line.split(',');
            let send = fields.next().unwrap().parse().unwrap();
            let index = fields.next().unwrap().parse().unwrap();
            let recv = fields.next().unwrap().parse().unwrap();
            (send, index, recv)
        })
        .collect()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn run_for(session: Session, window: Duration) -> pktprobe_core::engine::SessionReport {
    thread::sleep(window);
    session.controller().request_stop();
    session.join()
}

// ─── Deterministic ──────────────────────────────────────────────────────────

#[test]
fn paced_probes_round_trip() {
    let clock = ManualClock::new(1_000_000);
    clock.set(1_000);
    let ctl = Arc::new(Controller::new());
    ctl.set_state(Role::Stat, WorkerState::Inited);

    let template = ProbeTemplate::build(&PacketConfig::default()).unwrap();
    let counters = TrafficCounters::new();
    let (tx_port, rx_port) = loopback(64, template.wire_size());

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("probes.csv");
    let engine = EngineConfig {
        rate: "1m".into(),
        pool_size: 16,
        ..EngineConfig::default()
    };
    let tx = TxPath::new(
        StopAfter {
            inner: tx_port,
            ctl: ctl.clone(),
            remaining: 20,
        },
        template.clone(),
        clock.clone(),
        Box::new(CsvSink::append(&path).unwrap()),
        counters.clone(),
        &engine,
    )
    .unwrap();
    let cycles_per_byte = tx.scheduler().cycles_per_byte();
    let rx = RxPath::new(rx_port, template, counters.clone(), 32);

    let (rx_report, tx_report) = RxTxWorker::new(ctl.clone(), rx, tx, PollPolicy::spin()).run();

    assert_eq!(tx_report.packets_sent, 20);
    assert_eq!(tx_report.probes.completed, 20);
    assert_eq!(tx_report.probes.violations, 0);
    assert_eq!(tx_report.outstanding, 0);
    assert_eq!(rx_report.probes, 20);
    assert_eq!(counters.tx.packets(), 20);
    assert_eq!(counters.rx.packets(), 20);
    assert_eq!(ctl.state(Role::Rx), WorkerState::Stopped);
    assert_eq!(ctl.state(Role::Tx), WorkerState::Stopped);

    let records = parse_records(&std::fs::read_to_string(&path).unwrap());
    assert_eq!(records.len(), 20);
    assert!(records.iter().all(|&(send, _, recv)| recv >= send && recv > 0));

    // No probe leaves before the previous one's gate.
    let mut sends: Vec<u64> = records.iter().map(|r| r.0).collect();
    sends.sort_unstable();
    for pair in sends.windows(2) {
        assert!(pair[1] - pair[0] >= cycles_per_byte * 64);
    }
}

#[test]
fn data_plane_waits_for_stat() {
    let clock = ManualClock::new(1_000_000);
    let ctl = Controller::new();
    let policy = PollPolicy::with_backoff(Duration::from_micros(1), Duration::from_micros(64))
        .bounded(10_000);

    for _ in 0..3 {
        ctl.enter(&[Role::Rx, Role::Tx], &policy, &clock);
        assert_eq!(ctl.state(Role::Rx), WorkerState::Uninit);
        assert_eq!(ctl.state(Role::Tx), WorkerState::Uninit);
    }
    assert!(clock.cycles() > 0);
}

// ─── Threaded sessions ──────────────────────────────────────────────────────

#[test]
fn split_session_on_tsc() {
    init_tracing();
    let mut cfg = ProbeConfig::from_toml_str(
        r#"
        rate = "1m"
        units = 3
        pool_size = 1024
        stat_period_ms = 50
        "#,
    )
    .unwrap();
    cfg.probe_timeout = Duration::from_millis(500);

    let ctl = Arc::new(Controller::new());
    let session = Session::loopback(&cfg, TscClock::new(), ctl.clone(), Box::new(NullSink)).unwrap();
    let report = run_for(session, Duration::from_millis(300));

    let tx = report.tx.expect("tx report");
    let rx = report.rx.expect("rx report");
    let summary = report.summary.expect("run summary");

    assert!(tx.packets_sent > 0);
    assert!(tx.error.is_none());
    assert!(rx.probes <= tx.packets_sent);
    assert_eq!(
        tx.probes.completed + tx.probes.timed_out + tx.outstanding as u64,
        tx.probes.issued
    );
    assert_eq!(summary.tx.total_packets, tx.packets_sent);
    assert!(summary.duration_secs > 0.0);
    for role in Role::ALL {
        assert_eq!(ctl.state(role), WorkerState::Stopped);
    }
}

#[test]
fn lossy_session_records_timeouts() {
    init_tracing();
    let template = ProbeTemplate::build(&PacketConfig::default()).unwrap();
    let (tx_port, rx_port) = loopback(256, template.wire_size());
    let tx_port = tx_port.with_drop_every(5);
    let engine = EngineConfig {
        rate: "1m".into(),
        pool_size: 256,
        probe_timeout: Duration::from_millis(20),
        stat_period: Duration::from_millis(50),
        ..EngineConfig::default()
    };

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("probes.csv");
    let ctl = Arc::new(Controller::new());
    let session = Session::launch(
        2,
        engine,
        template,
        tx_port,
        rx_port,
        TscClock::new(),
        ctl.clone(),
        Box::new(CsvSink::append(&path).unwrap()),
    )
    .unwrap();
    let report = run_for(session, Duration::from_millis(300));

    let tx = report.tx.expect("tx report");
    assert!(tx.probes.timed_out > 0);
    assert!(tx.probes.completed > 0);

    let records = parse_records(&std::fs::read_to_string(&path).unwrap());
    let lost = records.iter().filter(|r| r.2 == 0).count() as u64;
    assert_eq!(lost, tx.probes.timed_out);
    assert_eq!(records.len() as u64, tx.probes.completed + tx.probes.timed_out);
}

#[test]
fn configuration_errors_surface_before_start() {
    let ctl = Arc::new(Controller::new());

    let cfg = ProbeConfig {
        units: 1,
        ..ProbeConfig::default()
    };
    let err = Session::loopback(&cfg, ManualClock::new(1_000), ctl.clone(), Box::new(NullSink))
        .err()
        .unwrap();
    assert!(matches!(err, EngineError::Config(ConfigError::InvalidUnits(1))));

    let cfg = ProbeConfig {
        rate: "fast".into(),
        ..ProbeConfig::default()
    };
    let err = Session::loopback(&cfg, ManualClock::new(1_000), ctl.clone(), Box::new(NullSink))
        .err()
        .unwrap();
    assert!(matches!(err, EngineError::Config(ConfigError::InvalidRate(_))));

    for role in Role::ALL {
        assert_eq!(ctl.state(role), WorkerState::Uninit);
    }
}
