//! # pktprobe
//!
//! Constant-bitrate probe generator and round-trip latency meter. Runs the
//! RX, TX and STAT roles on their own threads over an in-process loop-back
//! port and prints a JSON summary when the run ends.
//!
//! ## Usage
//!
//! ```bash
//! # 1 Mbit/s for ten seconds, three execution units
//! pktprobe --rate 1m --duration 10
//!
//! # Combined RX/TX unit, records to CSV, drop every 50th packet
//! pktprobe --units 2 --records probes.csv --drop-every 50
//!
//! # Everything from a file, CLI flags override
//! pktprobe --config pktprobe.toml --rate 10M
//! ```
//!
//! Ctrl-C or SIGTERM stops the run; the summary still reflects the
//! partial data.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;

use pktprobe_core::clock::{CycleClock, TscClock};
use pktprobe_core::config::{ProbeConfig, ProbeConfigInput};
use pktprobe_core::control::Controller;
use pktprobe_core::engine::{EngineConfig, Session};
use pktprobe_core::port::loopback;
use pktprobe_core::sink::{CsvSink, NullSink, RecordSink};
use pktprobe_core::template::ProbeTemplate;

/// Synthetic traffic generator and latency prober.
#[derive(Parser, Debug)]
#[command(name = "pktprobe", version, about)]
struct Cli {
    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Target bitrate: digits with an optional k/m/g binary suffix.
    #[arg(long)]
    rate: Option<String>,

    /// Execution units available (2 = combined RX/TX, 3+ = split).
    #[arg(long)]
    units: Option<usize>,

    /// Stop after this many seconds.
    #[arg(long)]
    duration: Option<u64>,

    /// Append correlation records to this CSV file.
    #[arg(long)]
    records: Option<PathBuf>,

    /// Probe slot pool size (power of two).
    #[arg(long)]
    pool_size: Option<usize>,

    /// Probe loss timeout in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,

    #[arg(long, allow_negative_numbers = true)]
    tx_port: Option<i64>,

    #[arg(long, allow_negative_numbers = true)]
    rx_port: Option<i64>,

    /// Loop-back loss injection: drop every Nth packet (0 = never).
    #[arg(long, default_value_t = 0)]
    drop_every: u64,
}

fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    // ── Configuration ───────────────────────────────────────────
    let cli = Cli::parse();
    let cfg = load_config(&cli)?;

    tracing::info!(
        rate = %cfg.rate,
        units = cfg.units,
        tx_port = %cfg.tx_port,
        rx_port = %cfg.rx_port,
        pool_size = cfg.pool_size,
        timeout_ms = cfg.probe_timeout.as_millis() as u64,
        records = ?cfg.records,
        duration = ?cfg.duration,
        "pktprobe starting"
    );

    // ── Graceful shutdown ───────────────────────────────────────
    let ctl = Arc::new(Controller::new());
    {
        let ctl = ctl.clone();
        ctrlc::set_handler(move || {
            if ctl.request_stop() {
                tracing::info!("stop requested, shutting down...");
            }
        })
        .context("failed to install signal handler")?;
    }

    // ── Record sink ─────────────────────────────────────────────
    let sink: Box<dyn RecordSink> = match &cfg.records {
        Some(path) => Box::new(
            CsvSink::append(path)
                .with_context(|| format!("failed to open record file {}", path.display()))?,
        ),
        None => Box::new(NullSink),
    };

    // ── Roles ───────────────────────────────────────────────────
    let clock = TscClock::new();
    tracing::info!(hz = clock.hz(), "cycle clock calibrated");

    let template = ProbeTemplate::build(&cfg.packet)?;
    let (tx_port, rx_port) = loopback(cfg.pool_size, template.wire_size());
    let tx_port = tx_port.with_drop_every(cli.drop_every);

    let session = Session::launch(
        cfg.units,
        EngineConfig::from(&cfg),
        template,
        tx_port,
        rx_port,
        clock,
        ctl.clone(),
        sink,
    )?;

    // ── Run window ──────────────────────────────────────────────
    let started = Instant::now();
    while !session.is_finished() {
        if cfg.duration.is_some_and(|limit| started.elapsed() >= limit) && ctl.request_stop() {
            tracing::info!("run duration reached");
        }
        thread::sleep(Duration::from_millis(50));
    }

    let report = session.join();
    println!("{}", serde_json::to_string_pretty(&report)?);
    tracing::info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        "pktprobe stopped"
    );

    Ok(())
}

/// File values first, then CLI overrides, then validation.
fn load_config(cli: &Cli) -> anyhow::Result<ProbeConfig> {
    let mut input = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            ProbeConfigInput::from_toml_str(&text)
                .with_context(|| format!("failed to parse config {}", path.display()))?
        }
        None => ProbeConfigInput::default(),
    };

    if let Some(rate) = &cli.rate {
        input.rate = Some(rate.clone());
    }
    if let Some(records) = &cli.records {
        input.records = Some(records.clone());
    }
    input.units = cli.units.or(input.units);
    input.duration_secs = cli.duration.or(input.duration_secs);
    input.pool_size = cli.pool_size.or(input.pool_size);
    input.probe_timeout_ms = cli.timeout_ms.or(input.probe_timeout_ms);
    input.tx_port = cli.tx_port.or(input.tx_port);
    input.rx_port = cli.rx_port.or(input.rx_port);

    Ok(input.resolve()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_defaults() {
        let cli = Cli::parse_from(["pktprobe", "--rate", "10k", "--units", "2", "--pool-size", "64"]);
        let cfg = load_config(&cli).unwrap();
        assert_eq!(cfg.rate, "10k");
        assert_eq!(cfg.units, 2);
        assert_eq!(cfg.pool_size, 64);
    }

    #[test]
    fn cli_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pktprobe.toml");
        std::fs::write(&path, "rate = \"1m\"\nunits = 4\nstat_period_ms = 500\n").unwrap();

        let cli = Cli::parse_from([
            "pktprobe",
            "--config",
            path.to_str().unwrap(),
            "--rate",
            "2m",
        ]);
        let cfg = load_config(&cli).unwrap();
        assert_eq!(cfg.rate, "2m");
        assert_eq!(cfg.units, 4);
        assert_eq!(cfg.stat_period, Duration::from_millis(500));
    }

    #[test]
    fn negative_port_is_fatal() {
        let cli = Cli::parse_from(["pktprobe", "--tx-port", "-1"]);
        let err = load_config(&cli).unwrap_err();
        assert!(err.to_string().contains("invalid port handle -1"));
    }
}
