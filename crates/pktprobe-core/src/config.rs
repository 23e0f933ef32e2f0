//! Run configuration.
//!
//! [`ProbeConfigInput`] is the raw TOML form, every field optional so CLI
//! flags can be layered on top. [`ProbeConfigInput::resolve`] validates it
//! into a [`ProbeConfig`]; any error there is fatal and surfaces before a
//! role starts.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::port::PortId;
use crate::rate::parse_rate;
use crate::template::{PacketConfig, PacketConfigInput};

pub const DEFAULT_RATE: &str = "1m";
pub const DEFAULT_UNITS: usize = 3;
pub const DEFAULT_POOL_SIZE: usize = 8192;
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_STAT_PERIOD: Duration = Duration::from_millis(200);
pub const DEFAULT_RETRY_LIMIT: u32 = 8;
pub const DEFAULT_RX_BURST: usize = 32;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProbeConfigInput {
    pub rate: Option<String>,
    pub units: Option<usize>,
    pub tx_port: Option<i64>,
    pub rx_port: Option<i64>,
    pub pool_size: Option<usize>,
    pub probe_timeout_ms: Option<u64>,
    pub stat_period_ms: Option<u64>,
    pub retry_limit: Option<u32>,
    pub rx_burst: Option<usize>,
    pub records: Option<PathBuf>,
    pub duration_secs: Option<u64>,
    pub packet: PacketConfigInput,
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Rate string as entered; validated, parsed again by the TX role.
    pub rate: String,
    pub units: usize,
    pub tx_port: PortId,
    pub rx_port: PortId,
    pub pool_size: usize,
    pub probe_timeout: Duration,
    pub stat_period: Duration,
    pub retry_limit: u32,
    pub rx_burst: usize,
    pub records: Option<PathBuf>,
    pub duration: Option<Duration>,
    pub packet: PacketConfig,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig {
            rate: DEFAULT_RATE.to_string(),
            units: DEFAULT_UNITS,
            tx_port: PortId::default(),
            rx_port: PortId::default(),
            pool_size: DEFAULT_POOL_SIZE,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            stat_period: DEFAULT_STAT_PERIOD,
            retry_limit: DEFAULT_RETRY_LIMIT,
            rx_burst: DEFAULT_RX_BURST,
            records: None,
            duration: None,
            packet: PacketConfig::default(),
        }
    }
}

impl ProbeConfigInput {
    /// Parses without validating, so callers can layer overrides on top.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(input)?)
    }

    pub fn resolve(self) -> Result<ProbeConfig, ConfigError> {
        let rate = self
            .rate
            .map(|r| r.trim().to_string())
            .unwrap_or_else(|| DEFAULT_RATE.to_string());
        parse_rate(&rate)?;

        let units = self.units.unwrap_or(DEFAULT_UNITS);
        if units < 2 {
            return Err(ConfigError::InvalidUnits(units));
        }

        let pool_size = self.pool_size.unwrap_or(DEFAULT_POOL_SIZE);
        if pool_size == 0 || !pool_size.is_power_of_two() || pool_size > u32::MAX as usize {
            return Err(ConfigError::InvalidPoolSize(pool_size));
        }

        Ok(ProbeConfig {
            rate,
            units,
            tx_port: PortId::new(self.tx_port.unwrap_or(0))?,
            rx_port: PortId::new(self.rx_port.unwrap_or(0))?,
            pool_size,
            probe_timeout: self
                .probe_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_PROBE_TIMEOUT),
            stat_period: self
                .stat_period_ms
                .filter(|&ms| ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_STAT_PERIOD),
            retry_limit: self.retry_limit.unwrap_or(DEFAULT_RETRY_LIMIT).max(1),
            rx_burst: self.rx_burst.unwrap_or(DEFAULT_RX_BURST).max(1),
            records: self.records.filter(|p| !p.as_os_str().is_empty()),
            duration: self.duration_secs.map(Duration::from_secs),
            packet: self.packet.resolve()?,
        })
    }
}

impl ProbeConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        ProbeConfigInput::from_toml_str(input)?.resolve()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn empty_config_uses_defaults() {
        let cfg = ProbeConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.rate, DEFAULT_RATE);
        assert_eq!(cfg.units, 3);
        assert_eq!(cfg.pool_size, 8192);
        assert_eq!(cfg.probe_timeout, Duration::from_secs(2));
        assert_eq!(cfg.stat_period, Duration::from_millis(200));
        assert_eq!(cfg.packet, PacketConfig::default());
        assert!(cfg.records.is_none());
    }

    #[test]
    fn parse_toml_config_full() {
        let toml = r#"
            rate = "10M"
            units = 2
            tx_port = 1
            rx_port = 2
            pool_size = 256
            probe_timeout_ms = 500
            stat_period_ms = 1000
            retry_limit = 4
            records = "/tmp/probes.csv"
            duration_secs = 30

            [packet]
            src_mac = "02:00:00:00:00:01"
            dst_ip = "10.0.0.2"
            dst_port = 9000
            pkt_len = 128
        "#;
        let cfg = ProbeConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.rate, "10M");
        assert_eq!(cfg.units, 2);
        assert_eq!(cfg.tx_port.get(), 1);
        assert_eq!(cfg.rx_port.get(), 2);
        assert_eq!(cfg.pool_size, 256);
        assert_eq!(cfg.probe_timeout, Duration::from_millis(500));
        assert_eq!(cfg.stat_period, Duration::from_secs(1));
        assert_eq!(cfg.retry_limit, 4);
        assert_eq!(cfg.records.as_deref(), Some(std::path::Path::new("/tmp/probes.csv")));
        assert_eq!(cfg.duration, Some(Duration::from_secs(30)));
        assert_eq!(cfg.packet.src_mac, [2, 0, 0, 0, 0, 1]);
        assert_eq!(cfg.packet.dst_ip, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(cfg.packet.dst_port, 9000);
        assert_eq!(cfg.packet.pkt_len, 128);
        assert_eq!(cfg.packet.src_port, 1024);
    }

    #[test]
    fn fatal_errors_surface() {
        assert!(matches!(
            ProbeConfig::from_toml_str(r#"rate = "-1""#),
            Err(ConfigError::InvalidRate(_))
        ));
        assert!(matches!(
            ProbeConfig::from_toml_str("tx_port = -1"),
            Err(ConfigError::InvalidPort(-1))
        ));
        assert!(matches!(
            ProbeConfig::from_toml_str("pool_size = 100"),
            Err(ConfigError::InvalidPoolSize(100))
        ));
        assert!(matches!(
            ProbeConfig::from_toml_str("units = 1"),
            Err(ConfigError::InvalidUnits(1))
        ));
        assert!(matches!(
            ProbeConfig::from_toml_str("[packet]\nsrc_mac = \"nope\""),
            Err(ConfigError::InvalidMac(_))
        ));
        assert!(matches!(
            ProbeConfig::from_toml_str("rate = ["),
            Err(ConfigError::Toml(_))
        ));
    }
}
