//! TOML configuration for routerbench.
//!
//! Layered like the rest of our tooling: an explicit `--config` path, then
//! the `ROUTERBENCH_CONFIG` environment variable, then the system location,
//! then compiled-in defaults describing the standard two-port lab rig.
//! Command-line overrides are applied on top and the result is validated
//! before it becomes a [`RunConfig`].

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::arp::{ArpPolicy, ArpStrategy};
use crate::device::sim::SimulatorConfig;
use crate::evaluate::{EvalPolicy, DEFAULT_LOSS_THRESHOLD};
use crate::orchestrator::RunConfig;
use crate::topology::{FlowSpec, MacAddr, PortId, PortSpec, Rate, Topology};

pub const CONFIG_ENV: &str = "ROUTERBENCH_CONFIG";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/routerbench/routerbench.toml";

/// Largest payload that still fits a 9000-byte jumbo frame.
const MAX_PAYLOAD: usize = 9000 - 14 - 20 - 8;

/// Longest accepted run (24 h).
pub const MAX_DURATION_SEC: u64 = 24 * 60 * 60;

/// Router interface MACs of the standard lab rig.
const LAB_ROUTER_MAC_SENDER: MacAddr = MacAddr([0x00, 0x32, 0x17, 0x75, 0xa8, 0x80]);
const LAB_ROUTER_MAC_RECEIVER: MacAddr = MacAddr([0x00, 0x32, 0x17, 0x75, 0xa8, 0x84]);

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("sender and receiver both use {0}")]
    SamePort(PortId),

    #[error("run duration must be at least one second")]
    ZeroDuration,

    #[error("run duration of {0}s exceeds the {MAX_DURATION_SEC}s limit")]
    DurationTooLong(u64),

    #[error("completion grace must be at least one second")]
    ZeroGrace,

    #[error("no router MAC for sender {0}: set [sender].peer_mac or use an ARP strategy that probes")]
    MissingPeerMac(PortId),

    #[error("ARP burst must send at least one announcement/probe per port")]
    ZeroBurst,

    #[error("stats reads must be at least one")]
    ZeroReads,

    #[error("loss threshold {0} must be within (0, 1]")]
    Threshold(f64),

    #[error("payload size {0} exceeds jumbo frame limit of {MAX_PAYLOAD} bytes")]
    PayloadSize(usize),

    #[error("simulator {field} {value} is out of range")]
    Simulator { field: &'static str, value: f64 },
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sender: PortSpec,
    pub receiver: PortSpec,
    pub flow: FlowSpec,
    pub run: RunSection,
    pub arp: ArpSection,
    pub timing: TimingSection,
    pub device: DeviceSection,
    /// Rig used by `--simulate`.
    pub simulator: SimulatorConfig,
    pub logging: LoggingSection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sender: PortSpec {
                port: PortId(1),
                local_ip: [11, 11, 11, 2].into(),
                peer_ip: [11, 11, 11, 1].into(),
                peer_mac: Some(LAB_ROUTER_MAC_SENDER),
            },
            receiver: PortSpec {
                port: PortId(0),
                local_ip: [12, 12, 12, 2].into(),
                peer_ip: [12, 12, 12, 1].into(),
                peer_mac: Some(LAB_ROUTER_MAC_RECEIVER),
            },
            flow: FlowSpec {
                source_ip: [16, 0, 0, 1].into(),
                destination_ip: [48, 0, 0, 1].into(),
                udp_source_port: 1234,
                udp_destination_port: 1234,
                payload_size: 1400,
            },
            run: RunSection::default(),
            arp: ArpSection::default(),
            timing: TimingSection::default(),
            device: DeviceSection::default(),
            simulator: SimulatorConfig::default(),
            logging: LoggingSection::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve the configuration source.
    ///
    /// An explicit path must load. The environment variable and system
    /// location fall through to the next source when unreadable.
    pub fn load_layered(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "{} set but file could not be loaded, trying fallback", CONFIG_ENV
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }

    pub fn apply(&mut self, overrides: &Overrides) {
        if let Some(rate) = overrides.rate {
            self.run.rate = rate;
        }
        if let Some(rate) = overrides.fallback_rate {
            self.run.fallback_rate = rate;
            self.run.fallback = true;
        }
        if overrides.no_fallback {
            self.run.fallback = false;
        }
        if let Some(secs) = overrides.duration_sec {
            self.run.duration_sec = secs;
        }
        if let Some(threshold) = overrides.loss_threshold {
            self.run.loss_threshold = threshold;
        }
        if let Some(mac) = overrides.peer_mac {
            self.sender.peer_mac = Some(mac);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sender.port == self.receiver.port {
            return Err(ConfigError::SamePort(self.sender.port));
        }
        if self.run.duration_sec == 0 {
            return Err(ConfigError::ZeroDuration);
        }
        if self.run.duration_sec > MAX_DURATION_SEC {
            return Err(ConfigError::DurationTooLong(self.run.duration_sec));
        }
        if self.timing.completion_grace_sec == 0 {
            return Err(ConfigError::ZeroGrace);
        }
        // Learning the router MAC from probe replies is best-effort; without
        // probes there is nothing to learn it from.
        if self.sender.peer_mac.is_none() && !self.arp.strategy.probes() {
            return Err(ConfigError::MissingPeerMac(self.sender.port));
        }
        let t = self.run.loss_threshold;
        if !(t > 0.0 && t <= 1.0) {
            return Err(ConfigError::Threshold(t));
        }
        if self.flow.payload_size > MAX_PAYLOAD {
            return Err(ConfigError::PayloadSize(self.flow.payload_size));
        }
        if self.arp.burst == 0 {
            return Err(ConfigError::ZeroBurst);
        }
        if self.timing.max_stats_reads == 0 {
            return Err(ConfigError::ZeroReads);
        }
        validate_simulator(&self.simulator)?;
        Ok(())
    }

    pub fn to_run_config(&self) -> Result<RunConfig, ConfigError> {
        self.validate()?;
        Ok(RunConfig {
            topology: Topology {
                sender: self.sender.clone(),
                receiver: self.receiver.clone(),
            },
            flow: self.flow,
            requested_rate: self.run.rate,
            fallback_rate: self.run.fallback.then_some(self.run.fallback_rate),
            duration: Duration::from_secs(self.run.duration_sec),
            connect_timeout: Duration::from_secs(self.device.connect_timeout_sec),
            completion_grace: Duration::from_secs(self.timing.completion_grace_sec),
            arp: ArpPolicy {
                strategy: self.arp.strategy,
                burst: self.arp.burst,
                interval: Duration::from_millis(self.arp.interval_ms),
                probe_payload_size: self.arp.probe_payload_size,
            },
            eval: EvalPolicy {
                loss_threshold: self.run.loss_threshold,
                settle: Duration::from_millis(self.timing.settle_ms),
                max_reads: self.timing.max_stats_reads,
            },
        })
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to serialize configuration")
    }
}

/// Values supplied on the command line.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub rate: Option<Rate>,
    pub fallback_rate: Option<Rate>,
    pub no_fallback: bool,
    pub duration_sec: Option<u64>,
    pub loss_threshold: Option<f64>,
    pub peer_mac: Option<MacAddr>,
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSection {
    /// Requested transmit rate, e.g. `"50gbps"` or `"100%"`.
    pub rate: Rate,
    /// Whether to retry once at `fallback_rate` when the hardware rejects `rate`.
    pub fallback: bool,
    pub fallback_rate: Rate,
    pub duration_sec: u64,
    /// Loss ratio below which the run passes (0.0001 = 0.01 %).
    pub loss_threshold: f64,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            rate: Rate::LINE_RATE,
            fallback: true,
            fallback_rate: Rate::LINE_RATE,
            duration_sec: 30,
            loss_threshold: DEFAULT_LOSS_THRESHOLD,
        }
    }
}

// ---------------------------------------------------------------------------
// ARP
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArpSection {
    pub strategy: ArpStrategy,
    /// Announcements/probes per port.
    pub burst: u32,
    pub interval_ms: u64,
    pub probe_payload_size: usize,
}

impl Default for ArpSection {
    fn default() -> Self {
        let policy = ArpPolicy::default();
        Self {
            strategy: policy.strategy,
            burst: policy.burst,
            interval_ms: policy.interval.as_millis() as u64,
            probe_payload_size: policy.probe_payload_size,
        }
    }
}

// ---------------------------------------------------------------------------
// Timing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingSection {
    /// Delay between stream completion and the first counter read.
    pub settle_ms: u64,
    /// Slack beyond the run duration before the completion wait gives up.
    pub completion_grace_sec: u64,
    /// Counter reads attempted while rx > tx.
    pub max_stats_reads: u32,
}

impl Default for TimingSection {
    fn default() -> Self {
        Self {
            settle_ms: 1000,
            completion_grace_sec: 10,
            max_stats_reads: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSection {
    pub connect_timeout_sec: u64,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            connect_timeout_sec: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

fn validate_simulator(sim: &SimulatorConfig) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&sim.loss_ratio) {
        return Err(ConfigError::Simulator {
            field: "loss_ratio",
            value: sim.loss_ratio,
        });
    }
    if !(sim.time_scale >= 0.0 && sim.time_scale.is_finite()) {
        return Err(ConfigError::Simulator {
            field: "time_scale",
            value: sim.time_scale,
        });
    }
    if !(sim.line_rate_gbps > 0.0 && sim.line_rate_gbps.is_finite()) {
        return Err(ConfigError::Simulator {
            field: "line_rate_gbps",
            value: sim.line_rate_gbps,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    /// `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit logs as JSON lines.
    pub json: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_the_lab_rig() {
        let cfg = Config::default();
        assert_eq!(cfg.sender.port, PortId(1));
        assert_eq!(cfg.sender.local_ip.to_string(), "11.11.11.2");
        assert_eq!(cfg.receiver.port, PortId(0));
        assert_eq!(cfg.receiver.peer_ip.to_string(), "12.12.12.1");
        assert_eq!(
            cfg.sender.peer_mac.map(|m| m.to_string()).as_deref(),
            Some("00:32:17:75:a8:80")
        );
        assert_eq!(
            cfg.receiver.peer_mac.map(|m| m.to_string()).as_deref(),
            Some("00:32:17:75:a8:84")
        );
        assert_eq!(cfg.flow.destination_ip.to_string(), "48.0.0.1");
        assert_eq!(cfg.flow.payload_size, 1400);
        assert_eq!(cfg.run.rate, Rate::LINE_RATE);
        assert_eq!(cfg.run.duration_sec, 30);
        assert_eq!(cfg.run.loss_threshold, 0.0001);
        assert_eq!(cfg.arp.strategy, ArpStrategy::Both);
        assert_eq!(cfg.arp.burst, 3);
        assert_eq!(cfg.arp.interval_ms, 200);
        assert_eq!(cfg.timing.settle_ms, 1000);
        assert_eq!(cfg.timing.completion_grace_sec, 10);
        assert_eq!(cfg.logging.level, "info");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse_full_toml() {
        let toml_str = r#"
[sender]
port = 0
local_ip = "11.11.11.2"
peer_ip = "11.11.11.1"
peer_mac = "00:32:17:75:A8:80"

[receiver]
port = 1
local_ip = "12.12.12.2"
peer_ip = "12.12.12.1"

[flow]
source_ip = "11.11.11.2"
destination_ip = "12.12.12.2"
udp_source_port = 5000
udp_destination_port = 6000
payload_size = 64

[run]
rate = "50gbps"
fallback_rate = "90%"
duration_sec = 60
loss_threshold = 0.001

[arp]
strategy = "gratuitous"
burst = 5
interval_ms = 100

[timing]
settle_ms = 2000
completion_grace_sec = 15
max_stats_reads = 5

[device]
connect_timeout_sec = 3

[simulator]
line_rate_gbps = 40.0
loss_ratio = 0.25
router_cache_warm = false

[logging]
level = "debug"
json = true
"#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.sender.port, PortId(0));
        assert_eq!(
            cfg.sender.peer_mac,
            Some("00:32:17:75:a8:80".parse().unwrap())
        );
        assert_eq!(cfg.receiver.peer_mac, None);
        assert_eq!(cfg.flow.udp_destination_port, 6000);
        assert_eq!(cfg.run.rate, Rate::BitsPerSec(50e9));
        assert_eq!(cfg.run.fallback_rate, Rate::Percent(90.0));
        assert!(cfg.run.fallback);
        assert_eq!(cfg.arp.strategy, ArpStrategy::Gratuitous);
        assert_eq!(cfg.arp.probe_payload_size, 64);
        assert_eq!(cfg.timing.max_stats_reads, 5);
        assert_eq!(cfg.device.connect_timeout_sec, 3);
        assert_eq!(cfg.simulator.line_rate_gbps, 40.0);
        assert!(!cfg.simulator.router_cache_warm);
        assert!(cfg.simulator.probe_replies);
        assert!(cfg.logging.json);

        let run = cfg.to_run_config().unwrap();
        assert_eq!(run.duration, Duration::from_secs(60));
        assert_eq!(run.fallback_rate, Some(Rate::Percent(90.0)));
        assert_eq!(run.arp.interval, Duration::from_millis(100));
        assert_eq!(run.eval.settle, Duration::from_millis(2000));
        assert_eq!(run.completion_grace, Duration::from_secs(15));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let cfg: Config = toml::from_str("[run]\nrate = \"10gbps\"\n").unwrap();
        assert_eq!(cfg.run.rate, Rate::BitsPerSec(10e9));
        assert_eq!(cfg.run.duration_sec, 30);
        assert_eq!(cfg.sender, Config::default().sender);
        assert_eq!(cfg.timing, TimingSection::default());
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn test_load_from_file() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[run]\nduration_sec = 5\n\n[logging]\nlevel = \"warn\"").unwrap();

        let cfg = Config::load_layered(Some(file.path())).unwrap();
        assert_eq!(cfg.run.duration_sec, 5);
        assert_eq!(cfg.logging.level, "warn");
    }

    #[test]
    fn test_load_missing_file_errors() {
        let path = Path::new("/nonexistent/routerbench.toml");
        assert!(Config::load(path).is_err());
        // An explicit path never falls back to defaults.
        assert!(Config::load_layered(Some(path)).is_err());
    }

    #[test]
    fn test_bad_values_are_rejected_at_parse() {
        assert!(toml::from_str::<Config>("[run]\nrate = \"warp 9\"\n").is_err());
        assert!(toml::from_str::<Config>(
            "[sender]\nport = 1\nlocal_ip = \"1.2.3.4\"\npeer_ip = \"1.2.3.1\"\npeer_mac = \"nope\"\n"
        )
        .is_err());
        assert!(toml::from_str::<Config>("[arp]\nstrategy = \"shout\"\n").is_err());
    }

    #[test]
    fn test_validation() {
        let mut cfg = Config::default();
        cfg.receiver.port = cfg.sender.port;
        assert_eq!(cfg.validate(), Err(ConfigError::SamePort(PortId(1))));

        let mut cfg = Config::default();
        cfg.run.duration_sec = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroDuration));

        let mut cfg = Config::default();
        cfg.run.loss_threshold = 0.0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Threshold(_))));

        let mut cfg = Config::default();
        cfg.arp.burst = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroBurst));

        let mut cfg = Config::default();
        cfg.flow.payload_size = 9000;
        assert_eq!(cfg.validate(), Err(ConfigError::PayloadSize(9000)));

        let mut cfg = Config::default();
        cfg.simulator.loss_ratio = 1.5;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Simulator { field: "loss_ratio", .. })
        ));
    }

    #[test]
    fn test_duration_is_capped() {
        let mut cfg = Config::default();
        cfg.run.duration_sec = MAX_DURATION_SEC;
        assert!(cfg.validate().is_ok());

        cfg.run.duration_sec = MAX_DURATION_SEC + 1;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::DurationTooLong(MAX_DURATION_SEC + 1))
        );

        cfg.run.duration_sec = u64::MAX;
        assert!(cfg.to_run_config().is_err());
    }

    #[test]
    fn test_completion_timeout_exceeds_duration() {
        let mut cfg = Config::default();
        cfg.timing.completion_grace_sec = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroGrace));

        cfg.timing.completion_grace_sec = 1;
        let run = cfg.to_run_config().unwrap();
        assert!(run.duration + run.completion_grace > run.duration);
    }

    #[test]
    fn test_router_mac_source_is_required() {
        let mut cfg = Config::default();
        cfg.sender.peer_mac = None;
        // Probing strategies may learn it.
        assert!(cfg.validate().is_ok());
        cfg.arp.strategy = ArpStrategy::Probe;
        assert!(cfg.validate().is_ok());

        cfg.arp.strategy = ArpStrategy::Gratuitous;
        assert_eq!(cfg.validate(), Err(ConfigError::MissingPeerMac(PortId(1))));
    }

    #[test]
    fn test_simulator_time_scale_validated() {
        let mut cfg = Config::default();
        cfg.simulator.time_scale = -1.0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Simulator { field: "time_scale", .. })
        ));
    }

    #[test]
    fn test_overrides() {
        let mut cfg = Config::default();
        cfg.apply(&Overrides {
            rate: Some("200gbps".parse().unwrap()),
            duration_sec: Some(5),
            loss_threshold: Some(0.01),
            peer_mac: Some("00:32:17:75:a8:80".parse().unwrap()),
            ..Overrides::default()
        });
        assert_eq!(cfg.run.rate, Rate::BitsPerSec(200e9));
        assert_eq!(cfg.run.duration_sec, 5);
        assert_eq!(cfg.run.loss_threshold, 0.01);
        assert!(cfg.sender.peer_mac.is_some());

        cfg.apply(&Overrides {
            no_fallback: true,
            ..Overrides::default()
        });
        assert_eq!(cfg.to_run_config().unwrap().fallback_rate, None);
    }

    #[test]
    fn test_toml_round_trip() {
        let mut cfg = Config::default();
        cfg.sender.peer_mac = Some("00:32:17:75:a8:80".parse().unwrap());
        let text = cfg.to_toml().unwrap();
        assert!(text.contains("rate = \"100%\""));
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back, cfg);
    }
}
