//! In-process traffic generator with a toy router wired between its ports.
//!
//! The router forwards the stream from the sender port to the other owned
//! port only when
//! - the stream's destination MAC is the router's interface on the sender
//!   link, and
//! - the router has a neighbour entry for the egress port, either because
//!   its cache was already warm or because an announcement or probe from
//!   that port reached it during this session.
//!
//! Packet counts follow from rate, duration and frame size. Faults can be
//! injected to exercise every failure path of the orchestrator, and every
//! call is recorded so tests can assert on sequencing.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{DeviceError, DeviceSession, PortInfo, PortStats, ProbeReport, TxMode};
use crate::packet::{parse_arp_sender, PacketTemplate};
use crate::topology::{MacAddr, PortId, Rate};

/// Preamble, SFD, inter-frame gap and FCS added to every frame on the wire.
const L1_OVERHEAD_BYTES: usize = 24;
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);
const LAB_ROUTER_MACS: [MacAddr; 2] = [
    MacAddr([0x00, 0x32, 0x17, 0x75, 0xa8, 0x84]),
    MacAddr([0x00, 0x32, 0x17, 0x75, 0xa8, 0x80]),
];

/// Behaviour of the simulated rig.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Number of ports on the generator.
    pub port_count: u8,
    /// Line rate of every port.
    pub line_rate_gbps: f64,
    /// Fraction of forwarded packets the router drops (0.0..=1.0).
    pub loss_ratio: f64,
    /// Whether the router already has neighbour entries for both links.
    pub router_cache_warm: bool,
    /// Whether the router answers echo probes.
    pub probe_replies: bool,
    /// Whether the router installs bindings from gratuitous ARP.
    pub accepts_gratuitous_arp: bool,
    /// Multiplier applied to every simulated wait (1.0 = real time, 0.0 = instant).
    pub time_scale: f64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            port_count: 2,
            line_rate_gbps: 100.0,
            loss_ratio: 0.0,
            router_cache_warm: true,
            probe_replies: true,
            accepts_gratuitous_arp: true,
            time_scale: 1.0,
        }
    }
}

/// Failures to inject.
#[derive(Debug, Clone, Default)]
pub struct Faults {
    pub fail_connect: bool,
    pub fail_acquire: bool,
    pub fail_service_mode: bool,
    pub fail_add_stream: bool,
    /// Reject every start, whatever the rate.
    pub reject_all_rates: bool,
    /// Streams never report completion.
    pub never_complete: bool,
    /// Number of stats reads that return receive counters ahead of transmit.
    pub counter_race_reads: u32,
}

#[derive(Debug)]
struct ActiveRun {
    duration: Duration,
    deltas: Vec<(PortId, PortStats)>,
}

#[derive(Debug, Default)]
struct SimState {
    connected: bool,
    owned: HashSet<PortId>,
    service_mode: HashSet<PortId>,
    l3: HashMap<PortId, (Ipv4Addr, Ipv4Addr)>,
    router_learned: HashSet<PortId>,
    streams: HashMap<PortId, (PacketTemplate, TxMode)>,
    active: Option<ActiveRun>,
    stats: HashMap<PortId, PortStats>,
    race_reads_left: u32,
    calls: Vec<&'static str>,
}

/// Cheaply cloneable handle; clones share the same device state.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    config: SimulatorConfig,
    faults: Faults,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedDevice {
    pub fn new(config: SimulatorConfig) -> Self {
        Self::with_faults(config, Faults::default())
    }

    pub fn with_faults(config: SimulatorConfig, faults: Faults) -> Self {
        let state = SimState {
            race_reads_left: faults.counter_race_reads,
            ..SimState::default()
        };
        Self {
            config,
            faults,
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Hardware address of a generator port.
    pub fn port_mac(port: PortId) -> MacAddr {
        MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, port.0])
    }

    /// Hardware address of the router interface facing `port`. Ports 0 and 1
    /// face the lab router's 12.12.12.1 and 11.11.11.1 interfaces.
    pub fn router_mac(port: PortId) -> MacAddr {
        LAB_ROUTER_MACS
            .get(usize::from(port.0))
            .copied()
            .unwrap_or(MacAddr([0x02, 0x52, 0x54, 0x00, 0x01, port.0]))
    }

    /// Operations invoked so far, in order.
    pub fn calls(&self) -> Vec<&'static str> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.lock().calls.iter().filter(|c| **c == op).count()
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn owned_ports(&self) -> Vec<PortId> {
        let mut ports: Vec<PortId> = self.lock().owned.iter().copied().collect();
        ports.sort();
        ports
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record `op` and check the session is up.
    fn enter(&self, op: &'static str) -> Result<MutexGuard<'_, SimState>, DeviceError> {
        let mut state = self.lock();
        state.calls.push(op);
        if !state.connected {
            return Err(DeviceError::NotConnected);
        }
        Ok(state)
    }

    fn scaled(&self, d: Duration) -> Duration {
        Duration::try_from_secs_f64(d.as_secs_f64() * self.config.time_scale.max(0.0))
            .unwrap_or(Duration::MAX)
    }

    fn line_rate_bps(&self) -> f64 {
        self.config.line_rate_gbps * 1e9
    }

    fn check_port(&self, op: &'static str, port: PortId) -> Result<(), DeviceError> {
        if port.0 >= self.config.port_count {
            return Err(DeviceError::Rejected {
                op,
                port,
                reason: format!("no such port (device has {})", self.config.port_count),
            });
        }
        Ok(())
    }

    fn check_owned(state: &SimState, op: &'static str, port: PortId) -> Result<(), DeviceError> {
        if !state.owned.contains(&port) {
            return Err(DeviceError::Rejected {
                op,
                port,
                reason: "port is not owned by this session".to_string(),
            });
        }
        Ok(())
    }

    fn rate_bps(&self, rate: &Rate, frame_len: usize) -> f64 {
        match *rate {
            Rate::Percent(p) => self.line_rate_bps() * p / 100.0,
            Rate::BitsPerSec(bps) => bps,
            Rate::PacketsPerSec(pps) => pps * wire_bits(frame_len),
        }
    }
}

fn wire_bits(frame_len: usize) -> f64 {
    ((frame_len + L1_OVERHEAD_BYTES) * 8) as f64
}

#[async_trait]
impl DeviceSession for SimulatedDevice {
    async fn connect(&self) -> Result<(), DeviceError> {
        let mut state = self.lock();
        state.calls.push("connect");
        if self.faults.fail_connect {
            return Err(DeviceError::Session(
                "connection refused by traffic generator".to_string(),
            ));
        }
        state.connected = true;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DeviceError> {
        let mut state = self.lock();
        state.calls.push("disconnect");
        state.connected = false;
        state.owned.clear();
        state.service_mode.clear();
        Ok(())
    }

    async fn acquire(&self, ports: &[PortId], force: bool) -> Result<(), DeviceError> {
        let mut state = self.enter("acquire")?;
        if self.faults.fail_acquire {
            return Err(DeviceError::Session(format!(
                "ports {:?} are owned by another user (force={})",
                ports, force
            )));
        }
        for &port in ports {
            self.check_port("acquire", port)?;
        }
        state.owned.extend(ports.iter().copied());
        Ok(())
    }

    async fn release(&self, ports: &[PortId]) -> Result<(), DeviceError> {
        let mut state = self.lock();
        state.calls.push("release");
        for port in ports {
            state.owned.remove(port);
        }
        Ok(())
    }

    async fn reset(&self, ports: &[PortId]) -> Result<(), DeviceError> {
        let mut state = self.enter("reset")?;
        for &port in ports {
            Self::check_owned(&state, "reset", port)?;
            state.streams.remove(&port);
            state.service_mode.remove(&port);
            state.l3.remove(&port);
        }
        state.active = None;
        Ok(())
    }

    async fn clear_stats(&self) -> Result<(), DeviceError> {
        let mut state = self.enter("clear_stats")?;
        state.stats.clear();
        Ok(())
    }

    async fn port_info(&self, ports: &[PortId]) -> Result<Vec<PortInfo>, DeviceError> {
        let _state = self.enter("port_info")?;
        ports
            .iter()
            .map(|&port| {
                self.check_port("port_info", port)?;
                Ok(PortInfo {
                    port,
                    hw_mac: Self::port_mac(port),
                    speed_gbps: self.config.line_rate_gbps as u32,
                    driver: "net_sim".to_string(),
                })
            })
            .collect()
    }

    async fn set_service_mode(&self, ports: &[PortId], enabled: bool) -> Result<(), DeviceError> {
        let mut state = self.enter("set_service_mode")?;
        for &port in ports {
            Self::check_owned(&state, "set_service_mode", port)?;
        }
        if self.faults.fail_service_mode {
            return Err(DeviceError::Session(
                "service mode is not supported by this port firmware".to_string(),
            ));
        }
        for &port in ports {
            if enabled {
                state.service_mode.insert(port);
            } else {
                state.service_mode.remove(&port);
            }
        }
        Ok(())
    }

    async fn set_l3_mode(
        &self,
        port: PortId,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
    ) -> Result<(), DeviceError> {
        let mut state = self.enter("set_l3_mode")?;
        Self::check_owned(&state, "set_l3_mode", port)?;
        state.l3.insert(port, (src_ip, dst_ip));
        Ok(())
    }

    async fn push_packets(&self, port: PortId, frames: &[Bytes]) -> Result<(), DeviceError> {
        let mut state = self.enter("push_packets")?;
        Self::check_owned(&state, "push_packets", port)?;
        if !state.service_mode.contains(&port) {
            return Err(DeviceError::Rejected {
                op: "push_packets",
                port,
                reason: "port is not in service mode".to_string(),
            });
        }
        for frame in frames {
            if let Some((mac, ip)) = parse_arp_sender(frame) {
                debug!(%port, %mac, %ip, "router saw ARP announcement");
                if self.config.accepts_gratuitous_arp && mac == Self::port_mac(port) {
                    state.router_learned.insert(port);
                }
            }
        }
        Ok(())
    }

    async fn probe(
        &self,
        port: PortId,
        dst_ip: Ipv4Addr,
        _payload_size: usize,
        count: u32,
    ) -> Result<ProbeReport, DeviceError> {
        let replies = {
            let mut state = self.enter("probe")?;
            Self::check_owned(&state, "probe", port)?;
            if !state.service_mode.contains(&port) {
                return Err(DeviceError::Rejected {
                    op: "probe",
                    port,
                    reason: "port is not in service mode".to_string(),
                });
            }
            let Some(&(_, peer)) = state.l3.get(&port) else {
                return Err(DeviceError::Rejected {
                    op: "probe",
                    port,
                    reason: "port has no L3 configuration".to_string(),
                });
            };
            let replies = self.config.probe_replies && peer == dst_ip;
            if replies {
                // Answering an echo request means resolving the requester.
                state.router_learned.insert(port);
            }
            replies
        };

        if !replies {
            tokio::time::sleep(self.scaled(PROBE_TIMEOUT)).await;
            return Err(DeviceError::Timeout {
                op: "probe",
                after: PROBE_TIMEOUT,
            });
        }
        Ok(ProbeReport {
            sent: count,
            received: count,
            peer_mac: Some(Self::router_mac(port)),
        })
    }

    async fn add_stream(
        &self,
        port: PortId,
        template: &PacketTemplate,
        mode: TxMode,
    ) -> Result<(), DeviceError> {
        let mut state = self.enter("add_stream")?;
        Self::check_owned(&state, "add_stream", port)?;
        if self.faults.fail_add_stream {
            return Err(DeviceError::Rejected {
                op: "add_stream",
                port,
                reason: "stream table full".to_string(),
            });
        }
        let frame = template.encode();
        debug!(%port, bytes = frame.len(), ?mode, "stream programmed");
        state.streams.insert(port, (template.clone(), mode));
        Ok(())
    }

    async fn start(
        &self,
        ports: &[PortId],
        rate: &Rate,
        duration: Duration,
    ) -> Result<(), DeviceError> {
        let mut state = self.enter("start")?;
        if self.faults.reject_all_rates {
            return Err(DeviceError::RateRejected {
                rate: *rate,
                reason: "port is not capable of transmitting".to_string(),
            });
        }

        let mut deltas = Vec::new();
        for &sender in ports {
            Self::check_owned(&state, "start", sender)?;
            if state.service_mode.contains(&sender) {
                return Err(DeviceError::Rejected {
                    op: "start",
                    port: sender,
                    reason: "port is in service mode".to_string(),
                });
            }
            let Some((template, mode)) = state.streams.get(&sender).cloned() else {
                return Err(DeviceError::Rejected {
                    op: "start",
                    port: sender,
                    reason: "no streams programmed".to_string(),
                });
            };

            let frame_len = template.frame_len();
            let bps = self.rate_bps(rate, frame_len);
            if bps > self.line_rate_bps() * (1.0 + 1e-9) {
                return Err(DeviceError::RateRejected {
                    rate: *rate,
                    reason: format!(
                        "requested {:.2} Gbps exceeds line rate of {} Gbps on {}",
                        bps / 1e9,
                        self.config.line_rate_gbps,
                        sender
                    ),
                });
            }

            let budget = (bps * duration.as_secs_f64() / wire_bits(frame_len)).floor() as u64;
            let tx = match mode {
                TxMode::Continuous => budget,
                TxMode::Burst { packets } => packets.min(budget),
            };

            let egress = state
                .owned
                .iter()
                .copied()
                .filter(|p| *p != sender)
                .min();
            let forwards = template.dst_mac == Self::router_mac(sender)
                && egress.is_some_and(|p| {
                    self.config.router_cache_warm || state.router_learned.contains(&p)
                });
            let dropped = (tx as f64 * self.config.loss_ratio.clamp(0.0, 1.0)).round() as u64;
            let rx = if forwards { tx - dropped.min(tx) } else { 0 };

            debug!(%sender, ?egress, tx, rx, forwards, "simulated stream scheduled");
            deltas.push((
                sender,
                PortStats {
                    opackets: tx,
                    obytes: tx.saturating_mul(frame_len as u64),
                    ..PortStats::default()
                },
            ));
            if let Some(egress) = egress {
                deltas.push((
                    egress,
                    PortStats {
                        ipackets: rx,
                        ibytes: rx.saturating_mul(frame_len as u64),
                        ..PortStats::default()
                    },
                ));
            }
        }

        state.active = Some(ActiveRun { duration, deltas });
        Ok(())
    }

    async fn stop(&self, _ports: &[PortId]) -> Result<(), DeviceError> {
        let mut state = self.enter("stop")?;
        state.active = None;
        Ok(())
    }

    async fn wait_for_completion(&self, _ports: &[PortId]) -> Result<(), DeviceError> {
        let duration = {
            let state = self.enter("wait_for_completion")?;
            match &state.active {
                Some(run) => run.duration,
                None => return Ok(()),
            }
        };
        if self.faults.never_complete {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(self.scaled(duration)).await;

        let mut state = self.lock();
        if let Some(run) = state.active.take() {
            for (port, delta) in run.deltas {
                let entry = state.stats.entry(port).or_default();
                entry.opackets = entry.opackets.saturating_add(delta.opackets);
                entry.ipackets = entry.ipackets.saturating_add(delta.ipackets);
                entry.obytes = entry.obytes.saturating_add(delta.obytes);
                entry.ibytes = entry.ibytes.saturating_add(delta.ibytes);
            }
        }
        Ok(())
    }

    async fn stats(&self) -> Result<HashMap<PortId, PortStats>, DeviceError> {
        let mut state = self.enter("stats")?;
        let mut snapshot: HashMap<PortId, PortStats> = (0..self.config.port_count)
            .map(|p| {
                let port = PortId(p);
                (port, state.stats.get(&port).copied().unwrap_or_default())
            })
            .collect();

        if state.race_reads_left > 0 {
            state.race_reads_left -= 1;
            // Receive aggregation lands before transmit aggregation.
            let total_tx = snapshot
                .values()
                .fold(0u64, |acc, s| acc.saturating_add(s.opackets));
            for s in snapshot.values_mut() {
                s.ipackets = s.ipackets.saturating_add(total_tx).saturating_add(1);
            }
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::FlowSpec;

    const SENDER: PortId = PortId(1);
    const RECEIVER: PortId = PortId(0);

    fn instant() -> SimulatorConfig {
        SimulatorConfig {
            time_scale: 0.0,
            ..SimulatorConfig::default()
        }
    }

    fn template(dst: MacAddr) -> PacketTemplate {
        PacketTemplate::new(
            SimulatedDevice::port_mac(SENDER),
            dst,
            FlowSpec {
                source_ip: "16.0.0.1".parse().unwrap(),
                destination_ip: "48.0.0.1".parse().unwrap(),
                udp_source_port: 1234,
                udp_destination_port: 1234,
                payload_size: 1400,
            },
        )
    }

    async fn ready(dev: &SimulatedDevice) {
        dev.connect().await.unwrap();
        dev.acquire(&[RECEIVER, SENDER], true).await.unwrap();
    }

    #[tokio::test]
    async fn test_requires_connection() {
        let dev = SimulatedDevice::new(instant());
        let err = dev.acquire(&[SENDER], true).await.unwrap_err();
        assert_eq!(err, DeviceError::NotConnected);
    }

    #[tokio::test]
    async fn test_rate_above_line_rate_rejected() {
        let dev = SimulatedDevice::new(instant());
        ready(&dev).await;
        dev.add_stream(SENDER, &template(SimulatedDevice::router_mac(SENDER)), TxMode::Continuous)
            .await
            .unwrap();

        let err = dev
            .start(&[SENDER], &"200gbps".parse().unwrap(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::RateRejected { .. }));

        dev.start(&[SENDER], &Rate::LINE_RATE, Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_forwarding_counts() {
        let dev = SimulatedDevice::new(instant());
        ready(&dev).await;
        dev.add_stream(SENDER, &template(SimulatedDevice::router_mac(SENDER)), TxMode::Continuous)
            .await
            .unwrap();
        // 10 Mbit/s of 1442-byte frames (11728 bits on the wire) for 2 s.
        dev.start(&[SENDER], &"10mbps".parse().unwrap(), Duration::from_secs(2))
            .await
            .unwrap();
        dev.wait_for_completion(&[SENDER]).await.unwrap();

        let stats = dev.stats().await.unwrap();
        assert_eq!(stats[&SENDER].opackets, 1705);
        assert_eq!(stats[&RECEIVER].ipackets, 1705);
        assert_eq!(stats[&SENDER].obytes, 1705 * 1442);
    }

    #[tokio::test]
    async fn test_wrong_router_mac_blackholes() {
        let dev = SimulatedDevice::new(instant());
        ready(&dev).await;
        dev.add_stream(SENDER, &template(MacAddr::BROADCAST), TxMode::Continuous)
            .await
            .unwrap();
        dev.start(&[SENDER], &Rate::LINE_RATE, Duration::from_secs(1))
            .await
            .unwrap();
        dev.wait_for_completion(&[SENDER]).await.unwrap();

        let stats = dev.stats().await.unwrap();
        assert!(stats[&SENDER].opackets > 0);
        assert_eq!(stats[&RECEIVER].ipackets, 0);
    }

    #[tokio::test]
    async fn test_cold_cache_learns_from_gratuitous_arp() {
        let dev = SimulatedDevice::new(SimulatorConfig {
            router_cache_warm: false,
            ..instant()
        });
        ready(&dev).await;
        dev.set_service_mode(&[RECEIVER], true).await.unwrap();
        let garp = crate::packet::gratuitous_arp(
            SimulatedDevice::port_mac(RECEIVER),
            "12.12.12.2".parse().unwrap(),
        );
        dev.push_packets(RECEIVER, &[garp]).await.unwrap();
        dev.set_service_mode(&[RECEIVER], false).await.unwrap();

        dev.add_stream(
            SENDER,
            &template(SimulatedDevice::router_mac(SENDER)),
            TxMode::Burst { packets: 500 },
        )
        .await
        .unwrap();
        dev.start(&[SENDER], &Rate::LINE_RATE, Duration::from_secs(1))
            .await
            .unwrap();
        dev.wait_for_completion(&[SENDER]).await.unwrap();

        let stats = dev.stats().await.unwrap();
        assert_eq!(stats[&SENDER].opackets, 500);
        assert_eq!(stats[&RECEIVER].ipackets, 500);
    }

    #[tokio::test]
    async fn test_probe_without_reply_times_out() {
        let dev = SimulatedDevice::new(SimulatorConfig {
            probe_replies: false,
            ..instant()
        });
        ready(&dev).await;
        dev.set_service_mode(&[SENDER], true).await.unwrap();
        let peer: Ipv4Addr = "11.11.11.1".parse().unwrap();
        dev.set_l3_mode(SENDER, "11.11.11.2".parse().unwrap(), peer)
            .await
            .unwrap();

        let err = dev.probe(SENDER, peer, 64, 3).await.unwrap_err();
        assert!(matches!(err, DeviceError::Timeout { op: "probe", .. }));
    }

    #[tokio::test]
    async fn test_counter_race_is_transient() {
        let dev = SimulatedDevice::with_faults(
            instant(),
            Faults {
                counter_race_reads: 1,
                ..Faults::default()
            },
        );
        ready(&dev).await;
        let first = dev.stats().await.unwrap();
        assert!(first[&RECEIVER].ipackets > first[&SENDER].opackets);
        let second = dev.stats().await.unwrap();
        assert_eq!(second[&RECEIVER].ipackets, 0);
    }

    #[tokio::test]
    async fn test_huge_duration_saturates_counters() {
        let dev = SimulatedDevice::new(instant());
        ready(&dev).await;
        dev.add_stream(SENDER, &template(SimulatedDevice::router_mac(SENDER)), TxMode::Continuous)
            .await
            .unwrap();
        dev.start(&[SENDER], &Rate::LINE_RATE, Duration::from_secs(u64::MAX))
            .await
            .unwrap();
        dev.wait_for_completion(&[SENDER]).await.unwrap();

        let stats = dev.stats().await.unwrap();
        assert_eq!(stats[&SENDER].opackets, u64::MAX);
        assert_eq!(stats[&SENDER].obytes, u64::MAX);
        assert_eq!(stats[&RECEIVER].ibytes, u64::MAX);
    }

    #[test]
    fn test_lab_router_addresses() {
        assert_eq!(
            SimulatedDevice::router_mac(SENDER).to_string(),
            "00:32:17:75:a8:80"
        );
        assert_eq!(
            SimulatedDevice::router_mac(RECEIVER).to_string(),
            "00:32:17:75:a8:84"
        );
        assert_eq!(
            SimulatedDevice::router_mac(PortId(5)),
            MacAddr([0x02, 0x52, 0x54, 0x00, 0x01, 5])
        );
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let dev = SimulatedDevice::new(instant());
        ready(&dev).await;
        dev.disconnect().await.unwrap();
        dev.disconnect().await.unwrap();
        assert!(!dev.is_connected());
        assert!(dev.owned_ports().is_empty());
    }
}
