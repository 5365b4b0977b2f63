//! Capability contract for the traffic-generator control session.
//!
//! The orchestrator never talks to hardware directly; it drives whatever
//! implements [`DeviceSession`]. Every method takes `&self` so independent
//! per-port steps (ARP resolution) can run concurrently over one session.

pub mod sim;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;

use crate::packet::PacketTemplate;
use crate::topology::{MacAddr, PortId, Rate};

/// Errors reported by a device session.
///
/// `RateRejected` is kept apart from everything else: it is the only failure
/// the traffic driver answers with a retry.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DeviceError {
    #[error("rate {rate} rejected by device: {reason}")]
    RateRejected { rate: Rate, reason: String },

    #[error("device session error: {0}")]
    Session(String),

    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("session is not connected")]
    NotConnected,

    #[error("{op} rejected on {port}: {reason}")]
    Rejected {
        op: &'static str,
        port: PortId,
        reason: String,
    },
}

/// Hardware metadata for one port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    pub port: PortId,
    pub hw_mac: MacAddr,
    pub speed_gbps: u32,
    pub driver: String,
}

/// Per-port packet and byte counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PortStats {
    pub opackets: u64,
    pub ipackets: u64,
    pub obytes: u64,
    pub ibytes: u64,
}

/// Outcome of an address-resolution probe burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub sent: u32,
    pub received: u32,
    /// Hardware address the peer answered from, when it answered.
    pub peer_mac: Option<MacAddr>,
}

/// How long a programmed stream transmits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    /// Free-run until stopped or the start duration elapses.
    Continuous,
    /// Send exactly this many packets, then stop.
    Burst { packets: u64 },
}

#[async_trait]
pub trait DeviceSession: Send + Sync {
    /// Establish the control-plane session.
    async fn connect(&self) -> Result<(), DeviceError>;

    /// Tear down the session. Always safe to call, including twice.
    async fn disconnect(&self) -> Result<(), DeviceError>;

    /// Take exclusive ownership of `ports`; `force` preempts another owner.
    async fn acquire(&self, ports: &[PortId], force: bool) -> Result<(), DeviceError>;

    async fn release(&self, ports: &[PortId]) -> Result<(), DeviceError>;

    /// Remove streams and return `ports` to their baseline configuration.
    async fn reset(&self, ports: &[PortId]) -> Result<(), DeviceError>;

    /// Zero every counter on the device.
    async fn clear_stats(&self) -> Result<(), DeviceError>;

    async fn port_info(&self, ports: &[PortId]) -> Result<Vec<PortInfo>, DeviceError>;

    /// Toggle the non-measuring mode in which control frames can be injected
    /// without touching traffic counters.
    async fn set_service_mode(&self, ports: &[PortId], enabled: bool) -> Result<(), DeviceError>;

    /// Bind `port` to a source/peer IP pair so it answers ARP and ICMP.
    async fn set_l3_mode(
        &self,
        port: PortId,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
    ) -> Result<(), DeviceError>;

    /// Inject raw frames. Requires service mode.
    async fn push_packets(&self, port: PortId, frames: &[Bytes]) -> Result<(), DeviceError>;

    /// Send `count` echo requests from `port` to `dst_ip`. Requires service mode.
    async fn probe(
        &self,
        port: PortId,
        dst_ip: Ipv4Addr,
        payload_size: usize,
        count: u32,
    ) -> Result<ProbeReport, DeviceError>;

    async fn add_stream(
        &self,
        port: PortId,
        template: &PacketTemplate,
        mode: TxMode,
    ) -> Result<(), DeviceError>;

    /// Begin transmission. Fails with [`DeviceError::RateRejected`] when the
    /// rate exceeds what the hardware can do.
    async fn start(&self, ports: &[PortId], rate: &Rate, duration: Duration)
        -> Result<(), DeviceError>;

    async fn stop(&self, ports: &[PortId]) -> Result<(), DeviceError>;

    /// Resolve once every stream on `ports` has finished.
    async fn wait_for_completion(&self, ports: &[PortId]) -> Result<(), DeviceError>;

    async fn stats(&self) -> Result<HashMap<PortId, PortStats>, DeviceError>;
}
