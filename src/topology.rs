//! Test rig data model: port addressing, the flow under test, and rates.
//!
//! Hardware addresses of the generator's own ports are never configured; they
//! are read from the device at the start of every run and bound into a
//! [`PortEndpoint`] together with the static addressing from [`PortSpec`].

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid MAC address '{0}' (expected six hex octets, e.g. 00:32:17:75:a8:80)")]
    Mac(String),

    #[error("invalid rate '{0}' (expected e.g. '100%', '50gbps', '10mpps')")]
    Rate(String),
}

// ---------------------------------------------------------------------------
// MacAddr
// ---------------------------------------------------------------------------

/// 48-bit Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for MacAddr {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parts: Vec<&str> = s.split(|c| c == ':' || c == '-').collect();
        if parts.len() != 6 {
            return Err(ParseError::Mac(s.to_string()));
        }
        let mut octets = [0u8; 6];
        for (slot, part) in octets.iter_mut().zip(&parts) {
            if part.len() != 2 {
                return Err(ParseError::Mac(s.to_string()));
            }
            *slot = u8::from_str_radix(part, 16).map_err(|_| ParseError::Mac(s.to_string()))?;
        }
        Ok(MacAddr(octets))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl TryFrom<String> for MacAddr {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacAddr> for String {
    fn from(mac: MacAddr) -> Self {
        mac.to_string()
    }
}

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

/// Physical port index on the traffic generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortId(pub u8);

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port {}", self.0)
    }
}

/// Static addressing for one generator port, as configured by the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    pub port: PortId,
    /// Address this port claims on the link towards the router.
    pub local_ip: Ipv4Addr,
    /// The router's interface address on the same link (next hop).
    pub peer_ip: Ipv4Addr,
    /// Router interface MAC, when known up front (`show arp` on the router).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_mac: Option<MacAddr>,
}

impl PortSpec {
    /// Bind the static addressing to the hardware address read from the device.
    pub fn bind(&self, hw_mac: MacAddr) -> PortEndpoint {
        PortEndpoint {
            port: self.port,
            hw_mac,
            local_ip: self.local_ip,
            peer_ip: self.peer_ip,
        }
    }
}

/// A generator port with its runtime-discovered hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortEndpoint {
    pub port: PortId,
    pub hw_mac: MacAddr,
    pub local_ip: Ipv4Addr,
    pub peer_ip: Ipv4Addr,
}

/// The two-port rig: traffic leaves `sender`, crosses the router, and is
/// expected back on `receiver`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub sender: PortSpec,
    pub receiver: PortSpec,
}

impl Topology {
    pub fn ports(&self) -> [PortId; 2] {
        [self.sender.port, self.receiver.port]
    }
}

/// The single synthetic UDP flow pushed through the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowSpec {
    pub source_ip: Ipv4Addr,
    pub destination_ip: Ipv4Addr,
    pub udp_source_port: u16,
    pub udp_destination_port: u16,
    pub payload_size: usize,
}

/// Expected forwarding path for the run.
///
/// Frames leave `sender` addressed to `egress_peer_mac` (the router's ingress
/// interface) and must reappear on `receiver` after the routing decision. A
/// stale binding here makes traffic vanish without any error from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RouteBinding {
    pub sender: PortEndpoint,
    pub egress_peer_mac: MacAddr,
    pub receiver: PortEndpoint,
}

// ---------------------------------------------------------------------------
// Rate
// ---------------------------------------------------------------------------

/// Transmit rate target handed to the generator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Rate {
    /// Percentage of the port's line rate.
    Percent(f64),
    /// Absolute layer-1 bit rate.
    BitsPerSec(f64),
    /// Absolute packet rate.
    PacketsPerSec(f64),
}

impl Rate {
    pub const LINE_RATE: Rate = Rate::Percent(100.0);
}

impl FromStr for Rate {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim().to_ascii_lowercase();
        let err = || ParseError::Rate(s.trim().to_string());

        let (number, rate): (&str, fn(f64) -> Rate) = if let Some(n) = text.strip_suffix('%') {
            (n, Rate::Percent)
        } else if let Some(n) = text.strip_suffix("bps") {
            (n, Rate::BitsPerSec)
        } else if let Some(n) = text.strip_suffix("pps") {
            (n, Rate::PacketsPerSec)
        } else {
            return Err(err());
        };

        let (digits, scale) = match number.chars().last() {
            Some('k') => (&number[..number.len() - 1], 1e3),
            Some('m') => (&number[..number.len() - 1], 1e6),
            Some('g') => (&number[..number.len() - 1], 1e9),
            _ => (number, 1.0),
        };
        // Scaled percentages ("5k%") make no sense.
        if scale != 1.0 && text.ends_with('%') {
            return Err(err());
        }

        let value: f64 = digits.trim().parse().map_err(|_| err())?;
        if !value.is_finite() || value <= 0.0 {
            return Err(err());
        }
        Ok(rate(value * scale))
    }
}

fn format_scaled(f: &mut fmt::Formatter<'_>, value: f64, unit: &str) -> fmt::Result {
    for (prefix, scale) in [("g", 1e9), ("m", 1e6), ("k", 1e3)] {
        if value >= scale && (value % scale) == 0.0 {
            return write!(f, "{}{}{}", value / scale, prefix, unit);
        }
    }
    write!(f, "{}{}", value, unit)
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Rate::Percent(p) => write!(f, "{}%", p),
            Rate::BitsPerSec(v) => format_scaled(f, v, "bps"),
            Rate::PacketsPerSec(v) => format_scaled(f, v, "pps"),
        }
    }
}

impl TryFrom<String> for Rate {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Rate> for String {
    fn from(rate: Rate) -> Self {
        rate.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_parse_and_display() {
        let mac: MacAddr = "00:32:17:75:A8:80".parse().unwrap();
        assert_eq!(mac.octets(), [0x00, 0x32, 0x17, 0x75, 0xa8, 0x80]);
        assert_eq!(mac.to_string(), "00:32:17:75:a8:80");

        let dashed: MacAddr = "00-32-17-75-a8-84".parse().unwrap();
        assert_eq!(dashed.to_string(), "00:32:17:75:a8:84");
    }

    #[test]
    fn test_mac_rejects_garbage() {
        assert!("00:32:17:75:a8".parse::<MacAddr>().is_err());
        assert!("00:32:17:75:a8:zz".parse::<MacAddr>().is_err());
        assert!("0:32:17:75:a8:80".parse::<MacAddr>().is_err());
        assert!("".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_rate_parse_forms() {
        assert_eq!("100%".parse::<Rate>().unwrap(), Rate::Percent(100.0));
        assert_eq!("12.5%".parse::<Rate>().unwrap(), Rate::Percent(12.5));
        assert_eq!("50gbps".parse::<Rate>().unwrap(), Rate::BitsPerSec(50e9));
        assert_eq!("200Gbps".parse::<Rate>().unwrap(), Rate::BitsPerSec(200e9));
        assert_eq!("750mbps".parse::<Rate>().unwrap(), Rate::BitsPerSec(750e6));
        assert_eq!("10mpps".parse::<Rate>().unwrap(), Rate::PacketsPerSec(10e6));
        assert_eq!("1000pps".parse::<Rate>().unwrap(), Rate::PacketsPerSec(1000.0));
    }

    #[test]
    fn test_rate_rejects_invalid() {
        for bad in ["", "fast", "0%", "-5%", "5k%", "gbps", "12 parsecs"] {
            assert!(bad.parse::<Rate>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn test_rate_display_is_canonical() {
        assert_eq!(Rate::BitsPerSec(50e9).to_string(), "50gbps");
        assert_eq!(Rate::BitsPerSec(1.5e9).to_string(), "1500mbps");
        assert_eq!(Rate::PacketsPerSec(10e6).to_string(), "10mpps");
        assert_eq!(Rate::Percent(100.0).to_string(), "100%");
        assert_eq!(Rate::LINE_RATE.to_string(), "100%");
    }

    #[test]
    fn test_port_spec_bind() {
        let spec = PortSpec {
            port: PortId(1),
            local_ip: "11.11.11.2".parse().unwrap(),
            peer_ip: "11.11.11.1".parse().unwrap(),
            peer_mac: None,
        };
        let mac: MacAddr = "02:00:00:00:00:01".parse().unwrap();
        let ep = spec.bind(mac);
        assert_eq!(ep.port, PortId(1));
        assert_eq!(ep.hw_mac, mac);
        assert_eq!(ep.peer_ip, spec.peer_ip);
    }
}
