//! Next-hop resolution before the timed traffic phase.
//!
//! The router must hold a correct neighbour entry for each generator port,
//! otherwise forwarded traffic is silently dropped at egress. Resolution is
//! advisory: the router cache may already be warm from an earlier run, so
//! nothing in here ever fails the run. Problems are collected and reported
//! as a degraded outcome instead.

use std::collections::BTreeMap;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::device::DeviceSession;
use crate::packet::gratuitous_arp;
use crate::topology::{MacAddr, PortEndpoint, PortId};

/// How a port makes itself known to the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArpStrategy {
    /// Broadcast unsolicited ARP replies for the port's address.
    Gratuitous,
    /// Ping the router's interface so it resolves the port itself.
    Probe,
    /// Announce, then probe. The probe reply also yields the router MAC.
    Both,
}

impl ArpStrategy {
    pub fn announces(self) -> bool {
        matches!(self, ArpStrategy::Gratuitous | ArpStrategy::Both)
    }

    /// Whether this strategy can learn the router MAC from probe replies.
    pub fn probes(self) -> bool {
        matches!(self, ArpStrategy::Probe | ArpStrategy::Both)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArpPolicy {
    pub strategy: ArpStrategy,
    /// Announcements/probes sent per port; a single one is not reliable.
    pub burst: u32,
    /// Delay between consecutive sends within a burst.
    pub interval: Duration,
    pub probe_payload_size: usize,
}

impl Default for ArpPolicy {
    fn default() -> Self {
        Self {
            strategy: ArpStrategy::Both,
            burst: 3,
            interval: Duration::from_millis(200),
            probe_payload_size: 64,
        }
    }
}

/// What happened on one port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PortResolution {
    pub announcements_sent: u32,
    pub probe_replies: u32,
    /// Router MAC learned from a probe reply.
    pub peer_mac: Option<MacAddr>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ArpOutcome {
    Resolved,
    Degraded { reasons: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArpReport {
    pub outcome: ArpOutcome,
    pub ports: BTreeMap<PortId, PortResolution>,
}

impl ArpReport {
    pub fn is_degraded(&self) -> bool {
        matches!(self.outcome, ArpOutcome::Degraded { .. })
    }

    /// Router MAC learned on `port`, if a probe got an answer.
    pub fn learned_peer_mac(&self, port: PortId) -> Option<MacAddr> {
        self.ports.get(&port).and_then(|r| r.peer_mac)
    }
}

pub struct ArpResolver<'a, S: DeviceSession + ?Sized> {
    session: &'a S,
    policy: &'a ArpPolicy,
}

impl<'a, S: DeviceSession + ?Sized> ArpResolver<'a, S> {
    pub fn new(session: &'a S, policy: &'a ArpPolicy) -> Self {
        Self { session, policy }
    }

    /// Refresh the router's bindings for every endpoint.
    ///
    /// Ports are handled concurrently and all of them are joined before this
    /// returns. Never fails.
    pub async fn resolve(&self, endpoints: &[PortEndpoint]) -> ArpReport {
        let ports: Vec<PortId> = endpoints.iter().map(|ep| ep.port).collect();
        let mut reasons = Vec::new();

        if let Err(e) = self.session.set_service_mode(&ports, true).await {
            warn!(error = %e, "could not enter service mode, skipping ARP refresh");
            return ArpReport {
                outcome: ArpOutcome::Degraded {
                    reasons: vec![format!("service mode unavailable: {}", e)],
                },
                ports: BTreeMap::new(),
            };
        }

        let results = join_all(endpoints.iter().map(|ep| self.resolve_port(ep))).await;

        if let Err(e) = self.session.set_service_mode(&ports, false).await {
            warn!(error = %e, "failed to leave service mode");
            reasons.push(format!("leaving service mode failed: {}", e));
        }

        let mut by_port = BTreeMap::new();
        for (ep, res) in endpoints.iter().zip(results) {
            if !self.confirmed(&res) {
                let why = res
                    .errors
                    .last()
                    .cloned()
                    .unwrap_or_else(|| "no confirmation from router".to_string());
                reasons.push(format!("{} ({} -> {}): {}", ep.port, ep.local_ip, ep.peer_ip, why));
            }
            by_port.insert(ep.port, res);
        }

        let outcome = if reasons.is_empty() {
            info!(ports = ?ports, "ARP bindings refreshed");
            ArpOutcome::Resolved
        } else {
            ArpOutcome::Degraded { reasons }
        };
        ArpReport {
            outcome,
            ports: by_port,
        }
    }

    fn confirmed(&self, res: &PortResolution) -> bool {
        if self.policy.strategy.probes() {
            res.probe_replies > 0
        } else {
            res.announcements_sent > 0
        }
    }

    async fn resolve_port(&self, ep: &PortEndpoint) -> PortResolution {
        let strategy = self.policy.strategy;
        let mut res = PortResolution::default();

        if strategy.probes() {
            if let Err(e) = self.session.set_l3_mode(ep.port, ep.local_ip, ep.peer_ip).await {
                warn!(port = %ep.port, error = %e, "failed to configure L3 mode");
                res.errors.push(e.to_string());
            }
        }

        let announcement = gratuitous_arp(ep.hw_mac, ep.local_ip);
        for attempt in 0..self.policy.burst {
            if attempt > 0 {
                tokio::time::sleep(self.policy.interval).await;
            }

            if strategy.announces() {
                match self
                    .session
                    .push_packets(ep.port, std::slice::from_ref(&announcement))
                    .await
                {
                    Ok(()) => res.announcements_sent += 1,
                    Err(e) => {
                        debug!(port = %ep.port, attempt, error = %e, "announcement failed");
                        res.errors.push(e.to_string());
                    }
                }
            }

            if strategy.probes() {
                match self
                    .session
                    .probe(ep.port, ep.peer_ip, self.policy.probe_payload_size, 1)
                    .await
                {
                    Ok(report) => {
                        res.probe_replies += report.received;
                        if report.peer_mac.is_some() {
                            res.peer_mac = report.peer_mac;
                        }
                    }
                    Err(e) => {
                        debug!(port = %ep.port, peer = %ep.peer_ip, attempt, error = %e, "probe got no reply");
                        res.errors.push(e.to_string());
                    }
                }
            }
        }

        debug!(
            port = %ep.port,
            announced = res.announcements_sent,
            replies = res.probe_replies,
            peer_mac = ?res.peer_mac,
            "port resolution finished"
        );
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sim::{Faults, SimulatedDevice, SimulatorConfig};

    fn endpoints() -> Vec<PortEndpoint> {
        vec![
            PortEndpoint {
                port: PortId(0),
                hw_mac: SimulatedDevice::port_mac(PortId(0)),
                local_ip: "12.12.12.2".parse().unwrap(),
                peer_ip: "12.12.12.1".parse().unwrap(),
            },
            PortEndpoint {
                port: PortId(1),
                hw_mac: SimulatedDevice::port_mac(PortId(1)),
                local_ip: "11.11.11.2".parse().unwrap(),
                peer_ip: "11.11.11.1".parse().unwrap(),
            },
        ]
    }

    fn policy(strategy: ArpStrategy) -> ArpPolicy {
        ArpPolicy {
            strategy,
            interval: Duration::ZERO,
            ..ArpPolicy::default()
        }
    }

    async fn device(config: SimulatorConfig, faults: Faults) -> SimulatedDevice {
        let dev = SimulatedDevice::with_faults(
            SimulatorConfig {
                time_scale: 0.0,
                ..config
            },
            faults,
        );
        dev.connect().await.unwrap();
        dev.acquire(&[PortId(0), PortId(1)], true).await.unwrap();
        dev
    }

    #[tokio::test]
    async fn test_probe_learns_router_macs() {
        let dev = device(SimulatorConfig::default(), Faults::default()).await;
        let policy = policy(ArpStrategy::Both);
        let report = ArpResolver::new(&dev, &policy).resolve(&endpoints()).await;

        assert_eq!(report.outcome, ArpOutcome::Resolved);
        assert_eq!(
            report.learned_peer_mac(PortId(1)),
            Some(SimulatedDevice::router_mac(PortId(1)))
        );
        let p0 = &report.ports[&PortId(0)];
        assert_eq!(p0.announcements_sent, 3);
        assert_eq!(p0.probe_replies, 3);
    }

    #[tokio::test]
    async fn test_burst_size_is_honoured() {
        let dev = device(SimulatorConfig::default(), Faults::default()).await;
        let policy = ArpPolicy {
            burst: 5,
            ..policy(ArpStrategy::Gratuitous)
        };
        let report = ArpResolver::new(&dev, &policy).resolve(&endpoints()).await;

        assert!(!report.is_degraded());
        assert_eq!(dev.call_count("push_packets"), 10);
        assert_eq!(dev.call_count("probe"), 0);
        assert_eq!(report.learned_peer_mac(PortId(1)), None);
    }

    #[tokio::test]
    async fn test_no_reply_is_degraded_not_fatal() {
        let dev = device(
            SimulatorConfig {
                probe_replies: false,
                ..SimulatorConfig::default()
            },
            Faults::default(),
        )
        .await;
        let policy = policy(ArpStrategy::Probe);
        let report = ArpResolver::new(&dev, &policy).resolve(&endpoints()).await;

        match &report.outcome {
            ArpOutcome::Degraded { reasons } => {
                assert_eq!(reasons.len(), 2);
                assert!(reasons[0].contains("timed out"));
            }
            other => panic!("expected degraded, got {:?}", other),
        }
        // Service mode is left again even after failures.
        assert_eq!(dev.call_count("set_service_mode"), 2);
    }

    #[tokio::test]
    async fn test_service_mode_failure_skips_resolution() {
        let dev = device(
            SimulatorConfig::default(),
            Faults {
                fail_service_mode: true,
                ..Faults::default()
            },
        )
        .await;
        let policy = policy(ArpStrategy::Both);
        let report = ArpResolver::new(&dev, &policy).resolve(&endpoints()).await;

        assert!(report.is_degraded());
        assert!(report.ports.is_empty());
        assert_eq!(dev.call_count("probe"), 0);
    }
}
