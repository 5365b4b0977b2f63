//! Stream programming, rate application with fallback, and the completion wait.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::device::{DeviceError, DeviceSession, TxMode};
use crate::packet::PacketTemplate;
use crate::topology::{FlowSpec, PortId, Rate, RouteBinding};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TrafficError {
    #[error("stream programming rejected: {0}")]
    Programming(DeviceError),

    /// Rate rejected and either no fallback was configured or the fallback
    /// was rejected as well. `reason` is the device's own words.
    #[error("rate rejected by hardware (requested {requested}, fallback {}): {reason}", rate_or_none(.fallback))]
    RateRejected {
        requested: Rate,
        fallback: Option<Rate>,
        reason: String,
    },

    #[error("failed to start traffic: {0}")]
    Start(DeviceError),

    #[error("stream did not complete within {after:?}")]
    CompletionTimeout { after: Duration },

    #[error("waiting for stream completion failed: {0}")]
    Completion(DeviceError),
}

fn rate_or_none(rate: &Option<Rate>) -> String {
    rate.map(|r| r.to_string()).unwrap_or_else(|| "none".to_string())
}

/// The rate the device actually accepted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AppliedRate {
    pub requested: Rate,
    pub applied: Rate,
    pub fell_back: bool,
}

pub struct TrafficDriver<'a, S: DeviceSession + ?Sized> {
    session: &'a S,
}

impl<'a, S: DeviceSession + ?Sized> TrafficDriver<'a, S> {
    pub fn new(session: &'a S) -> Self {
        Self { session }
    }

    /// Build the flow's template and program it as a continuous stream on
    /// the sender port.
    pub async fn program(
        &self,
        route: &RouteBinding,
        flow: &FlowSpec,
    ) -> Result<PacketTemplate, TrafficError> {
        let template = PacketTemplate::new(route.sender.hw_mac, route.egress_peer_mac, *flow);
        info!(
            port = %route.sender.port,
            src_mac = %template.src_mac,
            dst_mac = %template.dst_mac,
            src_ip = %flow.source_ip,
            dst_ip = %flow.destination_ip,
            frame_len = template.frame_len(),
            "programming continuous stream"
        );
        self.session
            .add_stream(route.sender.port, &template, TxMode::Continuous)
            .await
            .map_err(TrafficError::Programming)?;
        Ok(template)
    }

    /// Start transmission at `requested`, retrying once at `fallback` if and
    /// only if the device rejects the rate itself.
    pub async fn start(
        &self,
        port: PortId,
        requested: Rate,
        fallback: Option<Rate>,
        duration: Duration,
    ) -> Result<AppliedRate, TrafficError> {
        info!(%port, rate = %requested, ?duration, "starting traffic");
        let first = match self.session.start(&[port], &requested, duration).await {
            Ok(()) => {
                return Ok(AppliedRate {
                    requested,
                    applied: requested,
                    fell_back: false,
                })
            }
            Err(DeviceError::RateRejected { reason, .. }) => reason,
            Err(e) => return Err(TrafficError::Start(e)),
        };

        let Some(fallback) = fallback.filter(|f| *f != requested) else {
            return Err(TrafficError::RateRejected {
                requested,
                fallback: None,
                reason: first,
            });
        };

        warn!(%port, rate = %requested, %fallback, reason = %first, "rate rejected by hardware, falling back");
        match self.session.start(&[port], &fallback, duration).await {
            Ok(()) => Ok(AppliedRate {
                requested,
                applied: fallback,
                fell_back: true,
            }),
            Err(DeviceError::RateRejected { reason, .. }) => Err(TrafficError::RateRejected {
                requested,
                fallback: Some(fallback),
                reason,
            }),
            Err(e) => Err(TrafficError::Start(e)),
        }
    }

    /// Block until the stream reports completion, bounded by
    /// `duration + grace`.
    pub async fn wait(
        &self,
        port: PortId,
        duration: Duration,
        grace: Duration,
    ) -> Result<(), TrafficError> {
        let limit = duration.saturating_add(grace);
        match tokio::time::timeout(limit, self.session.wait_for_completion(&[port])).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TrafficError::Completion(e)),
            Err(_) => Err(TrafficError::CompletionTimeout { after: limit }),
        }
    }
}
