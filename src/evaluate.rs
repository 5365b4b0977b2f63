//! Loss computation and verdict.
//!
//! [`evaluate`] is the pure decision; [`ResultEvaluator`] reads the counters
//! from the device after a settling delay and re-reads when they are
//! inconsistent.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::device::{DeviceError, DeviceSession};
use crate::topology::PortId;

/// Loss ratio above which the loss is treated as a forwarding failure rather
/// than congestion.
pub const NEAR_TOTAL_LOSS_RATIO: f64 = 0.99;

/// Negligible-loss threshold used by the lab scripts (0.01 %).
pub const DEFAULT_LOSS_THRESHOLD: f64 = 0.0001;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MeasurementError {
    /// More packets received than transmitted: a counter-read race or the
    /// wrong port pair.
    #[error("received {rx} packets but only {tx} were transmitted (counter race or port mismatch)")]
    CounterMismatch { tx: u64, rx: u64 },

    #[error("device returned no counters for {0}")]
    MissingCounters(PortId),

    #[error("stats read failed: {0}")]
    Stats(#[from] DeviceError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Fail,
    Inconclusive,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Pass => write!(f, "PASS"),
            Verdict::Fail => write!(f, "FAIL"),
            Verdict::Inconclusive => write!(f, "INCONCLUSIVE"),
        }
    }
}

/// Extra diagnosis attached to a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Diagnosis {
    /// Nothing was transmitted: a configuration or device fault.
    NoTraffic,
    /// Practically everything was lost: the router is not forwarding the
    /// flow at all (ARP, cabling or routing), not merely congested.
    NearTotalLoss,
}

/// Counters and verdict of a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RunResult {
    pub tx_packets: u64,
    pub rx_packets: u64,
    pub lost_packets: u64,
    /// `lost / tx`; `None` when nothing was transmitted.
    pub loss_ratio: Option<f64>,
    pub verdict: Verdict,
    pub diagnosis: Option<Diagnosis>,
}

impl RunResult {
    pub fn loss_percent(&self) -> Option<f64> {
        self.loss_ratio.map(|r| r * 100.0)
    }
}

/// Classify a pair of counters against `threshold` (a ratio, 0.0001 = 0.01 %).
pub fn evaluate(tx: u64, rx: u64, threshold: f64) -> Result<RunResult, MeasurementError> {
    if rx > tx {
        return Err(MeasurementError::CounterMismatch { tx, rx });
    }
    let lost = tx - rx;

    if tx == 0 {
        return Ok(RunResult {
            tx_packets: 0,
            rx_packets: 0,
            lost_packets: 0,
            loss_ratio: None,
            verdict: Verdict::Inconclusive,
            diagnosis: Some(Diagnosis::NoTraffic),
        });
    }

    let ratio = lost as f64 / tx as f64;
    let verdict = if ratio < threshold {
        Verdict::Pass
    } else {
        Verdict::Fail
    };
    let diagnosis = (ratio > NEAR_TOTAL_LOSS_RATIO).then_some(Diagnosis::NearTotalLoss);

    Ok(RunResult {
        tx_packets: tx,
        rx_packets: rx,
        lost_packets: lost,
        loss_ratio: Some(ratio),
        verdict,
        diagnosis,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvalPolicy {
    pub loss_threshold: f64,
    /// Wait after completion before the first read; device counter
    /// aggregation lags the last packet.
    pub settle: Duration,
    /// Total reads attempted while counters are inconsistent.
    pub max_reads: u32,
}

impl Default for EvalPolicy {
    fn default() -> Self {
        Self {
            loss_threshold: DEFAULT_LOSS_THRESHOLD,
            settle: Duration::from_secs(1),
            max_reads: 3,
        }
    }
}

pub struct ResultEvaluator<'a, S: DeviceSession + ?Sized> {
    session: &'a S,
    policy: &'a EvalPolicy,
}

impl<'a, S: DeviceSession + ?Sized> ResultEvaluator<'a, S> {
    pub fn new(session: &'a S, policy: &'a EvalPolicy) -> Self {
        Self { session, policy }
    }

    /// Read transmit counters of `sender` and receive counters of `receiver`
    /// and classify them.
    pub async fn collect(
        &self,
        sender: PortId,
        receiver: PortId,
    ) -> Result<RunResult, MeasurementError> {
        let reads = self.policy.max_reads.max(1);
        let mut attempt = 1;
        loop {
            tokio::time::sleep(self.policy.settle).await;

            let stats = self.session.stats().await?;
            let tx = stats
                .get(&sender)
                .ok_or(MeasurementError::MissingCounters(sender))?
                .opackets;
            let rx = stats
                .get(&receiver)
                .ok_or(MeasurementError::MissingCounters(receiver))?
                .ipackets;
            debug!(attempt, tx, rx, "read port counters");

            match evaluate(tx, rx, self.policy.loss_threshold) {
                Ok(result) => {
                    info!(
                        tx = result.tx_packets,
                        rx = result.rx_packets,
                        lost = result.lost_packets,
                        verdict = %result.verdict,
                        "run evaluated"
                    );
                    return Ok(result);
                }
                Err(e @ MeasurementError::CounterMismatch { .. }) if attempt < reads => {
                    warn!(attempt, error = %e, "inconsistent counters, re-reading");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
