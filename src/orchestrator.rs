//! End-to-end run state machine.
//!
//! ```text
//! Idle -> Connected -> ArpResolved -> Streaming -> Completed ---> Torndown
//!   \________\_____________\______________\____________\-> Aborted -^
//! ```
//!
//! Each phase runs to completion before the next starts. Whatever happens,
//! including operator cancellation, teardown (stop, release, disconnect)
//! runs exactly once and its own failures are logged, never returned.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::arp::{ArpOutcome, ArpPolicy, ArpReport, ArpResolver};
use crate::device::{DeviceError, DeviceSession};
use crate::evaluate::{EvalPolicy, MeasurementError, ResultEvaluator, RunResult};
use crate::topology::{FlowSpec, PortEndpoint, PortId, Rate, RouteBinding, Topology};
use crate::traffic::{AppliedRate, TrafficDriver, TrafficError};

/// Upper bound for each individual teardown call.
const TEARDOWN_OP_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything one run needs, validated up front.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub topology: Topology,
    pub flow: FlowSpec,
    pub requested_rate: Rate,
    /// Rate retried once if the device rejects `requested_rate`.
    pub fallback_rate: Option<Rate>,
    pub duration: Duration,
    pub connect_timeout: Duration,
    /// Slack on top of `duration` before the completion wait gives up.
    pub completion_grace: Duration,
    pub arp: ArpPolicy,
    pub eval: EvalPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Connected,
    ArpResolved,
    Streaming,
    Completed,
    Aborted,
    Torndown,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to connect to traffic generator: {0}")]
    Connect(DeviceError),

    #[error("failed to acquire ports: {0}")]
    Acquire(DeviceError),

    #[error("failed to reset ports: {0}")]
    Reset(DeviceError),

    #[error("failed to read port info: {0}")]
    PortInfo(DeviceError),

    #[error("device reported no info for {0}")]
    MissingPort(PortId),

    #[error("no router MAC for {port}: none configured and {peer_ip} did not answer probes")]
    MissingPeerMac {
        port: PortId,
        peer_ip: std::net::Ipv4Addr,
    },

    #[error(transparent)]
    Traffic(#[from] TrafficError),

    #[error("measurement failed: {0}")]
    Measurement(#[from] MeasurementError),

    #[error("run cancelled")]
    Cancelled,
}

/// Durable outcome of a completed run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub route: RouteBinding,
    pub arp: ArpReport,
    pub rate: AppliedRate,
    pub duration_secs: f64,
    pub loss_threshold: f64,
    pub result: RunResult,
}

struct Phases {
    route: RouteBinding,
    arp: ArpReport,
    rate: AppliedRate,
    result: RunResult,
}

/// Side effects on the device that teardown has to undo.
#[derive(Debug, Default)]
struct Progress {
    ports_claimed: bool,
    stream_started: bool,
}

/// Single-use driver for one run against one device session.
pub struct Orchestrator<S: DeviceSession> {
    session: S,
    config: RunConfig,
    run_id: Uuid,
    state: RunState,
    history: Vec<RunState>,
    progress: Progress,
    torn_down: bool,
}

impl<S: DeviceSession> Orchestrator<S> {
    pub fn new(session: S, config: RunConfig) -> Self {
        Self {
            session,
            config,
            run_id: Uuid::new_v4(),
            state: RunState::Idle,
            history: vec![RunState::Idle],
            progress: Progress::default(),
            torn_down: false,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Every state entered so far, starting with `Idle`.
    pub fn history(&self) -> &[RunState] {
        &self.history
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    /// Execute the run. Cancelling `cancel` aborts the current phase; teardown
    /// still runs before this returns.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<RunReport, RunError> {
        let span = info_span!("run", run_id = %self.run_id);
        self.run_inner(cancel).instrument(span).await
    }

    async fn run_inner(&mut self, cancel: &CancellationToken) -> Result<RunReport, RunError> {
        let started_at = Utc::now();

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RunError::Cancelled),
            res = self.run_phases() => res,
        };

        if let Err(e) = &outcome {
            error!(state = ?self.state, error = %e, "run aborted");
            self.transition(RunState::Aborted);
        }
        self.teardown().await;

        let phases = outcome?;
        Ok(RunReport {
            run_id: self.run_id,
            started_at,
            finished_at: Utc::now(),
            route: phases.route,
            arp: phases.arp,
            rate: phases.rate,
            duration_secs: self.config.duration.as_secs_f64(),
            loss_threshold: self.config.eval.loss_threshold,
            result: phases.result,
        })
    }

    async fn run_phases(&mut self) -> Result<Phases, RunError> {
        let ports = self.config.topology.ports();

        // Idle -> Connected
        info!("connecting to traffic generator");
        let timeout = self.config.connect_timeout;
        match tokio::time::timeout(timeout, self.session.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(RunError::Connect(e)),
            Err(_) => {
                return Err(RunError::Connect(DeviceError::Timeout {
                    op: "connect",
                    after: timeout,
                }))
            }
        }
        self.progress.ports_claimed = true;
        self.session
            .acquire(&ports, true)
            .await
            .map_err(RunError::Acquire)?;
        self.session.reset(&ports).await.map_err(RunError::Reset)?;
        self.session.clear_stats().await.map_err(RunError::Reset)?;
        self.transition(RunState::Connected);

        let (sender, receiver) = self.discover_endpoints().await?;

        // Connected -> ArpResolved
        let arp = ArpResolver::new(&self.session, &self.config.arp)
            .resolve(&[receiver, sender])
            .await;
        if let ArpOutcome::Degraded { reasons } = &arp.outcome {
            warn!(
                condition = "DEGRADED",
                ?reasons,
                "ARP resolution incomplete, relying on the router's existing cache"
            );
        }
        self.transition(RunState::ArpResolved);
        let route = self.bind_route(sender, receiver, &arp)?;

        // ArpResolved -> Streaming
        TrafficDriver::new(&self.session)
            .program(&route, &self.config.flow)
            .await?;
        self.progress.stream_started = true;
        let rate = TrafficDriver::new(&self.session)
            .start(
                sender.port,
                self.config.requested_rate,
                self.config.fallback_rate,
                self.config.duration,
            )
            .await?;
        self.transition(RunState::Streaming);
        TrafficDriver::new(&self.session)
            .wait(
                sender.port,
                self.config.duration,
                self.config.completion_grace,
            )
            .await?;

        // Streaming -> Completed; counters are only meaningful from here on.
        self.transition(RunState::Completed);
        let result = ResultEvaluator::new(&self.session, &self.config.eval)
            .collect(sender.port, receiver.port)
            .await?;

        Ok(Phases {
            route,
            arp,
            rate,
            result,
        })
    }

    /// Read the ports' hardware addresses; they may change between runs.
    async fn discover_endpoints(&self) -> Result<(PortEndpoint, PortEndpoint), RunError> {
        let topo = &self.config.topology;
        let infos = self
            .session
            .port_info(&topo.ports())
            .await
            .map_err(RunError::PortInfo)?;

        let bind = |spec: &crate::topology::PortSpec| {
            infos
                .iter()
                .find(|i| i.port == spec.port)
                .map(|i| spec.bind(i.hw_mac))
                .ok_or(RunError::MissingPort(spec.port))
        };
        let sender = bind(&topo.sender)?;
        let receiver = bind(&topo.receiver)?;

        for (role, ep) in [("sender", &sender), ("receiver", &receiver)] {
            info!(
                role,
                port = %ep.port,
                hw_mac = %ep.hw_mac,
                local_ip = %ep.local_ip,
                peer_ip = %ep.peer_ip,
                "verifying cabling"
            );
        }
        Ok((sender, receiver))
    }

    /// Pick the router MAC the stream is addressed to: configured first,
    /// otherwise whatever answered the sender-side probes.
    fn bind_route(
        &self,
        sender: PortEndpoint,
        receiver: PortEndpoint,
        arp: &ArpReport,
    ) -> Result<RouteBinding, RunError> {
        let learned = arp.learned_peer_mac(sender.port);
        let egress_peer_mac = match (self.config.topology.sender.peer_mac, learned) {
            (Some(configured), Some(learned)) if configured != learned => {
                warn!(
                    port = %sender.port,
                    %configured,
                    %learned,
                    "configured router MAC differs from the one answering probes; using configured"
                );
                configured
            }
            (Some(configured), _) => configured,
            (None, Some(learned)) => learned,
            (None, None) => {
                return Err(RunError::MissingPeerMac {
                    port: sender.port,
                    peer_ip: sender.peer_ip,
                })
            }
        };
        info!(
            sender = %sender.port,
            receiver = %receiver.port,
            router_mac = %egress_peer_mac,
            "route bound"
        );
        Ok(RouteBinding {
            sender,
            egress_peer_mac,
            receiver,
        })
    }

    fn transition(&mut self, next: RunState) {
        info!(from = ?self.state, to = ?next, "state transition");
        self.state = next;
        self.history.push(next);
    }

    async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        let ports = self.config.topology.ports();

        if self.progress.stream_started {
            best_effort("stop", self.session.stop(&ports)).await;
        }
        if self.progress.ports_claimed {
            best_effort("release", self.session.release(&ports)).await;
        }
        best_effort("disconnect", self.session.disconnect()).await;
        self.transition(RunState::Torndown);
    }
}

async fn best_effort<F>(op: &'static str, fut: F)
where
    F: Future<Output = Result<(), DeviceError>>,
{
    match tokio::time::timeout(TEARDOWN_OP_TIMEOUT, fut).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(op, error = %e, "teardown step failed"),
        Err(_) => error!(op, timeout = ?TEARDOWN_OP_TIMEOUT, "teardown step timed out"),
    }
}
