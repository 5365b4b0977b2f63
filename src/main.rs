use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use routerbench::config::{Config, Overrides};
use routerbench::device::sim::SimulatedDevice;
use routerbench::evaluate::Verdict;
use routerbench::topology::{MacAddr, Rate};
use routerbench::{report, Orchestrator};

/// Exit status when the run aborted before producing a verdict.
const EXIT_ABORTED: u8 = 3;

#[derive(Parser)]
#[command(
    name = "routerbench",
    about = "Validate router throughput and loss with a two-port traffic generator",
    version,
    long_about = None
)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one throughput validation
    Run {
        /// Config file (default: $ROUTERBENCH_CONFIG, then /etc/routerbench/routerbench.toml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Drive the built-in simulated generator and router
        #[arg(long)]
        simulate: bool,

        /// Requested rate, e.g. 50gbps, 100%, 14.8mpps
        #[arg(long)]
        rate: Option<Rate>,

        /// Rate retried once if the hardware rejects --rate
        #[arg(long, conflicts_with = "no_fallback")]
        fallback_rate: Option<Rate>,

        /// Fail immediately if the requested rate is rejected
        #[arg(long)]
        no_fallback: bool,

        /// Run duration in seconds
        #[arg(long)]
        duration: Option<u64>,

        /// Loss ratio below which the run passes (0.0001 = 0.01%)
        #[arg(long)]
        threshold: Option<f64>,

        /// Router MAC on the sender link
        #[arg(long)]
        peer_mac: Option<MacAddr>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML
    ShowConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Load and validate a configuration
    CheckConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(EXIT_ABORTED)
        }
    }
}

fn init_tracing(config: &Config, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json || config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Resolve the configuration under a provisional subscriber, so fallback
/// warnings reach the operator before `[logging]` is known.
fn load(path: Option<&Path>, json_logs: bool) -> Result<Config> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr);
    let config = if json_logs {
        tracing::subscriber::with_default(builder.json().finish(), || Config::load_layered(path))?
    } else {
        tracing::subscriber::with_default(builder.finish(), || Config::load_layered(path))?
    };
    init_tracing(&config, json_logs);
    Ok(config)
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Run {
            config,
            simulate,
            rate,
            fallback_rate,
            no_fallback,
            duration,
            threshold,
            peer_mac,
            json,
        } => {
            let mut cfg = load(config.as_deref(), cli.json_logs)?;
            cfg.apply(&Overrides {
                rate,
                fallback_rate,
                no_fallback,
                duration_sec: duration,
                loss_threshold: threshold,
                peer_mac,
            });
            let run_config = cfg.to_run_config()?;

            if !simulate {
                bail!(
                    "no hardware traffic generator backend is available in this build; \
                     rerun with --simulate"
                );
            }
            tracing::info!(
                rate = %run_config.requested_rate,
                duration = ?run_config.duration,
                "starting simulated run"
            );
            let device = SimulatedDevice::new(cfg.simulator.clone());

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received, aborting run");
                    on_signal.cancel();
                }
            });

            let mut orchestrator = Orchestrator::new(device, run_config);
            let outcome = orchestrator.run(&cancel).await;
            let run_report = match outcome {
                Ok(r) => r,
                Err(e) => {
                    eprintln!("RUN ABORTED: {}", e);
                    return Ok(ExitCode::from(EXIT_ABORTED));
                }
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&run_report)?);
            } else {
                print!("{}", report::format_summary(&run_report));
            }
            Ok(match run_report.result.verdict {
                Verdict::Pass => ExitCode::SUCCESS,
                Verdict::Fail => ExitCode::from(1),
                Verdict::Inconclusive => ExitCode::from(2),
            })
        }
        Commands::ShowConfig { config } => {
            let cfg = load(config.as_deref(), cli.json_logs)?;
            print!("{}", cfg.to_toml()?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::CheckConfig { config } => {
            let cfg = load(config.as_deref(), cli.json_logs)?;
            cfg.validate()?;
            println!("configuration OK");
            Ok(ExitCode::SUCCESS)
        }
    }
}
