//! simrelay - simulation worker supervisor and result relay
//!
//! Runs one simulation worker at a time and relays every JSON document it
//! prints to subscribers.
//!
//! ## Usage
//!
//! ```bash
//! # Serve the HTTP API and the control topic
//! simrelay serve
//!
//! # With verbose logging and a custom configuration
//! simrelay -v --config ./simrelay.yaml serve
//!
//! # One-shot run, fragments printed as JSON lines
//! simrelay run --input machine.json
//! echo '{"days": 3}' | simrelay run --input -
//! ```

mod http;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;
use simrelay_core::{LogGuard, RelayConfig, RelayError, init_logging};
use simrelay_worker::{
    Broker, CommandGateway, MqttBroker, TopicBus, WorkerSupervisor, spawn_control_listener,
};
use tokio::io::AsyncReadExt;
use tracing::{error, info, warn};

/// How long a stopped worker gets before it is killed on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Simulation worker supervisor and streaming result relay
#[derive(Parser, Debug)]
#[command(name = "simrelay")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging (increases log level)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Directory for log files (defaults to ~/.simrelay/logs/)
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Configuration file (defaults to ~/.simrelay/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP API and listen on the control topic
    Serve,

    /// Run a single simulation and print its results as JSON lines
    Run {
        /// Run configuration file, or `-` for stdin
        #[arg(long)]
        input: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _guard = match setup_logging(&cli) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::from(1);
        }
    };

    let result = match &cli.command {
        Command::Serve => serve(cli.config.as_deref()).await.map(|()| true),
        Command::Run { input } => run_once(cli.config.as_deref(), input).await,
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            error!("simrelay error: {:#}", e);
            eprintln!("Error: {:#}", e);
            if let Some(hint) = error_hint(&e) {
                info!(hint, "suggested fix");
                eprintln!("Hint: {}", hint);
            }
            ExitCode::from(1)
        }
    }
}

/// Guidance for the first relay error in the chain, if it has any.
fn error_hint(err: &anyhow::Error) -> Option<&'static str> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<RelayError>())?
        .guidance()
}

/// Set up logging based on CLI arguments.
fn setup_logging(cli: &Cli) -> simrelay_core::Result<LogGuard> {
    let debug = cli.verbose > 0;
    init_logging(cli.log_dir.clone(), debug)
}

/// Broker, supervisor and gateway wired from the configuration.
struct Relay {
    config: RelayConfig,
    broker: Arc<dyn Broker>,
    gateway: CommandGateway,
}

impl Relay {
    /// With `external`, messages go through the MQTT broker at `bus.url` when
    /// one is configured. Otherwise the in-process bus is used.
    fn build(config_path: Option<&Path>, external: bool) -> anyhow::Result<Self> {
        let config = RelayConfig::load_or_default(config_path)?;
        let mqtt = if external {
            MqttBroker::from_config(&config.bus)?
        } else {
            None
        };
        let broker: Arc<dyn Broker> = match mqtt {
            Some(mqtt) => Arc::new(mqtt),
            None => Arc::new(TopicBus::new(config.bus.capacity)),
        };
        let supervisor = WorkerSupervisor::new(&config, broker.clone());
        info!(
            program = %config.worker.program,
            results_topic = %config.bus.results_topic,
            bus_url = config.bus.url.as_deref().filter(|_| external).unwrap_or("in-process"),
            "relay configured"
        );
        Ok(Self {
            gateway: CommandGateway::new(Arc::new(supervisor)),
            config,
            broker,
        })
    }

    fn broker(&self) -> Arc<dyn Broker> {
        self.broker.clone()
    }
}

async fn serve(config_path: Option<&Path>) -> anyhow::Result<()> {
    let relay = Relay::build(config_path, true)?;
    let addr = relay.config.http.bind_addr()?;

    let listener = spawn_control_listener(
        relay.gateway.clone(),
        relay.broker(),
        &relay.config.bus.control_topic,
        &relay.config.bus.ack_topic,
    );

    let state = http::AppState {
        gateway: relay.gateway.clone(),
        broker: relay.broker(),
        results_topic: relay.config.bus.results_topic.clone(),
    };
    let served = http::serve(addr, state, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
        info!("shutdown requested");
    })
    .await;

    listener.abort();
    let state = relay.gateway.supervisor().shutdown(SHUTDOWN_GRACE).await?;
    info!(state = %state, "simrelay stopped");

    served
}

async fn run_once(config_path: Option<&Path>, input: &str) -> anyhow::Result<bool> {
    // Results are printed locally, so no external broker is involved
    let relay = Relay::build(config_path, false)?;
    let run_config = read_input(input).await?;

    // Subscribe before starting so no fragment is missed
    let mut results = relay.broker().subscribe(&relay.config.bus.results_topic);
    let mut states = relay.gateway.supervisor().subscribe_state();

    let ack = relay.gateway.request_start(run_config).await;
    if !ack.accepted {
        bail!(
            "simulation rejected: {}",
            ack.reason.as_deref().unwrap_or("unknown")
        );
    }

    let mut stop_sent = false;
    let state = loop {
        tokio::select! {
            Some(message) = results.recv() => {
                println!("{}", message.payload);
            }
            changed = states.changed() => {
                let state = states.borrow_and_update().clone();
                if changed.is_err() || state.is_terminal() {
                    break state;
                }
            }
            signal = tokio::signal::ctrl_c(), if !stop_sent => {
                signal.context("listening for Ctrl-C")?;
                stop_sent = true;
                let ack = relay.gateway.request_stop();
                info!(accepted = ack.accepted, "stop requested from terminal");
            }
        }
    };

    // Fragments are published before the terminal state is recorded
    while let Some(message) = results.try_recv() {
        println!("{}", message.payload);
    }

    info!(state = %state, "simulation finished");
    Ok(state.is_success())
}

/// Read the run configuration from a file, or stdin for `-`.
async fn read_input(input: &str) -> anyhow::Result<Value> {
    let text = if input == "-" {
        let mut text = String::new();
        tokio::io::stdin()
            .read_to_string(&mut text)
            .await
            .context("reading run configuration from stdin")?;
        text
    } else {
        tokio::fs::read_to_string(input)
            .await
            .with_context(|| format!("reading run configuration from {input}"))?
    };

    serde_json::from_str(&text).context("run configuration is not valid JSON")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_hint_for_missing_config() {
        let missing = std::env::temp_dir().join("simrelay-missing/config.yaml");
        let err = anyhow::Error::from(RelayError::config_not_found_with_source(
            missing,
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        ));
        assert_eq!(
            error_hint(&err),
            Some("Create ~/.simrelay/config.yaml or pass --config <path>")
        );
    }

    #[test]
    fn test_error_hint_looks_through_context() {
        let err = anyhow::Error::from(RelayError::AlreadyRunning).context("starting simulation");
        assert_eq!(
            error_hint(&err),
            Some("Stop the current simulation or wait for it to finish")
        );
    }

    #[tokio::test]
    async fn test_serve_uses_configured_mqtt_broker() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"bus:\n  url: mqtt://127.0.0.1:1\n").unwrap();
        let fragment = || simrelay_worker::BusMessage::new("simulation/results", serde_json::json!(1));

        // Nothing listens on port 1, so the MQTT broker refuses publishes
        let served = Relay::build(Some(file.path()), true).unwrap();
        let err = served.broker().publish(fragment()).unwrap_err();
        assert_eq!(
            error_hint(&anyhow::Error::from(err)),
            Some("Check bus.url and that the message broker is reachable")
        );

        let local = Relay::build(Some(file.path()), false).unwrap();
        assert!(local.broker().publish(fragment()).is_ok());
    }

    #[test]
    fn test_error_hint_absent_for_other_errors() {
        assert_eq!(error_hint(&anyhow::anyhow!("simulation rejected: NotRunning")), None);
        assert_eq!(error_hint(&anyhow::Error::from(RelayError::internal("bug"))), None);
    }
}
