//! MirAIe MQTT command-line client
//!
//! Watches device state or sends control commands over a resilient broker
//! session. Credentials come from the environment variables named in the
//! configuration file.

use clap::{Parser, Subcommand};
use miraie_mqtt::config::ClientConfig;
use miraie_mqtt::observability::init_default_logging;
use miraie_mqtt::protocol::{ControlPayload, DeviceTopic, Payload};
use miraie_mqtt::session::{CommandOutcome, ListenerError, SessionManager};
use miraie_mqtt::transport::MqttConnector;
use std::path::PathBuf;
use std::process;
use tokio::signal;
use tokio::time::Duration;
use tracing::{error, info, warn, Level};

const CONNECTION_WAIT: Duration = Duration::from_secs(10);

/// Resilient MirAIe MQTT client
#[derive(Parser)]
#[command(name = "miraie-mqtt")]
#[command(about = "Watch and control MirAIe devices over MQTT")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print state updates for a device until interrupted
    Watch {
        /// Device topic base, e.g. `{home_id}/{device_id}`
        #[arg(short, long)]
        device: String,

        /// Stop after this many seconds
        #[arg(long)]
        duration_secs: Option<u64>,
    },
    /// Send a control command to a device
    Send {
        #[arg(short, long)]
        device: String,

        /// Command field as key=value; repeatable
        #[arg(short, long = "set", value_name = "KEY=VALUE", required = true)]
        set: Vec<String>,

        /// Seconds to wait for a state update confirming the command
        #[arg(long, default_value_t = 5)]
        confirm_secs: u64,
    },
    /// Validate configuration
    Config {
        /// Show the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level_override = match cli.verbose {
        0 => None,
        1 => Some(Level::DEBUG),
        _ => Some(Level::TRACE),
    };
    init_default_logging(level_override);

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Watch {
            device,
            duration_secs,
        } => watch_device(config, &device, duration_secs.map(Duration::from_secs)).await,
        Commands::Send {
            device,
            set,
            confirm_secs,
        } => send_command(config, &device, &set, Duration::from_secs(confirm_secs)).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(config_path: &Option<PathBuf>) -> Result<ClientConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(ClientConfig::load_from_file(path)?);
    }

    for path_str in ["miraie.toml", "config/miraie.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(ClientConfig::load_from_file(&path)?);
        }
    }

    info!("No configuration file found, using defaults");
    Ok(ClientConfig::default())
}

/// Connect a session with credentials from the environment
async fn open_session(config: &ClientConfig) -> Result<SessionManager, Box<dyn std::error::Error>> {
    let credentials = config.credentials()?;
    let session = SessionManager::new(config.session_config()?, MqttConnector::new());
    info!(
        client_id = session.client_id(),
        endpoint = %session.config().endpoint,
        "Starting broker session"
    );

    let connecting = session.clone();
    tokio::spawn(async move {
        if !connecting.connect_with_retry(credentials, None).await {
            warn!("Connection retries exhausted");
        }
    });
    session.wait_for_connection(CONNECTION_WAIT).await?;
    Ok(session)
}

async fn watch_device(
    config: ClientConfig,
    device: &str,
    duration: Option<Duration>,
) -> Result<(), Box<dyn std::error::Error>> {
    let device = DeviceTopic::new(device)?;
    let session = open_session(&config).await?;

    session
        .subscribe(device.state(), |topic: String, payload: Payload| async move {
            println!("{topic} {payload}");
            Ok::<(), ListenerError>(())
        })
        .await?;

    info!("Watching {}", device.state());
    let until_done = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = wait_for_shutdown_signal() => info!("Received shutdown signal"),
        _ = until_done => info!("Watch duration elapsed"),
    }

    info!(metrics = ?session.metrics(), "Session summary");
    session.disconnect().await;
    Ok(())
}

async fn send_command(
    config: ClientConfig,
    device: &str,
    assignments: &[String],
    confirm_wait: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let device = DeviceTopic::new(device)?;
    let command = assignments
        .iter()
        .try_fold(ControlPayload::new(), |payload, assignment| payload.assignment(assignment))?
        .build();

    let session = open_session(&config).await?;

    // The state topic must be subscribed for the confirmation to arrive
    session
        .subscribe(device.state(), |topic: String, payload: Payload| async move {
            println!("{topic} {payload}");
            Ok::<(), ListenerError>(())
        })
        .await?;

    let outcome = session
        .publish_and_confirm(&device.control(), &command, &device.state(), confirm_wait)
        .await;
    session.disconnect().await;

    match outcome {
        CommandOutcome::Confirmed { latency } => {
            info!(latency_ms = latency.as_millis() as u64, "Command confirmed by device");
            Ok(())
        }
        CommandOutcome::Unconfirmed => {
            warn!("Command sent but no state update arrived");
            Ok(())
        }
        CommandOutcome::Failed => Err("command could not be sent".into()),
    }
}

fn handle_config_command(config: &ClientConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;

    if show {
        println!("{}", toml::to_string_pretty(config)?);
    } else {
        info!("Configuration is valid");
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    let (mut sigint, mut sigterm) = match (
        signal::unix::signal(signal::unix::SignalKind::interrupt()),
        signal::unix::signal(signal::unix::SignalKind::terminate()),
    ) {
        (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
        _ => {
            warn!("Could not install signal handlers, falling back to Ctrl-C");
            let _ = signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
