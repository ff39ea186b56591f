//! Command-line entry point for the IoT device simulator.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use devsim_core::config::env_vars;
use devsim_core::{
    CommandListener, ConfigOverrides, ConnectionManager, Simulator, SimulatorConfig,
    TelemetryPublisher, shutdown_signal,
};
use tracing::info;

/// IoT Device Simulator - publishes synthetic temperature readings over MQTT.
#[derive(Parser, Debug)]
#[command(name = "device-sim")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Broker host.
    #[arg(long)]
    broker: Option<String>,

    /// Broker port.
    #[arg(short, long)]
    port: Option<u16>,

    /// MQTT client id (default: device-sim-<random 4 digits>).
    #[arg(long)]
    client_id: Option<String>,

    /// Username for broker authentication.
    #[arg(long, requires = "password")]
    username: Option<String>,

    /// Password for broker authentication.
    #[arg(long, requires = "username")]
    password: Option<String>,

    /// Keep-alive interval in seconds.
    #[arg(long)]
    keep_alive: Option<u64>,

    /// Device identity, selects the command topic.
    #[arg(long)]
    device_id: Option<String>,

    /// Sensor identity embedded in every reading.
    #[arg(long)]
    sensor_id: Option<String>,

    /// Seconds between two readings.
    #[arg(short, long)]
    interval: Option<u64>,

    /// Verbose output.
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            broker_host: self.broker.clone(),
            broker_port: self.port,
            client_id: self.client_id.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            keep_alive_secs: self.keep_alive,
            device_id: self.device_id.clone(),
            sensor_id: self.sensor_id.clone(),
            publish_interval_secs: self.interval,
        }
    }
}

/// Defaults, then config file, then environment, then flags.
fn load_config(args: &Args) -> Result<SimulatorConfig> {
    let mut config = match &args.config {
        Some(path) => SimulatorConfig::from_file(path)
            .with_context(|| format!("Failed to load config file {}", path.display()))?,
        None => SimulatorConfig::default(),
    };
    config.apply_env()?;
    config.apply(args.overrides());
    config.validate()?;
    Ok(config)
}

fn init_logging(verbose: bool) {
    let json_logging = std::env::var(env_vars::LOG_JSON)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "devsim_core={level},devsim_cli={level},warn",
            level = default_level
        ))
    });

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .compact()
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = load_config(&args)?;

    let listener = Arc::new(CommandListener::new(config.command_topic()));
    let session = ConnectionManager::new(config.clone(), listener);
    info!(
        broker = %config.broker.broker_addr(),
        client_id = %session.client_id(),
        device_id = %config.device_id,
        sensor_id = %config.sensor_id,
        "Device simulator configured"
    );

    let publisher = TelemetryPublisher::new(&config);
    let mut simulator = Simulator::new(session, publisher, config.publish_interval());
    simulator.run(shutdown_signal()).await?;

    Ok(())
}
