//! The trellis daemon.
//!
//! Wires the store, the sync worker, the MQTT transport and the local
//! HTTP API together, driven by a TOML configuration file.

mod samples;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use trellis::config::{Config, LogFormat, LoggingConfig};
use trellis::{env, telemetry, time, Store, Worker};
use trellis_api::TransportClient;
use trellis_mqtt::MqttTransport;

#[derive(Parser)]
#[command(name = "trellis-agent", version, about = "Edge entity-graph synchronization agent")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent (the default).
    Run,
    /// Print the resolved configuration and exit.
    Config,
    /// Print sample wire messages for integration debugging.
    Messages,
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file '{}'", path.display()))?;
            toml::from_str(&raw)
                .with_context(|| format!("failed to parse config file '{}'", path.display()))
        }
        None => Ok(Config::default()),
    }
}

fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(&config.level)
        .with_context(|| format!("invalid log filter '{}'", config.level))?;

    match (&config.file, config.format) {
        (Some(path), LogFormat::Json) => {
            let file = open_log_file(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .with_writer(Arc::new(file))
                .init();
        }
        (Some(path), LogFormat::Pretty) => {
            let file = open_log_file(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .init();
        }
        (None, LogFormat::Json) => {
            tracing_subscriber::fmt().with_env_filter(filter).json().init();
        }
        (None, LogFormat::Pretty) => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}

fn open_log_file(path: &str) -> anyhow::Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file '{path}'"))
}

fn print_config(config: &Config) -> anyhow::Result<()> {
    let mut echoed = config.clone();
    if echoed.logging.redact_passwords && !echoed.mqtt.password.is_empty() {
        echoed.mqtt.password = "********".into();
    }
    println!("{}", toml::to_string_pretty(&echoed)?);
    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    time::init();

    if !config.sync.client_kind.eq_ignore_ascii_case("mqtt") {
        anyhow::bail!("unknown sync client kind '{}'", config.sync.client_kind);
    }

    let environment = env::init_global(&config.device)?;
    let store = Store::open(&config.store)?;

    let transport = Arc::new(MqttTransport::new(
        config.mqtt.clone(),
        config.sync.clone(),
        environment,
    )?);

    let telemetry_store = store.clone();
    transport.set_telemetry_source(Arc::new(move || {
        telemetry::snapshot(&telemetry_store)
            .ok()
            .and_then(|data| serde_json::to_value(data).ok())
    }));

    let client: Arc<dyn TransportClient> = transport.clone();
    let worker = Worker::new(store.clone(), client, config.sync.clone());
    worker.start();

    if config.http.enabled {
        let http_config = config.http.clone();
        let http_store = store.clone();
        tokio::spawn(async move {
            if let Err(e) = trellis_http::serve(&http_config, http_store).await {
                error!(error = %e, "http api terminated");
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for shutdown signal")?;
    info!("shutdown requested");

    worker.stop().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Config => print_config(&config),
        Command::Messages => {
            samples::print_samples();
            Ok(())
        }
        Command::Run => {
            init_logging(&config.logging)?;
            run(config).await
        }
    }
}
