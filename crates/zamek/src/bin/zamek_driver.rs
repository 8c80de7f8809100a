//! zamek-driver: relays the IO board's serial line to the message bus.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use zamek::bus::{BusMessage, MqttBus};
use zamek::config::{Config, DEFAULT_CONFIG_FILES};
use tokio::sync::watch;

use zamek::{LinkError, LinkState};
use zamek::link::IoBoardLink;
use zamek::logging::{LogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "zamek-driver", version = zamek::ZAMEK_VERSION)]
#[command(about = "Relay RFID reader events between the IO board and the message bus", long_about = None)]
struct Cli {
    /// Configuration file; repeat to layer overrides [default: config.toml localconfig.toml]
    #[arg(short, long = "config", value_name = "FILE")]
    config: Vec<PathBuf>,

    /// Log level for zamek targets (ignored when RUST_LOG is set)
    #[arg(long, value_enum)]
    log: Option<LogLevel>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log, LogLevel::Info);

    if let Err(e) = run(cli).await {
        tracing::error!(error = %format!("{e:#}"), "zamek-driver stopped");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let paths: Vec<PathBuf> = if cli.config.is_empty() {
        DEFAULT_CONFIG_FILES.into_iter().map(PathBuf::from).collect()
    } else {
        cli.config
    };
    let config = Config::load(&paths).context("loading configuration")?;
    let serial = config.serial()?;

    let will = BusMessage::shutdown()?;
    let (bus, inbox) = MqttBus::connect(&config.mqtt, Some(will));

    let (state, states) = watch::channel(LinkState::Connecting);
    let result: Result<(), LinkError> = async {
        let mut link = IoBoardLink::open(serial, Arc::new(bus), config.link.timings(), state)?;
        link.health_check().await?;

        tracing::info!(version = zamek::ZAMEK_VERSION, "IO board link running");
        link.serve(inbox).await
    }
    .await;

    tracing::info!(state = %*states.borrow(), "IO board link stopped");
    result?;
    Ok(())
}
