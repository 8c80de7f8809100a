//! zamek-policy: runs one access policy against the message bus.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};

use zamek::bus::MqttBus;
use zamek::config::{Config, DEFAULT_CONFIG_FILES};
use zamek::logging::{LogLevel, init_tracing};
use zamek::{Policy, PluginRuntime};
use zamek_policies::{CardListPolicy, LoggingPolicy};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PolicyKind {
    /// Log every scan and decision
    Logging,
    /// Accept cards from an allow-list file
    CardList,
}

#[derive(Parser)]
#[command(name = "zamek-policy", version = zamek::ZAMEK_VERSION)]
#[command(about = "Run an access policy for zamek", long_about = None)]
struct Cli {
    /// Policy to run
    #[arg(value_enum)]
    policy: PolicyKind,

    /// Allow-list file for the card-list policy
    #[arg(long, value_name = "FILE", default_value = "cards.txt")]
    cards: PathBuf,

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
    init_tracing(cli.log, LogLevel::Warn);

    if let Err(e) = run(cli).await {
        tracing::error!(error = %format!("{e:#}"), "zamek-policy stopped");
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

    match cli.policy {
        PolicyKind::Logging => serve(LoggingPolicy, &config).await,
        PolicyKind::CardList => serve(CardListPolicy::new(cli.cards), &config).await,
    }
}

async fn serve<P: Policy>(policy: P, config: &Config) -> anyhow::Result<()> {
    let (bus, inbox) = MqttBus::connect(&config.mqtt, None);
    let runtime = PluginRuntime::new(policy, Arc::new(bus));
    runtime.run(inbox).await?;
    Ok(())
}
