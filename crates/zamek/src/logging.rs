//! Tracing subscriber setup shared by the binaries.
//!
//! `RUST_LOG` wins if set. Otherwise the level comes from the `--log` flag,
//! then `ZAMEK_LOG`, then the binary's default, and applies to the zamek
//! targets only, with audit lines always at info. `LOG_FORMAT=json`
//! switches to JSON lines. Output goes to stderr.

use std::fmt;
use std::str::FromStr;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt as tracing_fmt};

/// Target for policy audit lines.
pub const AUDIT_TARGET: &str = "zamek::audit";

const TARGETS: [&str; 4] = ["zamek", "zamek_driver", "zamek_policies", "zamek_policy"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown log level {other:?}")),
        }
    }
}

/// Directive string for the zamek targets at `level`. Audit lines stay
/// visible at every level.
pub fn filter_directives(level: LogLevel) -> String {
    let mut directives: Vec<String> = TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect();
    directives.push(format!("{AUDIT_TARGET}=info"));
    directives.join(",")
}

fn resolve_level(flag: Option<LogLevel>, env: Option<&str>, default: LogLevel) -> LogLevel {
    flag.or_else(|| env.and_then(|value| value.parse().ok()))
        .unwrap_or(default)
}

pub fn init_tracing(flag: Option<LogLevel>, default: LogLevel) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let env = std::env::var("ZAMEK_LOG").ok();
        let level = resolve_level(flag, env.as_deref(), default);
        EnvFilter::new(filter_directives(level))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}
