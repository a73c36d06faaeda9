//! Command-line interface for procman.
use std::{path::PathBuf, str::FromStr};

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

/// Level names from quietest to noisiest. A level's position doubles as its
/// numeric shorthand, so `0` is `off` and `5` is `trace`.
const LEVELS: [(&str, LevelFilter); 6] = [
    ("off", LevelFilter::OFF),
    ("error", LevelFilter::ERROR),
    ("warn", LevelFilter::WARN),
    ("info", LevelFilter::INFO),
    ("debug", LevelFilter::DEBUG),
    ("trace", LevelFilter::TRACE),
];

/// `--log-level` value: a level name, a common alias, or a digit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// Lowercase level name, usable as an `EnvFilter` directive.
    pub fn as_str(&self) -> &'static str {
        LEVELS
            .iter()
            .find(|(_, level)| *level == self.0)
            .map_or("info", |(name, _)| *name)
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let wanted = value.trim().to_ascii_lowercase();
        let wanted = match wanted.as_str() {
            "" => return Err("log level cannot be empty".into()),
            "err" => "error",
            "warning" => "warn",
            other => other,
        };

        let found = match wanted.parse::<usize>() {
            Ok(index) => LEVELS.get(index),
            Err(_) => LEVELS.iter().find(|(name, _)| *name == wanted),
        };
        found
            .map(|(_, level)| LogLevelArg(*level))
            .ok_or_else(|| format!("invalid log level '{}' (expected a name or 0-5)", value.trim()))
    }
}

/// Command-line interface for procman.
#[derive(Parser)]
#[command(name = "procman", version, author)]
#[command(about = "Supervise the apps described by an ecosystem file", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for procman.
#[derive(Subcommand)]
pub enum Commands {
    /// Launch every app and supervise them until interrupted.
    Start {
        /// Path to the ecosystem file (defaults to `ecosystem.config.{yaml,yml,json}`).
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Deployment mode whose `env_<mode>` overrides apply (e.g. `production`).
        #[arg(short, long, value_name = "MODE")]
        env: Option<String>,

        /// Optionally start only the named app.
        #[arg(long, value_name = "APP")]
        only: Option<String>,
    },

    /// Print the resolved launch plans as JSON and exit.
    Show {
        /// Path to the ecosystem file (defaults to `ecosystem.config.{yaml,yml,json}`).
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Deployment mode whose `env_<mode>` overrides apply.
        #[arg(short, long, value_name = "MODE")]
        env: Option<String>,
    },
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
