//! stowd: keeps the stow catalog in line with users' storage directories
//!
//! Usage:
//!   stowd [--config /etc/stow/stow.toml] [--once]
//!
//! Without `--once` the daemon repeats the pass every `sync.interval_secs`
//! seconds (a zero interval also means a single pass).

mod daemon;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "stowd", version, about = "stow catalog reconciliation daemon")]
struct Cli {
    /// Path to stow.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "STOW_CONFIG",
        default_value = "/etc/stow/stow.toml"
    )]
    config: PathBuf,

    /// Run a single pass and exit
    #[arg(long)]
    once: bool,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, env = "STOW_LOG")]
    log: Option<String>,

    /// Log format (json, text); overrides the config file
    #[arg(long, env = "STOW_LOG_FORMAT")]
    log_format: Option<LogFormat>,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, missing) = daemon::load_config(&cli.config).await?;

    let level = cli.log.clone().unwrap_or_else(|| config.daemon.log_level.clone());
    let format = cli.log_format.clone().unwrap_or(match config.daemon.log_format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(&level, &format);

    if missing {
        tracing::warn!(
            "config file not found: {}  (using defaults)",
            cli.config.display()
        );
    }
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        once = cli.once,
        "stowd starting"
    );

    daemon::run(config, cli.once).await
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}
