//! tidepool: validate pool configuration and probe targets through the pool.
//!
//! # Usage
//!
//! ```text
//! tidepool check --config pool.toml
//! tidepool probe --config pool.toml --target sales --count 3
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "tidepool",
    about = "Tidepool: target-keyed connection pool manager",
    version,
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and validate a pool.toml, then list its targets.
    Check {
        /// Path to pool.toml
        #[arg(short, long, default_value = "pool.toml")]
        config: PathBuf,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Borrow connections to a configured target through the pool and
    /// report timings and pool statistics.
    Probe {
        #[arg(short, long, default_value = "pool.toml")]
        config: PathBuf,
        /// Target name from the [targets] table
        #[arg(short, long)]
        target: String,
        /// Number of acquire/release cycles
        #[arg(short = 'n', long, default_value = "1")]
        count: u32,
        /// Acquire timeout in seconds (default: acquire_timeout_default)
        #[arg(long)]
        timeout: Option<u64>,
        /// Skip TLS certificate verification
        #[arg(long)]
        insecure: bool,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,tidepool=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check { config, format } => commands::check::check(&config, &format),
        Commands::Probe {
            config,
            target,
            count,
            timeout,
            insecure,
            format,
        } => {
            let options = commands::probe::ProbeOptions {
                count,
                timeout: timeout.map(std::time::Duration::from_secs),
                insecure,
            };
            commands::probe::probe(&config, &target, &options, &format).await
        }
    }
}
