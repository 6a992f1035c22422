//! toolhost server entry point
//!
//! ```bash
//! # Run with a configuration file
//! toolhost -c /etc/toolhost/config.json
//!
//! # Validate a configuration and exit
//! toolhost -c config.json --check
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use toolhost::config::{load_config, Config};
use toolhost::logbuf::{LogRing, LogRingLayer};
use toolhost::supervisor::Supervisor;

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/toolhost/config.json");
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "--check" => {
                    check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("toolhost v{}", toolhost::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r#"toolhost v{}

Multi-protocol toolbox command server.

USAGE:
    toolhost [OPTIONS]

OPTIONS:
    -c, --config <PATH>    Configuration file path [default: /etc/toolhost/config.json]
    --check                Check configuration and exit
    -h, --help             Print help information
    -v, --version          Print version information

ENVIRONMENT:
    RUST_LOG               Override the log filter (takes precedence over LogLevel)
"#,
        toolhost::VERSION
    );
}

/// Initialise tracing with the config-file default level, an `RUST_LOG`
/// override, and the in-memory ring the maintenance report reads from.
fn init_logging(config: &Config) -> Arc<LogRing> {
    let default_level = config.log_level.as_deref().unwrap_or("info");
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let ring = Arc::new(LogRing::new());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(LogRingLayer::new(Arc::clone(&ring)))
        .init();
    ring
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(&args.config_path).map_err(|e| {
        anyhow::anyhow!(
            "failed to load configuration from {:?}: {e}",
            args.config_path
        )
    })?;

    if args.check_config {
        println!("Configuration is valid");
        return Ok(());
    }

    let ring = init_logging(&config);
    info!(version = toolhost::VERSION, "toolhost starting");

    let supervisor = Supervisor::from_config(&config, ring)?;
    info!(daemons = ?supervisor.daemon_names(), "daemons configured");

    supervisor.run_until(shutdown_signal()).await?;
    info!("shutdown complete");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
