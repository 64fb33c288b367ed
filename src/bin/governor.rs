//! CLI entry point.

use std::process::ExitCode;

use clap::Parser;

use governor_ha::{Config, SupervisorDriver};

#[derive(Parser)]
#[command(name = "governor", about = "High-availability supervisor for a primary/replica database cluster")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(default_value = "governor.toml")]
    config: String,

    /// Overrides the `RUST_LOG`-style filter used for structured logging.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = args
        .log_level
        .unwrap_or_else(|| std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            // No cluster/node identity is known yet: the file that would
            // have named them failed to load.
            tracing::error!(error = %e, path = %args.config, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let scope = config.etcd.scope.clone();
    let name = config.postgresql.name.clone();

    let driver = match SupervisorDriver::connect(config).await {
        Ok(driver) => driver,
        Err(e) => {
            tracing::error!(error = %e, scope, name, "failed to connect to the coordination store");
            return ExitCode::FAILURE;
        }
    };

    match driver.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, scope, name, "supervisor exited with an error");
            ExitCode::FAILURE
        }
    }
}
