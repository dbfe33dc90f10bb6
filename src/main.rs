//! RPC Pool - settings checker.
//!
//! Reads a JSON settings file, resolves it into the pools the registry would build
//! and prints that plan with broker passwords masked. No broker connection is made.

use clap::Parser;
use rpc_pool::config::{Config, JsonFileSettings, PoolConfig, SettingsProvider};
use rpc_pool::error::PoolError;
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// One resolved pool as printed on stdout.
#[derive(Debug, Serialize)]
struct PlanEntry<'a> {
    name: &'a str,
    broker_uri: Option<String>,
    #[serde(flatten)]
    config: &'a PoolConfig,
}

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    // Logs go to stderr so stdout only carries the plan.
    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn run(config: &Config) -> Result<String, PoolError> {
    let settings = JsonFileSettings::new(&config.settings).settings()?;
    let plan = settings.resolve()?;

    let entries: Vec<PlanEntry<'_>> = plan
        .entries()
        .into_iter()
        .filter(|(name, _)| config.pool.as_deref().is_none_or(|wanted| wanted == *name))
        .map(|(name, pool)| PlanEntry {
            name,
            broker_uri: pool.redacted_uri(),
            config: pool,
        })
        .collect();

    if let Some(wanted) = &config.pool {
        if entries.is_empty() {
            return Err(PoolError::configuration(format!(
                "RPC_CONFIG must include this pool name \"{wanted}\" config"
            )));
        }
    }

    info!(pools = entries.len(), "Settings resolved");
    serde_json::to_string_pretty(&entries)
        .map_err(|e| PoolError::configuration(format!("Cannot render pool plan: {e}")))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    init_tracing(&config);

    info!(
        settings = %config.settings.display(),
        "Starting rpc-pool v{}",
        env!("CARGO_PKG_VERSION")
    );

    match run(&config) {
        Ok(rendered) => {
            println!("{rendered}");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Invalid settings");
            Err(e.into())
        }
    }
}
