//! Runs every configured pipeline once and exits.
//!
//! The exit code is 0 when every run succeeded and 1 otherwise.

use std::net::SocketAddr;
use std::process::ExitCode;

use anyhow::Context;
use tapflow_config::shared::OrchestratorConfig;
use tapflow_config::{Environment, load_config};
use tapflow_telemetry::metrics::init_metrics;
use tapflow_telemetry::tracing::init_tracing;
use tracing::{error, info};

use crate::core::start_runner_with_config;

mod core;

fn main() -> anyhow::Result<ExitCode> {
    let config = load_config::<OrchestratorConfig>().context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;

    let environment = Environment::load()?;
    let _log_flusher = init_tracing(
        env!("CARGO_BIN_NAME"),
        environment,
        config.log_dir.as_deref(),
    )?;

    // We start the runtime before the exporter, since its listener is spawned on it.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let all_succeeded = runtime.block_on(async move {
        if let Some(metrics) = &config.metrics {
            let listen_address: SocketAddr = metrics
                .listen_address
                .parse()
                .with_context(|| format!("invalid metrics address `{}`", metrics.listen_address))?;
            init_metrics(listen_address).context("failed to start the metrics exporter")?;
            info!(%listen_address, "metrics exporter started");
        }

        start_runner_with_config(config).await
    });

    match all_succeeded {
        Ok(true) => Ok(ExitCode::SUCCESS),
        Ok(false) => Ok(ExitCode::FAILURE),
        Err(err) => {
            error!("{err:#}");
            Err(err)
        }
    }
}
