use std::sync::Arc;

use tapflow::ConcurrencyController;
use tapflow::ControllerSettings;
use tapflow::RunResult;
use tapflow::fastsync::CommandBulkTransfer;
use tapflow::state::store::postgres::apply_migrations;
use tapflow::state::store::{
    CheckpointStore, FileCheckpointStore, MemoryCheckpointStore, PostgresCheckpointStore,
    RetryingCheckpointStore,
};
use tapflow_config::shared::{OrchestratorConfig, StateStoreConfig};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};

/// Builds the configured checkpoint store and runs every pipeline once.
///
/// Returns whether all runs succeeded.
pub async fn start_runner_with_config(config: OrchestratorConfig) -> anyhow::Result<bool> {
    info!(
        pipelines = config.pipelines.len(),
        max_parallel_runs = config.max_parallel_runs,
        work_dir = %config.work_dir.display(),
        "starting tapflow runner"
    );

    // Static dispatch over the store implementations, so each gets its own instantiation.
    match &config.state_store {
        StateStoreConfig::File { directory } => {
            let store = FileCheckpointStore::new(directory).await?;
            run_pipelines(&config, with_retries(store, &config)).await
        }
        StateStoreConfig::Memory => {
            warn!("using the memory checkpoint store, checkpoints are lost when the runner exits");
            run_pipelines(&config, with_retries(MemoryCheckpointStore::new(), &config)).await
        }
        StateStoreConfig::Postgres { connection } => {
            apply_migrations(connection).await?;
            let store = PostgresCheckpointStore::connect(connection).await?;
            run_pipelines(&config, with_retries(store, &config)).await
        }
    }
}

fn with_retries<S>(store: S, config: &OrchestratorConfig) -> RetryingCheckpointStore<S> {
    RetryingCheckpointStore::new(store, config.checkpoint_retry.clone())
}

#[tracing::instrument(skip_all)]
async fn run_pipelines<S>(config: &OrchestratorConfig, store: S) -> anyhow::Result<bool>
where
    S: CheckpointStore + Clone + Send + Sync + 'static,
{
    let settings = ControllerSettings::from_config(config);
    let bulk = CommandBulkTransfer::new(settings.terminate_grace, settings.stderr_tail_lines);
    let controller = Arc::new(ConcurrencyController::new(settings, store, bulk));

    let mut all_submitted = true;
    for definition in &config.pipelines {
        if let Err(err) = controller.submit(definition.clone()).await {
            error!(pipeline_id = %definition.id, error = %err, "failed to submit pipeline");
            all_submitted = false;
        }
    }

    // Listen for SIGTERM as well as Ctrl+C, so orchestrators stopping the runner get clean
    // checkpoints.
    let mut sigterm = signal(SignalKind::terminate())?;
    let shutdown_handle = tokio::spawn({
        let controller = controller.clone();
        async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("sigint (ctrl+c) received, cancelling runs");
                }
                _ = sigterm.recv() => {
                    info!("sigterm received, cancelling runs");
                }
            }

            controller.shutdown().await;
        }
    });

    let results = controller.wait_all().await;

    shutdown_handle.abort();
    let _ = shutdown_handle.await;

    for result in &results {
        log_result(result);
    }

    let all_succeeded = all_submitted && results.iter().all(RunResult::is_success);
    info!(
        runs = results.len(),
        failed = results.iter().filter(|result| !result.is_success()).count(),
        "runner finished"
    );

    Ok(all_succeeded)
}

fn log_result(result: &RunResult) {
    let duration_ms = (result.finished_at - result.started_at).num_milliseconds();

    match &result.failure {
        None => info!(
            pipeline_id = %result.pipeline_id,
            run_id = %result.run_id,
            outcome = result.outcome.as_str(),
            records = result.stats.records(),
            duration_ms,
            "run finished"
        ),
        Some(failure) => error!(
            pipeline_id = %result.pipeline_id,
            run_id = %result.run_id,
            outcome = result.outcome.as_str(),
            kind = %failure.kind,
            role = ?failure.role,
            exit_code = ?failure.exit_code,
            solution = failure.solution.as_deref(),
            duration_ms,
            "run finished: {}",
            failure.message
        ),
    }
}
