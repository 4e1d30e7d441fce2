//! Supervision of many pipeline runs at once.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tapflow_config::shared::{LockConfig, OrchestratorConfig, PipelineDefinition};
use tokio::sync::{Mutex, Semaphore};
use tracing::info;

use crate::concurrency::target_lock::TargetLocks;
use crate::error::{ErrorKind, TapflowResult};
use crate::fastsync::{BulkTransfer, ResyncRequest};
use crate::run::RunResult;
use crate::state::store::CheckpointStore;
use crate::types::PipelineId;
use crate::workers::base::{Worker, WorkerHandle};
use crate::workers::run::{PipelineRunWorker, RunHandle, RunResources};
use crate::{bail, tapflow_error};

/// Settings of a [`ConcurrencyController`], usually derived from [`OrchestratorConfig`].
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub max_parallel_runs: usize,
    pub work_dir: PathBuf,
    pub lock: LockConfig,
    pub terminate_grace: Duration,
    pub stderr_tail_lines: usize,
}

impl ControllerSettings {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            max_parallel_runs: config.max_parallel_runs as usize,
            work_dir: config.work_dir.clone(),
            lock: config.lock.clone(),
            terminate_grace: config.supervisor.terminate_grace(),
            stderr_tail_lines: config.supervisor.stderr_tail_lines,
        }
    }
}

/// Per submission options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Streams to bulk load again regardless of their checkpoint.
    pub resync: ResyncRequest,
}

/// Runs pipelines as isolated tasks.
///
/// At most `max_parallel_runs` runs execute at the same time and runs sharing a target lock key
/// never overlap. A failure or panic inside a run only ends that run.
#[derive(Debug)]
pub struct ConcurrencyController<S, B> {
    resources: RunResources<S, B>,
    runs: Mutex<Vec<RunHandle>>,
}

impl<S, B> ConcurrencyController<S, B>
where
    S: CheckpointStore + Clone + Send + Sync + 'static,
    B: BulkTransfer + Clone + Send + Sync + 'static,
{
    pub fn new(settings: ControllerSettings, store: S, bulk: B) -> Self {
        let slots = Arc::new(Semaphore::new(settings.max_parallel_runs.max(1)));

        Self {
            resources: RunResources {
                settings: Arc::new(settings),
                store,
                bulk,
                locks: TargetLocks::new(),
                slots,
            },
            runs: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &S {
        &self.resources.store
    }

    /// Submits a run of `definition` with default options.
    pub async fn submit(&self, definition: PipelineDefinition) -> TapflowResult<RunHandle> {
        self.submit_with(definition, RunOptions::default()).await
    }

    /// Submits a run of `definition`.
    ///
    /// Fails when the definition is invalid or a run of the same pipeline is still in progress.
    pub async fn submit_with(
        &self,
        definition: PipelineDefinition,
        options: RunOptions,
    ) -> TapflowResult<RunHandle> {
        definition.validate().map_err(|err| {
            tapflow_error!(
                ErrorKind::ConfigError,
                "Invalid pipeline definition",
                definition.id,
                source: err
            )
        })?;
        let pipeline_id = PipelineId::new(definition.id.clone())?;

        let mut runs = self.runs.lock().await;
        if runs
            .iter()
            .any(|run| run.pipeline_id() == &pipeline_id && !run.is_finished())
        {
            bail!(
                ErrorKind::InvalidState,
                "A run of this pipeline is already in progress",
                pipeline_id
            );
        }

        let worker = PipelineRunWorker::new(
            pipeline_id,
            Arc::new(definition),
            options,
            self.resources.clone(),
        );
        let handle = worker.start().await?;
        info!(pipeline_id = %handle.pipeline_id(), run_id = %handle.run_id(), "submitted run");

        runs.push(handle.clone());

        Ok(handle)
    }

    /// Waits for `handle`'s run to finish.
    ///
    /// The run is forgotten once its result is returned here, so it is not reported again by
    /// [`ConcurrencyController::wait_all`].
    pub async fn wait(&self, handle: RunHandle) -> RunResult {
        let run_id = handle.run_id();
        let result = handle.wait().await;
        self.runs.lock().await.retain(|run| run.run_id() != run_id);

        result
    }

    /// Number of submitted runs whose result was not returned yet.
    pub async fn unreported_runs(&self) -> usize {
        self.runs.lock().await.len()
    }

    /// Requests cancellation of `handle`'s run.
    pub fn cancel(&self, handle: &RunHandle) {
        if handle.cancel() {
            info!(pipeline_id = %handle.pipeline_id(), run_id = %handle.run_id(), "cancelling run");
        }
    }

    /// Cancels every run that has not finished yet.
    pub async fn shutdown(&self) {
        let runs = self.runs.lock().await;
        info!(runs = runs.len(), "shutting down controller");

        for run in runs.iter().filter(|run| !run.is_finished()) {
            self.cancel(run);
        }
    }

    /// Waits for every submitted run and returns their results in submission order.
    ///
    /// Runs are forgotten once reported here.
    pub async fn wait_all(&self) -> Vec<RunResult> {
        let runs = std::mem::take(&mut *self.runs.lock().await);

        let mut results = Vec::with_capacity(runs.len());
        for run in runs {
            results.push(run.wait().await);
        }

        results
    }
}
