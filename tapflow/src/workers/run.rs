use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tapflow_config::shared::PipelineDefinition;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::catalog::{Catalog, ReplicationMethod};
use crate::concurrency::shutdown::{
    ShutdownRx, ShutdownTx, create_shutdown_channel, trigger_shutdown, wait_for_shutdown,
};
use crate::concurrency::target_lock::{TargetLockGuard, TargetLocks};
use crate::controller::{ControllerSettings, RunOptions};
use crate::error::{ErrorKind, TapflowError, TapflowResult};
use crate::failpoints::{RUN__BEFORE_ROUTER, tapflow_fail_point};
use crate::fastsync::{
    BulkTransfer, FastSyncContext, FastSyncReport, TableStatus, plan, run_fastsync,
};
use crate::metrics::{
    OUTCOME_LABEL, PIPELINE_ID_LABEL, TAPFLOW_RUN_REQUEUES_TOTAL, TAPFLOW_RUNS_ACTIVE,
    TAPFLOW_RUNS_FINISHED_TOTAL, TAPFLOW_RUNS_STARTED_TOTAL,
};
use crate::process::ConnectorRole;
use crate::process::command::{extractor_spec, stage_spec};
use crate::router::{ColumnTransformer, RouterConfig, route};
use crate::run::{RunOutcome, RunPhase, RunProgress, RunResult};
use crate::state::store::CheckpointStore;
use crate::types::{PipelineId, RunId, StreamId};
use crate::workers::base::{Worker, WorkerHandle};
use crate::workers::policy::{RetryDirective, build_error_handling_policy};
use crate::{bail, tapflow_error};

const CATALOG_FILE: &str = "catalog.json";
const STATE_FILE: &str = "state.json";
const SUMMARY_FILE: &str = "summary.json";
const FASTSYNC_DIR: &str = "fastsync";

/// Handle to a submitted run.
///
/// Clones observe the same run.
#[derive(Debug, Clone)]
pub struct RunHandle {
    run_id: RunId,
    pipeline_id: PipelineId,
    phase_rx: watch::Receiver<RunPhase>,
    cancel_tx: Arc<ShutdownTx>,
    result_rx: watch::Receiver<Option<RunResult>>,
}

impl RunHandle {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn pipeline_id(&self) -> &PipelineId {
        &self.pipeline_id
    }

    /// Receiver notified on every phase change.
    pub fn phase_receiver(&self) -> watch::Receiver<RunPhase> {
        self.phase_rx.clone()
    }

    /// Requests cancellation. Returns `false` when it was already requested.
    pub fn cancel(&self) -> bool {
        trigger_shutdown(&self.cancel_tx)
    }

    pub fn is_finished(&self) -> bool {
        self.result_rx.borrow().is_some()
    }
}

impl WorkerHandle<RunPhase> for RunHandle {
    type Output = RunResult;

    fn state(&self) -> RunPhase {
        *self.phase_rx.borrow()
    }

    async fn wait(self) -> RunResult {
        let mut result_rx = self.result_rx;

        let waited = result_rx.wait_for(Option::is_some).await.map(|result| result.clone());
        match waited {
            Ok(Some(result)) => result,
            // The supervising task always publishes before it drops the sender.
            Ok(None) | Err(_) => RunResult::finish(
                self.run_id,
                self.pipeline_id,
                Utc::now(),
                RunProgress::default(),
                Err(tapflow_error!(
                    ErrorKind::InvalidState,
                    "Run supervisor stopped without a result"
                )),
            ),
        }
    }
}

/// Decrements the active runs gauge when the run stops executing.
struct ActiveRun;

impl ActiveRun {
    fn enter() -> Self {
        counter!(TAPFLOW_RUNS_STARTED_TOTAL).increment(1);
        gauge!(TAPFLOW_RUNS_ACTIVE).increment(1.0);

        Self
    }
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        gauge!(TAPFLOW_RUNS_ACTIVE).decrement(1.0);
    }
}

/// Controller owned dependencies shared by every run.
#[derive(Debug, Clone)]
pub struct RunResources<S, B> {
    pub settings: Arc<ControllerSettings>,
    pub store: S,
    pub bulk: B,
    pub locks: TargetLocks,
    /// One permit per run allowed to execute at the same time.
    pub slots: Arc<Semaphore>,
}

/// Executes one run of a pipeline: slot, target lock, bulk path, router, summary.
#[derive(Debug)]
pub struct PipelineRunWorker<S, B> {
    run_id: RunId,
    pipeline_id: PipelineId,
    definition: Arc<PipelineDefinition>,
    options: RunOptions,
    resources: RunResources<S, B>,
}

impl<S, B> PipelineRunWorker<S, B> {
    pub fn new(
        pipeline_id: PipelineId,
        definition: Arc<PipelineDefinition>,
        options: RunOptions,
        resources: RunResources<S, B>,
    ) -> Self {
        Self {
            run_id: RunId::new(),
            pipeline_id,
            definition,
            options,
            resources,
        }
    }

    fn run_dir(&self) -> PathBuf {
        self.resources
            .settings
            .work_dir
            .join(self.pipeline_id.as_str())
            .join(self.run_id.to_string())
    }
}

impl<S, B> Worker<RunHandle, RunPhase> for PipelineRunWorker<S, B>
where
    S: CheckpointStore + Clone + Send + Sync + 'static,
    B: BulkTransfer + Clone + Send + Sync + 'static,
{
    type Error = TapflowError;

    async fn start(self) -> TapflowResult<RunHandle> {
        let run_id = self.run_id;
        let pipeline_id = self.pipeline_id.clone();
        let (phase_tx, phase_rx) = watch::channel(RunPhase::Queued);
        let (cancel_tx, cancel_rx) = create_shutdown_channel();
        let (result_tx, result_rx) = watch::channel(None);

        let span = info_span!("pipeline_run", pipeline_id = %pipeline_id, %run_id);
        let started_at = Utc::now();
        let phase_tx = Arc::new(phase_tx);

        let run = tokio::spawn(
            self.run(phase_tx.clone(), cancel_rx, started_at)
                .instrument(span.clone()),
        );

        // A panic inside the run is turned into its result here, away from the controller.
        tokio::spawn(
            {
                let pipeline_id = pipeline_id.clone();
                async move {
                    let result = match run.await {
                        Ok(result) => result,
                        Err(err) => {
                            error!(error = %err, "run task panicked");
                            RunResult::finish(
                                run_id,
                                pipeline_id,
                                started_at,
                                RunProgress::default(),
                                Err(tapflow_error!(
                                    ErrorKind::RunPanic,
                                    "Run panicked",
                                    source: err
                                )),
                            )
                        }
                    };

                    phase_tx.send_replace(RunPhase::Finished);
                    result_tx.send_replace(Some(result));
                }
            }
            .instrument(span),
        );

        Ok(RunHandle {
            run_id,
            pipeline_id,
            phase_rx,
            cancel_tx: Arc::new(cancel_tx),
            result_rx,
        })
    }
}

impl<S, B> PipelineRunWorker<S, B>
where
    S: CheckpointStore + Clone + Send + Sync + 'static,
    B: BulkTransfer + Clone + Send + Sync + 'static,
{
    async fn run(
        self,
        phase_tx: Arc<watch::Sender<RunPhase>>,
        cancel_rx: ShutdownRx,
        started_at: DateTime<Utc>,
    ) -> RunResult {
        info!("run submitted");

        let mut progress = RunProgress::default();
        let result = self.execute(&phase_tx, cancel_rx, &mut progress).await;
        let result = RunResult::finish(
            self.run_id,
            self.pipeline_id.clone(),
            started_at,
            progress,
            result,
        );

        counter!(
            TAPFLOW_RUNS_FINISHED_TOTAL,
            PIPELINE_ID_LABEL => self.pipeline_id.to_string(),
            OUTCOME_LABEL => result.outcome.as_str()
        )
        .increment(1);

        match (&result.outcome, &result.error) {
            (RunOutcome::Success, _) => info!(records = result.stats.records(), "run succeeded"),
            (RunOutcome::Cancelled, _) => info!("run cancelled"),
            (RunOutcome::Failed, Some(err)) => error!(error = %err, "run failed"),
            (RunOutcome::Failed, None) => error!("run failed"),
        }

        if let Err(err) = write_summary(&self.run_dir(), &result).await {
            warn!(error = %err, "failed to write run summary");
        }

        result
    }

    async fn execute(
        &self,
        phase_tx: &watch::Sender<RunPhase>,
        mut cancel_rx: ShutdownRx,
        progress: &mut RunProgress,
    ) -> TapflowResult<()> {
        let (_slot, _lock) = self
            .acquire_slot_and_lock(phase_tx, &mut cancel_rx, progress)
            .await?;
        let _active = ActiveRun::enter();

        let definition = &self.definition;
        let run_dir = self.run_dir();
        tokio::fs::create_dir_all(&run_dir).await.map_err(|err| {
            tapflow_error!(
                ErrorKind::IoError,
                "Failed to create the run directory",
                run_dir.display(),
                source: err
            )
        })?;

        let catalog = Catalog::load(&definition.catalog_path).await?;
        let mut committed = self.resources.store.load(&self.pipeline_id).await?;
        progress.last_checkpoint = committed.clone();

        let fastsync_plan = plan(definition, &catalog, committed.as_ref(), &self.options.resync);
        debug!(
            bulk = ?fastsync_plan.bulk,
            incremental = ?fastsync_plan.incremental,
            "planned replication"
        );

        if !fastsync_plan.bulk.is_empty() {
            set_phase(phase_tx, RunPhase::FastSync);

            let output_dir = run_dir.join(FASTSYNC_DIR);
            tokio::fs::create_dir_all(&output_dir).await?;

            let context = FastSyncContext {
                pipeline_id: self.pipeline_id.clone(),
                run_id: self.run_id,
                definition: definition.clone(),
                output_dir,
                store: self.resources.store.clone(),
                bulk: self.resources.bulk.clone(),
                locks: self.resources.locks.clone(),
                lock_timeout: self.resources.settings.lock.acquire_timeout(),
            };
            let report = run_fastsync(context, fastsync_plan, cancel_rx.clone()).await?;
            let cancelled = report.cancelled;
            progress.fastsync = Some(report);
            if cancelled {
                bail!(ErrorKind::RunCancelled, "Run was cancelled during bulk transfers");
            }

            committed = self.resources.store.load(&self.pipeline_id).await?;
            progress.last_checkpoint = committed.clone();
        }

        let excluded = excluded_streams(&catalog, progress.fastsync.as_ref());
        let run_catalog = catalog.without_streams(&excluded);

        if run_catalog.selected().next().is_none() {
            info!("no streams left for incremental replication");
        } else {
            set_phase(phase_tx, RunPhase::Replicating);

            let catalog_path = run_dir.join(CATALOG_FILE);
            run_catalog.write(&catalog_path).await?;

            let state_path = match &committed {
                Some(checkpoint) => {
                    let path = run_dir.join(STATE_FILE);
                    tokio::fs::write(&path, serde_json::to_vec(&checkpoint.bookmark)?).await?;
                    Some(path)
                }
                None => None,
            };

            tapflow_fail_point(RUN__BEFORE_ROUTER)?;

            let config = RouterConfig {
                pipeline_id: self.pipeline_id.clone(),
                run_id: self.run_id,
                extractor: extractor_spec(&definition.extractor, &catalog_path, state_path.as_deref()),
                transformer: definition
                    .transformer
                    .as_ref()
                    .map(|transformer| stage_spec(ConnectorRole::Transformer, transformer)),
                loader: stage_spec(ConnectorRole::Loader, &definition.loader),
                columns: ColumnTransformer::new(&definition.transformations),
                terminate_grace: self.resources.settings.terminate_grace,
                stderr_tail_lines: self.resources.settings.stderr_tail_lines,
            };

            let outcome = route(config, committed, self.resources.store.clone(), cancel_rx).await;
            progress.process_exits = outcome.process_exits;
            progress.stats = outcome.stats;
            progress.last_checkpoint = outcome.last_checkpoint;
            outcome.result?;
        }

        // Failed tables are reported in the result and picked up again by the next run.
        if let Some(report) = &progress.fastsync {
            if !report.is_success() {
                let failed: Vec<StreamId> = report.failed_streams().into_iter().collect();
                warn!(
                    failed = %failed.join(", "),
                    "bulk transfer failed for some tables, they were left out of this run"
                );
            }
        }

        Ok(())
    }

    /// Takes a controller slot and the target lock, going back to the queue as long as the
    /// lock stays busy and requeues are left.
    async fn acquire_slot_and_lock(
        &self,
        phase_tx: &watch::Sender<RunPhase>,
        cancel_rx: &mut ShutdownRx,
        progress: &mut RunProgress,
    ) -> TapflowResult<(OwnedSemaphorePermit, TargetLockGuard)> {
        let lock_config = &self.resources.settings.lock;

        loop {
            set_phase(phase_tx, RunPhase::Queued);
            let slot = tokio::select! {
                slot = self.resources.slots.clone().acquire_owned() => slot.map_err(|err| {
                    tapflow_error!(ErrorKind::InvalidState, "Controller slots were closed", source: err)
                })?,
                _ = wait_for_shutdown(cancel_rx) => {
                    bail!(ErrorKind::RunCancelled, "Run was cancelled while queued");
                }
            };

            set_phase(phase_tx, RunPhase::WaitingForLock);
            let lock = tokio::select! {
                lock = self.resources.locks.acquire(&self.definition.target_lock_key, lock_config.acquire_timeout()) => lock,
                _ = wait_for_shutdown(cancel_rx) => {
                    bail!(ErrorKind::RunCancelled, "Run was cancelled while waiting for its target lock");
                }
            };

            let err = match lock {
                Ok(lock) => return Ok((slot, lock)),
                Err(err) => err,
            };
            if build_error_handling_policy(&err).retry_directive() != RetryDirective::Requeue {
                return Err(err);
            }
            if lock_config
                .max_requeues
                .is_some_and(|max_requeues| progress.requeues >= max_requeues)
            {
                return Err(err);
            }

            drop(slot);
            progress.requeues += 1;
            counter!(
                TAPFLOW_RUN_REQUEUES_TOTAL,
                PIPELINE_ID_LABEL => self.pipeline_id.to_string()
            )
            .increment(1);
            warn!(requeues = progress.requeues, error = %err, "target lock busy, requeueing run");

            tokio::select! {
                _ = tokio::time::sleep(lock_config.requeue_delay()) => {}
                _ = wait_for_shutdown(cancel_rx) => {
                    bail!(ErrorKind::RunCancelled, "Run was cancelled while requeued");
                }
            }
        }
    }
}

fn set_phase(phase_tx: &watch::Sender<RunPhase>, phase: RunPhase) {
    let previous = phase_tx.send_replace(phase);
    if previous != phase {
        debug!(?previous, ?phase, "run phase changed");
    }
}

/// Streams the router must not replicate: tables whose bulk transfer failed, and
/// `FULL_TABLE` tables the bulk path already copied completely.
fn excluded_streams(catalog: &Catalog, report: Option<&FastSyncReport>) -> BTreeSet<StreamId> {
    let Some(report) = report else {
        return BTreeSet::new();
    };

    report
        .tables
        .iter()
        .filter(|table| {
            table.status != TableStatus::Succeeded
                || catalog.entry(&table.stream).is_some_and(|entry| {
                    entry.replication_method == ReplicationMethod::FullTable
                })
        })
        .map(|table| table.stream.clone())
        .collect()
}

async fn write_summary(run_dir: &Path, result: &RunResult) -> TapflowResult<()> {
    tokio::fs::create_dir_all(run_dir).await?;
    let summary = serde_json::to_vec_pretty(result)?;
    tokio::fs::write(run_dir.join(SUMMARY_FILE), summary).await?;

    Ok(())
}
