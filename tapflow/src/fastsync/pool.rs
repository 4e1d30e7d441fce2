use metrics::counter;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tapflow_config::shared::PipelineDefinition;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{Instrument, error, info, info_span};

use crate::concurrency::shutdown::{ShutdownRx, is_shutdown, wait_for_shutdown};
use crate::concurrency::target_lock::{TargetLocks, table_lock_key};
use crate::error::{ErrorKind, TapflowError, TapflowResult};
use crate::failpoints::{FASTSYNC__BEFORE_MERGE_COMMIT, tapflow_fail_point};
use crate::fastsync::bulk::{BulkTransfer, BulkTransferRequest};
use crate::fastsync::plan::FastSyncPlan;
use crate::metrics::{OUTCOME_LABEL, PIPELINE_ID_LABEL, STREAM_LABEL, TAPFLOW_BULK_TABLES_TOTAL};
use crate::state::checkpoint::{Checkpoint, with_stream_bookmark};
use crate::state::store::CheckpointStore;
use crate::types::{PipelineId, RunId, StreamId};
use crate::{bail, tapflow_error};

/// Final state of one bulk loaded table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Succeeded,
    Failed,
    Cancelled,
}

impl TableStatus {
    fn as_str(&self) -> &'static str {
        match self {
            TableStatus::Succeeded => "succeeded",
            TableStatus::Failed => "failed",
            TableStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableOutcome {
    pub stream: StreamId,
    pub status: TableStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// What the bulk path did during a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FastSyncReport {
    pub plan: FastSyncPlan,
    pub tables: Vec<TableOutcome>,
    /// The run was cancelled before every planned table finished.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
}

impl FastSyncReport {
    pub fn failed_streams(&self) -> BTreeSet<StreamId> {
        self.tables
            .iter()
            .filter(|table| table.status != TableStatus::Succeeded)
            .map(|table| table.stream.clone())
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.tables
            .iter()
            .all(|table| table.status == TableStatus::Succeeded)
    }
}

/// Dependencies of the bulk path of one run.
#[derive(Debug, Clone)]
pub struct FastSyncContext<S, B> {
    pub pipeline_id: PipelineId,
    pub run_id: RunId,
    pub definition: Arc<PipelineDefinition>,
    /// Directory receiving one output file per table.
    pub output_dir: PathBuf,
    pub store: S,
    pub bulk: B,
    pub locks: TargetLocks,
    pub lock_timeout: Duration,
}

struct TableWorker<S, B> {
    context: FastSyncContext<S, B>,
    /// Serializes merge commits of tables finishing at the same time.
    merge_lock: Mutex<()>,
    permits: Semaphore,
}

impl<S, B> TableWorker<S, B>
where
    S: CheckpointStore,
    B: BulkTransfer,
{
    async fn sync(&self, stream: &StreamId, mut shutdown_rx: ShutdownRx) -> TapflowResult<()> {
        let context = &self.context;

        let _permit = tokio::select! {
            permit = self.permits.acquire() => permit.map_err(|err| {
                tapflow_error!(ErrorKind::InvalidState, "Bulk transfer slots were closed", source: err)
            })?,
            _ = wait_for_shutdown(&mut shutdown_rx) => {
                bail!(ErrorKind::RunCancelled, "Bulk transfer was cancelled before it started");
            }
        };

        let lock_key = table_lock_key(&context.definition.target_lock_key, stream);
        let _lock = tokio::select! {
            lock = context.locks.acquire(&lock_key, context.lock_timeout) => lock?,
            _ = wait_for_shutdown(&mut shutdown_rx) => {
                bail!(ErrorKind::RunCancelled, "Bulk transfer was cancelled while waiting for its lock");
            }
        };

        let request = BulkTransferRequest {
            pipeline_id: context.pipeline_id.clone(),
            run_id: context.run_id,
            definition: context.definition.clone(),
            stream: stream.clone(),
            output_path: context.output_dir.join(output_file_name(stream)),
        };
        let position = context.bulk.transfer(request, shutdown_rx).await?;

        tapflow_fail_point(FASTSYNC__BEFORE_MERGE_COMMIT)?;
        self.merge(stream, position).await
    }

    /// Writes the position of `stream` into the latest checkpoint, leaving other streams as
    /// they are.
    async fn merge(&self, stream: &str, position: serde_json::Value) -> TapflowResult<()> {
        let context = &self.context;
        let _merge = self.merge_lock.lock().await;

        let current = context.store.load(&context.pipeline_id).await?;
        let bookmark = with_stream_bookmark(
            current.as_ref().map(|checkpoint| &checkpoint.bookmark),
            stream,
            position,
        );
        let activated_versions = current
            .as_ref()
            .map(|checkpoint| checkpoint.activated_versions.clone())
            .unwrap_or_default();
        let checkpoint = Checkpoint::next(
            context.pipeline_id.clone(),
            current.as_ref(),
            context.run_id,
            bookmark,
            activated_versions,
        );
        let sequence = checkpoint.sequence;

        context.store.commit(checkpoint).await?;
        info!(%stream, sequence, "merged bulk transfer position into checkpoint");

        Ok(())
    }
}

/// Keeps stream ids with path separators from escaping the output directory.
fn output_file_name(stream: &str) -> String {
    let name: String = stream
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();

    format!("{name}.json")
}

/// Bulk loads the planned tables, at most `max_parallel_tables` at a time.
///
/// Every table is tracked on its own: a failed transfer does not stop the others and leaves no
/// position behind for its stream. On cancellation the report lists what finished so far and
/// is marked `cancelled`. Returns an error only when a worker could not be joined.
pub async fn run_fastsync<S, B>(
    context: FastSyncContext<S, B>,
    plan: FastSyncPlan,
    shutdown_rx: ShutdownRx,
) -> TapflowResult<FastSyncReport>
where
    S: CheckpointStore + Send + Sync + 'static,
    B: BulkTransfer + Send + Sync + 'static,
{
    let max_parallel_tables = context
        .definition
        .fastsync
        .as_ref()
        .map_or(1, |fastsync| fastsync.max_parallel_tables.max(1) as usize);
    let pipeline_id = context.pipeline_id.clone();
    let worker = Arc::new(TableWorker {
        context,
        merge_lock: Mutex::new(()),
        permits: Semaphore::new(max_parallel_tables),
    });

    info!(tables = plan.bulk.len(), max_parallel_tables, "starting bulk transfers");

    let mut join_set: JoinSet<(StreamId, TapflowResult<()>, Duration)> = JoinSet::new();
    for stream in plan.bulk.iter().cloned() {
        let worker = worker.clone();
        let shutdown_rx = shutdown_rx.clone();
        let span = info_span!("bulk_table", %stream);

        join_set.spawn(
            async move {
                let started = Instant::now();
                let result = worker.sync(&stream, shutdown_rx).await;

                (stream, result, started.elapsed())
            }
            .instrument(span),
        );
    }

    let mut report = FastSyncReport {
        plan,
        ..FastSyncReport::default()
    };
    let mut errors: Vec<TapflowError> = Vec::new();

    while let Some(joined) = join_set.join_next().await {
        let (stream, result, elapsed) = match joined {
            Ok(joined) => joined,
            Err(err) => {
                errors.push(tapflow_error!(
                    ErrorKind::RunPanic,
                    "Bulk transfer worker panicked",
                    source: err
                ));
                continue;
            }
        };

        let outcome = table_outcome(stream, result, elapsed);
        counter!(
            TAPFLOW_BULK_TABLES_TOTAL,
            PIPELINE_ID_LABEL => pipeline_id.to_string(),
            STREAM_LABEL => outcome.stream.clone(),
            OUTCOME_LABEL => outcome.status.as_str()
        )
        .increment(1);
        report.tables.push(outcome);
    }
    report.tables.sort_by(|a, b| a.stream.cmp(&b.stream));

    if !errors.is_empty() {
        return Err(errors.into());
    }

    if is_shutdown(&shutdown_rx) {
        report.cancelled = true;
        info!(
            succeeded = succeeded(&report),
            tables = report.tables.len(),
            "bulk transfers cancelled"
        );
    }

    Ok(report)
}

fn table_outcome(stream: StreamId, result: TapflowResult<()>, elapsed: Duration) -> TableOutcome {
    let duration_ms = elapsed.as_millis() as u64;

    match result {
        Ok(()) => {
            info!(%stream, ?elapsed, "bulk transfer finished");

            TableOutcome {
                stream,
                status: TableStatus::Succeeded,
                error_kind: None,
                error: None,
                duration_ms,
            }
        }
        Err(err) => {
            let status = if err.kind() == ErrorKind::RunCancelled {
                TableStatus::Cancelled
            } else {
                error!(%stream, error = %err, "bulk transfer failed");
                TableStatus::Failed
            };

            TableOutcome {
                stream,
                status,
                error_kind: Some(err.kind().to_string()),
                error: Some(err.summary()),
                duration_ms,
            }
        }
    }
}

fn succeeded(report: &FastSyncReport) -> usize {
    report
        .tables
        .iter()
        .filter(|table| table.status == TableStatus::Succeeded)
        .count()
}
