//! Results of pipeline runs.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{ErrorKind, TapflowError, TapflowResult};
use crate::fastsync::FastSyncReport;
use crate::process::{ConnectorRole, FailureSummary, ProcessExit};
use crate::router::RouteStats;
use crate::state::checkpoint::Checkpoint;
use crate::types::{PipelineId, RunId};
use crate::workers::policy::build_error_handling_policy;

/// Terminal outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunOutcome {
    Success,
    Failed,
    Cancelled,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::Failed => "failed",
            RunOutcome::Cancelled => "cancelled",
        }
    }
}

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    /// Waiting for a controller slot.
    Queued,
    WaitingForLock,
    /// Bulk loading tables.
    FastSync,
    /// Connector processes are running through the router.
    Replicating,
    Finished,
}

/// Structured description of why a run did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureDescription {
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<ConnectorRole>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Failure reported by (or synthesized for) the connector that failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<FailureSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub solution: Option<String>,
}

impl FailureDescription {
    pub fn from_error(error: &TapflowError, process_exits: &[ProcessExit]) -> Self {
        let failed_exit = if error.kind() == ErrorKind::SubprocessFailure {
            failed_process(process_exits)
        } else {
            None
        };

        Self {
            kind: error.kind().to_string(),
            message: error.summary(),
            role: failed_exit.map(|exit| exit.role),
            exit_code: failed_exit.and_then(|exit| exit.code),
            summary: failed_exit.and_then(|exit| exit.failure.clone()),
            solution: build_error_handling_policy(error)
                .solution()
                .map(str::to_string),
        }
    }
}

/// The process whose failure ended the run: the first that failed on its own, otherwise the
/// first unsuccessful one.
fn failed_process(process_exits: &[ProcessExit]) -> Option<&ProcessExit> {
    process_exits
        .iter()
        .find(|exit| !exit.success() && !exit.terminated_by_request())
        .or_else(|| process_exits.iter().find(|exit| !exit.success()))
}

/// Everything a run collected before it ended, successful or not.
#[derive(Debug, Default)]
pub struct RunProgress {
    pub process_exits: Vec<ProcessExit>,
    pub last_checkpoint: Option<Checkpoint>,
    pub fastsync: Option<FastSyncReport>,
    pub stats: RouteStats,
    pub requeues: u32,
}

/// Summary of one pipeline run, also written to `summary.json` in the run directory.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: RunId,
    pub pipeline_id: PipelineId,
    pub outcome: RunOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub process_exits: Vec<ProcessExit>,
    pub last_checkpoint: Option<Checkpoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fastsync: Option<FastSyncReport>,
    pub stats: RouteStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureDescription>,
    pub requeues: u32,
    /// The error that ended the run, kept for callers inspecting it programmatically.
    #[serde(skip)]
    pub error: Option<TapflowError>,
}

impl RunResult {
    pub fn finish(
        run_id: RunId,
        pipeline_id: PipelineId,
        started_at: DateTime<Utc>,
        progress: RunProgress,
        result: TapflowResult<()>,
    ) -> Self {
        let (outcome, failure, error) = match result {
            Ok(()) => (RunOutcome::Success, None, None),
            Err(err) => {
                let outcome = if err.kind() == ErrorKind::RunCancelled {
                    RunOutcome::Cancelled
                } else {
                    RunOutcome::Failed
                };
                let failure = FailureDescription::from_error(&err, &progress.process_exits);

                (outcome, Some(failure), Some(err))
            }
        };

        Self {
            run_id,
            pipeline_id,
            outcome,
            started_at,
            finished_at: Utc::now(),
            process_exits: progress.process_exits,
            last_checkpoint: progress.last_checkpoint,
            fastsync: progress.fastsync,
            stats: progress.stats,
            failure,
            requeues: progress.requeues,
            error,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Success
    }
}
