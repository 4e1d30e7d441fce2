use metrics::counter;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{Instrument, debug, error, info, warn};

use crate::concurrency::shutdown::{ShutdownRx, is_shutdown, wait_for_shutdown};
use crate::error::{ErrorKind, TapflowError, TapflowResult};
use crate::failpoints::{ROUTER__BEFORE_CHECKPOINT_COMMIT, tapflow_fail_point};
use crate::metrics::{
    MESSAGE_TYPE_LABEL, PIPELINE_ID_LABEL, ROLE_LABEL, TAPFLOW_CHECKPOINTS_COMMITTED_TOTAL,
    TAPFLOW_MESSAGES_ROUTED_TOTAL, TAPFLOW_PROCESS_FAILURES_TOTAL,
};
use crate::process::{
    ConnectorRole, ProcessExit, ProcessHandle, ProcessSignaller, ProcessSpec, Signal, StdioMode,
    start,
};
use crate::protocol::{Message, MessageType, TYPE_KEY, decode, encode};
use crate::router::tracker::{CheckpointTracker, PendingState, RouteStats};
use crate::router::transform::ColumnTransformer;
use crate::state::checkpoint::Checkpoint;
use crate::state::store::CheckpointStore;
use crate::types::{PipelineId, RunId, StreamId};
use crate::{bail, tapflow_error};

/// Everything the router needs to run the stages of one pipeline run.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub pipeline_id: PipelineId,
    pub run_id: RunId,
    pub extractor: ProcessSpec,
    pub transformer: Option<ProcessSpec>,
    pub loader: ProcessSpec,
    pub columns: ColumnTransformer,
    pub terminate_grace: Duration,
    pub stderr_tail_lines: usize,
}

/// What happened during a router run.
#[derive(Debug)]
pub struct RouteOutcome {
    pub result: TapflowResult<()>,
    pub process_exits: Vec<ProcessExit>,
    pub stats: RouteStats,
    /// The latest checkpoint of the pipeline, committed by this run or before it.
    pub last_checkpoint: Option<Checkpoint>,
}

enum TaskOutput {
    Hop(TapflowResult<()>),
    Acknowledgments(TapflowResult<()>),
    Exit(TapflowResult<ProcessExit>),
}

struct Wiring {
    extractor_out: ChildStdout,
    transformer: Option<(ChildStdin, ChildStdout)>,
    loader_in: ChildStdin,
    loader_out: ChildStdout,
}

/// Shared by the loader hop, the acknowledgment reader and the final commit.
struct Committer<S> {
    pipeline_id: PipelineId,
    run_id: RunId,
    store: S,
    tracker: Mutex<CheckpointTracker>,
}

impl<S> Committer<S>
where
    S: CheckpointStore,
{
    async fn commit(&self, pending: PendingState) -> TapflowResult<Checkpoint> {
        tapflow_fail_point(ROUTER__BEFORE_CHECKPOINT_COMMIT)?;

        let previous = self.tracker.lock().await.last_committed().cloned();
        let checkpoint = Checkpoint::next(
            self.pipeline_id.clone(),
            previous.as_ref(),
            self.run_id,
            pending.value,
            pending.activated_versions,
        );

        self.store.commit(checkpoint.clone()).await?;
        self.tracker.lock().await.mark_committed(checkpoint.clone());

        counter!(
            TAPFLOW_CHECKPOINTS_COMMITTED_TOTAL,
            PIPELINE_ID_LABEL => self.pipeline_id.to_string()
        )
        .increment(1);
        info!(sequence = checkpoint.sequence, "checkpoint committed");

        Ok(checkpoint)
    }
}

/// One forwarding hop between two stages.
struct Hop<S> {
    upstream: ConnectorRole,
    downstream: ConnectorRole,
    /// Set on the hop reading the extractor.
    columns: Option<ColumnTransformer>,
    /// Set on the hop reading the extractor. Versions already activated before this run.
    committed_versions: Option<BTreeMap<StreamId, u64>>,
    /// Set on the hop writing to the loader.
    committer: Option<Arc<Committer<S>>>,
    /// Once cancelled, nothing more is forwarded and the downstream input is closed.
    shutdown_rx: ShutdownRx,
}

impl<S> Hop<S>
where
    S: CheckpointStore,
{
    async fn forward(self, upstream: ChildStdout, mut downstream: ChildStdin) -> TapflowResult<()> {
        let mut reader = BufReader::new(upstream);
        let mut buf = Vec::new();
        let mut seen_schemas = HashSet::new();
        let mut line_number = 0u64;
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            buf.clear();
            let read = tokio::select! {
                biased;

                _ = wait_for_shutdown(&mut shutdown_rx) => {
                    debug!(upstream = %self.upstream, lines = line_number, "run cancelled, forwarding stopped");
                    return Ok(());
                }

                read = reader.read_until(b'\n', &mut buf) => read
                    .map_err(|err| pipe_error("Failed to read stage output", self.upstream, err))?,
            };
            if read == 0 {
                break;
            }
            line_number += 1;

            let Ok(line) = std::str::from_utf8(&buf) else {
                bail!(
                    ErrorKind::ProtocolError,
                    "Stage output is not valid UTF-8",
                    format!("{} line {line_number}", self.upstream)
                );
            };
            if line.trim().is_empty() {
                continue;
            }

            let message = decode(line).map_err(|err| {
                tapflow_error!(
                    ErrorKind::ProtocolError,
                    "Stage emitted an invalid message",
                    format!("{} line {line_number}: {}", self.upstream, err.summary()),
                    source: err
                )
            })?;

            let Some(message) = self.process(message, &mut seen_schemas, line_number).await? else {
                continue;
            };
            if is_shutdown(&shutdown_rx) {
                debug!(upstream = %self.upstream, lines = line_number, "run cancelled, forwarding stopped");
                return Ok(());
            }

            let mut encoded = encode(&message);
            encoded.push('\n');
            downstream
                .write_all(encoded.as_bytes())
                .await
                .map_err(|err| pipe_error("Failed to write to downstream stage", self.downstream, err))?;
        }

        downstream
            .flush()
            .await
            .map_err(|err| pipe_error("Failed to write to downstream stage", self.downstream, err))?;
        debug!(upstream = %self.upstream, lines = line_number, "stage output finished");

        Ok(())
    }

    /// Validates ordering and applies the per hop rules. `None` drops the message.
    async fn process(
        &self,
        message: Message,
        seen_schemas: &mut HashSet<String>,
        line_number: u64,
    ) -> TapflowResult<Option<Message>> {
        let message = match message {
            Message::Schema(schema) => {
                seen_schemas.insert(schema.stream.clone());
                Message::Schema(schema)
            }
            Message::Record(mut record) => {
                if !seen_schemas.contains(&record.stream) {
                    bail!(
                        ErrorKind::ProtocolError,
                        "Record received before the schema of its stream",
                        format!("{} line {line_number}: stream `{}`", self.upstream, record.stream)
                    );
                }
                if let Some(columns) = &self.columns {
                    columns.apply(&mut record)?;
                }
                Message::Record(record)
            }
            Message::ActivateVersion(activate) => {
                let already_active = self.committed_versions.as_ref().is_some_and(|committed| {
                    committed
                        .get(&activate.stream)
                        .is_some_and(|version| activate.version <= *version)
                });
                if already_active {
                    debug!(
                        stream = %activate.stream,
                        version = activate.version,
                        "skipping already activated table version"
                    );
                    return Ok(None);
                }
                Message::ActivateVersion(activate)
            }
            Message::State(state) => Message::State(state),
        };

        if let Some(committer) = &self.committer {
            let pipeline_id = committer.pipeline_id.to_string();
            let mut tracker = committer.tracker.lock().await;

            match &message {
                Message::Schema(schema) => tracker.stats_mut().stream_mut(&schema.stream).schemas += 1,
                Message::Record(record) => tracker.stats_mut().stream_mut(&record.stream).records += 1,
                Message::ActivateVersion(activate) => {
                    tracker.record_activation(&activate.stream, activate.version);
                    tracker.stats_mut().stream_mut(&activate.stream).activate_versions += 1;
                }
                // Held as pending before the loader can possibly acknowledge it.
                Message::State(state) => tracker.push_pending(state.value.clone()),
            }

            counter!(
                TAPFLOW_MESSAGES_ROUTED_TOTAL,
                PIPELINE_ID_LABEL => pipeline_id,
                MESSAGE_TYPE_LABEL => message.message_type().as_str()
            )
            .increment(1);
        }

        Ok(Some(message))
    }
}

/// Reads loader output and commits acknowledged states.
async fn read_acknowledgments<S>(
    loader_out: ChildStdout,
    committer: Arc<Committer<S>>,
    shutdown_rx: ShutdownRx,
) -> TapflowResult<()>
where
    S: CheckpointStore,
{
    let mut reader = BufReader::new(loader_out);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let read = reader
            .read_until(b'\n', &mut buf)
            .await
            .map_err(|err| pipe_error("Failed to read stage output", ConnectorRole::Loader, err))?;
        if read == 0 {
            return Ok(());
        }

        let line = String::from_utf8_lossy(&buf);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let Some(ack) = parse_acknowledgment(line) else {
            info!(role = %ConnectorRole::Loader, "{line}");
            continue;
        };

        if is_shutdown(&shutdown_rx) {
            debug!("ignoring acknowledgment received after cancellation");
            continue;
        }

        let pending = committer.tracker.lock().await.acknowledge(&ack);
        match pending {
            Some(pending) => {
                committer.commit(pending).await?;
            }
            None => warn!(acknowledgment = %ack, "acknowledgment matches no pending state"),
        }
    }
}

/// A JSON object on loader output acknowledges a state. It is either the state value itself or
/// a `STATE` message wrapping it.
fn parse_acknowledgment(line: &str) -> Option<Value> {
    let Value::Object(mut object) = serde_json::from_str(line).ok()? else {
        return None;
    };

    if object.get(TYPE_KEY).and_then(Value::as_str) == Some(MessageType::State.as_str()) {
        return object.remove("value");
    }

    Some(Value::Object(object))
}

fn pipe_error(description: &'static str, role: ConnectorRole, err: std::io::Error) -> TapflowError {
    tapflow_error!(ErrorKind::IoError, description, role, source: err)
}

fn subprocess_failure(exit: &ProcessExit) -> TapflowError {
    let status = match (exit.code, exit.signal) {
        (Some(code), _) => format!("exit code {code}"),
        (None, Some(signal)) => format!("signal {signal}"),
        (None, None) => "unknown status".to_string(),
    };
    let detail = match &exit.failure {
        Some(failure) => format!("{} failed with {status}: {}: {}", exit.role, failure.kind, failure.message),
        None => format!("{} failed with {status}", exit.role),
    };

    tapflow_error!(ErrorKind::SubprocessFailure, "Connector process failed", detail)
}

fn start_stages(config: &RouterConfig, handles: &mut Vec<ProcessHandle>) -> TapflowResult<Wiring> {
    let tail = config.stderr_tail_lines;

    let mut loader = start(&config.loader, StdioMode::Piped, StdioMode::Piped, tail)?;
    let (loader_in, loader_out) = (loader.take_stdin(), loader.take_stdout());
    handles.push(loader);
    let (Some(loader_in), Some(loader_out)) = (loader_in, loader_out) else {
        bail!(ErrorKind::InvalidState, "Loader pipes are not available");
    };

    let transformer = match &config.transformer {
        Some(spec) => {
            let mut transformer = start(spec, StdioMode::Piped, StdioMode::Piped, tail)?;
            let pipes = (transformer.take_stdin(), transformer.take_stdout());
            handles.push(transformer);
            let (Some(transformer_in), Some(transformer_out)) = pipes else {
                bail!(ErrorKind::InvalidState, "Transformer pipes are not available");
            };
            Some((transformer_in, transformer_out))
        }
        None => None,
    };

    let mut extractor = start(&config.extractor, StdioMode::Null, StdioMode::Piped, tail)?;
    let extractor_out = extractor.take_stdout();
    handles.push(extractor);
    let Some(extractor_out) = extractor_out else {
        bail!(ErrorKind::InvalidState, "Extractor pipes are not available");
    };

    Ok(Wiring {
        extractor_out,
        transformer,
        loader_in,
        loader_out,
    })
}

/// Sends terminate to every stage, then kill to whatever is left after `grace`.
fn escalate(signallers: Vec<ProcessSignaller>, grace: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        for signaller in &signallers {
            if let Err(err) = signaller.signal(Signal::Terminate) {
                warn!(role = %signaller.role(), error = %err, "failed to terminate stage");
            }
        }

        tokio::time::sleep(grace).await;

        for signaller in &signallers {
            if let Err(err) = signaller.signal(Signal::Kill) {
                warn!(role = %signaller.role(), error = %err, "failed to kill stage");
            }
        }
    })
}

/// Runs the stages of a pipeline and routes their messages until every stage exited.
///
/// Stages start downstream first: loader, transformer, extractor. `committed` is the
/// checkpoint the extractor resumes from. Cancelling through `shutdown_rx` stops forwarding,
/// terminates every stage and discards pending states.
pub async fn route<S>(
    config: RouterConfig,
    committed: Option<Checkpoint>,
    store: S,
    mut shutdown_rx: ShutdownRx,
) -> RouteOutcome
where
    S: CheckpointStore + Send + Sync + 'static,
{
    let committed_versions = committed
        .as_ref()
        .map(|checkpoint| checkpoint.activated_versions.clone())
        .unwrap_or_default();
    let committer = Arc::new(Committer {
        pipeline_id: config.pipeline_id.clone(),
        run_id: config.run_id,
        store,
        tracker: Mutex::new(CheckpointTracker::new(committed.clone())),
    });

    let mut handles = Vec::with_capacity(3);
    let wiring = match start_stages(&config, &mut handles) {
        Ok(wiring) => wiring,
        Err(err) => {
            error!(error = %err, "failed to start stages");
            let mut process_exits = Vec::with_capacity(handles.len());
            for handle in handles {
                let role = handle.role();
                match handle.terminate(config.terminate_grace).await {
                    Ok(exit) => process_exits.push(exit),
                    Err(err) => warn!(%role, error = %err, "failed to stop stage"),
                }
            }

            return RouteOutcome {
                result: Err(err),
                process_exits,
                stats: RouteStats::default(),
                last_checkpoint: committed,
            };
        }
    };

    let signallers: Vec<ProcessSignaller> = handles.iter().map(ProcessHandle::signaller).collect();
    let mut tasks = JoinSet::new();
    for handle in handles {
        tasks.spawn(async move { TaskOutput::Exit(handle.wait().await) }.in_current_span());
    }

    let Wiring {
        extractor_out,
        transformer,
        loader_in,
        loader_out,
    } = wiring;
    let columns = (!config.columns.is_empty()).then(|| config.columns.clone());
    match transformer {
        Some((transformer_in, transformer_out)) => {
            let extract: Hop<S> = Hop {
                upstream: ConnectorRole::Extractor,
                downstream: ConnectorRole::Transformer,
                columns,
                committed_versions: Some(committed_versions),
                committer: None,
                shutdown_rx: shutdown_rx.clone(),
            };
            let load = Hop {
                upstream: ConnectorRole::Transformer,
                downstream: ConnectorRole::Loader,
                columns: None,
                committed_versions: None,
                committer: Some(committer.clone()),
                shutdown_rx: shutdown_rx.clone(),
            };
            tasks.spawn(
                async move { TaskOutput::Hop(extract.forward(extractor_out, transformer_in).await) }
                    .in_current_span(),
            );
            tasks.spawn(
                async move { TaskOutput::Hop(load.forward(transformer_out, loader_in).await) }
                    .in_current_span(),
            );
        }
        None => {
            let hop = Hop {
                upstream: ConnectorRole::Extractor,
                downstream: ConnectorRole::Loader,
                columns,
                committed_versions: Some(committed_versions),
                committer: Some(committer.clone()),
                shutdown_rx: shutdown_rx.clone(),
            };
            tasks.spawn(
                async move { TaskOutput::Hop(hop.forward(extractor_out, loader_in).await) }
                    .in_current_span(),
            );
        }
    }
    {
        let committer = committer.clone();
        let shutdown_rx = shutdown_rx.clone();
        tasks.spawn(
            async move {
                TaskOutput::Acknowledgments(
                    read_acknowledgments(loader_out, committer, shutdown_rx).await,
                )
            }
            .in_current_span(),
        );
    }

    let mut primary_errors: Vec<TapflowError> = Vec::new();
    let mut stage_failures: Vec<TapflowError> = Vec::new();
    let mut pipe_errors: Vec<TapflowError> = Vec::new();
    let mut process_exits = Vec::new();
    let mut cancelled = false;
    let mut escalation: Option<JoinHandle<()>> = None;

    loop {
        tokio::select! {
            biased;

            _ = wait_for_shutdown(&mut shutdown_rx), if !cancelled => {
                info!("run cancelled, terminating stages");
                cancelled = true;
                if escalation.is_none() {
                    escalation = Some(escalate(signallers.clone(), config.terminate_grace));
                }
            }

            joined = tasks.join_next() => {
                let Some(joined) = joined else {
                    break;
                };

                let failed = match joined.map_err(TapflowError::from) {
                    Ok(TaskOutput::Hop(Ok(()))) | Ok(TaskOutput::Acknowledgments(Ok(()))) => false,
                    Ok(TaskOutput::Hop(Err(err))) | Ok(TaskOutput::Acknowledgments(Err(err))) => {
                        if err.kind() == ErrorKind::IoError {
                            debug!(error = %err.summary(), "pipe closed");
                            pipe_errors.push(err);
                        } else {
                            error!(error = %err, "routing failed");
                            primary_errors.push(err);
                        }
                        true
                    }
                    Ok(TaskOutput::Exit(Ok(exit))) => {
                        let stopped_on_request = (escalation.is_some() || cancelled)
                            && exit.terminated_by_request();
                        let failed = !exit.success() && !stopped_on_request;
                        if failed {
                            let err = subprocess_failure(&exit);
                            error!(role = %exit.role, error = %err.summary(), "stage failed");
                            counter!(
                                TAPFLOW_PROCESS_FAILURES_TOTAL,
                                PIPELINE_ID_LABEL => config.pipeline_id.to_string(),
                                ROLE_LABEL => exit.role.as_str()
                            )
                            .increment(1);
                            stage_failures.push(err);
                        }
                        process_exits.push(exit);
                        failed
                    }
                    Ok(TaskOutput::Exit(Err(err))) | Err(err) => {
                        error!(error = %err, "stage supervision failed");
                        primary_errors.push(err);
                        true
                    }
                };

                if failed && escalation.is_none() {
                    escalation = Some(escalate(signallers.clone(), config.terminate_grace));
                }
            }
        }
    }

    if let Some(escalation) = escalation.take() {
        escalation.abort();
    }

    let clean = !cancelled
        && primary_errors.is_empty()
        && stage_failures.is_empty()
        && pipe_errors.is_empty()
        && process_exits
            .iter()
            .any(|exit| exit.role == ConnectorRole::Loader && exit.success());

    let latest = {
        let mut tracker = committer.tracker.lock().await;
        if clean {
            tracker.take_latest()
        } else {
            let discarded = tracker.discard_pending();
            if discarded > 0 {
                info!(discarded, "discarding unacknowledged states");
            }
            None
        }
    };
    if let Some(latest) = latest {
        // A clean loader exit confirms everything it consumed was written.
        if let Err(err) = committer.commit(latest).await {
            error!(error = %err, "final checkpoint commit failed");
            primary_errors.push(err);
        }
    }

    let result = if !primary_errors.is_empty() {
        Err(primary_errors.into())
    } else if cancelled {
        Err(tapflow_error!(ErrorKind::RunCancelled, "Run was cancelled"))
    } else if !stage_failures.is_empty() {
        Err(stage_failures.into())
    } else if !pipe_errors.is_empty() {
        Err(pipe_errors.into())
    } else {
        Ok(())
    };

    let tracker = committer.tracker.lock().await;

    RouteOutcome {
        result,
        process_exits,
        stats: tracker.stats().clone(),
        last_checkpoint: tracker.last_committed().cloned(),
    }
}
