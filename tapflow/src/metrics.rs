//! Metric names and labels emitted by the engine.

/// Label for the pipeline id.
pub const PIPELINE_ID_LABEL: &str = "pipeline_id";

/// Label for the stream a message or table belongs to.
pub const STREAM_LABEL: &str = "stream";

/// Label for the message type (`SCHEMA`, `RECORD`, ...).
pub const MESSAGE_TYPE_LABEL: &str = "message_type";

/// Label for the terminal outcome of a run or table.
pub const OUTCOME_LABEL: &str = "outcome";

/// Label for the connector role of a process.
pub const ROLE_LABEL: &str = "role";

// Run metrics

/// Counter of runs that obtained a slot and started executing.
pub const TAPFLOW_RUNS_STARTED_TOTAL: &str = "tapflow_runs_started_total";

/// Counter of finished runs, labelled by outcome.
pub const TAPFLOW_RUNS_FINISHED_TOTAL: &str = "tapflow_runs_finished_total";

/// Gauge of runs currently executing.
pub const TAPFLOW_RUNS_ACTIVE: &str = "tapflow_runs_active";

/// Counter of runs put back in the queue after a lock timeout.
pub const TAPFLOW_RUN_REQUEUES_TOTAL: &str = "tapflow_run_requeues_total";

/// Histogram of seconds spent waiting for a target lock.
pub const TAPFLOW_LOCK_WAIT_SECONDS: &str = "tapflow_lock_wait_seconds";

// Stream metrics

/// Counter of messages forwarded to the loader, labelled by type.
pub const TAPFLOW_MESSAGES_ROUTED_TOTAL: &str = "tapflow_messages_routed_total";

/// Counter of connector processes that exited unsuccessfully, labelled by role.
pub const TAPFLOW_PROCESS_FAILURES_TOTAL: &str = "tapflow_process_failures_total";

// Checkpoint metrics

/// Counter of checkpoints committed.
pub const TAPFLOW_CHECKPOINTS_COMMITTED_TOTAL: &str = "tapflow_checkpoints_committed_total";

/// Counter of checkpoint commit attempts that were retried.
pub const TAPFLOW_CHECKPOINT_COMMIT_RETRIES_TOTAL: &str = "tapflow_checkpoint_commit_retries_total";

// Bulk transfer metrics

/// Counter of bulk table transfers, labelled by outcome.
pub const TAPFLOW_BULK_TABLES_TOTAL: &str = "tapflow_bulk_tables_total";
