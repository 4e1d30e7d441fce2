use thiserror::Error;

/// Errors found while validating configuration before anything is started.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("`max_parallel_runs` must be greater than zero")]
    MaxParallelRunsZero,

    #[error("pipeline id `{0}` is invalid, use only ASCII letters, digits, `-` and `_`")]
    InvalidPipelineId(String),

    #[error("pipeline id `{0}` is defined more than once")]
    DuplicatePipelineId(String),

    #[error("pipeline `{pipeline_id}` has an empty {role} command")]
    EmptyCommand {
        pipeline_id: String,
        role: &'static str,
    },

    #[error("pipeline `{0}` has an empty target lock key")]
    EmptyTargetLockKey(String),

    #[error("pipeline `{0}` has a fastsync definition with `max_parallel_tables` set to zero")]
    MaxParallelTablesZero(String),

    #[error("pipeline `{pipeline_id}` has a transformation with an empty stream or column")]
    IncompleteTransformation { pipeline_id: String },

    #[error("`checkpoint_retry.max_attempts` must be greater than zero")]
    RetryMaxAttemptsZero,

    #[error("`checkpoint_retry.backoff_factor` must be at least 1.0")]
    RetryBackoffFactorTooSmall,

    #[error("`checkpoint_retry.initial_delay_ms` must not exceed `max_delay_ms`")]
    RetryDelaysInverted,

    #[error("trusted root certificates are required when tls is enabled")]
    MissingTrustedRootCerts,
}

/// Returns whether `id` can be used as a pipeline id.
///
/// Pipeline ids name files and directories on disk, so they are restricted to a portable
/// character set.
pub fn is_valid_pipeline_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
