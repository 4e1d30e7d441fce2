use crate::error::{ErrorKind, TapflowError};

/// Retry behavior for a classified error.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RetryDirective {
    /// The run goes back to the queue and tries again after the requeue delay.
    Requeue,
    /// The next invocation of the pipeline picks up from the last checkpoint on its own.
    NextRun,
    /// The pipeline should only run again after manual intervention.
    Manual,
}

/// Policy describing how a [`TapflowError`] ending a run should be handled.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ErrorHandlingPolicy {
    retry_directive: RetryDirective,
    solution: Option<&'static str>,
}

impl ErrorHandlingPolicy {
    const fn new(retry_directive: RetryDirective, solution: Option<&'static str>) -> Self {
        Self {
            retry_directive,
            solution,
        }
    }

    pub fn retry_directive(&self) -> RetryDirective {
        self.retry_directive
    }

    /// Operator facing hint reported with the failure.
    pub fn solution(&self) -> Option<&'static str> {
        self.solution
    }
}

/// Decides how the controller and operators treat an error that ended (or paused) a run.
pub fn build_error_handling_policy(error: &TapflowError) -> ErrorHandlingPolicy {
    match error.kind() {
        ErrorKind::LockContentionTimeout => ErrorHandlingPolicy::new(
            RetryDirective::Requeue,
            Some(
                "Another run holds the target lock. Raise `lock.acquire_timeout_ms` or `lock.max_requeues` if runs are expected to overlap.",
            ),
        ),

        ErrorKind::RunCancelled => ErrorHandlingPolicy::new(RetryDirective::NextRun, None),
        ErrorKind::BulkTransferError => ErrorHandlingPolicy::new(
            RetryDirective::NextRun,
            Some(
                "Failed tables are bulk loaded again on the next run. Check the fastsync logs if the failure repeats.",
            ),
        ),
        ErrorKind::CheckpointIoError => ErrorHandlingPolicy::new(
            RetryDirective::NextRun,
            Some("Verify the state store is reachable and writable."),
        ),

        ErrorKind::ProtocolError => ErrorHandlingPolicy::new(
            RetryDirective::Manual,
            Some("A connector emitted invalid output. Check the connector versions and their logs."),
        ),
        ErrorKind::SubprocessFailure => ErrorHandlingPolicy::new(
            RetryDirective::Manual,
            Some("Inspect the failure summary and the stderr of the failing connector."),
        ),
        ErrorKind::CheckpointRegression => ErrorHandlingPolicy::new(
            RetryDirective::Manual,
            Some(
                "The run tried to move a committed position backwards. Reset the pipeline checkpoint if the source was rewound deliberately.",
            ),
        ),
        ErrorKind::ConfigError => ErrorHandlingPolicy::new(
            RetryDirective::Manual,
            Some("Fix the pipeline definition or the files it references."),
        ),

        #[cfg(feature = "failpoints")]
        ErrorKind::InjectedFault => {
            ErrorHandlingPolicy::new(RetryDirective::NextRun, Some("Injected by a fail point."))
        }

        _ => ErrorHandlingPolicy::new(
            RetryDirective::Manual,
            Some(
                "There is no single prescribed solution for this error. Check the run summary and the logs of the run.",
            ),
        ),
    }
}
