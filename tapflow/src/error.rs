//! Error types and result definitions for the replication engine.
//!
//! [`TapflowError`] carries a classification ([`ErrorKind`]), a static description, optional
//! dynamic detail, an optional source, the call site that created it and a backtrace. Several
//! errors can be aggregated into one, which is how failures of concurrently running tasks are
//! reported.

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

/// Result type used across the engine.
pub type TapflowResult<T> = Result<T, TapflowError>;

#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

/// Main error type of the engine.
///
/// Cloning is cheap: the source and backtrace are shared.
#[derive(Debug, Clone)]
pub struct TapflowError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    Single(ErrorPayload),
    /// Failures collected from several tasks, for example parallel bulk transfers.
    Many {
        errors: Vec<TapflowError>,
        location: &'static Location<'static>,
    },
}

/// Classification of engine failures.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Stream errors
    /// A stage emitted a line that is not a valid message or violates ordering.
    ProtocolError,

    // Process errors
    /// A connector process could not be started or exited unsuccessfully.
    SubprocessFailure,
    /// A bulk transfer of one table failed.
    BulkTransferError,

    // Checkpoint errors
    /// Reading or writing a checkpoint failed. Commits are retried.
    CheckpointIoError,
    /// A commit would move the persisted position backwards.
    CheckpointRegression,

    // Scheduling errors
    /// The target lock could not be acquired in time.
    LockContentionTimeout,
    RunCancelled,
    RunPanic,

    // General errors
    ConfigError,
    IoError,
    SerializationError,
    DeserializationError,
    InvalidState,
    Unknown,

    // Used by fault injection tests only.
    #[cfg(feature = "failpoints")]
    InjectedFault,
}

impl ErrorKind {
    /// Stable name used in run summaries and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ProtocolError => "protocol_error",
            ErrorKind::SubprocessFailure => "subprocess_failure",
            ErrorKind::BulkTransferError => "bulk_transfer_error",
            ErrorKind::CheckpointIoError => "checkpoint_io_error",
            ErrorKind::CheckpointRegression => "checkpoint_regression",
            ErrorKind::LockContentionTimeout => "lock_contention_timeout",
            ErrorKind::RunCancelled => "run_cancelled",
            ErrorKind::RunPanic => "run_panic",
            ErrorKind::ConfigError => "config_error",
            ErrorKind::IoError => "io_error",
            ErrorKind::SerializationError => "serialization_error",
            ErrorKind::DeserializationError => "deserialization_error",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::Unknown => "unknown",
            #[cfg(feature = "failpoints")]
            ErrorKind::InjectedFault => "injected_fault",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TapflowError {
    /// Returns the kind of this error, or of the first aggregated one.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.kind,
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns every kind contained in this error, flattened.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::Single(ref payload) => vec![payload.kind],
            ErrorRepr::Many { ref errors, .. } => errors.iter().flat_map(|err| err.kinds()).collect(),
        }
    }

    /// Returns the static description, or the first one for aggregated errors.
    pub fn description(&self) -> &str {
        match self.repr {
            ErrorRepr::Single(ref payload) => &payload.description,
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.description())
                .unwrap_or("multiple errors"),
        }
    }

    /// Returns the dynamic detail, or the first available one for aggregated errors.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.detail.as_deref(),
            ErrorRepr::Many { ref errors, .. } => errors.iter().find_map(|err| err.detail()),
        }
    }

    /// Returns the aggregated errors, or a single element slice.
    pub fn errors(&self) -> &[TapflowError] {
        match self.repr {
            ErrorRepr::Single(_) => std::slice::from_ref(self),
            ErrorRepr::Many { ref errors, .. } => errors,
        }
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self.repr {
            ErrorRepr::Single(ref payload) => Some(payload.backtrace.as_ref()),
            ErrorRepr::Many { .. } => None,
        }
    }

    pub fn location(&self) -> &'static Location<'static> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.location,
            ErrorRepr::Many { location, .. } => location,
        }
    }

    /// Attaches the error that caused this one.
    ///
    /// Has no effect on aggregated errors, which expose their first error as source.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        if let ErrorRepr::Single(ref mut payload) = self.repr {
            payload.source = Some(Arc::new(source));
        }

        self
    }

    /// One line rendering without location and backtrace, used in run summaries.
    pub fn summary(&self) -> String {
        match self.detail() {
            Some(detail) => format!("{}: {}", self.description(), detail),
            None => self.description().to_string(),
        }
    }

    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        TapflowError {
            repr: ErrorRepr::Single(ErrorPayload {
                kind,
                description,
                detail,
                source,
                location: Location::caller(),
                backtrace: Arc::new(Backtrace::capture()),
            }),
        }
    }
}

impl PartialEq for TapflowError {
    fn eq(&self, other: &TapflowError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::Single(a), ErrorRepr::Single(b)) => a.kind == b.kind,
            (ErrorRepr::Many { errors: a, .. }, ErrorRepr::Many { errors: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for TapflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            ErrorRepr::Single(payload) => {
                let location = payload.location;
                write!(
                    f,
                    "[{:?}] {} @ {}:{}:{}",
                    payload.kind,
                    payload.description,
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                if let Some(detail) = payload.detail.as_deref() {
                    write_indented(f, "Detail:", detail)?;
                }

                let backtrace = payload.backtrace.to_string();
                if !backtrace.trim().is_empty() {
                    write_indented(f, "Backtrace:", &backtrace)?;
                }

                Ok(())
            }
            ErrorRepr::Many { errors, location } => {
                write!(
                    f,
                    "[Many] {} error{} aggregated @ {}:{}:{}",
                    errors.len(),
                    if errors.len() == 1 { "" } else { "s" },
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                for (index, error) in errors.iter().enumerate() {
                    let rendered = error.to_string();
                    let mut lines = rendered.lines();
                    write!(f, "\n  {}. {}", index + 1, lines.next().unwrap_or_default())?;
                    for line in lines {
                        write!(f, "\n     {line}")?;
                    }
                }

                Ok(())
            }
        }
    }
}

fn write_indented(f: &mut fmt::Formatter<'_>, header: &str, body: &str) -> fmt::Result {
    write!(f, "\n  {header}")?;
    for line in body.lines() {
        if line.trim().is_empty() {
            write!(f, "\n    ")?;
        } else {
            write!(f, "\n    {line}")?;
        }
    }

    Ok(())
}

impl error::Error for TapflowError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload
                .source
                .as_ref()
                .map(|source| source.as_ref() as &(dyn error::Error + 'static)),
            ErrorRepr::Many { errors, .. } => errors
                .first()
                .map(|error| error as &(dyn error::Error + 'static)),
        }
    }
}

impl From<(ErrorKind, &'static str)> for TapflowError {
    #[track_caller]
    fn from((kind, description): (ErrorKind, &'static str)) -> TapflowError {
        TapflowError::from_components(kind, Cow::Borrowed(description), None, None)
    }
}

impl<D> From<(ErrorKind, &'static str, D)> for TapflowError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, description, detail): (ErrorKind, &'static str, D)) -> TapflowError {
        TapflowError::from_components(kind, Cow::Borrowed(description), Some(detail.into()), None)
    }
}

/// Aggregates errors. A single error is returned unwrapped.
impl<E> From<Vec<E>> for TapflowError
where
    E: Into<TapflowError>,
{
    #[track_caller]
    fn from(errors: Vec<E>) -> TapflowError {
        let location = Location::caller();
        let mut errors: Vec<TapflowError> = errors.into_iter().map(Into::into).collect();

        if errors.len() == 1 {
            if let Some(error) = errors.pop() {
                return error;
            }
        }

        TapflowError {
            repr: ErrorRepr::Many { errors, location },
        }
    }
}

impl From<std::io::Error> for TapflowError {
    #[track_caller]
    fn from(err: std::io::Error) -> TapflowError {
        let detail = err.to_string();
        TapflowError::from_components(
            ErrorKind::IoError,
            Cow::Borrowed("I/O operation failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<serde_json::Error> for TapflowError {
    #[track_caller]
    fn from(err: serde_json::Error) -> TapflowError {
        let (kind, description) = match err.classify() {
            serde_json::error::Category::Io => (ErrorKind::IoError, "JSON I/O operation failed"),
            serde_json::error::Category::Syntax
            | serde_json::error::Category::Data
            | serde_json::error::Category::Eof => {
                (ErrorKind::DeserializationError, "JSON deserialization failed")
            }
        };

        let detail = err.to_string();
        TapflowError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Database errors only come from the Postgres checkpoint store, so they are all checkpoint
/// I/O failures and therefore retried.
impl From<sqlx::Error> for TapflowError {
    #[track_caller]
    fn from(err: sqlx::Error) -> TapflowError {
        let description = match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                "Checkpoint database connection failed"
            }
            sqlx::Error::Migrate(_) => "Checkpoint database migration failed",
            _ => "Checkpoint database query failed",
        };

        let detail = err.to_string();
        TapflowError::from_components(
            ErrorKind::CheckpointIoError,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<sqlx::migrate::MigrateError> for TapflowError {
    #[track_caller]
    fn from(err: sqlx::migrate::MigrateError) -> TapflowError {
        let detail = err.to_string();
        TapflowError::from_components(
            ErrorKind::CheckpointIoError,
            Cow::Borrowed("Checkpoint database migration failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<tokio::task::JoinError> for TapflowError {
    #[track_caller]
    fn from(err: tokio::task::JoinError) -> TapflowError {
        let (kind, description) = if err.is_cancelled() {
            (ErrorKind::RunCancelled, "Task was cancelled")
        } else {
            (ErrorKind::RunPanic, "Task panicked")
        };

        let detail = err.to_string();
        TapflowError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<nix::errno::Errno> for TapflowError {
    #[track_caller]
    fn from(err: nix::errno::Errno) -> TapflowError {
        let detail = err.to_string();
        TapflowError::from_components(
            ErrorKind::IoError,
            Cow::Borrowed("System call failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<chrono::ParseError> for TapflowError {
    #[track_caller]
    fn from(err: chrono::ParseError) -> TapflowError {
        let detail = err.to_string();
        TapflowError::from_components(
            ErrorKind::DeserializationError,
            Cow::Borrowed("Timestamp parsing failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}
