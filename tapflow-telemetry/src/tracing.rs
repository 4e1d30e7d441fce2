use std::io;
use std::path::Path;
use std::sync::Once;

use tapflow_config::Environment;
use thiserror::Error;
use tracing::subscriber::SetGlobalDefaultError;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_log::LogTracer;
use tracing_log::log_tracer::SetLoggerError;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;

/// Filter used when `RUST_LOG` is not set.
const DEFAULT_LOG_FILTER: &str = "info";

/// Setting this variable to any value turns on log output in tests.
const ENABLE_TRACING_ENV: &str = "ENABLE_TRACING";

static TEST_TRACING: Once = Once::new();

#[derive(Debug, Error)]
pub enum TracingError {
    #[error("failed to bridge `log` records into tracing: {0}")]
    LogTracer(#[from] SetLoggerError),

    #[error("failed to install the global tracing subscriber: {0}")]
    SetGlobalDefault(#[from] SetGlobalDefaultError),

    #[error("failed to create the log file appender: {0}")]
    Appender(#[source] io::Error),
}

/// Flushes buffered log lines when dropped.
///
/// Keep it alive until the process is about to exit.
#[must_use]
pub struct LogFlusher {
    _guard: Option<WorkerGuard>,
}

/// Installs the global subscriber for `app_name`.
///
/// Logs are written as pretty text in development and as JSON lines in production. When
/// `log_dir` is set they go to a daily rotated file inside it instead of stdout.
pub fn init_tracing(
    app_name: &str,
    environment: Environment,
    log_dir: Option<&Path>,
) -> Result<LogFlusher, TracingError> {
    LogTracer::init()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let (writer, guard) = match log_dir {
        Some(log_dir) => {
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(app_name)
                .filename_suffix("log")
                .build(log_dir)
                .map_err(|err| TracingError::Appender(io::Error::other(err)))?;
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);

            (BoxMakeWriter::new(non_blocking), Some(guard))
        }
        None => (BoxMakeWriter::new(io::stdout), None),
    };

    if environment.is_prod() {
        let subscriber = tracing_subscriber::registry().with(filter).with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_writer(writer),
        );
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = tracing_subscriber::registry().with(filter).with(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_ansi(log_dir.is_none())
                .with_writer(writer),
        );
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(LogFlusher { _guard: guard })
}

/// Installs a test writer subscriber once per process when `ENABLE_TRACING` is set.
pub fn init_test_tracing() {
    if std::env::var_os(ENABLE_TRACING_ENV).is_none() {
        return;
    }

    TEST_TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
        let subscriber = tracing_subscriber::registry().with(filter).with(
            tracing_subscriber::fmt::layer()
                .with_test_writer()
                .with_target(false),
        );

        // Another test harness may already own the global subscriber.
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}
