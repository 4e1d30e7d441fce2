use serde_json::Value;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tapflow_config::shared::PipelineDefinition;
use tracing::{info, warn};

use crate::concurrency::shutdown::{ShutdownRx, wait_for_shutdown};
use crate::error::{ErrorKind, TapflowResult};
use crate::process::command::fastsync_spec;
use crate::process::{ProcessExit, Signal, StdioMode, start};
use crate::state::checkpoint::stream_bookmark;
use crate::types::{PipelineId, RunId, StreamId};
use crate::{bail, tapflow_error};

/// One table to copy in bulk.
#[derive(Debug, Clone)]
pub struct BulkTransferRequest {
    pub pipeline_id: PipelineId,
    pub run_id: RunId,
    pub definition: Arc<PipelineDefinition>,
    pub stream: StreamId,
    /// File the transfer writes its end position to.
    pub output_path: PathBuf,
}

/// Copies a whole table to the destination outside of the message protocol.
///
/// Resolves to the position the incremental path resumes from, which becomes
/// `bookmarks.<stream>` of the pipeline checkpoint.
pub trait BulkTransfer {
    fn transfer(
        &self,
        request: BulkTransferRequest,
        shutdown_rx: ShutdownRx,
    ) -> impl Future<Output = TapflowResult<Value>> + Send;
}

/// Runs the pipeline's fastsync command as a child process, one table per invocation.
#[derive(Debug, Clone)]
pub struct CommandBulkTransfer {
    terminate_grace: Duration,
    stderr_tail_lines: usize,
}

impl CommandBulkTransfer {
    pub fn new(terminate_grace: Duration, stderr_tail_lines: usize) -> Self {
        Self {
            terminate_grace,
            stderr_tail_lines,
        }
    }
}

impl BulkTransfer for CommandBulkTransfer {
    async fn transfer(
        &self,
        request: BulkTransferRequest,
        mut shutdown_rx: ShutdownRx,
    ) -> TapflowResult<Value> {
        let definition = &request.definition;
        let Some(fastsync) = &definition.fastsync else {
            bail!(
                ErrorKind::ConfigError,
                "Pipeline has no fastsync definition",
                request.pipeline_id
            );
        };

        let spec = fastsync_spec(
            fastsync,
            &definition.extractor,
            &definition.loader,
            &request.stream,
            &request.output_path,
        );
        let handle = start(
            &spec,
            StdioMode::Null,
            StdioMode::Null,
            self.stderr_tail_lines,
        )
        .map_err(|err| {
            tapflow_error!(
                ErrorKind::BulkTransferError,
                "Failed to start bulk transfer",
                format!("stream `{}`", request.stream),
                source: err
            )
        })?;
        let signaller = handle.signaller();

        let wait = handle.wait();
        tokio::pin!(wait);

        let exit = tokio::select! {
            exit = &mut wait => exit?,
            _ = wait_for_shutdown(&mut shutdown_rx) => {
                info!(stream = %request.stream, "stopping bulk transfer");
                signaller.signal(Signal::Terminate)?;
                if tokio::time::timeout(self.terminate_grace, &mut wait).await.is_err() {
                    warn!(stream = %request.stream, "bulk transfer ignored terminate, killing it");
                    signaller.signal(Signal::Kill)?;
                    let _ = wait.await;
                }

                bail!(
                    ErrorKind::RunCancelled,
                    "Bulk transfer was cancelled",
                    format!("stream `{}`", request.stream)
                );
            }
        };

        if !exit.success() {
            bail!(
                ErrorKind::BulkTransferError,
                "Bulk transfer failed",
                failure_detail(&request.stream, &exit)
            );
        }

        read_position(&request).await
    }
}

fn failure_detail(stream: &str, exit: &ProcessExit) -> String {
    let status = match (exit.code, exit.signal) {
        (Some(code), _) => format!("exit code {code}"),
        (None, Some(signal)) => format!("signal {signal}"),
        (None, None) => "unknown status".to_string(),
    };

    match &exit.failure {
        Some(failure) => format!(
            "stream `{stream}`, {status}: {}: {}",
            failure.kind, failure.message
        ),
        None => format!("stream `{stream}`, {status}"),
    }
}

/// Reads `bookmarks.<stream>` from the output file of a finished transfer.
async fn read_position(request: &BulkTransferRequest) -> TapflowResult<Value> {
    let contents = tokio::fs::read(&request.output_path).await.map_err(|err| {
        tapflow_error!(
            ErrorKind::BulkTransferError,
            "Bulk transfer did not write its end position",
            request.output_path.display(),
            source: err
        )
    })?;

    let output: Value = serde_json::from_slice(&contents).map_err(|err| {
        tapflow_error!(
            ErrorKind::BulkTransferError,
            "Bulk transfer wrote an invalid end position",
            request.output_path.display(),
            source: err
        )
    })?;

    let Some(position) = stream_bookmark(&output, &request.stream) else {
        bail!(
            ErrorKind::BulkTransferError,
            "Bulk transfer output has no position for the stream",
            format!(
                "stream `{}` missing from {}",
                request.stream,
                request.output_path.display()
            )
        );
    };

    Ok(Value::Object(position.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::shutdown::{create_shutdown_channel, trigger_shutdown};
    use serde_json::json;
    use std::path::Path;

    fn request(dir: &Path, script: &str) -> BulkTransferRequest {
        let definition: PipelineDefinition = serde_json::from_value(json!({
            "id": "orders",
            "extractor": {"kind": "postgres", "command": "tap", "config_path": "tap.json"},
            "loader": {"kind": "postgres", "command": "target", "config_path": "target.json"},
            "catalog_path": "catalog.json",
            "target_lock_key": "warehouse",
            "fastsync": {"command": "/bin/sh", "args": ["-c", script, "fastsync"]}
        }))
        .unwrap();

        BulkTransferRequest {
            pipeline_id: PipelineId::new("orders").unwrap(),
            run_id: RunId::new(),
            definition: Arc::new(definition),
            stream: "public-users".to_string(),
            output_path: dir.join("public-users.json"),
        }
    }

    // `$8` is the value following `--state`.
    const WRITE_POSITION: &str =
        r#"printf '{"bookmarks": {"public-users": {"lsn": 42}}}' > "$8""#;

    #[tokio::test]
    async fn successful_transfer_returns_the_stream_position() {
        let dir = tempfile::tempdir().unwrap();
        let (_tx, rx) = create_shutdown_channel();
        let transfer = CommandBulkTransfer::new(Duration::from_secs(1), 20);

        let position = transfer
            .transfer(request(dir.path(), WRITE_POSITION), rx)
            .await
            .unwrap();

        assert_eq!(position, json!({"lsn": 42}));
    }

    #[tokio::test]
    async fn failing_command_is_a_bulk_transfer_error() {
        let dir = tempfile::tempdir().unwrap();
        let (_tx, rx) = create_shutdown_channel();
        let transfer = CommandBulkTransfer::new(Duration::from_secs(1), 20);

        let err = transfer
            .transfer(request(dir.path(), "echo 'copy failed' >&2; exit 3"), rx)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::BulkTransferError);
        assert!(err.detail().unwrap().contains("exit code 3"));
    }

    #[tokio::test]
    async fn missing_position_is_a_bulk_transfer_error() {
        let dir = tempfile::tempdir().unwrap();
        let (_tx, rx) = create_shutdown_channel();
        let transfer = CommandBulkTransfer::new(Duration::from_secs(1), 20);

        let err = transfer
            .transfer(
                request(dir.path(), r#"printf '{"bookmarks": {}}' > "$8""#),
                rx,
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::BulkTransferError);
    }

    #[tokio::test]
    async fn cancellation_stops_the_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = create_shutdown_channel();
        let transfer = CommandBulkTransfer::new(Duration::from_millis(200), 20);

        let running = tokio::spawn({
            let request = request(dir.path(), "sleep 30");
            async move { transfer.transfer(request, rx).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger_shutdown(&tx);

        let err = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::RunCancelled);
    }
}
