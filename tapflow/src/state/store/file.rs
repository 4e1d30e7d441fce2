use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

use crate::concurrency::keyed_lock::KeyedLock;
use crate::error::{ErrorKind, TapflowError, TapflowResult};
use crate::state::checkpoint::{Checkpoint, ensure_progress};
use crate::state::store::base::CheckpointStore;
use crate::tapflow_error;
use crate::types::PipelineId;

const CHECKPOINT_EXTENSION: &str = "json";

/// Stores one JSON document per pipeline in a directory.
///
/// A commit writes a temporary file next to the target, flushes it to disk, renames it over the
/// target and flushes the directory, so a crash leaves either the old or the new document.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    directory: PathBuf,
    locks: KeyedLock<PipelineId>,
}

impl FileCheckpointStore {
    /// Creates the store, creating `directory` when missing.
    pub async fn new(directory: impl Into<PathBuf>) -> TapflowResult<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory)
            .await
            .map_err(|err| checkpoint_io("Failed to create the checkpoint directory", &directory, err))?;

        info!(directory = %directory.display(), "using file checkpoint store");

        Ok(Self {
            directory,
            locks: KeyedLock::new(),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn checkpoint_path(&self, pipeline_id: &PipelineId) -> PathBuf {
        self.directory
            .join(format!("{pipeline_id}.{CHECKPOINT_EXTENSION}"))
    }

    async fn read(&self, pipeline_id: &PipelineId) -> TapflowResult<Option<Checkpoint>> {
        let path = self.checkpoint_path(pipeline_id);

        let contents = match fs::read(&path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == IoErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(checkpoint_io("Failed to read checkpoint", &path, err)),
        };

        let checkpoint = serde_json::from_slice(&contents).map_err(|err| {
            tapflow_error!(
                ErrorKind::DeserializationError,
                "Checkpoint document is corrupt",
                format!("{}: {err}", path.display()),
                source: err
            )
        })?;

        Ok(Some(checkpoint))
    }

    async fn write_atomically(&self, path: &Path, contents: &[u8]) -> TapflowResult<()> {
        let temp_path = path.with_extension(format!("{CHECKPOINT_EXTENSION}.tmp-{}", Uuid::new_v4()));

        let result = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(contents).await?;
            file.sync_all().await?;
            drop(file);

            fs::rename(&temp_path, path).await?;

            // The rename itself is only durable once the directory entry is flushed.
            fs::File::open(&self.directory).await?.sync_all().await
        }
        .await;

        if let Err(err) = result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(checkpoint_io("Failed to write checkpoint", path, err));
        }

        Ok(())
    }
}

impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, pipeline_id: &PipelineId) -> TapflowResult<Option<Checkpoint>> {
        self.read(pipeline_id).await
    }

    async fn commit(&self, checkpoint: Checkpoint) -> TapflowResult<()> {
        let _guard = self.locks.lock(&checkpoint.pipeline_id).await;

        if let Some(current) = self.read(&checkpoint.pipeline_id).await? {
            if current.is_same_commit(&checkpoint) {
                debug!(
                    pipeline_id = %checkpoint.pipeline_id,
                    sequence = checkpoint.sequence,
                    "checkpoint already persisted"
                );
                return Ok(());
            }
            ensure_progress(&current, &checkpoint)?;
        }

        let path = self.checkpoint_path(&checkpoint.pipeline_id);
        let contents = serde_json::to_vec_pretty(&checkpoint)?;
        self.write_atomically(&path, &contents).await?;

        debug!(
            pipeline_id = %checkpoint.pipeline_id,
            sequence = checkpoint.sequence,
            "checkpoint written"
        );

        Ok(())
    }

    async fn reset(&self, pipeline_id: &PipelineId) -> TapflowResult<()> {
        let _guard = self.locks.lock(pipeline_id).await;
        let path = self.checkpoint_path(pipeline_id);

        match fs::remove_file(&path).await {
            Ok(()) => {
                info!(%pipeline_id, "checkpoint reset");
                Ok(())
            }
            Err(err) if err.kind() == IoErrorKind::NotFound => Ok(()),
            Err(err) => Err(checkpoint_io("Failed to remove checkpoint", &path, err)),
        }
    }
}

fn checkpoint_io(description: &'static str, path: &Path, err: std::io::Error) -> TapflowError {
    tapflow_error!(
        ErrorKind::CheckpointIoError,
        description,
        format!("{}: {err}", path.display()),
        source: err
    )
}
