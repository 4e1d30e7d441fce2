use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::TapflowResult;
use crate::state::checkpoint::{Checkpoint, ensure_progress};
use crate::state::store::base::CheckpointStore;
use crate::types::PipelineId;

#[derive(Debug, Default)]
struct Inner {
    checkpoints: HashMap<PipelineId, Checkpoint>,
    /// Every accepted commit per pipeline, oldest first.
    history: HashMap<PipelineId, Vec<Checkpoint>>,
}

/// Keeps checkpoints in process memory. Everything is lost on exit.
///
/// A single mutex serializes all commits, which trivially satisfies the per pipeline
/// ordering.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all checkpoints accepted for `pipeline_id`, oldest first.
    pub async fn history(&self, pipeline_id: &PipelineId) -> Vec<Checkpoint> {
        let inner = self.inner.lock().await;

        inner.history.get(pipeline_id).cloned().unwrap_or_default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, pipeline_id: &PipelineId) -> TapflowResult<Option<Checkpoint>> {
        let inner = self.inner.lock().await;

        Ok(inner.checkpoints.get(pipeline_id).cloned())
    }

    async fn commit(&self, checkpoint: Checkpoint) -> TapflowResult<()> {
        let mut inner = self.inner.lock().await;

        if let Some(current) = inner.checkpoints.get(&checkpoint.pipeline_id) {
            if current.is_same_commit(&checkpoint) {
                return Ok(());
            }
            ensure_progress(current, &checkpoint)?;
        }

        inner
            .history
            .entry(checkpoint.pipeline_id.clone())
            .or_default()
            .push(checkpoint.clone());
        inner
            .checkpoints
            .insert(checkpoint.pipeline_id.clone(), checkpoint);

        Ok(())
    }

    async fn reset(&self, pipeline_id: &PipelineId) -> TapflowResult<()> {
        let mut inner = self.inner.lock().await;
        inner.checkpoints.remove(pipeline_id);

        Ok(())
    }
}
