use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

use crate::error::TapflowResult;
use crate::state::checkpoint::Checkpoint;
use crate::state::store::{CheckpointStore, MemoryCheckpointStore};
use crate::test_utils::notify::TimedNotify;
use crate::types::PipelineId;

type SequenceCondition = (PipelineId, u64, Arc<Notify>);

/// [`MemoryCheckpointStore`] that notifies tests when commits happen.
#[derive(Debug, Clone, Default)]
pub struct NotifyingCheckpointStore {
    inner: MemoryCheckpointStore,
    conditions: Arc<Mutex<Vec<SequenceCondition>>>,
}

impl NotifyingCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &MemoryCheckpointStore {
        &self.inner
    }

    /// Notifies once a checkpoint of `pipeline_id` with at least `sequence` is committed.
    ///
    /// Fires right away when such a checkpoint already exists.
    pub async fn notify_on_sequence(&self, pipeline_id: &PipelineId, sequence: u64) -> TimedNotify {
        let notify = Arc::new(Notify::new());

        let reached = self
            .inner
            .load(pipeline_id)
            .await
            .ok()
            .flatten()
            .is_some_and(|checkpoint| checkpoint.sequence >= sequence);
        if reached {
            notify.notify_one();
        } else {
            self.conditions
                .lock()
                .await
                .push((pipeline_id.clone(), sequence, notify.clone()));
        }

        TimedNotify::new(notify)
    }

    async fn check_conditions(&self, committed: &Checkpoint) {
        let mut conditions = self.conditions.lock().await;

        conditions.retain(|(pipeline_id, sequence, notify)| {
            let reached = *pipeline_id == committed.pipeline_id && committed.sequence >= *sequence;
            if reached {
                notify.notify_one();
            }

            !reached
        });
    }
}

impl CheckpointStore for NotifyingCheckpointStore {
    async fn load(&self, pipeline_id: &PipelineId) -> TapflowResult<Option<Checkpoint>> {
        self.inner.load(pipeline_id).await
    }

    async fn commit(&self, checkpoint: Checkpoint) -> TapflowResult<()> {
        self.inner.commit(checkpoint.clone()).await?;
        self.check_conditions(&checkpoint).await;

        Ok(())
    }

    async fn reset(&self, pipeline_id: &PipelineId) -> TapflowResult<()> {
        self.inner.reset(pipeline_id).await
    }
}
