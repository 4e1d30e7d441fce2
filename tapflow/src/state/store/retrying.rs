use metrics::counter;
use rand::Rng;
use std::time::Duration;
use tapflow_config::shared::RetryConfig;
use tracing::warn;

use crate::error::{ErrorKind, TapflowResult};
use crate::metrics::{PIPELINE_ID_LABEL, TAPFLOW_CHECKPOINT_COMMIT_RETRIES_TOTAL};
use crate::state::checkpoint::Checkpoint;
use crate::state::store::base::CheckpointStore;
use crate::types::PipelineId;

/// Wraps a store and retries commits that failed with [`ErrorKind::CheckpointIoError`].
///
/// Regressions and other failures are returned immediately. Delays follow the configured
/// exponential backoff with up to 25% random jitter added.
#[derive(Debug, Clone)]
pub struct RetryingCheckpointStore<S> {
    inner: S,
    config: RetryConfig,
}

impl<S> RetryingCheckpointStore<S> {
    pub fn new(inner: S, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn delay_after(&self, attempt: u32) -> Duration {
        let delay = self.config.delay_after(attempt);
        let jitter_ms = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 4);

        delay + Duration::from_millis(jitter_ms)
    }
}

impl<S> CheckpointStore for RetryingCheckpointStore<S>
where
    S: CheckpointStore + Send + Sync,
{
    async fn load(&self, pipeline_id: &PipelineId) -> TapflowResult<Option<Checkpoint>> {
        self.inner.load(pipeline_id).await
    }

    async fn commit(&self, checkpoint: Checkpoint) -> TapflowResult<()> {
        let mut attempt = 1;

        loop {
            let err = match self.inner.commit(checkpoint.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            if err.kind() != ErrorKind::CheckpointIoError || attempt >= self.config.max_attempts {
                return Err(err);
            }

            let delay = self.delay_after(attempt);
            warn!(
                pipeline_id = %checkpoint.pipeline_id,
                sequence = checkpoint.sequence,
                attempt,
                ?delay,
                error = %err.summary(),
                "checkpoint commit failed, retrying"
            );
            counter!(
                TAPFLOW_CHECKPOINT_COMMIT_RETRIES_TOTAL,
                PIPELINE_ID_LABEL => checkpoint.pipeline_id.to_string()
            )
            .increment(1);

            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn reset(&self, pipeline_id: &PipelineId) -> TapflowResult<()> {
        self.inner.reset(pipeline_id).await
    }
}
