use std::future::Future;

use crate::error::TapflowResult;
use crate::state::checkpoint::Checkpoint;
use crate::types::PipelineId;

/// Durable storage of the latest acknowledged checkpoint of every pipeline.
///
/// Implementations must guarantee that:
/// - a commit is atomic: after a crash either the new or the previous checkpoint is visible;
/// - commits for the same pipeline are serialized, commits for different pipelines are not;
/// - a commit that does not move forward from the persisted checkpoint (see
///   [`crate::state::checkpoint::ensure_progress`]) is rejected with
///   [`crate::error::ErrorKind::CheckpointRegression`] and leaves the store unchanged.
pub trait CheckpointStore {
    /// Returns the persisted checkpoint of `pipeline_id`, if any.
    fn load(
        &self,
        pipeline_id: &PipelineId,
    ) -> impl Future<Output = TapflowResult<Option<Checkpoint>>> + Send;

    /// Persists `checkpoint` as the latest checkpoint of its pipeline.
    fn commit(&self, checkpoint: Checkpoint) -> impl Future<Output = TapflowResult<()>> + Send;

    /// Removes the checkpoint of `pipeline_id`.
    ///
    /// This is the only way to move a pipeline back. The next run starts from scratch.
    fn reset(&self, pipeline_id: &PipelineId) -> impl Future<Output = TapflowResult<()>> + Send;
}
