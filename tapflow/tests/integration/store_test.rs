use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tapflow::error::ErrorKind;
use tapflow::state::checkpoint::Checkpoint;
use tapflow::state::store::{
    CheckpointStore, FileCheckpointStore, MemoryCheckpointStore, RetryingCheckpointStore,
};
use tapflow::test_utils::connectors::ConnectorScripts;
use tapflow::test_utils::pipeline::{
    PipelineBuilder, create_controller, pipeline_id, test_settings, write_catalog,
};
use tapflow::types::{PipelineId, RunId};
use tapflow_config::shared::RetryConfig;
use tapflow_telemetry::tracing::init_test_tracing;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

/// Commits `commits` checkpoints for each pipeline from concurrent tasks, each one reading the
/// latest checkpoint and committing the next under a lock shared by the tasks of its pipeline.
async fn commit_concurrently<S>(store: Arc<S>, pipelines: &[&str], commits: u64)
where
    S: CheckpointStore + Send + Sync + 'static,
{
    let mut tasks = JoinSet::new();

    for id in pipelines {
        let pipeline_id = pipeline_id(id);
        let writer = Arc::new(Mutex::new(()));

        for _ in 0..commits {
            let store = store.clone();
            let pipeline_id = pipeline_id.clone();
            let writer = writer.clone();

            tasks.spawn(async move {
                let _writer = writer.lock().await;
                let previous = store.load(&pipeline_id).await.unwrap();
                let position = previous.as_ref().map_or(1, |checkpoint| checkpoint.sequence + 1);
                let checkpoint = Checkpoint::next(
                    pipeline_id,
                    previous.as_ref(),
                    RunId::new(),
                    json!({"bookmarks": {"A": {"replication_key_value": position}}}),
                    BTreeMap::new(),
                );

                store.commit(checkpoint).await.unwrap();
            });
        }
    }

    while let Some(result) = tasks.join_next().await {
        result.unwrap();
    }
}

async fn assert_store_contract<S>(store: S)
where
    S: CheckpointStore + Send + Sync + 'static,
{
    let store = Arc::new(store);
    commit_concurrently(store.clone(), &["alpha", "beta"], 10).await;

    for id in ["alpha", "beta"] {
        let latest = store.load(&pipeline_id(id)).await.unwrap().unwrap();
        assert_eq!(latest.sequence, 10);
        assert_eq!(latest.bookmark["bookmarks"]["A"]["replication_key_value"], json!(10));
    }

    // A checkpoint moving the position backwards is rejected and leaves the store unchanged.
    let alpha = pipeline_id("alpha");
    let latest = store.load(&alpha).await.unwrap().unwrap();
    let backwards = Checkpoint::next(
        alpha.clone(),
        Some(&latest),
        RunId::new(),
        json!({"bookmarks": {"A": {"replication_key_value": 3}}}),
        BTreeMap::new(),
    );
    let err = store.commit(backwards).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CheckpointRegression);
    assert_eq!(store.load(&alpha).await.unwrap().unwrap(), latest);

    // Reset is the only way back.
    store.reset(&alpha).await.unwrap();
    assert!(store.load(&alpha).await.unwrap().is_none());
    assert!(store.load(&pipeline_id("beta")).await.unwrap().is_some());

    let restart = Checkpoint::next(
        alpha.clone(),
        None,
        RunId::new(),
        json!({"bookmarks": {"A": {"replication_key_value": 1}}}),
        BTreeMap::new(),
    );
    store.commit(restart).await.unwrap();
    assert_eq!(store.load(&alpha).await.unwrap().unwrap().sequence, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn file_store_honours_the_store_contract() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();

    assert_store_contract(FileCheckpointStore::new(dir.path()).await.unwrap()).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn memory_store_honours_the_store_contract() {
    init_test_tracing();

    assert_store_contract(MemoryCheckpointStore::new()).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn retrying_store_honours_the_store_contract() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let store = FileCheckpointStore::new(dir.path()).await.unwrap();

    assert_store_contract(RetryingCheckpointStore::new(store, RetryConfig::default())).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn file_store_survives_reopening() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let pipeline: PipelineId = pipeline_id("orders");

    let store = FileCheckpointStore::new(dir.path()).await.unwrap();
    commit_concurrently(Arc::new(store), &["orders"], 3).await;

    let reopened = FileCheckpointStore::new(dir.path()).await.unwrap();
    let checkpoint = reopened.load(&pipeline).await.unwrap().unwrap();
    assert_eq!(checkpoint.sequence, 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn reset_pipeline_starts_without_state() {
    init_test_tracing();
    let scripts = ConnectorScripts::new();
    let work_dir = tempfile::tempdir().unwrap();

    let catalog = write_catalog(scripts.path(), &[("A", "INCREMENTAL")]);
    let loader = scripts.acknowledging_loader("target");
    let extractor = scripts.extractor(
        "tap",
        &[json!({"type": "STATE", "value": {"bookmarks": {"A": {"replication_key_value": 5}}}})],
        0,
    );
    let controller = create_controller(test_settings(work_dir.path()), MemoryCheckpointStore::new());
    let definition = PipelineBuilder::new("orders", &extractor, &loader, &catalog).build();

    let handle = controller.submit(definition.clone()).await.unwrap();
    assert!(controller.wait(handle).await.is_success());

    controller.store().reset(&pipeline_id("orders")).await.unwrap();

    let handle = controller.submit(definition).await.unwrap();
    let result = controller.wait(handle).await;

    assert!(result.is_success());
    assert!(scripts.extractor_state("tap").is_none());
    assert_eq!(result.last_checkpoint.unwrap().sequence, 1);

    let history = controller.store().history(&pipeline_id("orders")).await;
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|checkpoint| checkpoint.sequence == 1));
}
