use serde_json::json;
use tapflow::error::ErrorKind;
use tapflow::failpoints::{
    FASTSYNC__BEFORE_MERGE_COMMIT, ROUTER__BEFORE_CHECKPOINT_COMMIT, RUN__BEFORE_ROUTER,
};
use tapflow::fastsync::TableStatus;
use tapflow::state::store::CheckpointStore;
use tapflow::test_utils::connectors::ConnectorScripts;
use tapflow::test_utils::failpoints::CustomFailScenario;
use tapflow::test_utils::notifying_store::NotifyingCheckpointStore;
use tapflow::test_utils::pipeline::{
    PipelineBuilder, create_controller, pipeline_id, test_settings, write_catalog,
};
use tapflow::RunOutcome;
use tapflow_telemetry::tracing::init_test_tracing;

fn state(position: u64) -> serde_json::Value {
    json!({"type": "STATE", "value": {"bookmarks": {"A": {"replication_key": "id", "replication_key_value": position}}}})
}

#[tokio::test(flavor = "multi_thread")]
async fn crash_between_commits_resumes_from_the_last_commit() {
    init_test_tracing();
    let scripts = ConnectorScripts::new();
    let work_dir = tempfile::tempdir().unwrap();

    let catalog = write_catalog(scripts.path(), &[("A", "INCREMENTAL")]);
    let loader = scripts.acknowledging_loader("target");
    let store = NotifyingCheckpointStore::new();
    let controller = create_controller(test_settings(work_dir.path()), store.clone());

    let extractor = scripts.extractor("tap-1", &[state(1), state(2), state(3)], 0);
    let definition = PipelineBuilder::new("orders", &extractor, &loader, &catalog).build();

    {
        let _scenario = CustomFailScenario::setup(&[(ROUTER__BEFORE_CHECKPOINT_COMMIT, "1*off->return")]);

        let handle = controller.submit(definition).await.unwrap();
        let result = controller.wait(handle).await;

        assert_eq!(result.outcome, RunOutcome::Failed);
        assert_eq!(result.failure.unwrap().kind, "injected_fault");
    }

    let committed = store.load(&pipeline_id("orders")).await.unwrap().unwrap();
    assert_eq!(committed.sequence, 1);
    assert_eq!(committed.bookmark, state(1)["value"]);

    // The next run starts from the only checkpoint that made it to the store.
    let extractor = scripts.extractor("tap-2", &[state(2), state(3)], 0);
    let definition = PipelineBuilder::new("orders", &extractor, &loader, &catalog).build();
    let handle = controller.submit(definition).await.unwrap();
    let result = controller.wait(handle).await;

    assert!(result.is_success(), "{:?}", result.failure);
    assert_eq!(scripts.extractor_state("tap-2").unwrap(), state(1)["value"]);
    assert_eq!(result.last_checkpoint.unwrap().sequence, 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn failure_before_routing_leaves_the_checkpoint_untouched() {
    init_test_tracing();
    let scripts = ConnectorScripts::new();
    let work_dir = tempfile::tempdir().unwrap();

    let catalog = write_catalog(scripts.path(), &[("A", "INCREMENTAL")]);
    let loader = scripts.acknowledging_loader("target");
    let store = NotifyingCheckpointStore::new();
    let controller = create_controller(test_settings(work_dir.path()), store.clone());

    let extractor = scripts.extractor("tap", &[state(1)], 0);
    let definition = PipelineBuilder::new("orders", &extractor, &loader, &catalog).build();

    let _scenario = CustomFailScenario::setup(&[(RUN__BEFORE_ROUTER, "return(checkpoint_io)")]);

    let handle = controller.submit(definition).await.unwrap();
    let result = controller.wait(handle).await;

    assert_eq!(result.outcome, RunOutcome::Failed);
    assert_eq!(result.error.unwrap().kind(), ErrorKind::CheckpointIoError);
    assert!(result.process_exits.is_empty());
    assert!(scripts.extractor_args("tap").is_empty());
    assert!(store.load(&pipeline_id("orders")).await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_bulk_merge_marks_only_that_table_failed() {
    init_test_tracing();
    let scripts = ConnectorScripts::new();
    let work_dir = tempfile::tempdir().unwrap();

    let catalog = write_catalog(scripts.path(), &[("T", "FULL_TABLE"), ("U", "FULL_TABLE")]);
    let loader = scripts.acknowledging_loader("target");
    let store = NotifyingCheckpointStore::new();
    let controller = create_controller(test_settings(work_dir.path()), store.clone());

    let extractor = scripts.extractor("tap", &[], 0);
    let fastsync = scripts.fastsync("fastsync", 10, &[]);
    let definition = PipelineBuilder::new("orders", &extractor, &loader, &catalog)
        .fastsync(&fastsync, 1)
        .build();

    // Tables are copied one at a time, so the first merge fails and the second one succeeds.
    let _scenario = CustomFailScenario::setup(&[(FASTSYNC__BEFORE_MERGE_COMMIT, "1*return->off")]);

    let handle = controller.submit(definition).await.unwrap();
    let result = controller.wait(handle).await;

    assert_eq!(result.outcome, RunOutcome::Success);

    let report = result.fastsync.unwrap();
    let failed: Vec<_> = report
        .tables
        .iter()
        .filter(|table| table.status == TableStatus::Failed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].error_kind.as_deref(), Some("injected_fault"));

    let committed = store.load(&pipeline_id("orders")).await.unwrap().unwrap();
    assert_eq!(committed.sequence, 1);
    assert!(committed.stream_bookmark(&failed[0].stream).is_none());
}
