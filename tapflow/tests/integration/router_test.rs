use serde_json::json;
use std::collections::BTreeMap;
use tapflow::error::ErrorKind;
use tapflow::process::ConnectorRole;
use tapflow::protocol::{Message, MessageType};
use tapflow::state::Checkpoint;
use tapflow::state::store::{CheckpointStore, FileCheckpointStore};
use tapflow::test_utils::connectors::ConnectorScripts;
use tapflow::test_utils::notifying_store::NotifyingCheckpointStore;
use tapflow::test_utils::pipeline::{
    PipelineBuilder, create_controller, pipeline_id, test_settings, write_catalog,
};
use tapflow::types::RunId;
use tapflow::RunOutcome;
use tapflow_telemetry::tracing::init_test_tracing;

fn schema(stream: &str) -> serde_json::Value {
    json!({"type": "SCHEMA", "stream": stream, "schema": {"type": "object"}, "key_properties": ["id"]})
}

fn record(stream: &str, id: u64) -> serde_json::Value {
    json!({"type": "RECORD", "stream": stream, "record": {"id": id}})
}

fn state(stream: &str, id: u64) -> serde_json::Value {
    json!({"type": "STATE", "value": {"bookmarks": {stream: {"id": id}}}})
}

fn message_types(messages: &[Message]) -> Vec<MessageType> {
    messages.iter().map(Message::message_type).collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn acknowledged_state_is_committed_and_survives_a_restart() {
    init_test_tracing();
    let scripts = ConnectorScripts::new();
    let work_dir = tempfile::tempdir().unwrap();
    let state_dir = tempfile::tempdir().unwrap();

    let catalog = write_catalog(scripts.path(), &[("A", "INCREMENTAL")]);
    let extractor = scripts.extractor("tap", &[schema("A"), record("A", 1), state("A", 1)], 0);
    let loader = scripts.acknowledging_loader("target");
    let definition = PipelineBuilder::new("orders", &extractor, &loader, &catalog).build();

    let store = FileCheckpointStore::new(state_dir.path()).await.unwrap();
    let controller = create_controller(test_settings(work_dir.path()), store);

    let handle = controller.submit(definition).await.unwrap();
    let result = controller.wait(handle).await;

    assert_eq!(result.outcome, RunOutcome::Success);
    assert_eq!(result.stats.states_committed, 1);
    assert_eq!(result.stats.streams["A"].records, 1);
    assert_eq!(
        message_types(&scripts.loader_messages("target")),
        vec![MessageType::Schema, MessageType::Record, MessageType::State]
    );

    // A store opened after a restart sees the commit and rejects a stale one.
    let restarted = FileCheckpointStore::new(state_dir.path()).await.unwrap();
    let checkpoint = restarted.load(&pipeline_id("orders")).await.unwrap().unwrap();
    assert_eq!(checkpoint.sequence, 1);
    assert_eq!(checkpoint.bookmark, json!({"bookmarks": {"A": {"id": 1}}}));

    let stale = Checkpoint::next(
        pipeline_id("orders"),
        None,
        RunId::new(),
        json!({"bookmarks": {"A": {"id": 0}}}),
        BTreeMap::new(),
    );
    let err = restarted.commit(stale).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CheckpointRegression);

    let summary = std::fs::read_to_string(
        work_dir
            .path()
            .join("orders")
            .join(result.run_id.to_string())
            .join("summary.json"),
    )
    .unwrap();
    let summary: serde_json::Value = serde_json::from_str(&summary).unwrap();
    assert_eq!(summary["outcome"], "SUCCESS");
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_extractor_leaves_the_checkpoint_unchanged() {
    init_test_tracing();
    let scripts = ConnectorScripts::new();
    let work_dir = tempfile::tempdir().unwrap();

    let catalog = write_catalog(scripts.path(), &[("A", "INCREMENTAL")]);
    let extractor = scripts.extractor("tap", &[schema("A"), record("A", 1)], 1);
    let loader = scripts.acknowledging_loader("target");
    let definition = PipelineBuilder::new("orders", &extractor, &loader, &catalog).build();

    let store = NotifyingCheckpointStore::new();
    let controller = create_controller(test_settings(work_dir.path()), store.clone());

    let handle = controller.submit(definition).await.unwrap();
    let result = controller.wait(handle).await;

    assert_eq!(result.outcome, RunOutcome::Failed);
    let failure = result.failure.unwrap();
    assert_eq!(failure.kind, "subprocess_failure");
    assert_eq!(failure.role, Some(ConnectorRole::Extractor));
    assert_eq!(failure.exit_code, Some(1));
    assert!(result.last_checkpoint.is_none());
    assert!(store.load(&pipeline_id("orders")).await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn resumed_run_receives_the_committed_state() {
    init_test_tracing();
    let scripts = ConnectorScripts::new();
    let work_dir = tempfile::tempdir().unwrap();

    let catalog = write_catalog(scripts.path(), &[("A", "INCREMENTAL")]);
    let loader = scripts.acknowledging_loader("target");
    let store = NotifyingCheckpointStore::new();
    let controller = create_controller(test_settings(work_dir.path()), store.clone());

    let first = scripts.extractor("tap", &[schema("A"), record("A", 1), state("A", 1)], 0);
    let handle = controller
        .submit(PipelineBuilder::new("orders", &first, &loader, &catalog).build())
        .await
        .unwrap();
    assert!(controller.wait(handle).await.is_success());
    assert!(!scripts.extractor_args("tap").contains(&"--state".to_string()));
    assert!(scripts.extractor_state("tap").is_none());

    let second = scripts.extractor("tap", &[schema("A"), record("A", 2), state("A", 2)], 0);
    let handle = controller
        .submit(PipelineBuilder::new("orders", &second, &loader, &catalog).build())
        .await
        .unwrap();
    assert!(controller.wait(handle).await.is_success());

    assert!(scripts.extractor_args("tap").contains(&"--state".to_string()));
    assert_eq!(
        scripts.extractor_state("tap"),
        Some(json!({"bookmarks": {"A": {"id": 1}}}))
    );

    let history = store.inner().history(&pipeline_id("orders")).await;
    let sequences: Vec<u64> = history.iter().map(|checkpoint| checkpoint.sequence).collect();
    assert_eq!(sequences, vec![1, 2]);
}

#[tokio::test(flavor = "multi_thread")]
async fn silent_loader_commits_the_latest_state_on_clean_exit() {
    init_test_tracing();
    let scripts = ConnectorScripts::new();
    let work_dir = tempfile::tempdir().unwrap();

    let catalog = write_catalog(scripts.path(), &[("A", "INCREMENTAL")]);
    let extractor = scripts.extractor(
        "tap",
        &[schema("A"), record("A", 1), state("A", 1), record("A", 2), state("A", 2)],
        0,
    );
    let loader = scripts.silent_loader("target", 0);
    let store = NotifyingCheckpointStore::new();
    let controller = create_controller(test_settings(work_dir.path()), store.clone());

    let handle = controller
        .submit(PipelineBuilder::new("orders", &extractor, &loader, &catalog).build())
        .await
        .unwrap();
    let result = controller.wait(handle).await;

    assert!(result.is_success());
    let history = store.inner().history(&pipeline_id("orders")).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].bookmark, json!({"bookmarks": {"A": {"id": 2}}}));
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_silent_loader_commits_nothing() {
    init_test_tracing();
    let scripts = ConnectorScripts::new();
    let work_dir = tempfile::tempdir().unwrap();

    let catalog = write_catalog(scripts.path(), &[("A", "INCREMENTAL")]);
    let extractor = scripts.extractor("tap", &[schema("A"), record("A", 1), state("A", 1)], 0);
    let loader = scripts.silent_loader("target", 2);
    let store = NotifyingCheckpointStore::new();
    let controller = create_controller(test_settings(work_dir.path()), store.clone());

    let handle = controller
        .submit(PipelineBuilder::new("orders", &extractor, &loader, &catalog).build())
        .await
        .unwrap();
    let result = controller.wait(handle).await;

    assert_eq!(result.outcome, RunOutcome::Failed);
    assert_eq!(result.failure.unwrap().role, Some(ConnectorRole::Loader));
    assert!(store.load(&pipeline_id("orders")).await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn record_before_schema_is_a_protocol_error() {
    init_test_tracing();
    let scripts = ConnectorScripts::new();
    let work_dir = tempfile::tempdir().unwrap();

    let catalog = write_catalog(scripts.path(), &[("A", "INCREMENTAL")]);
    let extractor = scripts.extractor("tap", &[record("A", 1), state("A", 1)], 0);
    let loader = scripts.acknowledging_loader("target");
    let store = NotifyingCheckpointStore::new();
    let controller = create_controller(test_settings(work_dir.path()), store.clone());

    let handle = controller
        .submit(PipelineBuilder::new("orders", &extractor, &loader, &catalog).build())
        .await
        .unwrap();
    let result = controller.wait(handle).await;

    assert_eq!(result.outcome, RunOutcome::Failed);
    assert_eq!(result.error.unwrap().kind(), ErrorKind::ProtocolError);
    assert!(store.load(&pipeline_id("orders")).await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn transformer_and_column_rules_rewrite_records() {
    init_test_tracing();
    let scripts = ConnectorScripts::new();
    let work_dir = tempfile::tempdir().unwrap();

    let catalog = write_catalog(scripts.path(), &[("users", "INCREMENTAL")]);
    let extractor = scripts.extractor(
        "tap",
        &[
            schema("users"),
            json!({"type": "RECORD", "stream": "users", "record": {"id": 1, "email": "a@example.com", "salary": 10}}),
            state("users", 1),
        ],
        0,
    );
    let transformer = scripts.passthrough_transformer("transform");
    let loader = scripts.acknowledging_loader("target");
    let definition = PipelineBuilder::new("users", &extractor, &loader, &catalog)
        .transformer(&transformer)
        .transformations(json!([
            {"stream": "users", "column": "email", "type": "MASK-HIDDEN"},
            {"stream": "users", "column": "salary", "type": "MASK-NUMBER"}
        ]))
        .build();
    let store = NotifyingCheckpointStore::new();
    let controller = create_controller(test_settings(work_dir.path()), store.clone());

    let handle = controller.submit(definition).await.unwrap();
    let result = controller.wait(handle).await;

    assert!(result.is_success());
    assert_eq!(result.process_exits.len(), 3);

    let records: Vec<_> = scripts
        .loader_messages("target")
        .into_iter()
        .filter_map(|message| match message {
            Message::Record(record) => Some(record),
            _ => None,
        })
        .collect();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].record["email"], json!("hidden"));
    assert_eq!(records[0].record["salary"], json!(0));
}

#[tokio::test(flavor = "multi_thread")]
async fn activated_versions_are_not_replayed_on_resume() {
    init_test_tracing();
    let scripts = ConnectorScripts::new();
    let work_dir = tempfile::tempdir().unwrap();

    let catalog = write_catalog(scripts.path(), &[("A", "FULL_TABLE")]);
    let activate = |version: u64| json!({"type": "ACTIVATE_VERSION", "stream": "A", "version": version});
    let store = NotifyingCheckpointStore::new();
    let controller = create_controller(test_settings(work_dir.path()), store.clone());

    let first_loader = scripts.acknowledging_loader("target-1");
    let first = scripts.extractor("tap-1", &[schema("A"), activate(5), state("A", 1)], 0);
    let handle = controller
        .submit(PipelineBuilder::new("orders", &first, &first_loader, &catalog).build())
        .await
        .unwrap();
    assert!(controller.wait(handle).await.is_success());

    let checkpoint = store.load(&pipeline_id("orders")).await.unwrap().unwrap();
    assert_eq!(checkpoint.activated_versions, BTreeMap::from([("A".to_string(), 5)]));

    let second_loader = scripts.acknowledging_loader("target-2");
    let second = scripts.extractor(
        "tap-2",
        &[schema("A"), activate(5), record("A", 2), activate(6), state("A", 2)],
        0,
    );
    let handle = controller
        .submit(PipelineBuilder::new("orders", &second, &second_loader, &catalog).build())
        .await
        .unwrap();
    assert!(controller.wait(handle).await.is_success());

    let forwarded: Vec<u64> = scripts
        .loader_messages("target-2")
        .into_iter()
        .filter_map(|message| match message {
            Message::ActivateVersion(activate) => Some(activate.version),
            _ => None,
        })
        .collect();
    assert_eq!(forwarded, vec![6]);

    let checkpoint = store.load(&pipeline_id("orders")).await.unwrap().unwrap();
    assert_eq!(checkpoint.activated_versions, BTreeMap::from([("A".to_string(), 6)]));
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_run_forwards_nothing_from_an_extractor_ignoring_sigterm() {
    init_test_tracing();
    let scripts = ConnectorScripts::new();
    let work_dir = tempfile::tempdir().unwrap();

    let catalog = write_catalog(scripts.path(), &[("A", "INCREMENTAL")]);
    let resume = scripts.path().join("resume");

    // Pauses after its first state until `resume` exists, then emits records forever.
    let extractor = scripts.write(
        "tap",
        &format!(
            r#"trap '' TERM
cat <<'MESSAGES'
{}
{}
{}
MESSAGES
while [ ! -e "{resume}" ]; do sleep 0.05; done
i=2
while true; do
  printf '{{"type": "RECORD", "stream": "A", "record": {{"id": %s}}}}\n' "$i"
  i=$((i + 1))
done"#,
            schema("A"),
            record("A", 1),
            state("A", 1),
            resume = resume.display()
        ),
    );
    let loader = scripts.write(
        "target",
        &format!(
            r#"trap '' TERM
while IFS= read -r line; do
  printf '%s\n' "$line" >> "{out}"
  case "$line" in
    *'"type":"STATE"'*) printf '%s\n' "$line" ;;
  esac
done"#,
            out = scripts.output_path("target").display()
        ),
    );

    let store = NotifyingCheckpointStore::new();
    let controller = create_controller(test_settings(work_dir.path()), store.clone());
    let definition = PipelineBuilder::new("orders", &extractor, &loader, &catalog).build();

    let handle = controller.submit(definition).await.unwrap();
    store
        .notify_on_sequence(&pipeline_id("orders"), 1)
        .await
        .notified()
        .await;
    controller.cancel(&handle);

    // Both stages ignore SIGTERM and live until the grace period ends, so anything routed
    // after the cancellation would still reach the loader.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    std::fs::write(&resume, b"").unwrap();
    let result = controller.wait(handle).await;

    assert_eq!(result.outcome, RunOutcome::Cancelled);
    assert_eq!(
        message_types(&scripts.loader_messages("target")),
        vec![MessageType::Schema, MessageType::Record, MessageType::State]
    );
    let checkpoint = store.load(&pipeline_id("orders")).await.unwrap().unwrap();
    assert_eq!(checkpoint.sequence, 1);
}
