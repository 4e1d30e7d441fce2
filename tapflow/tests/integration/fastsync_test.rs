use serde_json::json;
use std::collections::BTreeSet;
use tapflow::catalog::Catalog;
use tapflow::fastsync::{ResyncRequest, TableStatus};
use tapflow::state::store::CheckpointStore;
use tapflow::test_utils::connectors::ConnectorScripts;
use tapflow::test_utils::notifying_store::NotifyingCheckpointStore;
use tapflow::test_utils::pipeline::{
    PipelineBuilder, create_controller, pipeline_id, test_settings, write_catalog,
};
use tapflow::{RunOptions, RunOutcome};
use tapflow_telemetry::tracing::init_test_tracing;

fn cursor_state(streams: &[(&str, u64)]) -> serde_json::Value {
    let bookmarks: serde_json::Map<String, serde_json::Value> = streams
        .iter()
        .map(|(stream, value)| {
            (
                stream.to_string(),
                json!({"replication_key": "id", "replication_key_value": value}),
            )
        })
        .collect();

    json!({"type": "STATE", "value": {"bookmarks": bookmarks}})
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_table_is_excluded_and_retried_on_the_next_run() {
    init_test_tracing();
    let scripts = ConnectorScripts::new();
    let work_dir = tempfile::tempdir().unwrap();

    let catalog = write_catalog(scripts.path(), &[("T", "INCREMENTAL"), ("U", "INCREMENTAL")]);
    let loader = scripts.acknowledging_loader("target");
    let store = NotifyingCheckpointStore::new();
    let controller = create_controller(test_settings(work_dir.path()), store.clone());

    // First run: the bulk copy of T fails, U is copied and then replicated incrementally.
    let extractor = scripts.extractor(
        "tap-1",
        &[
            json!({"type": "SCHEMA", "stream": "U", "schema": {"type": "object"}, "key_properties": ["id"]}),
            json!({"type": "RECORD", "stream": "U", "record": {"id": 1001}}),
            cursor_state(&[("U", 1001)]),
        ],
        0,
    );
    let fastsync = scripts.fastsync("fastsync-1", 1000, &["T"]);
    let definition = PipelineBuilder::new("orders", &extractor, &loader, &catalog)
        .fastsync(&fastsync, 2)
        .build();

    let handle = controller.submit(definition).await.unwrap();
    let result = controller.wait(handle).await;

    // The failed table is reported, the run itself succeeds.
    assert_eq!(result.outcome, RunOutcome::Success);
    assert!(result.failure.is_none());

    let report = result.fastsync.as_ref().unwrap();
    assert_eq!(report.plan.bulk, vec!["T", "U"]);
    assert_eq!(report.failed_streams(), BTreeSet::from(["T".to_string()]));
    let u = report.tables.iter().find(|table| table.stream == "U").unwrap();
    assert_eq!(u.status, TableStatus::Succeeded);

    // U went through the router, T was left out of the catalog handed to the extractor.
    assert_eq!(result.stats.streams["U"].records, 1);
    let run_catalog = Catalog::load(
        &work_dir
            .path()
            .join("orders")
            .join(result.run_id.to_string())
            .join("catalog.json"),
    )
    .await
    .unwrap();
    let selected: Vec<_> = run_catalog
        .selected()
        .map(|entry| entry.stream_id.clone())
        .collect();
    assert_eq!(selected, vec!["U"]);

    let checkpoint = store.load(&pipeline_id("orders")).await.unwrap().unwrap();
    assert!(checkpoint.stream_bookmark("T").is_none());
    assert_eq!(
        checkpoint.stream_bookmark("U").unwrap()["replication_key_value"],
        json!(1001)
    );

    // Second run: only T needs the bulk path again.
    let extractor = scripts.extractor("tap-2", &[cursor_state(&[("T", 2000), ("U", 1002)])], 0);
    let fastsync = scripts.fastsync("fastsync-2", 2000, &[]);
    let definition = PipelineBuilder::new("orders", &extractor, &loader, &catalog)
        .fastsync(&fastsync, 2)
        .build();

    let handle = controller.submit(definition).await.unwrap();
    let result = controller.wait(handle).await;

    assert!(result.is_success(), "{:?}", result.failure);
    let report = result.fastsync.unwrap();
    assert_eq!(report.plan.bulk, vec!["T"]);
    assert_eq!(report.plan.incremental, vec!["U"]);
    assert!(report.is_success());
}

#[tokio::test(flavor = "multi_thread")]
async fn resync_request_reloads_a_resumable_stream() {
    init_test_tracing();
    let scripts = ConnectorScripts::new();
    let work_dir = tempfile::tempdir().unwrap();

    let catalog = write_catalog(scripts.path(), &[("U", "INCREMENTAL")]);
    let loader = scripts.acknowledging_loader("target");
    let store = NotifyingCheckpointStore::new();
    let controller = create_controller(test_settings(work_dir.path()), store.clone());

    let extractor = scripts.extractor("tap", &[cursor_state(&[("U", 1500)])], 0);
    let fastsync = scripts.fastsync("fastsync", 1500, &[]);
    let definition = PipelineBuilder::new("orders", &extractor, &loader, &catalog)
        .fastsync(&fastsync, 1)
        .build();

    let handle = controller.submit(definition.clone()).await.unwrap();
    let first = controller.wait(handle).await;
    assert!(first.is_success());
    assert_eq!(first.fastsync.unwrap().plan.bulk, vec!["U"]);

    let handle = controller.submit(definition.clone()).await.unwrap();
    let second = controller.wait(handle).await;
    assert!(second.is_success());
    assert!(second.fastsync.is_none());

    let options = RunOptions {
        resync: ResyncRequest::All,
    };
    let handle = controller.submit_with(definition, options).await.unwrap();
    let third = controller.wait(handle).await;
    assert!(third.is_success(), "{:?}", third.failure);
    assert_eq!(third.fastsync.unwrap().plan.bulk, vec!["U"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_bulk_transfers_keep_their_report() {
    init_test_tracing();
    let scripts = ConnectorScripts::new();
    let work_dir = tempfile::tempdir().unwrap();

    let catalog = write_catalog(scripts.path(), &[("A", "FULL_TABLE"), ("Z", "FULL_TABLE")]);
    let loader = scripts.acknowledging_loader("target");
    let extractor = scripts.extractor("tap", &[], 0);
    let store = NotifyingCheckpointStore::new();
    let controller = create_controller(test_settings(work_dir.path()), store.clone());

    // A is copied right away, Z never finishes on its own.
    let fastsync = scripts.write(
        "fastsync",
        r#"table=""
out=""
while [ $# -gt 0 ]; do
  case "$1" in
    --tables) table="$2"; shift ;;
    --state) out="$2"; shift ;;
  esac
  shift
done
[ "$table" = "Z" ] && exec sleep 30
printf '{"bookmarks": {"%s": {"replication_key": "id", "replication_key_value": 1}}}' "$table" > "$out""#,
    );
    let definition = PipelineBuilder::new("orders", &extractor, &loader, &catalog)
        .fastsync(&fastsync, 2)
        .build();

    let handle = controller.submit(definition).await.unwrap();
    store
        .notify_on_sequence(&pipeline_id("orders"), 1)
        .await
        .notified()
        .await;
    controller.cancel(&handle);
    let result = controller.wait(handle).await;

    assert_eq!(result.outcome, RunOutcome::Cancelled);
    let report = result.fastsync.unwrap();
    assert!(report.cancelled);
    let statuses: Vec<_> = report
        .tables
        .iter()
        .map(|table| (table.stream.as_str(), table.status))
        .collect();
    assert_eq!(
        statuses,
        vec![("A", TableStatus::Succeeded), ("Z", TableStatus::Cancelled)]
    );
    assert!(scripts.extractor_args("tap").is_empty());
}
