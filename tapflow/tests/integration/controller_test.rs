use serde_json::json;
use std::path::Path;
use tapflow::error::ErrorKind;
use tapflow::test_utils::connectors::ConnectorScripts;
use tapflow::test_utils::notifying_store::NotifyingCheckpointStore;
use tapflow::test_utils::pipeline::{
    PipelineBuilder, create_controller, pipeline_id, test_settings, write_catalog,
};
use tapflow::{RunOutcome, RunPhase};
use tapflow_config::shared::LockConfig;
use tapflow_telemetry::tracing::init_test_tracing;

/// Extractor that marks `busy` while it runs and leaves an `overlap` marker when another
/// extractor sharing `dir` was already running.
fn exclusive_extractor(scripts: &ConnectorScripts, name: &str, dir: &Path) -> std::path::PathBuf {
    let state = json!({"type": "STATE", "value": {"bookmarks": {"A": {"id": 1}}}});

    scripts.write(
        name,
        &format!(
            r#"if ! mkdir "{dir}/busy" 2>/dev/null; then touch "{dir}/overlap"; fi
sleep 0.3
rmdir "{dir}/busy" 2>/dev/null
echo '{state}'"#,
            dir = dir.display()
        ),
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn runs_sharing_a_target_never_overlap() {
    init_test_tracing();
    let scripts = ConnectorScripts::new();
    let work_dir = tempfile::tempdir().unwrap();
    let markers = tempfile::tempdir().unwrap();

    let catalog = write_catalog(scripts.path(), &[("A", "INCREMENTAL")]);
    let loader = scripts.acknowledging_loader("target");
    let controller = create_controller(
        test_settings(work_dir.path()),
        NotifyingCheckpointStore::new(),
    );

    for id in ["first", "second", "third"] {
        let extractor = exclusive_extractor(&scripts, &format!("tap-{id}"), markers.path());
        let definition = PipelineBuilder::new(id, &extractor, &loader, &catalog)
            .target_lock_key("warehouse")
            .build();
        controller.submit(definition).await.unwrap();
    }

    let results = controller.wait_all().await;

    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|result| result.is_success()));
    assert!(!markers.path().join("overlap").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn different_targets_run_in_parallel() {
    init_test_tracing();
    let scripts = ConnectorScripts::new();
    let work_dir = tempfile::tempdir().unwrap();
    let markers = tempfile::tempdir().unwrap();

    let catalog = write_catalog(scripts.path(), &[("A", "INCREMENTAL")]);
    let loader = scripts.acknowledging_loader("target");
    let controller = create_controller(
        test_settings(work_dir.path()),
        NotifyingCheckpointStore::new(),
    );

    // Both extractors wait until the other one has started.
    let barrier = |name: &str, mine: &str, other: &str| {
        scripts.write(
            name,
            &format!(
                r#"touch "{dir}/{mine}"
i=0
while [ ! -e "{dir}/{other}" ] && [ $i -lt 100 ]; do sleep 0.05; i=$((i+1)); done
[ -e "{dir}/{other}" ] || exit 7"#,
                dir = markers.path().display()
            ),
        )
    };
    let left = barrier("tap-left", "left", "right");
    let right = barrier("tap-right", "right", "left");

    controller
        .submit(PipelineBuilder::new("left", &left, &loader, &catalog).build())
        .await
        .unwrap();
    controller
        .submit(PipelineBuilder::new("right", &right, &loader, &catalog).build())
        .await
        .unwrap();

    let results = controller.wait_all().await;

    assert!(results.iter().all(|result| result.is_success()));
}

#[tokio::test(flavor = "multi_thread")]
async fn busy_target_is_requeued_until_the_limit() {
    init_test_tracing();
    let scripts = ConnectorScripts::new();
    let work_dir = tempfile::tempdir().unwrap();

    let catalog = write_catalog(scripts.path(), &[("A", "INCREMENTAL")]);
    let loader = scripts.acknowledging_loader("target");
    let mut settings = test_settings(work_dir.path());
    settings.lock = LockConfig {
        acquire_timeout_ms: 100,
        requeue_delay_ms: 20,
        max_requeues: Some(1),
    };
    let controller = create_controller(settings, NotifyingCheckpointStore::new());

    let slow = scripts.write("tap-slow", "sleep 30");
    let holder = controller
        .submit(
            PipelineBuilder::new("holder", &slow, &loader, &catalog)
                .target_lock_key("warehouse")
                .build(),
        )
        .await
        .unwrap();
    holder
        .phase_receiver()
        .wait_for(|phase| *phase == RunPhase::Replicating)
        .await
        .unwrap();

    let fast = scripts.extractor("tap-fast", &[], 0);
    let waiting = controller
        .submit(
            PipelineBuilder::new("waiting", &fast, &loader, &catalog)
                .target_lock_key("warehouse")
                .build(),
        )
        .await
        .unwrap();
    let result = controller.wait(waiting).await;

    assert_eq!(result.outcome, RunOutcome::Failed);
    assert_eq!(result.requeues, 1);
    assert_eq!(
        result.error.unwrap().kind(),
        ErrorKind::LockContentionTimeout
    );

    controller.cancel(&holder);
    let result = controller.wait(holder).await;
    assert_eq!(result.outcome, RunOutcome::Cancelled);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelling_a_run_stops_its_processes() {
    init_test_tracing();
    let scripts = ConnectorScripts::new();
    let work_dir = tempfile::tempdir().unwrap();

    let catalog = write_catalog(scripts.path(), &[("A", "INCREMENTAL")]);
    let loader = scripts.acknowledging_loader("target");
    let store = NotifyingCheckpointStore::new();
    let controller = create_controller(test_settings(work_dir.path()), store.clone());

    let extractor = scripts.write(
        "tap",
        r#"echo '{"type": "STATE", "value": {"bookmarks": {"A": {"id": 1}}}}'
sleep 30"#,
    );
    let handle = controller
        .submit(PipelineBuilder::new("orders", &extractor, &loader, &catalog).build())
        .await
        .unwrap();

    store
        .notify_on_sequence(&pipeline_id("orders"), 1)
        .await
        .notified()
        .await;

    controller.shutdown().await;
    let result = controller.wait(handle).await;

    assert_eq!(result.outcome, RunOutcome::Cancelled);
    assert_eq!(result.last_checkpoint.unwrap().sequence, 1);
    assert!(
        result
            .process_exits
            .iter()
            .any(|exit| exit.terminated_by_request())
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelling_a_queued_run_reports_cancelled() {
    init_test_tracing();
    let scripts = ConnectorScripts::new();
    let work_dir = tempfile::tempdir().unwrap();

    let catalog = write_catalog(scripts.path(), &[("A", "INCREMENTAL")]);
    let loader = scripts.acknowledging_loader("target");
    let mut settings = test_settings(work_dir.path());
    settings.max_parallel_runs = 1;
    let controller = create_controller(settings, NotifyingCheckpointStore::new());

    let slow = scripts.write("tap-slow", "sleep 30");
    let running = controller
        .submit(PipelineBuilder::new("running", &slow, &loader, &catalog).build())
        .await
        .unwrap();
    running
        .phase_receiver()
        .wait_for(|phase| *phase == RunPhase::Replicating)
        .await
        .unwrap();

    let fast = scripts.extractor("tap-fast", &[], 0);
    let queued = controller
        .submit(PipelineBuilder::new("queued", &fast, &loader, &catalog).build())
        .await
        .unwrap();
    assert_eq!(*queued.phase_receiver().borrow(), RunPhase::Queued);

    controller.cancel(&queued);
    let result = controller.wait(queued).await;
    assert_eq!(result.outcome, RunOutcome::Cancelled);
    assert!(result.process_exits.is_empty());

    controller.cancel(&running);
    assert_eq!(controller.wait(running).await.outcome, RunOutcome::Cancelled);
}

#[tokio::test(flavor = "multi_thread")]
async fn second_submit_of_an_active_pipeline_is_rejected() {
    init_test_tracing();
    let scripts = ConnectorScripts::new();
    let work_dir = tempfile::tempdir().unwrap();

    let catalog = write_catalog(scripts.path(), &[("A", "INCREMENTAL")]);
    let loader = scripts.acknowledging_loader("target");
    let controller = create_controller(
        test_settings(work_dir.path()),
        NotifyingCheckpointStore::new(),
    );

    let slow = scripts.write("tap-slow", "sleep 30");
    let definition = PipelineBuilder::new("orders", &slow, &loader, &catalog).build();
    let handle = controller.submit(definition.clone()).await.unwrap();

    let err = controller.submit(definition).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    controller.shutdown().await;
    let results = controller.wait_all().await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].run_id, handle.run_id());
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_definition_is_rejected() {
    init_test_tracing();
    let scripts = ConnectorScripts::new();
    let work_dir = tempfile::tempdir().unwrap();

    let catalog = write_catalog(scripts.path(), &[("A", "INCREMENTAL")]);
    let loader = scripts.acknowledging_loader("target");
    let extractor = scripts.extractor("tap", &[], 0);
    let controller = create_controller(
        test_settings(work_dir.path()),
        NotifyingCheckpointStore::new(),
    );

    let definition = PipelineBuilder::new("orders", &extractor, &loader, &catalog)
        .target_lock_key("")
        .build();

    let err = controller.submit(definition).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigError);
}

#[tokio::test(flavor = "multi_thread")]
async fn waited_runs_are_forgotten_and_unwaited_ones_still_reported() {
    init_test_tracing();
    let scripts = ConnectorScripts::new();
    let work_dir = tempfile::tempdir().unwrap();

    let catalog = write_catalog(scripts.path(), &[("A", "INCREMENTAL")]);
    let loader = scripts.acknowledging_loader("target");
    let extractor = scripts.extractor("tap", &[], 0);
    let controller = create_controller(
        test_settings(work_dir.path()),
        NotifyingCheckpointStore::new(),
    );

    let definition = PipelineBuilder::new("orders", &extractor, &loader, &catalog).build();
    for _ in 0..5 {
        let handle = controller.submit(definition.clone()).await.unwrap();
        assert!(controller.wait(handle).await.is_success());
    }
    assert_eq!(controller.unreported_runs().await, 0);

    // Finished before the next submission but never waited for.
    let unwaited = controller.submit(definition.clone()).await.unwrap();
    unwaited
        .phase_receiver()
        .wait_for(|phase| *phase == RunPhase::Finished)
        .await
        .unwrap();
    let other = PipelineBuilder::new("invoices", &extractor, &loader, &catalog).build();
    controller.submit(other).await.unwrap();

    let results = controller.wait_all().await;
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].run_id, unwaited.run_id());
    assert_eq!(controller.unreported_runs().await, 0);
}
