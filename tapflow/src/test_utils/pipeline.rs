use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tapflow_config::shared::{
    ExtractorKind, FastSyncDefinition, LoaderDefinition, LoaderKind, LockConfig,
    PipelineDefinition, TransformerDefinition, TransformerKind,
};

use crate::controller::{ConcurrencyController, ControllerSettings};
use crate::fastsync::CommandBulkTransfer;
use crate::state::store::CheckpointStore;
use crate::types::PipelineId;

/// Settings with short timeouts so tests fail fast.
pub fn test_settings(work_dir: &Path) -> ControllerSettings {
    ControllerSettings {
        max_parallel_runs: 4,
        work_dir: work_dir.to_path_buf(),
        lock: LockConfig {
            acquire_timeout_ms: 5_000,
            requeue_delay_ms: 50,
            max_requeues: None,
        },
        terminate_grace: Duration::from_millis(500),
        stderr_tail_lines: 50,
    }
}

/// Controller using the command based bulk transfer.
pub fn create_controller<S>(
    settings: ControllerSettings,
    store: S,
) -> ConcurrencyController<S, CommandBulkTransfer>
where
    S: CheckpointStore + Clone + Send + Sync + 'static,
{
    let bulk = CommandBulkTransfer::new(settings.terminate_grace, settings.stderr_tail_lines);

    ConcurrencyController::new(settings, store, bulk)
}

/// Writes a catalog selecting every `(stream, replication method)` pair.
pub fn write_catalog(dir: &Path, streams: &[(&str, &str)]) -> PathBuf {
    let streams: Vec<Value> = streams
        .iter()
        .map(|(stream, method)| {
            json!({
                "tap_stream_id": stream,
                "stream": stream,
                "key_properties": ["id"],
                "schema": {"type": "object"},
                "metadata": [{
                    "breadcrumb": [],
                    "metadata": {"selected": true, "replication-method": method}
                }]
            })
        })
        .collect();

    let path = dir.join("catalog.json");
    std::fs::write(&path, json!({"streams": streams}).to_string()).unwrap();

    path
}

/// Builder of pipeline definitions around script connectors.
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    definition: PipelineDefinition,
}

impl PipelineBuilder {
    /// A `custom` extractor and loader writing to `target_lock_key`.
    pub fn new(id: &str, extractor: &Path, loader: &Path, catalog: &Path) -> Self {
        let definition = serde_json::from_value(json!({
            "id": id,
            "extractor": {
                "kind": ExtractorKind::Custom,
                "command": extractor,
                "config_path": "extractor.json"
            },
            "loader": {
                "kind": LoaderKind::Custom,
                "command": loader,
                "config_path": "loader.json"
            },
            "catalog_path": catalog,
            "target_lock_key": format!("target-{id}")
        }))
        .unwrap();

        Self { definition }
    }

    pub fn target_lock_key(mut self, key: &str) -> Self {
        self.definition.target_lock_key = key.to_string();
        self
    }

    pub fn loader_kind(mut self, kind: LoaderKind) -> Self {
        self.definition.loader = LoaderDefinition {
            kind,
            ..self.definition.loader
        };
        self
    }

    pub fn transformer(mut self, command: &Path) -> Self {
        self.definition.transformer = Some(TransformerDefinition {
            kind: TransformerKind::Custom,
            command: command.display().to_string(),
            args: vec![],
            env: Default::default(),
            config_path: PathBuf::from("transformer.json"),
        });
        self
    }

    pub fn fastsync(mut self, command: &Path, max_parallel_tables: u16) -> Self {
        self.definition.fastsync = Some(FastSyncDefinition {
            command: command.display().to_string(),
            args: vec![],
            env: Default::default(),
            max_parallel_tables,
        });
        self
    }

    pub fn transformations(mut self, transformations: Value) -> Self {
        self.definition.transformations = serde_json::from_value(transformations).unwrap();
        self
    }

    pub fn build(self) -> PipelineDefinition {
        self.definition
    }
}

pub fn pipeline_id(id: &str) -> PipelineId {
    PipelineId::new(id).unwrap()
}
