use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::shared::{
    ColumnTransformation, ExtractorDefinition, LoaderDefinition, TransformerDefinition,
    ValidationError, is_valid_pipeline_id,
};

const fn default_max_parallel_tables() -> u16 {
    4
}

/// Static description of one replication pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PipelineDefinition {
    /// Identifies the pipeline across runs. Checkpoints are keyed by it.
    pub id: String,
    pub extractor: ExtractorDefinition,
    #[serde(default)]
    pub transformer: Option<TransformerDefinition>,
    pub loader: LoaderDefinition,
    /// Catalog produced by discovery, passed to the extractor.
    pub catalog_path: PathBuf,
    /// Identity of the destination written by the loader.
    ///
    /// Pipelines sharing a key never write concurrently.
    pub target_lock_key: String,
    /// Bulk path used before incremental replication, when supported.
    #[serde(default)]
    pub fastsync: Option<FastSyncDefinition>,
    /// Column level rules applied to records before they reach the next stage.
    #[serde(default)]
    pub transformations: Vec<ColumnTransformation>,
}

impl PipelineDefinition {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !is_valid_pipeline_id(&self.id) {
            return Err(ValidationError::InvalidPipelineId(self.id.clone()));
        }

        let mut commands = vec![
            ("extractor", self.extractor.command.as_str()),
            ("loader", self.loader.command.as_str()),
        ];
        if let Some(transformer) = &self.transformer {
            commands.push(("transformer", transformer.command.as_str()));
        }
        if let Some(fastsync) = &self.fastsync {
            commands.push(("fastsync", fastsync.command.as_str()));
        }
        for (role, command) in commands {
            if command.trim().is_empty() {
                return Err(ValidationError::EmptyCommand {
                    pipeline_id: self.id.clone(),
                    role,
                });
            }
        }

        if self.target_lock_key.trim().is_empty() {
            return Err(ValidationError::EmptyTargetLockKey(self.id.clone()));
        }

        if let Some(fastsync) = &self.fastsync {
            if fastsync.max_parallel_tables == 0 {
                return Err(ValidationError::MaxParallelTablesZero(self.id.clone()));
            }
        }

        if self
            .transformations
            .iter()
            .any(|rule| rule.stream.is_empty() || rule.column.is_empty())
        {
            return Err(ValidationError::IncompleteTransformation {
                pipeline_id: self.id.clone(),
            });
        }

        Ok(())
    }
}

/// External bulk loader used to warm up a destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FastSyncDefinition {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Tables transferred at the same time.
    #[serde(default = "default_max_parallel_tables")]
    pub max_parallel_tables: u16,
}
