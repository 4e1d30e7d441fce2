use serde::Deserialize;
use std::path::PathBuf;

use crate::shared::{PgConnectionConfig, ValidationError};

fn default_state_directory() -> PathBuf {
    PathBuf::from("state")
}

/// Where checkpoints are persisted.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateStoreConfig {
    /// One JSON document per pipeline inside `directory`, replaced atomically.
    File {
        #[serde(default = "default_state_directory")]
        directory: PathBuf,
    },
    /// Process memory only. Checkpoints are lost on exit.
    Memory,
    /// One row per pipeline in a Postgres table.
    Postgres { connection: PgConnectionConfig },
}

impl StateStoreConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            StateStoreConfig::Postgres { connection } => connection.validate(),
            StateStoreConfig::File { .. } | StateStoreConfig::Memory => Ok(()),
        }
    }
}

impl Default for StateStoreConfig {
    fn default() -> Self {
        Self::File {
            directory: default_state_directory(),
        }
    }
}
