use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tapflow_config::shared::is_valid_pipeline_id;
use uuid::Uuid;

use crate::bail;
use crate::error::{ErrorKind, TapflowError, TapflowResult};

/// Identifier of a stream inside the message protocol and the catalog.
pub type StreamId = String;

/// Validated pipeline identifier.
///
/// Used as the checkpoint key and as a directory name, so it is restricted to ASCII letters,
/// digits, `-` and `_`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PipelineId(String);

impl PipelineId {
    pub fn new(id: impl Into<String>) -> TapflowResult<Self> {
        let id = id.into();
        if !is_valid_pipeline_id(&id) {
            bail!(
                ErrorKind::ConfigError,
                "Invalid pipeline id",
                format!("`{id}` may only contain ASCII letters, digits, `-` and `_`")
            );
        }

        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PipelineId {
    type Err = TapflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for PipelineId {
    type Error = TapflowError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PipelineId> for String {
    fn from(value: PipelineId) -> Self {
        value.0
    }
}

/// Identifier of one execution of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn into_inner(self) -> Uuid {
        self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for RunId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
