use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Known extractor implementations.
///
/// The set is closed on purpose: behavior that depends on the extractor (catalog flag,
/// bulk path support, required bookmark members) is decided by matching on it. Anything not
/// listed runs as [`ExtractorKind::Custom`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExtractorKind {
    Postgres,
    Mysql,
    MongoDb,
    S3Csv,
    Kafka,
    Custom,
}

impl ExtractorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractorKind::Postgres => "postgres",
            ExtractorKind::Mysql => "mysql",
            ExtractorKind::MongoDb => "mongo-db",
            ExtractorKind::S3Csv => "s3-csv",
            ExtractorKind::Kafka => "kafka",
            ExtractorKind::Custom => "custom",
        }
    }
}

/// Known loader implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoaderKind {
    Postgres,
    Snowflake,
    Redshift,
    Bigquery,
    S3Csv,
    Custom,
}

impl LoaderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoaderKind::Postgres => "postgres",
            LoaderKind::Snowflake => "snowflake",
            LoaderKind::Redshift => "redshift",
            LoaderKind::Bigquery => "bigquery",
            LoaderKind::S3Csv => "s3-csv",
            LoaderKind::Custom => "custom",
        }
    }
}

/// Known transformer implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransformerKind {
    TransformField,
    Custom,
}

impl TransformerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransformerKind::TransformField => "transform-field",
            TransformerKind::Custom => "custom",
        }
    }
}

macro_rules! impl_kind_display {
    ($($kind:ty),*) => {
        $(
            impl fmt::Display for $kind {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(self.as_str())
                }
            }
        )*
    };
}

impl_kind_display!(ExtractorKind, LoaderKind, TransformerKind);

/// How to launch one connector process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ConnectorDefinition<K> {
    pub kind: K,
    /// Executable, resolved through `PATH` when not absolute.
    pub command: String,
    /// Arguments placed before the ones added by the engine.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables for the child.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Connector configuration file, passed as `--config`.
    pub config_path: PathBuf,
}

pub type ExtractorDefinition = ConnectorDefinition<ExtractorKind>;

pub type TransformerDefinition = ConnectorDefinition<TransformerKind>;

pub type LoaderDefinition = ConnectorDefinition<LoaderKind>;
