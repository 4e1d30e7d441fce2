//! Read only view over a discovered catalog.
//!
//! The catalog is produced by the extractor's discovery mode. Every stream carries a list of
//! metadata entries addressed by breadcrumb; the entry with the empty breadcrumb describes the
//! stream itself, `["properties", <column>]` entries describe columns.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use crate::error::{ErrorKind, TapflowResult};
use crate::types::StreamId;
use crate::{bail, tapflow_error};

const STREAMS_KEY: &str = "streams";
const METADATA_KEY: &str = "metadata";
const BREADCRUMB_KEY: &str = "breadcrumb";

/// How a stream is replicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicationMethod {
    FullTable,
    Incremental,
    LogBased,
}

impl ReplicationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicationMethod::FullTable => "FULL_TABLE",
            ReplicationMethod::Incremental => "INCREMENTAL",
            ReplicationMethod::LogBased => "LOG_BASED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "FULL_TABLE" => Some(ReplicationMethod::FullTable),
            "INCREMENTAL" => Some(ReplicationMethod::Incremental),
            "LOG_BASED" => Some(ReplicationMethod::LogBased),
            _ => None,
        }
    }
}

impl fmt::Display for ReplicationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One stream of the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub stream_id: StreamId,
    pub key_properties: Vec<String>,
    pub replication_method: ReplicationMethod,
    pub replication_key: Option<String>,
    pub selected: bool,
    /// Columns explicitly selected or marked `automatic`.
    pub selected_columns: BTreeSet<String>,
}

/// A catalog document together with its parsed entries.
#[derive(Debug, Clone, PartialEq)]
pub struct Catalog {
    raw: Value,
    entries: Vec<CatalogEntry>,
}

impl Catalog {
    pub async fn load(path: &Path) -> TapflowResult<Self> {
        let contents = tokio::fs::read(path).await.map_err(|err| {
            tapflow_error!(
                ErrorKind::ConfigError,
                "Failed to read catalog",
                path.display(),
                source: err
            )
        })?;

        let raw: Value = serde_json::from_slice(&contents).map_err(|err| {
            tapflow_error!(
                ErrorKind::ConfigError,
                "Catalog is not valid JSON",
                format!("{}: {err}", path.display()),
                source: err
            )
        })?;

        Self::from_value(raw)
    }

    pub fn from_value(raw: Value) -> TapflowResult<Self> {
        let Some(streams) = raw.get(STREAMS_KEY).and_then(Value::as_array) else {
            bail!(
                ErrorKind::ConfigError,
                "Catalog has no `streams` array"
            );
        };

        let entries = streams
            .iter()
            .map(parse_entry)
            .collect::<TapflowResult<Vec<_>>>()?;

        Ok(Self { raw, entries })
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn entry(&self, stream_id: &str) -> Option<&CatalogEntry> {
        self.entries.iter().find(|entry| entry.stream_id == stream_id)
    }

    /// Entries of the selected streams, in catalog order.
    pub fn selected(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.iter().filter(|entry| entry.selected)
    }

    /// Returns a copy where every stream in `excluded` is deselected.
    ///
    /// Unselected streams and every other part of the document are left untouched.
    pub fn without_streams(&self, excluded: &BTreeSet<StreamId>) -> Self {
        if excluded.is_empty() {
            return self.clone();
        }

        let mut raw = self.raw.clone();
        if let Some(streams) = raw.get_mut(STREAMS_KEY).and_then(Value::as_array_mut) {
            for stream in streams {
                let Some(stream_id) = stream_id(stream) else {
                    continue;
                };
                if excluded.contains(&stream_id) {
                    deselect(stream);
                }
            }
        }

        let entries = self
            .entries
            .iter()
            .cloned()
            .map(|mut entry| {
                if excluded.contains(&entry.stream_id) {
                    entry.selected = false;
                }
                entry
            })
            .collect();

        Self { raw, entries }
    }

    pub fn as_value(&self) -> &Value {
        &self.raw
    }

    /// Writes the catalog document to `path`.
    pub async fn write(&self, path: &Path) -> TapflowResult<()> {
        let contents = serde_json::to_vec_pretty(&self.raw)?;
        tokio::fs::write(path, contents).await?;

        Ok(())
    }
}

fn stream_id(stream: &Value) -> Option<String> {
    stream
        .get("tap_stream_id")
        .or_else(|| stream.get("stream"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn metadata_entries(stream: &Value) -> impl Iterator<Item = (&[Value], &Map<String, Value>)> {
    stream
        .get(METADATA_KEY)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|entry| {
            let breadcrumb = entry.get(BREADCRUMB_KEY)?.as_array()?;
            let metadata = entry.get(METADATA_KEY)?.as_object()?;
            Some((breadcrumb.as_slice(), metadata))
        })
}

fn parse_entry(stream: &Value) -> TapflowResult<CatalogEntry> {
    let Some(stream_id) = stream_id(stream) else {
        bail!(
            ErrorKind::ConfigError,
            "Catalog stream has no `tap_stream_id`"
        );
    };

    let stream_metadata = metadata_entries(stream)
        .find(|(breadcrumb, _)| breadcrumb.is_empty())
        .map(|(_, metadata)| metadata);

    let key_properties = stream
        .get("key_properties")
        .or_else(|| stream_metadata.and_then(|metadata| metadata.get("table-key-properties")))
        .and_then(Value::as_array)
        .map(|keys| keys.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default();

    let replication_method = match stream_metadata
        .and_then(|metadata| metadata.get("replication-method"))
        .and_then(Value::as_str)
    {
        Some(method) => ReplicationMethod::parse(method).ok_or_else(|| {
            tapflow_error!(
                ErrorKind::ConfigError,
                "Catalog stream has an unknown replication method",
                format!("stream `{stream_id}`: `{method}`")
            )
        })?,
        None => ReplicationMethod::FullTable,
    };

    let replication_key = stream_metadata
        .and_then(|metadata| metadata.get("replication-key"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let selected = stream_metadata
        .and_then(|metadata| metadata.get("selected"))
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let selected_columns = metadata_entries(stream)
        .filter_map(|(breadcrumb, metadata)| {
            let [kind, column] = breadcrumb else {
                return None;
            };
            if kind.as_str() != Some("properties") {
                return None;
            }

            let automatic = metadata.get("inclusion").and_then(Value::as_str) == Some("automatic");
            let selected = metadata.get("selected").and_then(Value::as_bool) == Some(true);
            (automatic || selected).then(|| column.as_str().map(str::to_string))?
        })
        .collect();

    Ok(CatalogEntry {
        stream_id,
        key_properties,
        replication_method,
        replication_key,
        selected,
        selected_columns,
    })
}

fn deselect(stream: &mut Value) {
    let Some(entries) = stream.get_mut(METADATA_KEY).and_then(Value::as_array_mut) else {
        return;
    };

    for entry in entries {
        let is_stream_entry = entry
            .get(BREADCRUMB_KEY)
            .and_then(Value::as_array)
            .is_some_and(Vec::is_empty);
        if !is_stream_entry {
            continue;
        }

        if let Some(metadata) = entry.get_mut(METADATA_KEY).and_then(Value::as_object_mut) {
            metadata.insert("selected".to_string(), Value::Bool(false));
        }
    }
}
