use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::bail;
use crate::error::{ErrorKind, TapflowResult};
use crate::types::{PipelineId, RunId};

/// Member of a bookmark holding the per stream positions.
pub const BOOKMARKS_KEY: &str = "bookmarks";

/// Persisted replication progress of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub pipeline_id: PipelineId,
    /// Strictly increasing per pipeline.
    pub sequence: u64,
    /// The acknowledged `STATE` value.
    pub bookmark: Value,
    /// Latest activated table version per stream.
    #[serde(default)]
    pub activated_versions: BTreeMap<String, u64>,
    pub committed_at: DateTime<Utc>,
    pub run_id: RunId,
}

impl Checkpoint {
    /// Builds the checkpoint following `previous`, or the first one of the pipeline.
    pub fn next(
        pipeline_id: PipelineId,
        previous: Option<&Checkpoint>,
        run_id: RunId,
        bookmark: Value,
        activated_versions: BTreeMap<String, u64>,
    ) -> Self {
        Self {
            pipeline_id,
            sequence: previous.map_or(1, |previous| previous.sequence + 1),
            bookmark,
            activated_versions,
            committed_at: Utc::now(),
            run_id,
        }
    }

    /// Position data of `stream`, if the bookmark has any.
    pub fn stream_bookmark(&self, stream: &str) -> Option<&Map<String, Value>> {
        stream_bookmark(&self.bookmark, stream)
    }

    /// Whether `other` is this very commit, seen again when a commit whose outcome was lost
    /// is retried. `committed_at` is ignored since stores may round it.
    pub fn is_same_commit(&self, other: &Checkpoint) -> bool {
        self.pipeline_id == other.pipeline_id
            && self.sequence == other.sequence
            && self.run_id == other.run_id
            && self.bookmark == other.bookmark
            && self.activated_versions == other.activated_versions
    }
}

/// Returns the `bookmarks.<stream>` object of a bookmark value.
pub fn stream_bookmark<'a>(bookmark: &'a Value, stream: &str) -> Option<&'a Map<String, Value>> {
    bookmark.get(BOOKMARKS_KEY)?.get(stream)?.as_object()
}

/// Returns a copy of `bookmark` with `bookmarks.<stream>` replaced by `position`.
///
/// A bookmark that is not an object is replaced by a fresh one.
pub fn with_stream_bookmark(bookmark: Option<&Value>, stream: &str, position: Value) -> Value {
    let mut root = match bookmark {
        Some(Value::Object(root)) => root.clone(),
        _ => Map::new(),
    };

    let mut bookmarks = match root.remove(BOOKMARKS_KEY) {
        Some(Value::Object(bookmarks)) => bookmarks,
        _ => Map::new(),
    };
    bookmarks.insert(stream.to_string(), position);
    root.insert(BOOKMARKS_KEY.to_string(), Value::Object(bookmarks));

    Value::Object(root)
}

/// Rejects `next` when it does not move forward from `previous`.
///
/// The sequence must grow. Positions of streams present in both bookmarks must not move
/// backwards for the members this engine understands: `lsn`, `log_file` with `log_pos`, and
/// `replication_key_value` when both sides are numbers or RFC 3339 timestamps. Other members
/// are opaque and not compared.
pub fn ensure_progress(previous: &Checkpoint, next: &Checkpoint) -> TapflowResult<()> {
    if next.sequence <= previous.sequence {
        bail!(
            ErrorKind::CheckpointRegression,
            "Checkpoint sequence does not advance",
            format!(
                "pipeline `{}`: persisted sequence {}, attempted {}",
                next.pipeline_id, previous.sequence, next.sequence
            )
        );
    }

    let (Some(previous_streams), Some(next_streams)) = (
        previous.bookmark.get(BOOKMARKS_KEY).and_then(Value::as_object),
        next.bookmark.get(BOOKMARKS_KEY).and_then(Value::as_object),
    ) else {
        return Ok(());
    };

    for (stream, next_position) in next_streams {
        let (Some(previous_position), Some(next_position)) = (
            previous_streams.get(stream).and_then(Value::as_object),
            next_position.as_object(),
        ) else {
            continue;
        };

        if let Some(member) = regressed_member(previous_position, next_position) {
            bail!(
                ErrorKind::CheckpointRegression,
                "Checkpoint would move a stream position backwards",
                format!(
                    "pipeline `{}`, stream `{stream}`, member `{member}`: {} -> {}",
                    next.pipeline_id,
                    Value::Object(previous_position.clone()),
                    Value::Object(next_position.clone())
                )
            );
        }
    }

    Ok(())
}

fn regressed_member(
    previous: &Map<String, Value>,
    next: &Map<String, Value>,
) -> Option<&'static str> {
    if let (Some(previous_lsn), Some(next_lsn)) = (
        previous.get("lsn").and_then(parse_lsn),
        next.get("lsn").and_then(parse_lsn),
    ) {
        if next_lsn < previous_lsn {
            return Some("lsn");
        }
    }

    if let (Some(previous_log), Some(next_log)) = (binlog_position(previous), binlog_position(next))
    {
        if next_log < previous_log {
            return Some("log_pos");
        }
    }

    // A changed replication key makes the values incomparable.
    let same_key = previous.get("replication_key") == next.get("replication_key");
    if same_key {
        if let (Some(previous_value), Some(next_value)) = (
            previous.get("replication_key_value"),
            next.get("replication_key_value"),
        ) {
            if compare_key_values(previous_value, next_value) == Some(Ordering::Greater) {
                return Some("replication_key_value");
            }
        }
    }

    None
}

/// Accepts integers and the textual `XXX/YYY` form of Postgres LSNs.
fn parse_lsn(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => {
            let (high, low) = text.split_once('/')?;
            let high = u64::from_str_radix(high, 16).ok()?;
            let low = u64::from_str_radix(low, 16).ok()?;
            Some((high << 32) | low)
        }
        _ => None,
    }
}

/// Binlog files are numbered with a fixed width suffix, so names order lexicographically.
fn binlog_position(position: &Map<String, Value>) -> Option<(&str, u64)> {
    let file = position.get("log_file")?.as_str()?;
    let pos = position.get("log_pos")?.as_u64()?;

    Some((file, pos))
}

fn compare_key_values(previous: &Value, next: &Value) -> Option<Ordering> {
    match (previous, next) {
        (Value::Number(previous), Value::Number(next)) => {
            if let (Some(previous), Some(next)) = (previous.as_i64(), next.as_i64()) {
                return Some(previous.cmp(&next));
            }

            previous.as_f64()?.partial_cmp(&next.as_f64()?)
        }
        (Value::String(previous), Value::String(next)) => {
            let previous = DateTime::parse_from_rfc3339(previous).ok()?;
            let next = DateTime::parse_from_rfc3339(next).ok()?;

            Some(previous.cmp(&next))
        }
        _ => None,
    }
}
