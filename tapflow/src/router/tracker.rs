use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};

use crate::state::checkpoint::Checkpoint;
use crate::types::StreamId;

/// Per stream message counts observed at the loader input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub schemas: u64,
    pub records: u64,
    pub activate_versions: u64,
}

/// Counts of a router run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouteStats {
    pub streams: BTreeMap<StreamId, StreamStats>,
    pub states_received: u64,
    pub states_committed: u64,
}

impl RouteStats {
    pub fn stream_mut(&mut self, stream: &str) -> &mut StreamStats {
        self.streams.entry(stream.to_string()).or_default()
    }

    pub fn records(&self) -> u64 {
        self.streams.values().map(|stream| stream.records).sum()
    }
}

/// A `STATE` forwarded to the loader and not yet acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingState {
    pub value: Value,
    /// Activated versions as of the moment the state was forwarded.
    pub activated_versions: BTreeMap<StreamId, u64>,
}

/// Book keeping of in flight states between the loader hop and the acknowledgment reader.
#[derive(Debug, Default)]
pub struct CheckpointTracker {
    pending: VecDeque<PendingState>,
    activated_versions: BTreeMap<StreamId, u64>,
    last_committed: Option<Checkpoint>,
    stats: RouteStats,
}

impl CheckpointTracker {
    /// Starts from the last committed checkpoint of the pipeline, if any.
    pub fn new(committed: Option<Checkpoint>) -> Self {
        Self {
            pending: VecDeque::new(),
            activated_versions: committed
                .as_ref()
                .map(|checkpoint| checkpoint.activated_versions.clone())
                .unwrap_or_default(),
            last_committed: committed,
            stats: RouteStats::default(),
        }
    }

    pub fn last_committed(&self) -> Option<&Checkpoint> {
        self.last_committed.as_ref()
    }

    pub fn mark_committed(&mut self, checkpoint: Checkpoint) {
        self.stats.states_committed += 1;
        self.last_committed = Some(checkpoint);
    }

    pub fn record_activation(&mut self, stream: &str, version: u64) {
        let current = self.activated_versions.entry(stream.to_string()).or_default();
        *current = (*current).max(version);
    }

    pub fn push_pending(&mut self, value: Value) {
        self.stats.states_received += 1;
        self.pending.push_back(PendingState {
            value,
            activated_versions: self.activated_versions.clone(),
        });
    }

    /// Resolves the oldest pending state equal to `ack` together with every state before it.
    ///
    /// Returns `None`, leaving the queue untouched, when nothing matches.
    pub fn acknowledge(&mut self, ack: &Value) -> Option<PendingState> {
        let position = self.pending.iter().position(|pending| &pending.value == ack)?;
        let mut resolved = self.pending.drain(..=position);

        resolved.next_back()
    }

    /// Removes and returns the most recent pending state, dropping the older ones.
    pub fn take_latest(&mut self) -> Option<PendingState> {
        let latest = self.pending.pop_back();
        self.pending.clear();

        latest
    }

    /// Drops all pending states, returning how many there were.
    pub fn discard_pending(&mut self) -> usize {
        let discarded = self.pending.len();
        self.pending.clear();

        discarded
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> &RouteStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut RouteStats {
        &mut self.stats
    }
}
