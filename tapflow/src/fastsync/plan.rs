use serde::Serialize;
use std::collections::BTreeSet;
use tapflow_config::shared::PipelineDefinition;

use crate::catalog::{Catalog, CatalogEntry, ReplicationMethod};
use crate::connector::{bookmark_is_resumable, fastsync_supported};
use crate::state::checkpoint::Checkpoint;
use crate::types::StreamId;

/// Streams an operator asked to reload from scratch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ResyncRequest {
    #[default]
    None,
    All,
    Streams(BTreeSet<StreamId>),
}

impl ResyncRequest {
    pub fn includes(&self, stream: &str) -> bool {
        match self {
            ResyncRequest::None => false,
            ResyncRequest::All => true,
            ResyncRequest::Streams(streams) => streams.contains(stream),
        }
    }
}

/// Split of the selected streams between the bulk path and the incremental path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FastSyncPlan {
    pub bulk: Vec<StreamId>,
    pub incremental: Vec<StreamId>,
}

/// Whether the pipeline can use the bulk path at all.
pub fn is_applicable(definition: &PipelineDefinition) -> bool {
    definition.fastsync.is_some()
        && fastsync_supported(definition.extractor.kind, definition.loader.kind)
}

/// Decides which selected streams are bulk loaded before replication starts.
///
/// A stream goes to the bulk path when it is replicated with `FULL_TABLE`, when a resync was
/// requested for it, or when its committed bookmark lacks the members its extractor needs to
/// resume. Everything goes incremental when the bulk path is not applicable.
pub fn plan(
    definition: &PipelineDefinition,
    catalog: &Catalog,
    committed: Option<&Checkpoint>,
    resync: &ResyncRequest,
) -> FastSyncPlan {
    let applicable = is_applicable(definition);
    let mut plan = FastSyncPlan::default();

    for entry in catalog.selected() {
        if applicable && needs_bulk(definition, entry, committed, resync) {
            plan.bulk.push(entry.stream_id.clone());
        } else {
            plan.incremental.push(entry.stream_id.clone());
        }
    }

    plan
}

fn needs_bulk(
    definition: &PipelineDefinition,
    entry: &CatalogEntry,
    committed: Option<&Checkpoint>,
    resync: &ResyncRequest,
) -> bool {
    if entry.replication_method == ReplicationMethod::FullTable || resync.includes(&entry.stream_id) {
        return true;
    }

    let bookmark = committed.and_then(|checkpoint| checkpoint.stream_bookmark(&entry.stream_id));

    !bookmark_is_resumable(definition.extractor.kind, entry.replication_method, bookmark)
}
