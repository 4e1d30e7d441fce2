//! Dispatch over the closed set of connector kinds.

use serde_json::{Map, Value};
use tapflow_config::shared::{ExtractorKind, LoaderKind};

use crate::catalog::ReplicationMethod;

/// Command line flag used to hand the catalog to an extractor.
///
/// Database extractors still take the legacy `--properties` flag.
pub fn catalog_flag(kind: ExtractorKind) -> &'static str {
    match kind {
        ExtractorKind::Postgres | ExtractorKind::Mysql | ExtractorKind::MongoDb => "--properties",
        ExtractorKind::S3Csv | ExtractorKind::Kafka | ExtractorKind::Custom => "--catalog",
    }
}

/// Whether a bulk transfer exists between the two kinds.
///
/// `Custom` on either side trusts the configured fastsync command.
pub fn fastsync_supported(extractor: ExtractorKind, loader: LoaderKind) -> bool {
    match (extractor, loader) {
        (ExtractorKind::Custom, _) | (_, LoaderKind::Custom) => true,
        (ExtractorKind::Kafka, _) | (_, LoaderKind::S3Csv) => false,
        (
            ExtractorKind::Postgres
            | ExtractorKind::Mysql
            | ExtractorKind::MongoDb
            | ExtractorKind::S3Csv,
            LoaderKind::Postgres | LoaderKind::Snowflake | LoaderKind::Redshift | LoaderKind::Bigquery,
        ) => true,
    }
}

/// Members a stream bookmark must contain for the extractor to resume incrementally.
pub fn required_bookmark_keys(
    kind: ExtractorKind,
    method: ReplicationMethod,
) -> &'static [&'static str] {
    match method {
        ReplicationMethod::FullTable => &[],
        ReplicationMethod::LogBased => match kind {
            ExtractorKind::Postgres => &["lsn"],
            ExtractorKind::Mysql => &["log_file", "log_pos"],
            ExtractorKind::MongoDb => &["token"],
            ExtractorKind::S3Csv | ExtractorKind::Kafka | ExtractorKind::Custom => &[],
        },
        ReplicationMethod::Incremental => match kind {
            ExtractorKind::S3Csv => &["modified_since"],
            _ => &["replication_key_value"],
        },
    }
}

/// Whether `bookmark` holds every member required to resume.
pub fn bookmark_is_resumable(
    kind: ExtractorKind,
    method: ReplicationMethod,
    bookmark: Option<&Map<String, Value>>,
) -> bool {
    let required = required_bookmark_keys(kind, method);
    match bookmark {
        Some(bookmark) => required.iter().all(|key| bookmark.contains_key(*key)),
        None => required.is_empty(),
    }
}
