use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::prelude::FromRow;
use sqlx::types::Json;
use sqlx::{Executor, PgPool};
use std::collections::BTreeMap;
use tapflow_config::shared::PgConnectionConfig;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ErrorKind, TapflowError, TapflowResult};
use crate::state::checkpoint::{Checkpoint, ensure_progress};
use crate::state::store::base::CheckpointStore;
use crate::tapflow_error;
use crate::types::PipelineId;

const NUM_POOL_CONNECTIONS: u32 = 2;

#[derive(Debug, FromRow)]
struct CheckpointRow {
    pipeline_id: String,
    sequence: i64,
    bookmark: Json<Value>,
    activated_versions: Json<BTreeMap<String, u64>>,
    committed_at: DateTime<Utc>,
    run_id: Uuid,
}

impl TryFrom<CheckpointRow> for Checkpoint {
    type Error = TapflowError;

    fn try_from(row: CheckpointRow) -> Result<Self, Self::Error> {
        let sequence = u64::try_from(row.sequence).map_err(|err| {
            tapflow_error!(
                ErrorKind::DeserializationError,
                "Checkpoint row has a negative sequence",
                format!("pipeline `{}`: {}", row.pipeline_id, row.sequence),
                source: err
            )
        })?;

        Ok(Checkpoint {
            pipeline_id: PipelineId::new(row.pipeline_id)?,
            sequence,
            bookmark: row.bookmark.0,
            activated_versions: row.activated_versions.0,
            committed_at: row.committed_at,
            run_id: row.run_id.into(),
        })
    }
}

/// Stores checkpoints in the `tapflow.checkpoints` table.
///
/// Each commit runs in a transaction that locks the pipeline row, so concurrent commits for the
/// same pipeline are serialized even across processes.
#[derive(Debug, Clone)]
pub struct PostgresCheckpointStore {
    pool: PgPool,
}

impl PostgresCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects to the checkpoint database described by `config`.
    pub async fn connect(config: &PgConnectionConfig) -> TapflowResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(NUM_POOL_CONNECTIONS)
            .connect_with(config.connect_options())
            .await?;

        info!(host = %config.host, database = %config.name, "using postgres checkpoint store");

        Ok(Self::new(pool))
    }

    async fn fetch(
        &self,
        pipeline_id: &PipelineId,
    ) -> TapflowResult<Option<Checkpoint>> {
        let row = sqlx::query_as::<_, CheckpointRow>(
            r#"
            select pipeline_id, sequence, bookmark, activated_versions, committed_at, run_id
            from tapflow.checkpoints
            where pipeline_id = $1
            "#,
        )
        .bind(pipeline_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Checkpoint::try_from).transpose()
    }
}

impl CheckpointStore for PostgresCheckpointStore {
    async fn load(&self, pipeline_id: &PipelineId) -> TapflowResult<Option<Checkpoint>> {
        self.fetch(pipeline_id).await
    }

    async fn commit(&self, checkpoint: Checkpoint) -> TapflowResult<()> {
        let sequence = i64::try_from(checkpoint.sequence).map_err(|err| {
            tapflow_error!(
                ErrorKind::SerializationError,
                "Checkpoint sequence does not fit the database column",
                checkpoint.sequence,
                source: err
            )
        })?;

        let mut tx = self.pool.begin().await?;

        let current = sqlx::query_as::<_, CheckpointRow>(
            r#"
            select pipeline_id, sequence, bookmark, activated_versions, committed_at, run_id
            from tapflow.checkpoints
            where pipeline_id = $1
            for update
            "#,
        )
        .bind(checkpoint.pipeline_id.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        // Returning early drops the transaction, which rolls it back and releases the row lock.
        if let Some(current) = current {
            let current = Checkpoint::try_from(current)?;
            if current.is_same_commit(&checkpoint) {
                debug!(
                    pipeline_id = %checkpoint.pipeline_id,
                    sequence = checkpoint.sequence,
                    "checkpoint already persisted"
                );
                return Ok(());
            }
            ensure_progress(&current, &checkpoint)?;
        }

        sqlx::query(
            r#"
            insert into tapflow.checkpoints
                (pipeline_id, sequence, bookmark, activated_versions, committed_at, run_id)
            values ($1, $2, $3, $4, $5, $6)
            on conflict (pipeline_id)
            do update set
                sequence = excluded.sequence,
                bookmark = excluded.bookmark,
                activated_versions = excluded.activated_versions,
                committed_at = excluded.committed_at,
                run_id = excluded.run_id
            "#,
        )
        .bind(checkpoint.pipeline_id.as_str())
        .bind(sequence)
        .bind(Json(&checkpoint.bookmark))
        .bind(Json(&checkpoint.activated_versions))
        .bind(checkpoint.committed_at)
        .bind(checkpoint.run_id.into_inner())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(
            pipeline_id = %checkpoint.pipeline_id,
            sequence = checkpoint.sequence,
            "checkpoint written"
        );

        Ok(())
    }

    async fn reset(&self, pipeline_id: &PipelineId) -> TapflowResult<()> {
        sqlx::query("delete from tapflow.checkpoints where pipeline_id = $1")
            .bind(pipeline_id.as_str())
            .execute(&self.pool)
            .await?;

        info!(%pipeline_id, "checkpoint reset");

        Ok(())
    }
}

/// Applies the checkpoint table migrations in the `tapflow` schema.
///
/// The `search_path` is pointed at `tapflow` so the `_sqlx_migrations` bookkeeping table is
/// created there instead of in the public schema.
pub async fn apply_migrations(config: &PgConnectionConfig) -> TapflowResult<()> {
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                conn.execute("create schema if not exists tapflow;").await?;
                conn.execute("set search_path = 'tapflow';").await?;

                Ok(())
            })
        })
        .connect_with(config.connect_options())
        .await?;

    info!("applying checkpoint store migrations");

    let migrator = sqlx::migrate!("./migrations");
    migrator.run(&pool).await?;

    info!("checkpoint store migrations applied");

    Ok(())
}
