//! PostgreSQL storage backend on a bounded `deadpool-postgres` pool.
//!
//! Entities are stored as a JSONB document next to the few columns queries
//! filter or order on, so the row shape follows the model types directly.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{
    Manager, ManagerConfig, Object, Pool, PoolError, RecyclingMethod, Runtime,
};
use futures_util::future::try_join_all;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_postgres::error::SqlState;
use tokio_postgres::{NoTls, Row};

use super::{Storage, StorageError, StorageResult};
use crate::config::StorageConfig;
use crate::models::{Checkpoint, Cron, CronFilter, Run, RunFilter, Thread, ThreadFilter};

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS thread (
    thread_id   TEXT PRIMARY KEY,
    owner_id    TEXT,
    status      TEXT NOT NULL,
    metadata    JSONB NOT NULL DEFAULT '{}'::jsonb,
    created_at  TIMESTAMPTZ NOT NULL,
    doc         JSONB NOT NULL
);
CREATE TABLE IF NOT EXISTS checkpoints (
    seq           BIGSERIAL PRIMARY KEY,
    checkpoint_id TEXT NOT NULL UNIQUE,
    thread_id     TEXT NOT NULL,
    run_id        TEXT,
    created_at    TIMESTAMPTZ NOT NULL,
    doc           JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS checkpoints_thread_seq ON checkpoints (thread_id, seq DESC);
CREATE TABLE IF NOT EXISTS run (
    run_id      TEXT PRIMARY KEY,
    thread_id   TEXT,
    owner_id    TEXT,
    status      TEXT NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL,
    doc         JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS run_thread_created ON run (thread_id, created_at DESC);
CREATE TABLE IF NOT EXISTS cron (
    cron_id      TEXT PRIMARY KEY,
    assistant_id TEXT NOT NULL,
    thread_id    TEXT,
    owner_id     TEXT,
    created_at   TIMESTAMPTZ NOT NULL,
    doc          JSONB NOT NULL
);
";

pub struct PostgresStorage {
    pool: Pool,
}

impl PostgresStorage {
    /// Build the pool, create the schema and pre-warm `pool_min_size` connections.
    pub async fn connect(cfg: &StorageConfig) -> anyhow::Result<Self> {
        use anyhow::Context;

        let url = cfg
            .database_url
            .as_deref()
            .context("storage.database_url is required for the postgres backend")?;
        let pg_config: tokio_postgres::Config =
            url.parse().context("Failed to parse database_url")?;
        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(cfg.pool_max_size)
            .wait_timeout(Some(Duration::from_secs(cfg.acquire_timeout_secs)))
            .runtime(Runtime::Tokio1)
            .build()
            .context("Failed to build postgres pool")?;

        let storage = Self { pool };
        {
            let client = storage
                .client()
                .await
                .context("Failed to connect to postgres")?;
            client
                .batch_execute(SCHEMA)
                .await
                .context("Failed to create storage schema")?;
        }
        let warm = try_join_all((0..cfg.pool_min_size).map(|_| storage.pool.get()))
            .await
            .context("Failed to pre-warm postgres pool")?;
        tracing::info!(
            warm = warm.len(),
            max = cfg.pool_max_size,
            "postgres pool ready"
        );
        drop(warm);
        Ok(storage)
    }

    async fn client(&self) -> StorageResult<Object> {
        self.pool.get().await.map_err(map_pool_error)
    }
}

fn map_pool_error(err: PoolError) -> StorageError {
    match err {
        PoolError::Timeout(kind) => StorageError::PoolExhausted(format!("{kind:?} timeout")),
        PoolError::Backend(err) => map_pg_error(&err),
        PoolError::Closed => StorageError::Unavailable("pool closed".to_string()),
        other => StorageError::Unavailable(other.to_string()),
    }
}

fn map_pg_error(err: &tokio_postgres::Error) -> StorageError {
    if err.is_closed() {
        return StorageError::Unavailable(err.to_string());
    }
    if err.code() == Some(&SqlState::UNIQUE_VIOLATION) {
        return StorageError::Conflict(err.to_string());
    }
    StorageError::Query(err.to_string())
}

fn to_doc<T: Serialize>(value: &T) -> StorageResult<Value> {
    serde_json::to_value(value).map_err(|err| StorageError::Corrupt(err.to_string()))
}

fn from_row<T: DeserializeOwned>(row: &Row) -> StorageResult<T> {
    let doc: Value = row
        .try_get("doc")
        .map_err(|err| StorageError::Corrupt(err.to_string()))?;
    serde_json::from_value(doc).map_err(|err| StorageError::Corrupt(err.to_string()))
}

fn from_rows<T: DeserializeOwned>(rows: &[Row]) -> StorageResult<Vec<T>> {
    rows.iter().map(from_row).collect()
}

fn as_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn count_of(row: &Row) -> StorageResult<usize> {
    let count: i64 = row
        .try_get(0)
        .map_err(|err| StorageError::Corrupt(err.to_string()))?;
    Ok(usize::try_from(count).unwrap_or(0))
}

const THREAD_WHERE: &str = "($1::text IS NULL OR owner_id = $1) \
     AND ($2::text IS NULL OR status = $2) \
     AND ($3::jsonb IS NULL OR metadata @> $3)";

const RUN_WHERE: &str = "($1::text IS NULL OR owner_id = $1) \
     AND ($2::text IS NULL OR thread_id = $2) \
     AND ($3::text[] IS NULL OR status = ANY($3))";

const CRON_WHERE: &str = "($1::text IS NULL OR owner_id = $1) \
     AND ($2::text IS NULL OR assistant_id = $2) \
     AND ($3::text IS NULL OR thread_id = $3)";

fn statuses(filter: &RunFilter) -> Option<Vec<String>> {
    (!filter.statuses.is_empty()).then(|| {
        filter
            .statuses
            .iter()
            .map(|status| status.as_str().to_string())
            .collect()
    })
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn create_thread(&self, thread: &Thread) -> StorageResult<()> {
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO thread (thread_id, owner_id, status, metadata, created_at, doc) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
                &[
                    &thread.thread_id,
                    &thread.owner_id,
                    &thread.status.as_str(),
                    &thread.metadata,
                    &thread.created_at,
                    &to_doc(thread)?,
                ],
            )
            .await
            .map_err(|err| map_pg_error(&err))?;
        Ok(())
    }

    async fn get_thread(
        &self,
        owner: Option<&str>,
        thread_id: &str,
    ) -> StorageResult<Option<Thread>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT doc FROM thread WHERE thread_id = $1 \
                 AND ($2::text IS NULL OR owner_id = $2)",
                &[&thread_id, &owner],
            )
            .await
            .map_err(|err| map_pg_error(&err))?;
        row.as_ref().map(from_row).transpose()
    }

    async fn update_thread(&self, thread: &Thread) -> StorageResult<()> {
        let client = self.client().await?;
        let updated = client
            .execute(
                "UPDATE thread SET owner_id = $2, status = $3, metadata = $4, doc = $5 \
                 WHERE thread_id = $1",
                &[
                    &thread.thread_id,
                    &thread.owner_id,
                    &thread.status.as_str(),
                    &thread.metadata,
                    &to_doc(thread)?,
                ],
            )
            .await
            .map_err(|err| map_pg_error(&err))?;
        if updated == 0 {
            return Err(StorageError::NotFound(format!(
                "Thread {} not found",
                thread.thread_id
            )));
        }
        Ok(())
    }

    async fn delete_thread(&self, owner: Option<&str>, thread_id: &str) -> StorageResult<bool> {
        let mut client = self.client().await?;
        let tx = client
            .transaction()
            .await
            .map_err(|err| map_pg_error(&err))?;
        let deleted = tx
            .execute(
                "DELETE FROM thread WHERE thread_id = $1 \
                 AND ($2::text IS NULL OR owner_id = $2)",
                &[&thread_id, &owner],
            )
            .await
            .map_err(|err| map_pg_error(&err))?;
        if deleted > 0 {
            tx.execute("DELETE FROM checkpoints WHERE thread_id = $1", &[&thread_id])
                .await
                .map_err(|err| map_pg_error(&err))?;
            tx.execute("DELETE FROM run WHERE thread_id = $1", &[&thread_id])
                .await
                .map_err(|err| map_pg_error(&err))?;
        }
        tx.commit().await.map_err(|err| map_pg_error(&err))?;
        Ok(deleted > 0)
    }

    async fn search_threads(
        &self,
        owner: Option<&str>,
        filter: &ThreadFilter,
    ) -> StorageResult<Vec<Thread>> {
        let client = self.client().await?;
        let sql = format!(
            "SELECT doc FROM thread WHERE {THREAD_WHERE} \
             ORDER BY created_at DESC LIMIT $4 OFFSET $5"
        );
        let rows = client
            .query(
                &sql,
                &[
                    &owner,
                    &filter.status.map(|status| status.as_str()),
                    &filter.metadata,
                    &filter.limit.map(as_i64),
                    &as_i64(filter.offset),
                ],
            )
            .await
            .map_err(|err| map_pg_error(&err))?;
        from_rows(&rows)
    }

    async fn count_threads(
        &self,
        owner: Option<&str>,
        filter: &ThreadFilter,
    ) -> StorageResult<usize> {
        let client = self.client().await?;
        let sql = format!("SELECT COUNT(*) FROM thread WHERE {THREAD_WHERE}");
        let row = client
            .query_one(
                &sql,
                &[
                    &owner,
                    &filter.status.map(|status| status.as_str()),
                    &filter.metadata,
                ],
            )
            .await
            .map_err(|err| map_pg_error(&err))?;
        count_of(&row)
    }

    async fn put_checkpoint(&self, checkpoint: &Checkpoint) -> StorageResult<()> {
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO checkpoints (checkpoint_id, thread_id, run_id, created_at, doc) \
                 VALUES ($1, $2, $3, $4, $5)",
                &[
                    &checkpoint.checkpoint_id,
                    &checkpoint.thread_id,
                    &checkpoint.run_id,
                    &checkpoint.created_at,
                    &to_doc(checkpoint)?,
                ],
            )
            .await
            .map_err(|err| map_pg_error(&err))?;
        Ok(())
    }

    async fn latest_checkpoint(&self, thread_id: &str) -> StorageResult<Option<Checkpoint>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT doc FROM checkpoints WHERE thread_id = $1 ORDER BY seq DESC LIMIT 1",
                &[&thread_id],
            )
            .await
            .map_err(|err| map_pg_error(&err))?;
        row.as_ref().map(from_row).transpose()
    }

    async fn list_checkpoints(
        &self,
        thread_id: &str,
        limit: Option<usize>,
        before: Option<&str>,
    ) -> StorageResult<Vec<Checkpoint>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT doc FROM checkpoints WHERE thread_id = $1 \
                 AND seq < COALESCE( \
                     (SELECT seq FROM checkpoints WHERE checkpoint_id = $2), \
                     9223372036854775807) \
                 ORDER BY seq DESC LIMIT $3",
                &[&thread_id, &before, &limit.map(as_i64)],
            )
            .await
            .map_err(|err| map_pg_error(&err))?;
        from_rows(&rows)
    }

    async fn latest_checkpoint_before(
        &self,
        thread_id: &str,
        before: DateTime<Utc>,
    ) -> StorageResult<Option<Checkpoint>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT doc FROM checkpoints WHERE thread_id = $1 AND created_at < $2 \
                 ORDER BY seq DESC LIMIT 1",
                &[&thread_id, &before],
            )
            .await
            .map_err(|err| map_pg_error(&err))?;
        row.as_ref().map(from_row).transpose()
    }

    async fn checkpoint_for_run(
        &self,
        thread_id: &str,
        run_id: &str,
    ) -> StorageResult<Option<Checkpoint>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT doc FROM checkpoints WHERE thread_id = $1 AND run_id = $2 \
                 ORDER BY seq DESC LIMIT 1",
                &[&thread_id, &run_id],
            )
            .await
            .map_err(|err| map_pg_error(&err))?;
        row.as_ref().map(from_row).transpose()
    }

    async fn delete_checkpoints_for_run(
        &self,
        thread_id: &str,
        run_id: &str,
    ) -> StorageResult<usize> {
        let client = self.client().await?;
        let deleted = client
            .execute(
                "DELETE FROM checkpoints WHERE thread_id = $1 AND run_id = $2",
                &[&thread_id, &run_id],
            )
            .await
            .map_err(|err| map_pg_error(&err))?;
        Ok(usize::try_from(deleted).unwrap_or(usize::MAX))
    }

    async fn create_run(&self, run: &Run) -> StorageResult<()> {
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO run (run_id, thread_id, owner_id, status, created_at, doc) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
                &[
                    &run.run_id,
                    &run.thread_id,
                    &run.owner_id,
                    &run.status.as_str(),
                    &run.created_at,
                    &to_doc(run)?,
                ],
            )
            .await
            .map_err(|err| map_pg_error(&err))?;
        Ok(())
    }

    async fn get_run(&self, owner: Option<&str>, run_id: &str) -> StorageResult<Option<Run>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT doc FROM run WHERE run_id = $1 AND ($2::text IS NULL OR owner_id = $2)",
                &[&run_id, &owner],
            )
            .await
            .map_err(|err| map_pg_error(&err))?;
        row.as_ref().map(from_row).transpose()
    }

    async fn update_run(&self, run: &Run) -> StorageResult<()> {
        let client = self.client().await?;
        let updated = client
            .execute(
                "UPDATE run SET status = $2, doc = $3 WHERE run_id = $1",
                &[&run.run_id, &run.status.as_str(), &to_doc(run)?],
            )
            .await
            .map_err(|err| map_pg_error(&err))?;
        if updated == 0 {
            return Err(StorageError::NotFound(format!("Run {} not found", run.run_id)));
        }
        Ok(())
    }

    async fn delete_run(&self, owner: Option<&str>, run_id: &str) -> StorageResult<bool> {
        let client = self.client().await?;
        let deleted = client
            .execute(
                "DELETE FROM run WHERE run_id = $1 AND ($2::text IS NULL OR owner_id = $2)",
                &[&run_id, &owner],
            )
            .await
            .map_err(|err| map_pg_error(&err))?;
        Ok(deleted > 0)
    }

    async fn list_runs(&self, owner: Option<&str>, filter: &RunFilter) -> StorageResult<Vec<Run>> {
        let client = self.client().await?;
        let sql = format!(
            "SELECT doc FROM run WHERE {RUN_WHERE} \
             ORDER BY created_at DESC LIMIT $4 OFFSET $5"
        );
        let rows = client
            .query(
                &sql,
                &[
                    &owner,
                    &filter.thread_id,
                    &statuses(filter),
                    &filter.limit.map(as_i64),
                    &as_i64(filter.offset),
                ],
            )
            .await
            .map_err(|err| map_pg_error(&err))?;
        from_rows(&rows)
    }

    async fn count_runs(&self, owner: Option<&str>, filter: &RunFilter) -> StorageResult<usize> {
        let client = self.client().await?;
        let sql = format!("SELECT COUNT(*) FROM run WHERE {RUN_WHERE}");
        let row = client
            .query_one(&sql, &[&owner, &filter.thread_id, &statuses(filter)])
            .await
            .map_err(|err| map_pg_error(&err))?;
        count_of(&row)
    }

    async fn create_cron(&self, cron: &Cron) -> StorageResult<()> {
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO cron (cron_id, assistant_id, thread_id, owner_id, created_at, doc) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
                &[
                    &cron.cron_id,
                    &cron.assistant_id,
                    &cron.thread_id,
                    &cron.owner_id,
                    &cron.created_at,
                    &to_doc(cron)?,
                ],
            )
            .await
            .map_err(|err| map_pg_error(&err))?;
        Ok(())
    }

    async fn get_cron(&self, owner: Option<&str>, cron_id: &str) -> StorageResult<Option<Cron>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT doc FROM cron WHERE cron_id = $1 AND ($2::text IS NULL OR owner_id = $2)",
                &[&cron_id, &owner],
            )
            .await
            .map_err(|err| map_pg_error(&err))?;
        row.as_ref().map(from_row).transpose()
    }

    async fn update_cron(&self, cron: &Cron) -> StorageResult<()> {
        let client = self.client().await?;
        let updated = client
            .execute(
                "UPDATE cron SET doc = $2 WHERE cron_id = $1",
                &[&cron.cron_id, &to_doc(cron)?],
            )
            .await
            .map_err(|err| map_pg_error(&err))?;
        if updated == 0 {
            return Err(StorageError::NotFound(format!(
                "Cron {} not found",
                cron.cron_id
            )));
        }
        Ok(())
    }

    async fn delete_cron(&self, owner: Option<&str>, cron_id: &str) -> StorageResult<bool> {
        let client = self.client().await?;
        let deleted = client
            .execute(
                "DELETE FROM cron WHERE cron_id = $1 AND ($2::text IS NULL OR owner_id = $2)",
                &[&cron_id, &owner],
            )
            .await
            .map_err(|err| map_pg_error(&err))?;
        Ok(deleted > 0)
    }

    async fn list_crons(
        &self,
        owner: Option<&str>,
        filter: &CronFilter,
    ) -> StorageResult<Vec<Cron>> {
        let client = self.client().await?;
        let sql = format!(
            "SELECT doc FROM cron WHERE {CRON_WHERE} \
             ORDER BY created_at DESC LIMIT $4 OFFSET $5"
        );
        let rows = client
            .query(
                &sql,
                &[
                    &owner,
                    &filter.assistant_id,
                    &filter.thread_id,
                    &filter.limit.map(as_i64),
                    &as_i64(filter.offset),
                ],
            )
            .await
            .map_err(|err| map_pg_error(&err))?;
        from_rows(&rows)
    }

    async fn count_crons(&self, owner: Option<&str>, filter: &CronFilter) -> StorageResult<usize> {
        let client = self.client().await?;
        let sql = format!("SELECT COUNT(*) FROM cron WHERE {CRON_WHERE}");
        let row = client
            .query_one(&sql, &[&owner, &filter.assistant_id, &filter.thread_id])
            .await
            .map_err(|err| map_pg_error(&err))?;
        count_of(&row)
    }

    async fn close(&self) {
        self.pool.close();
        tracing::info!("postgres pool closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_pool_is_unavailable() {
        let err = map_pool_error(PoolError::Closed);
        assert!(matches!(err, StorageError::Unavailable(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn empty_status_filter_is_unbounded() {
        assert_eq!(statuses(&RunFilter::default()), None);
    }

    #[test]
    fn schema_declares_every_table() {
        let tables: Vec<&str> = SCHEMA
            .lines()
            .filter_map(|line| line.strip_prefix("CREATE TABLE IF NOT EXISTS "))
            .filter_map(|rest| rest.split_whitespace().next())
            .collect();
        assert_eq!(tables, ["thread", "checkpoints", "run", "cron"]);
    }
}
