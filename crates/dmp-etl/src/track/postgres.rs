//! Postgres tracker store
//!
//! Two tables: `etl_run` and `etl_table_log`. Claims serialize through a
//! transaction-scoped advisory lock keyed on `table:partition`, so two
//! concurrent claimants cannot both insert a running log.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::TrackerError;

use super::store::TrackerStore;
use super::{LogStatus, Run, RunStatus, RunSummary, RunType, TableClaim, TableLog, TableOperation};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS etl_run (
    id            UUID PRIMARY KEY,
    run_type      TEXT NOT NULL,
    partition_key TEXT NOT NULL,
    started_at    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    completed_at  TIMESTAMPTZ,
    status        TEXT NOT NULL DEFAULT 'running',
    error_message TEXT,
    metadata      JSONB NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS etl_table_log (
    id                UUID PRIMARY KEY,
    run_id            UUID NOT NULL REFERENCES etl_run(id),
    table_name        TEXT NOT NULL,
    source_descriptor TEXT NOT NULL,
    operation         TEXT NOT NULL,
    started_at        TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    completed_at      TIMESTAMPTZ,
    rows_affected     BIGINT,
    status            TEXT NOT NULL DEFAULT 'running',
    error_message     TEXT
);

CREATE INDEX IF NOT EXISTS idx_etl_table_log_run ON etl_table_log(run_id);
CREATE INDEX IF NOT EXISTS idx_etl_table_log_table ON etl_table_log(table_name, status);
"#;

pub struct PgTrackerStore {
    pool: PgPool,
}

impl PgTrackerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the tracking tables if they are missing.
    pub async fn ensure_schema(&self) -> Result<(), TrackerError> {
        let mut tx = self.pool.begin().await?;
        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

fn run_from_row(row: &PgRow) -> Result<Run, TrackerError> {
    let run_type: String = row.try_get("run_type")?;
    let status: String = row.try_get("status")?;
    Ok(Run {
        id: row.try_get("id")?,
        run_type: RunType::parse(&run_type)
            .ok_or_else(|| TrackerError::Corrupt(format!("unknown run_type '{run_type}'")))?,
        partition_key: row.try_get("partition_key")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        status: RunStatus::parse(&status)
            .ok_or_else(|| TrackerError::Corrupt(format!("unknown run status '{status}'")))?,
        error_message: row.try_get("error_message")?,
        metadata: row.try_get("metadata")?,
    })
}

fn log_from_row(row: &PgRow) -> Result<TableLog, TrackerError> {
    let operation: String = row.try_get("operation")?;
    let status: String = row.try_get("status")?;
    Ok(TableLog {
        id: row.try_get("id")?,
        run_id: row.try_get("run_id")?,
        table_name: row.try_get("table_name")?,
        source_descriptor: row.try_get("source_descriptor")?,
        operation: TableOperation::parse(&operation)
            .ok_or_else(|| TrackerError::Corrupt(format!("unknown operation '{operation}'")))?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        rows_affected: row.try_get("rows_affected")?,
        status: LogStatus::parse(&status)
            .ok_or_else(|| TrackerError::Corrupt(format!("unknown log status '{status}'")))?,
        error_message: row.try_get("error_message")?,
    })
}

#[async_trait]
impl TrackerStore for PgTrackerStore {
    async fn open_run(
        &self,
        run_type: RunType,
        partition_key: &str,
        metadata: serde_json::Value,
    ) -> Result<Uuid, TrackerError> {
        let run_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO etl_run (id, run_type, partition_key, status, metadata) \
             VALUES ($1, $2, $3, 'running', $4)",
        )
        .bind(run_id)
        .bind(run_type.as_str())
        .bind(partition_key)
        .bind(metadata)
        .execute(&self.pool)
        .await?;
        Ok(run_id)
    }

    async fn close_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<(), TrackerError> {
        if !status.is_terminal() {
            return Err(TrackerError::InvalidTransition(format!(
                "cannot close run to non-terminal status '{}'",
                status.as_str()
            )));
        }
        let result = sqlx::query(
            "UPDATE etl_run \
             SET status = $2, completed_at = NOW(), error_message = $3 \
             WHERE id = $1 AND status = 'running'",
        )
        .bind(run_id)
        .bind(status.as_str())
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Distinguish a missing run from one already closed
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM etl_run WHERE id = $1)")
                    .bind(run_id)
                    .fetch_one(&self.pool)
                    .await?;
            return Err(if exists {
                TrackerError::RunClosed(run_id)
            } else {
                TrackerError::RunNotFound(run_id)
            });
        }
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Run, TrackerError> {
        let row = sqlx::query("SELECT * FROM etl_run WHERE id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(TrackerError::RunNotFound(run_id))?;
        run_from_row(&row)
    }

    async fn claim_table(
        &self,
        run_id: Uuid,
        table_name: &str,
        operation: TableOperation,
        source_descriptor: &str,
    ) -> Result<TableClaim, TrackerError> {
        let mut tx = self.pool.begin().await?;

        let partition_key: String =
            sqlx::query_scalar("SELECT partition_key FROM etl_run WHERE id = $1")
                .bind(run_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(TrackerError::RunNotFound(run_id))?;

        // Serialize claimants of the same table/partition pair
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(format!("{table_name}:{partition_key}"))
            .execute(&mut *tx)
            .await?;

        let existing: Option<String> = sqlx::query_scalar(
            "SELECT l.status FROM etl_table_log l \
             JOIN etl_run r ON r.id = l.run_id \
             WHERE l.table_name = $1 \
               AND r.partition_key = $2 \
               AND l.status IN ('completed', 'running') \
             ORDER BY l.status ASC \
             LIMIT 1",
        )
        .bind(table_name)
        .bind(&partition_key)
        .fetch_optional(&mut *tx)
        .await?;

        match existing.as_deref() {
            Some("completed") => return Ok(TableClaim::AlreadyCompleted),
            Some("running") => return Ok(TableClaim::InProgress),
            Some(other) => {
                return Err(TrackerError::Corrupt(format!(
                    "unknown log status '{other}'"
                )))
            }
            None => {}
        }

        let log_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO etl_table_log \
             (id, run_id, table_name, source_descriptor, operation, status) \
             VALUES ($1, $2, $3, $4, $5, 'running')",
        )
        .bind(log_id)
        .bind(run_id)
        .bind(table_name)
        .bind(source_descriptor)
        .bind(operation.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(TableClaim::Acquired(log_id))
    }

    async fn close_table(
        &self,
        log_id: Uuid,
        status: LogStatus,
        rows_affected: Option<i64>,
        error: Option<&str>,
    ) -> Result<(), TrackerError> {
        if !status.is_terminal() {
            return Err(TrackerError::InvalidTransition(format!(
                "cannot close table log to non-terminal status '{}'",
                status.as_str()
            )));
        }
        if (status == LogStatus::Completed) != rows_affected.is_some() {
            return Err(TrackerError::CompletionInvariant);
        }

        let result = sqlx::query(
            "UPDATE etl_table_log \
             SET status = $2, completed_at = NOW(), rows_affected = $3, error_message = $4 \
             WHERE id = $1 AND status = 'running'",
        )
        .bind(log_id)
        .bind(status.as_str())
        .bind(rows_affected)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM etl_table_log WHERE id = $1)")
                    .bind(log_id)
                    .fetch_one(&self.pool)
                    .await?;
            return Err(if exists {
                TrackerError::InvalidTransition(format!("table log {log_id} is already closed"))
            } else {
                TrackerError::LogNotFound(log_id)
            });
        }
        Ok(())
    }

    async fn loaded_partitions(&self, table_name: &str) -> Result<BTreeSet<String>, TrackerError> {
        let keys: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT r.partition_key \
             FROM etl_table_log l \
             JOIN etl_run r ON r.id = l.run_id \
             WHERE l.table_name = $1 AND l.status = 'completed'",
        )
        .bind(table_name)
        .fetch_all(&self.pool)
        .await?;
        Ok(keys.into_iter().collect())
    }

    async fn run_summary(&self, run_id: Uuid) -> Result<RunSummary, TrackerError> {
        let row = sqlx::query(
            "SELECT r.status, \
                    r.partition_key, \
                    r.started_at, \
                    r.completed_at, \
                    COUNT(l.id) AS table_count, \
                    COUNT(*) FILTER (WHERE l.status = 'completed') AS tables_completed, \
                    COUNT(*) FILTER (WHERE l.status = 'failed') AS tables_failed, \
                    COALESCE(SUM(l.rows_affected), 0)::bigint AS total_rows \
             FROM etl_run r \
             LEFT JOIN etl_table_log l ON l.run_id = r.id \
             WHERE r.id = $1 \
             GROUP BY r.id",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(TrackerError::RunNotFound(run_id))?;

        let status: String = row.try_get("status")?;
        let started_at: DateTime<Utc> = row.try_get("started_at")?;
        let completed_at: Option<DateTime<Utc>> = row.try_get("completed_at")?;
        let end = completed_at.unwrap_or_else(Utc::now);

        Ok(RunSummary {
            run_id,
            status: RunStatus::parse(&status)
                .ok_or_else(|| TrackerError::Corrupt(format!("unknown run status '{status}'")))?,
            partition_key: row.try_get("partition_key")?,
            table_count: row.try_get("table_count")?,
            tables_completed: row.try_get("tables_completed")?,
            tables_failed: row.try_get("tables_failed")?,
            total_rows: row.try_get("total_rows")?,
            duration_secs: (end - started_at).num_seconds(),
        })
    }

    async fn table_logs(&self, run_id: Uuid) -> Result<Vec<TableLog>, TrackerError> {
        let rows = sqlx::query(
            "SELECT * FROM etl_table_log WHERE run_id = $1 ORDER BY started_at, id",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(log_from_row).collect()
    }

    async fn stale_runs(&self, older_than: Duration) -> Result<Vec<Run>, TrackerError> {
        let cutoff = Utc::now() - older_than;
        let rows = sqlx::query(
            "SELECT * FROM etl_run \
             WHERE status = 'running' AND started_at < $1 \
             ORDER BY started_at",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn force_fail_run(&self, run_id: Uuid, reason: &str) -> Result<(), TrackerError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE etl_run \
             SET status = 'failed', completed_at = NOW(), error_message = $2 \
             WHERE id = $1 AND status = 'running'",
        )
        .bind(run_id)
        .bind(reason)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM etl_run WHERE id = $1)")
                    .bind(run_id)
                    .fetch_one(&mut *tx)
                    .await?;
            return Err(if exists {
                TrackerError::RunClosed(run_id)
            } else {
                TrackerError::RunNotFound(run_id)
            });
        }

        sqlx::query(
            "UPDATE etl_table_log \
             SET status = 'failed', completed_at = NOW(), error_message = $2 \
             WHERE run_id = $1 AND status = 'running'",
        )
        .bind(run_id)
        .bind(reason)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}
