//! Run and table-log tracking
//!
//! Every migration run and every per-table attempt is recorded durably
//! so interrupted work can be resumed, skipped, or reconciled later.
//! Status transitions are one-way: `running` moves to exactly one of
//! `completed` or `failed`, and closed records never reopen.

pub mod memory;
pub mod postgres;
pub mod store;

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::TrackerError;

pub use memory::MemoryTrackerStore;
pub use postgres::PgTrackerStore;
pub use store::TrackerStore;

/// What kind of work a run performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    RawLoad,
    Transform,
}

impl RunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunType::RawLoad => "raw_load",
            RunType::Transform => "transform",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "raw_load" => Some(RunType::RawLoad),
            "transform" => Some(RunType::Transform),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// Operation recorded on a table log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableOperation {
    Load,
    Transform,
    Truncate,
}

impl TableOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableOperation::Load => "load",
            TableOperation::Transform => "transform",
            TableOperation::Truncate => "truncate",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "load" => Some(TableOperation::Load),
            "transform" => Some(TableOperation::Transform),
            "truncate" => Some(TableOperation::Truncate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Running,
    Completed,
    Failed,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Running => "running",
            LogStatus::Completed => "completed",
            LogStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(LogStatus::Running),
            "completed" => Some(LogStatus::Completed),
            "failed" => Some(LogStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, LogStatus::Running)
    }
}

/// One recorded migration run
#[derive(Debug, Clone, Serialize)]
pub struct Run {
    pub id: Uuid,
    pub run_type: RunType,
    /// Dataset slice this run covers (vintage year, region, batch id)
    pub partition_key: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub error_message: Option<String>,
    pub metadata: serde_json::Value,
}

/// One per-table attempt within a run
#[derive(Debug, Clone, Serialize)]
pub struct TableLog {
    pub id: Uuid,
    pub run_id: Uuid,
    pub table_name: String,
    pub source_descriptor: String,
    pub operation: TableOperation,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Set exactly when the attempt completed
    pub rows_affected: Option<i64>,
    pub status: LogStatus,
    pub error_message: Option<String>,
}

/// Aggregated view of one run and its table logs
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub partition_key: String,
    pub table_count: i64,
    pub tables_completed: i64,
    pub tables_failed: i64,
    pub total_rows: i64,
    pub duration_secs: i64,
}

/// Result of trying to claim a table for work
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableClaim {
    /// Claimed; the log id to close when the attempt ends
    Acquired(Uuid),
    /// A prior run already completed this table for this partition
    AlreadyCompleted,
    /// Another live attempt holds this table for this partition
    InProgress,
}

/// Facade over a [`TrackerStore`] adding structured logging around each
/// state change.
#[derive(Clone)]
pub struct RunTracker {
    store: Arc<dyn TrackerStore>,
}

impl RunTracker {
    pub fn new(store: Arc<dyn TrackerStore>) -> Self {
        Self { store }
    }

    pub async fn open_run(
        &self,
        run_type: RunType,
        partition_key: &str,
        metadata: serde_json::Value,
    ) -> Result<Uuid, TrackerError> {
        let run_id = self.store.open_run(run_type, partition_key, metadata).await?;
        info!(%run_id, run_type = run_type.as_str(), partition = partition_key, "run opened");
        Ok(run_id)
    }

    pub async fn close_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<(), TrackerError> {
        self.store.close_run(run_id, status, error).await?;
        match status {
            RunStatus::Failed => warn!(%run_id, error, "run failed"),
            _ => info!(%run_id, status = status.as_str(), "run closed"),
        }
        Ok(())
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<Run, TrackerError> {
        self.store.get_run(run_id).await
    }

    /// Atomically claim one table for this run. Checks prior and live
    /// attempts across all runs sharing the partition.
    pub async fn claim_table(
        &self,
        run_id: Uuid,
        table_name: &str,
        operation: TableOperation,
        source_descriptor: &str,
    ) -> Result<TableClaim, TrackerError> {
        let claim = self
            .store
            .claim_table(run_id, table_name, operation, source_descriptor)
            .await?;
        match &claim {
            TableClaim::Acquired(log_id) => {
                info!(%run_id, table = table_name, %log_id, "table claimed")
            }
            TableClaim::AlreadyCompleted => {
                info!(%run_id, table = table_name, "table already completed, skipping")
            }
            TableClaim::InProgress => {
                warn!(%run_id, table = table_name, "table held by a live attempt, skipping")
            }
        }
        Ok(claim)
    }

    pub async fn close_table(
        &self,
        log_id: Uuid,
        status: LogStatus,
        rows_affected: Option<i64>,
        error: Option<&str>,
    ) -> Result<(), TrackerError> {
        self.store
            .close_table(log_id, status, rows_affected, error)
            .await?;
        match status {
            LogStatus::Failed => warn!(%log_id, error, "table attempt failed"),
            _ => info!(%log_id, status = status.as_str(), rows = rows_affected, "table closed"),
        }
        Ok(())
    }

    /// Partition keys for which the named table has a completed log.
    pub async fn loaded_partitions(
        &self,
        table_name: &str,
    ) -> Result<BTreeSet<String>, TrackerError> {
        self.store.loaded_partitions(table_name).await
    }

    pub async fn run_summary(&self, run_id: Uuid) -> Result<RunSummary, TrackerError> {
        self.store.run_summary(run_id).await
    }

    pub async fn table_logs(&self, run_id: Uuid) -> Result<Vec<TableLog>, TrackerError> {
        self.store.table_logs(run_id).await
    }

    /// Runs still marked running that started before the given age.
    pub async fn stale_runs(&self, older_than: Duration) -> Result<Vec<Run>, TrackerError> {
        self.store.stale_runs(older_than).await
    }

    /// Force-fail an abandoned run and every log it still holds open,
    /// releasing its table claims.
    pub async fn force_fail_run(&self, run_id: Uuid, reason: &str) -> Result<(), TrackerError> {
        self.store.force_fail_run(run_id, reason).await?;
        warn!(%run_id, reason, "run force-failed");
        Ok(())
    }
}
