//! Tracker storage seam

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::Duration;
use uuid::Uuid;

use crate::error::TrackerError;

use super::{LogStatus, Run, RunStatus, RunSummary, RunType, TableClaim, TableLog, TableOperation};

/// Durable storage for runs and table logs.
///
/// Implementations enforce the state-machine invariants themselves so
/// every caller gets the same guarantees:
///
/// - a run or log closes at most once, and only to a terminal status
/// - `rows_affected` is set exactly when a log completes
/// - claiming is atomic under concurrent callers
#[async_trait]
pub trait TrackerStore: Send + Sync {
    async fn open_run(
        &self,
        run_type: RunType,
        partition_key: &str,
        metadata: serde_json::Value,
    ) -> Result<Uuid, TrackerError>;

    async fn close_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<(), TrackerError>;

    async fn get_run(&self, run_id: Uuid) -> Result<Run, TrackerError>;

    /// Claim `table_name` for `run_id`. Considers every run sharing the
    /// claiming run's partition key: a completed log anywhere yields
    /// `AlreadyCompleted`, a running log yields `InProgress`, otherwise
    /// a new running log is inserted and `Acquired` returned.
    async fn claim_table(
        &self,
        run_id: Uuid,
        table_name: &str,
        operation: TableOperation,
        source_descriptor: &str,
    ) -> Result<TableClaim, TrackerError>;

    async fn close_table(
        &self,
        log_id: Uuid,
        status: LogStatus,
        rows_affected: Option<i64>,
        error: Option<&str>,
    ) -> Result<(), TrackerError>;

    /// Partition keys with a completed log for `table_name`, ordered.
    async fn loaded_partitions(&self, table_name: &str) -> Result<BTreeSet<String>, TrackerError>;

    async fn run_summary(&self, run_id: Uuid) -> Result<RunSummary, TrackerError>;

    /// Logs belonging to one run, in insertion order.
    async fn table_logs(&self, run_id: Uuid) -> Result<Vec<TableLog>, TrackerError>;

    /// Runs still `running` whose start is older than the given age.
    async fn stale_runs(&self, older_than: Duration) -> Result<Vec<Run>, TrackerError>;

    /// Mark an abandoned run failed along with all of its running logs.
    async fn force_fail_run(&self, run_id: Uuid, reason: &str) -> Result<(), TrackerError>;
}
