//! In-memory tracker store for tests
//!
//! Enforces exactly the invariants the Postgres store enforces, behind a
//! single async mutex so claims serialize the same way.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::TrackerError;

use super::store::TrackerStore;
use super::{LogStatus, Run, RunStatus, RunSummary, RunType, TableClaim, TableLog, TableOperation};

#[derive(Default)]
struct State {
    runs: HashMap<Uuid, Run>,
    logs: HashMap<Uuid, TableLog>,
    log_order: Vec<Uuid>,
}

#[derive(Default)]
pub struct MemoryTrackerStore {
    state: Mutex<State>,
}

impl MemoryTrackerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TrackerStore for MemoryTrackerStore {
    async fn open_run(
        &self,
        run_type: RunType,
        partition_key: &str,
        metadata: serde_json::Value,
    ) -> Result<Uuid, TrackerError> {
        let mut state = self.state.lock().await;
        let run = Run {
            id: Uuid::new_v4(),
            run_type,
            partition_key: partition_key.to_string(),
            started_at: Utc::now(),
            completed_at: None,
            status: RunStatus::Running,
            error_message: None,
            metadata,
        };
        let id = run.id;
        state.runs.insert(id, run);
        Ok(id)
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
        let mut state = self.state.lock().await;
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or(TrackerError::RunNotFound(run_id))?;
        if run.status.is_terminal() {
            return Err(TrackerError::RunClosed(run_id));
        }
        run.status = status;
        run.completed_at = Some(Utc::now());
        run.error_message = error.map(str::to_string);
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Run, TrackerError> {
        let state = self.state.lock().await;
        state
            .runs
            .get(&run_id)
            .cloned()
            .ok_or(TrackerError::RunNotFound(run_id))
    }

    async fn claim_table(
        &self,
        run_id: Uuid,
        table_name: &str,
        operation: TableOperation,
        source_descriptor: &str,
    ) -> Result<TableClaim, TrackerError> {
        let mut state = self.state.lock().await;
        let partition_key = state
            .runs
            .get(&run_id)
            .ok_or(TrackerError::RunNotFound(run_id))?
            .partition_key
            .clone();

        // Any run sharing the partition counts, not just this one
        for log in state.logs.values() {
            if log.table_name != table_name {
                continue;
            }
            let Some(owner) = state.runs.get(&log.run_id) else {
                continue;
            };
            if owner.partition_key != partition_key {
                continue;
            }
            match log.status {
                LogStatus::Completed => return Ok(TableClaim::AlreadyCompleted),
                LogStatus::Running => return Ok(TableClaim::InProgress),
                LogStatus::Failed => {}
            }
        }

        let log = TableLog {
            id: Uuid::new_v4(),
            run_id,
            table_name: table_name.to_string(),
            source_descriptor: source_descriptor.to_string(),
            operation,
            started_at: Utc::now(),
            completed_at: None,
            rows_affected: None,
            status: LogStatus::Running,
            error_message: None,
        };
        let id = log.id;
        state.logs.insert(id, log);
        state.log_order.push(id);
        Ok(TableClaim::Acquired(id))
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
        let mut state = self.state.lock().await;
        let log = state
            .logs
            .get_mut(&log_id)
            .ok_or(TrackerError::LogNotFound(log_id))?;
        if log.status.is_terminal() {
            return Err(TrackerError::InvalidTransition(format!(
                "table log {log_id} is already closed"
            )));
        }
        log.status = status;
        log.completed_at = Some(Utc::now());
        log.rows_affected = rows_affected;
        log.error_message = error.map(str::to_string);
        Ok(())
    }

    async fn loaded_partitions(&self, table_name: &str) -> Result<BTreeSet<String>, TrackerError> {
        let state = self.state.lock().await;
        Ok(state
            .logs
            .values()
            .filter(|log| log.table_name == table_name && log.status == LogStatus::Completed)
            .filter_map(|log| state.runs.get(&log.run_id))
            .map(|run| run.partition_key.clone())
            .collect())
    }

    async fn run_summary(&self, run_id: Uuid) -> Result<RunSummary, TrackerError> {
        let state = self.state.lock().await;
        let run = state
            .runs
            .get(&run_id)
            .ok_or(TrackerError::RunNotFound(run_id))?;

        let logs: Vec<&TableLog> = state
            .logs
            .values()
            .filter(|log| log.run_id == run_id)
            .collect();
        let end = run.completed_at.unwrap_or_else(Utc::now);

        Ok(RunSummary {
            run_id,
            status: run.status,
            partition_key: run.partition_key.clone(),
            table_count: logs.len() as i64,
            tables_completed: logs
                .iter()
                .filter(|l| l.status == LogStatus::Completed)
                .count() as i64,
            tables_failed: logs.iter().filter(|l| l.status == LogStatus::Failed).count() as i64,
            total_rows: logs.iter().filter_map(|l| l.rows_affected).sum(),
            duration_secs: (end - run.started_at).num_seconds(),
        })
    }

    async fn table_logs(&self, run_id: Uuid) -> Result<Vec<TableLog>, TrackerError> {
        let state = self.state.lock().await;
        Ok(state
            .log_order
            .iter()
            .filter_map(|id| state.logs.get(id))
            .filter(|log| log.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn stale_runs(&self, older_than: Duration) -> Result<Vec<Run>, TrackerError> {
        let cutoff = Utc::now() - older_than;
        let state = self.state.lock().await;
        let mut stale: Vec<Run> = state
            .runs
            .values()
            .filter(|run| run.status == RunStatus::Running && run.started_at < cutoff)
            .cloned()
            .collect();
        stale.sort_by_key(|run| run.started_at);
        Ok(stale)
    }

    async fn force_fail_run(&self, run_id: Uuid, reason: &str) -> Result<(), TrackerError> {
        let mut state = self.state.lock().await;
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or(TrackerError::RunNotFound(run_id))?;
        if run.status.is_terminal() {
            return Err(TrackerError::RunClosed(run_id));
        }
        let now = Utc::now();
        run.status = RunStatus::Failed;
        run.completed_at = Some(now);
        run.error_message = Some(reason.to_string());

        for log in state.logs.values_mut() {
            if log.run_id == run_id && log.status == LogStatus::Running {
                log.status = LogStatus::Failed;
                log.completed_at = Some(now);
                log.error_message = Some(reason.to_string());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> MemoryTrackerStore {
        MemoryTrackerStore::new()
    }

    #[tokio::test]
    async fn test_run_lifecycle() {
        let s = store();
        let run_id = s.open_run(RunType::RawLoad, "2024", json!({})).await.unwrap();
        let run = s.get_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.completed_at.is_none());

        s.close_run(run_id, RunStatus::Completed, None).await.unwrap();
        let run = s.get_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_double_close_rejected() {
        let s = store();
        let run_id = s.open_run(RunType::RawLoad, "2024", json!({})).await.unwrap();
        s.close_run(run_id, RunStatus::Completed, None).await.unwrap();
        let err = s.close_run(run_id, RunStatus::Failed, Some("again")).await;
        assert!(matches!(err, Err(TrackerError::RunClosed(_))));
    }

    #[tokio::test]
    async fn test_close_to_running_rejected() {
        let s = store();
        let run_id = s.open_run(RunType::RawLoad, "2024", json!({})).await.unwrap();
        let err = s.close_run(run_id, RunStatus::Running, None).await;
        assert!(matches!(err, Err(TrackerError::InvalidTransition(_))));
    }

    #[tokio::test]
    async fn test_completion_invariant() {
        let s = store();
        let run_id = s.open_run(RunType::RawLoad, "2024", json!({})).await.unwrap();
        let TableClaim::Acquired(log_id) = s
            .claim_table(run_id, "t", TableOperation::Load, "src")
            .await
            .unwrap()
        else {
            panic!("expected acquire");
        };

        // Completed without rows
        let err = s.close_table(log_id, LogStatus::Completed, None, None).await;
        assert!(matches!(err, Err(TrackerError::CompletionInvariant)));

        // Failed with rows
        let err = s
            .close_table(log_id, LogStatus::Failed, Some(10), Some("boom"))
            .await;
        assert!(matches!(err, Err(TrackerError::CompletionInvariant)));

        s.close_table(log_id, LogStatus::Completed, Some(10), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_claim_sees_other_runs_same_partition() {
        let s = store();
        let first = s.open_run(RunType::RawLoad, "2024", json!({})).await.unwrap();
        let TableClaim::Acquired(log_id) = s
            .claim_table(first, "t", TableOperation::Load, "src")
            .await
            .unwrap()
        else {
            panic!("expected acquire");
        };

        // Second run, same partition: claim is held
        let second = s.open_run(RunType::RawLoad, "2024", json!({})).await.unwrap();
        assert_eq!(
            s.claim_table(second, "t", TableOperation::Load, "src")
                .await
                .unwrap(),
            TableClaim::InProgress
        );

        // Different partition is free
        let other = s.open_run(RunType::RawLoad, "2023", json!({})).await.unwrap();
        assert!(matches!(
            s.claim_table(other, "t", TableOperation::Load, "src")
                .await
                .unwrap(),
            TableClaim::Acquired(_)
        ));

        // After completion the claim reports done
        s.close_table(log_id, LogStatus::Completed, Some(5), None)
            .await
            .unwrap();
        assert_eq!(
            s.claim_table(second, "t", TableOperation::Load, "src")
                .await
                .unwrap(),
            TableClaim::AlreadyCompleted
        );
    }

    #[tokio::test]
    async fn test_failed_attempt_can_be_reclaimed() {
        let s = store();
        let run_id = s.open_run(RunType::RawLoad, "2024", json!({})).await.unwrap();
        let TableClaim::Acquired(log_id) = s
            .claim_table(run_id, "t", TableOperation::Load, "src")
            .await
            .unwrap()
        else {
            panic!("expected acquire");
        };
        s.close_table(log_id, LogStatus::Failed, None, Some("disk full"))
            .await
            .unwrap();

        let retry = s.open_run(RunType::RawLoad, "2024", json!({})).await.unwrap();
        assert!(matches!(
            s.claim_table(retry, "t", TableOperation::Load, "src")
                .await
                .unwrap(),
            TableClaim::Acquired(_)
        ));
    }

    #[tokio::test]
    async fn test_loaded_partitions() {
        let s = store();
        for (partition, complete) in [("2021", true), ("2022", true), ("2023", false)] {
            let run_id = s
                .open_run(RunType::RawLoad, partition, json!({}))
                .await
                .unwrap();
            let TableClaim::Acquired(log_id) = s
                .claim_table(run_id, "t", TableOperation::Load, "src")
                .await
                .unwrap()
            else {
                panic!("expected acquire");
            };
            if complete {
                s.close_table(log_id, LogStatus::Completed, Some(1), None)
                    .await
                    .unwrap();
            } else {
                s.close_table(log_id, LogStatus::Failed, None, Some("x"))
                    .await
                    .unwrap();
            }
        }

        let partitions = s.loaded_partitions("t").await.unwrap();
        assert_eq!(
            partitions.into_iter().collect::<Vec<_>>(),
            vec!["2021".to_string(), "2022".to_string()]
        );
    }

    #[tokio::test]
    async fn test_run_summary_aggregates() {
        let s = store();
        let run_id = s.open_run(RunType::RawLoad, "2024", json!({})).await.unwrap();
        for (table, rows) in [("a", Some(10i64)), ("b", Some(32)), ("c", None)] {
            let TableClaim::Acquired(log_id) = s
                .claim_table(run_id, table, TableOperation::Load, "src")
                .await
                .unwrap()
            else {
                panic!("expected acquire");
            };
            match rows {
                Some(n) => s
                    .close_table(log_id, LogStatus::Completed, Some(n), None)
                    .await
                    .unwrap(),
                None => s
                    .close_table(log_id, LogStatus::Failed, None, Some("y"))
                    .await
                    .unwrap(),
            }
        }
        s.close_run(run_id, RunStatus::Completed, None).await.unwrap();

        let summary = s.run_summary(run_id).await.unwrap();
        assert_eq!(summary.table_count, 3);
        assert_eq!(summary.tables_completed, 2);
        assert_eq!(summary.tables_failed, 1);
        assert_eq!(summary.total_rows, 42);
    }

    #[tokio::test]
    async fn test_stale_and_force_fail() {
        let s = store();
        let run_id = s.open_run(RunType::RawLoad, "2024", json!({})).await.unwrap();
        let TableClaim::Acquired(_) = s
            .claim_table(run_id, "t", TableOperation::Load, "src")
            .await
            .unwrap()
        else {
            panic!("expected acquire");
        };

        // Zero age makes the just-opened run stale
        let stale = s.stale_runs(Duration::seconds(0)).await.unwrap();
        assert_eq!(stale.len(), 1);

        s.force_fail_run(run_id, "operator cleanup").await.unwrap();
        let run = s.get_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);

        // The claim is released for a new run
        let retry = s.open_run(RunType::RawLoad, "2024", json!({})).await.unwrap();
        assert!(matches!(
            s.claim_table(retry, "t", TableOperation::Load, "src")
                .await
                .unwrap(),
            TableClaim::Acquired(_)
        ));
        assert!(s.stale_runs(Duration::seconds(0)).await.unwrap().is_empty());
    }
}
