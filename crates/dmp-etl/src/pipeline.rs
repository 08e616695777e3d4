//! Pipeline orchestration
//!
//! Ties the stages together for one run: open a run record, claim each
//! table, stream extract/transform/load, close the table log, and close
//! the run. Resumption falls out of the tracker: tables completed by an
//! earlier run are skipped before any source byte is read.

use std::sync::Arc;

use serde_json::json;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::error::EtlError;
use crate::extract::{self, SourceSpec};
use crate::load::{Destination, Loader, WriteStrategy};
use crate::stats::{RunStats, TableStats};
use crate::track::{LogStatus, RunStatus, RunTracker, RunType, TableClaim, TableOperation};
use crate::transform::TransformChain;
use crate::validate::{ValidationReport, Validator};

pub const DEFAULT_BATCH_SIZE: usize = 5000;

/// What happens to the rest of the run when one table fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Close the run failed at the first table failure
    AbortOnFailure,
    /// Record the failure and keep going; the run still completes
    #[default]
    BestEffort,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub batch_size: usize,
    /// Skip loading and run tracking; extraction, transforms, and any
    /// requested validation still run
    pub dry_run: bool,
    /// Reconcile each keyed table against its source after loading
    pub validate: bool,
    pub failure_policy: FailurePolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            dry_run: false,
            validate: false,
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            batch_size: std::env::var("ETL_BATCH_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.batch_size),
            dry_run: std::env::var("ETL_DRY_RUN")
                .map(|s| s == "1" || s.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.dry_run),
            validate: std::env::var("ETL_VALIDATE")
                .map(|s| s == "1" || s.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.validate),
            failure_policy: match std::env::var("ETL_FAILURE_POLICY").as_deref() {
                Ok("abort") => FailurePolicy::AbortOnFailure,
                _ => defaults.failure_policy,
            },
        }
    }
}

/// One table's worth of work within a run
pub struct TableJob {
    pub table_name: String,
    pub source: SourceSpec,
    pub operation: TableOperation,
    pub strategy: WriteStrategy,
    /// Enables key diffing during validation
    pub key_column: Option<String>,
    pub chain: TransformChain,
}

impl TableJob {
    pub fn new(table_name: impl Into<String>, source: SourceSpec) -> Self {
        Self {
            table_name: table_name.into(),
            source,
            operation: TableOperation::Load,
            strategy: WriteStrategy::Append,
            key_column: None,
            chain: TransformChain::new(),
        }
    }

    pub fn with_operation(mut self, operation: TableOperation) -> Self {
        self.operation = operation;
        self
    }

    pub fn with_strategy(mut self, strategy: WriteStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_key_column(mut self, column: impl Into<String>) -> Self {
        self.key_column = Some(column.into());
        self
    }

    pub fn with_chain(mut self, chain: TransformChain) -> Self {
        self.chain = chain;
        self
    }
}

/// Result of one pipeline run
#[derive(Debug)]
pub struct PipelineOutcome {
    /// `None` for dry runs, which record nothing
    pub run_id: Option<Uuid>,
    pub status: RunStatus,
    pub stats: RunStats,
    pub validations: Vec<ValidationReport>,
}

pub struct Pipeline {
    tracker: RunTracker,
    dest: Arc<dyn Destination>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(tracker: RunTracker, dest: Arc<dyn Destination>, config: PipelineConfig) -> Self {
        Self {
            tracker,
            dest,
            config,
        }
    }

    /// Execute one run over the given table jobs.
    ///
    /// Under `dry_run` the tracker is never touched, so an aborted dry
    /// run cannot poison later resumption.
    #[instrument(skip(self, jobs), fields(partition = partition_key, tables = jobs.len()))]
    pub async fn run(
        &self,
        run_type: RunType,
        partition_key: &str,
        jobs: Vec<TableJob>,
    ) -> Result<PipelineOutcome, EtlError> {
        if self.config.dry_run {
            info!("dry run: tracker and destination writes disabled");
            return self.dry_run(jobs, partition_key).await;
        }

        let metadata = json!({
            "tables": jobs.iter().map(|j| j.table_name.as_str()).collect::<Vec<_>>(),
            "batch_size": self.config.batch_size,
        });
        let run_id = self
            .tracker
            .open_run(run_type, partition_key, metadata)
            .await?;

        let mut stats = RunStats::default();
        let mut aborted: Option<String> = None;

        for job in &jobs {
            // Cheap pre-check; the claim below is the authoritative gate
            let done = self.tracker.loaded_partitions(&job.table_name).await?;
            if done.contains(partition_key) {
                info!(table = %job.table_name, partition = partition_key, "already loaded, skipping");
                stats = stats.skipped();
                continue;
            }

            let claim = self
                .tracker
                .claim_table(run_id, &job.table_name, job.operation, &job.source.descriptor())
                .await?;
            let log_id = match claim {
                TableClaim::Acquired(log_id) => log_id,
                TableClaim::AlreadyCompleted | TableClaim::InProgress => {
                    stats = stats.skipped();
                    continue;
                }
            };

            match self.run_table(job, partition_key).await {
                Ok(table_stats) => {
                    self.tracker
                        .close_table(
                            log_id,
                            LogStatus::Completed,
                            Some(table_stats.rows_loaded as i64),
                            None,
                        )
                        .await?;
                    stats = stats.completed(table_stats);
                }
                Err(e) => {
                    error!(table = %job.table_name, error = %e, "table attempt failed");
                    self.tracker
                        .close_table(log_id, LogStatus::Failed, None, Some(&e.to_string()))
                        .await?;
                    stats = stats.failed(TableStats::for_table(&job.table_name));
                    if self.config.failure_policy == FailurePolicy::AbortOnFailure {
                        aborted = Some(e.to_string());
                        break;
                    }
                }
            }
        }

        let validations = if self.config.validate && aborted.is_none() {
            self.validate_tables(&jobs, partition_key).await?
        } else {
            Vec::new()
        };

        let status = match aborted {
            Some(reason) => {
                self.tracker
                    .close_run(run_id, RunStatus::Failed, Some(&reason))
                    .await?;
                RunStatus::Failed
            }
            None => {
                // Best-effort runs complete even with failed tables; the
                // summary carries the counts
                self.tracker.close_run(run_id, RunStatus::Completed, None).await?;
                RunStatus::Completed
            }
        };

        info!(
            %run_id,
            attempted = stats.tables_attempted,
            completed = stats.tables_completed,
            failed = stats.tables_failed,
            skipped = stats.tables_skipped,
            rows = stats.total_rows_loaded,
            "run finished"
        );

        Ok(PipelineOutcome {
            run_id: Some(run_id),
            status,
            stats,
            validations,
        })
    }

    /// Stream one table: extract, transform, load, fold stats.
    async fn run_table(&self, job: &TableJob, partition_key: &str) -> Result<TableStats, EtlError> {
        let mut extractor = extract::open(&job.source, self.config.batch_size)?;
        let mut loader = Loader::new(
            self.dest.clone(),
            &job.table_name,
            job.strategy.clone(),
            partition_key,
        );

        let mut stats = TableStats::for_table(&job.table_name);
        while let Some(batch) = extractor.next_batch()? {
            let batch = job.chain.apply(batch)?;
            let loaded = loader.write(&batch).await?;
            stats = stats.absorb(&batch, loaded);
        }

        info!(
            table = %job.table_name,
            extracted = stats.rows_extracted,
            skipped = stats.rows_skipped,
            dropped = stats.rows_dropped,
            loaded = stats.rows_loaded,
            "table loaded"
        );
        Ok(stats)
    }

    /// Extract and transform without writing anywhere. Validation still
    /// runs when requested, reporting against the target as it stands.
    async fn dry_run(
        &self,
        jobs: Vec<TableJob>,
        partition_key: &str,
    ) -> Result<PipelineOutcome, EtlError> {
        let mut stats = RunStats::default();
        for job in &jobs {
            let attempt = async {
                let mut extractor = extract::open(&job.source, self.config.batch_size)?;
                let mut table_stats = TableStats::for_table(&job.table_name);
                while let Some(batch) = extractor.next_batch()? {
                    let batch = job.chain.apply(batch)?;
                    table_stats = table_stats.absorb(&batch, 0);
                }
                Ok::<TableStats, EtlError>(table_stats)
            };
            match attempt.await {
                Ok(table_stats) => {
                    info!(
                        table = %job.table_name,
                        extracted = table_stats.rows_extracted,
                        skipped = table_stats.rows_skipped,
                        "dry run table finished"
                    );
                    stats = stats.completed(table_stats);
                }
                Err(e) => {
                    warn!(table = %job.table_name, error = %e, "dry run table failed");
                    stats = stats.failed(TableStats::for_table(&job.table_name));
                }
            }
        }
        let validations = if self.config.validate {
            self.validate_tables(&jobs, partition_key).await?
        } else {
            Vec::new()
        };
        Ok(PipelineOutcome {
            run_id: None,
            status: RunStatus::Completed,
            stats,
            validations,
        })
    }

    async fn validate_tables(
        &self,
        jobs: &[TableJob],
        partition_key: &str,
    ) -> Result<Vec<ValidationReport>, EtlError> {
        let validator = Validator::new(self.dest.clone(), self.config.batch_size);
        let mut reports = Vec::new();
        for job in jobs {
            let Some(key_column) = job.key_column.as_deref() else {
                continue;
            };
            // Count within the partition only when the strategy scopes
            // writes to it; append and upsert land in the whole table
            let partition = match &job.strategy {
                WriteStrategy::TruncatePartition { partition_column } => {
                    Some((partition_column.as_str(), partition_key))
                }
                _ => None,
            };
            let report = validator
                .reconcile(&job.source, &job.table_name, Some(key_column), partition)
                .await?;
            reports.push(report);
        }
        Ok(reports)
    }
}
