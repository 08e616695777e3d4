//! Source/target reconciliation
//!
//! Checks compare what the source holds against what the target landed:
//! raw record counts, an order-independent record-set checksum, key set
//! diffs, referential integrity, and numeric bounds. A mismatch is a
//! FAIL verdict in the report, never an error; errors are reserved for
//! sources or targets that cannot be read at all.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use dmp_common::checksum::RecordSetChecksum;

use crate::batch::value_text;
use crate::error::ValidateError;
use crate::extract::{self, SourceSpec};
use crate::load::Destination;

/// Sample size kept for key diffs and violation lists
pub const KEY_SAMPLE_LIMIT: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ValidationStatus {
    Pass,
    Fail,
}

/// Outcome of reconciling one table against its source
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub table_name: String,
    /// Raw source records, malformed ones included
    pub source_count: u64,
    pub target_count: i64,
    pub count_match: bool,
    /// Order-independent checksum over well-formed source records
    pub source_checksum: String,
    /// Source keys absent from the target (first [`KEY_SAMPLE_LIMIT`])
    pub missing_keys: Vec<String>,
    /// Target keys absent from the source (first [`KEY_SAMPLE_LIMIT`])
    pub extra_keys: Vec<String>,
    pub status: ValidationStatus,
}

/// Outcome of a referential-integrity check
#[derive(Debug, Clone, Serialize)]
pub struct ReferenceReport {
    pub table_name: String,
    pub fk_column: String,
    pub ref_table: String,
    pub orphan_count: u64,
    pub orphan_sample: Vec<String>,
    pub status: ValidationStatus,
}

/// Outcome of a numeric bounds check
#[derive(Debug, Clone, Serialize)]
pub struct BoundsReport {
    pub table_name: String,
    pub column: String,
    pub violation_count: u64,
    pub sample: Vec<f64>,
    pub status: ValidationStatus,
}

pub struct Validator {
    dest: Arc<dyn Destination>,
    batch_size: usize,
}

impl Validator {
    pub fn new(dest: Arc<dyn Destination>, batch_size: usize) -> Self {
        Self { dest, batch_size }
    }

    /// Reconcile one target table against its source file.
    ///
    /// The source is streamed exactly once. The raw count includes
    /// malformed records, so a load that silently skipped rows shows a
    /// count mismatch here. Key diffing runs when `key_column` is set.
    pub async fn reconcile(
        &self,
        source: &SourceSpec,
        table_name: &str,
        key_column: Option<&str>,
        partition: Option<(&str, &str)>,
    ) -> Result<ValidationReport, ValidateError> {
        let mut extractor = extract::open(source, self.batch_size)?;

        let mut source_count = 0u64;
        let mut checksum = RecordSetChecksum::new();
        let mut source_keys = BTreeSet::new();
        while let Some(batch) = extractor.next_batch()? {
            source_count += batch.records.len() as u64 + batch.skipped;
            for record in &batch.records {
                checksum.add(record);
                if let Some(key) = key_column {
                    if let Some(value) = record.get(key).and_then(value_text) {
                        source_keys.insert(value);
                    }
                }
            }
        }

        let target_count = self.dest.count_rows(table_name, partition).await?;
        let count_match = i64::try_from(source_count).map_or(false, |n| n == target_count);

        let (missing_keys, extra_keys) = match key_column {
            None => (Vec::new(), Vec::new()),
            Some(key) => {
                let target_keys: BTreeSet<String> = self
                    .dest
                    .fetch_keys(table_name, key)
                    .await?
                    .into_iter()
                    .collect();
                let missing = source_keys
                    .difference(&target_keys)
                    .take(KEY_SAMPLE_LIMIT)
                    .cloned()
                    .collect();
                let extra = target_keys
                    .difference(&source_keys)
                    .take(KEY_SAMPLE_LIMIT)
                    .cloned()
                    .collect::<Vec<_>>();
                (missing, extra)
            }
        };

        let pass = count_match && missing_keys.is_empty() && extra_keys.is_empty();
        let report = ValidationReport {
            table_name: table_name.to_string(),
            source_count,
            target_count,
            count_match,
            source_checksum: checksum.finish(),
            missing_keys,
            extra_keys,
            status: if pass {
                ValidationStatus::Pass
            } else {
                ValidationStatus::Fail
            },
        };

        match report.status {
            ValidationStatus::Pass => {
                info!(table = table_name, rows = report.source_count, "reconciliation passed")
            }
            ValidationStatus::Fail => warn!(
                table = table_name,
                source = report.source_count,
                target = report.target_count,
                missing = report.missing_keys.len(),
                extra = report.extra_keys.len(),
                "reconciliation failed"
            ),
        }
        Ok(report)
    }

    /// Every value of `fk_column` must appear in `ref_table.ref_column`.
    pub async fn check_references(
        &self,
        table_name: &str,
        fk_column: &str,
        ref_table: &str,
        ref_column: &str,
    ) -> Result<ReferenceReport, ValidateError> {
        let referenced: BTreeSet<String> = self
            .dest
            .fetch_keys(ref_table, ref_column)
            .await?
            .into_iter()
            .collect();

        let mut orphan_count = 0u64;
        let mut orphan_sample = Vec::new();
        for value in self.dest.fetch_keys(table_name, fk_column).await? {
            if !referenced.contains(&value) {
                orphan_count += 1;
                if orphan_sample.len() < KEY_SAMPLE_LIMIT {
                    orphan_sample.push(value);
                }
            }
        }

        let status = if orphan_count == 0 {
            ValidationStatus::Pass
        } else {
            warn!(
                table = table_name,
                column = fk_column,
                orphans = orphan_count,
                "referential integrity check failed"
            );
            ValidationStatus::Fail
        };
        Ok(ReferenceReport {
            table_name: table_name.to_string(),
            fk_column: fk_column.to_string(),
            ref_table: ref_table.to_string(),
            orphan_count,
            orphan_sample,
            status,
        })
    }

    /// Every non-null value of `column` must lie within `[min, max]`.
    pub async fn check_bounds(
        &self,
        table_name: &str,
        column: &str,
        min: f64,
        max: f64,
    ) -> Result<BoundsReport, ValidateError> {
        let mut violation_count = 0u64;
        let mut sample = Vec::new();
        for value in self.dest.fetch_numeric(table_name, column).await? {
            if value < min || value > max {
                violation_count += 1;
                if sample.len() < KEY_SAMPLE_LIMIT {
                    sample.push(value);
                }
            }
        }

        let status = if violation_count == 0 {
            ValidationStatus::Pass
        } else {
            warn!(
                table = table_name,
                column,
                violations = violation_count,
                "bounds check failed"
            );
            ValidationStatus::Fail
        };
        Ok(BoundsReport {
            table_name: table_name.to_string(),
            column: column.to_string(),
            violation_count,
            sample,
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Record;
    use crate::load::MemoryDestination;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn row(pairs: &[(&str, serde_json::Value)]) -> Record {
        let mut r = Record::new();
        for (k, v) in pairs {
            r.insert((*k).to_string(), v.clone());
        }
        r
    }

    fn csv_file(contents: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[tokio::test]
    async fn test_reconcile_counts_malformed_source_rows() {
        // 3 raw records, one malformed; target landed 2
        let f = csv_file("id,name\n1,a\n2,b,EXTRA\n3,c\n");
        let dest = Arc::new(MemoryDestination::new());
        dest.insert_rows(
            "t",
            &[
                row(&[("id", json!("1")), ("name", json!("a"))]),
                row(&[("id", json!("3")), ("name", json!("c"))]),
            ],
        )
        .await
        .unwrap();

        let validator = Validator::new(dest, 100);
        let report = validator
            .reconcile(&SourceSpec::csv(f.path()), "t", Some("id"), None)
            .await
            .unwrap();

        assert_eq!(report.source_count, 3);
        assert_eq!(report.target_count, 2);
        assert!(!report.count_match);
        assert_eq!(report.status, ValidationStatus::Fail);
        // The malformed record never parsed, so no key diff from it
        assert!(report.missing_keys.is_empty());
        assert!(report.extra_keys.is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_passes_on_exact_match() {
        let f = csv_file("id,name\n1,a\n2,b\n");
        let dest = Arc::new(MemoryDestination::new());
        dest.insert_rows(
            "t",
            &[
                row(&[("id", json!("1")), ("name", json!("a"))]),
                row(&[("id", json!("2")), ("name", json!("b"))]),
            ],
        )
        .await
        .unwrap();

        let validator = Validator::new(dest, 100);
        let report = validator
            .reconcile(&SourceSpec::csv(f.path()), "t", Some("id"), None)
            .await
            .unwrap();
        assert_eq!(report.status, ValidationStatus::Pass);
        assert!(!report.source_checksum.is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_reports_key_diffs() {
        let f = csv_file("id\n1\n2\n");
        let dest = Arc::new(MemoryDestination::new());
        dest.insert_rows("t", &[row(&[("id", json!("1"))]), row(&[("id", json!("9"))])])
            .await
            .unwrap();

        let validator = Validator::new(dest, 100);
        let report = validator
            .reconcile(&SourceSpec::csv(f.path()), "t", Some("id"), None)
            .await
            .unwrap();
        assert_eq!(report.missing_keys, vec!["2".to_string()]);
        assert_eq!(report.extra_keys, vec!["9".to_string()]);
        assert_eq!(report.status, ValidationStatus::Fail);
    }

    #[tokio::test]
    async fn test_check_references_finds_orphans() {
        let dest = Arc::new(MemoryDestination::new());
        dest.insert_rows("parents", &[row(&[("id", json!("p1"))])])
            .await
            .unwrap();
        dest.insert_rows(
            "children",
            &[
                row(&[("parent_id", json!("p1"))]),
                row(&[("parent_id", json!("ghost"))]),
            ],
        )
        .await
        .unwrap();

        let validator = Validator::new(dest, 100);
        let report = validator
            .check_references("children", "parent_id", "parents", "id")
            .await
            .unwrap();
        assert_eq!(report.orphan_count, 1);
        assert_eq!(report.orphan_sample, vec!["ghost".to_string()]);
        assert_eq!(report.status, ValidationStatus::Fail);
    }

    #[tokio::test]
    async fn test_check_bounds() {
        let dest = Arc::new(MemoryDestination::new());
        dest.insert_rows(
            "t",
            &[
                row(&[("pct", json!(55.0))]),
                row(&[("pct", json!(101.5))]),
                row(&[("pct", json!(-3.0))]),
            ],
        )
        .await
        .unwrap();

        let validator = Validator::new(dest, 100);
        let report = validator.check_bounds("t", "pct", 0.0, 100.0).await.unwrap();
        assert_eq!(report.violation_count, 2);
        assert_eq!(report.status, ValidationStatus::Fail);

        let ok = validator.check_bounds("t", "pct", -10.0, 200.0).await.unwrap();
        assert_eq!(ok.status, ValidationStatus::Pass);
    }
}
