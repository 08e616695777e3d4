//! Loading batches into the target store

pub mod destination;
pub mod memory;
pub mod postgres;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::batch::{value_key, Batch, Record};
use crate::error::LoadError;

pub use destination::Destination;
pub use memory::MemoryDestination;
pub use postgres::PgDestination;

/// How batches land in the target table.
#[derive(Debug, Clone)]
pub enum WriteStrategy {
    /// Plain inserts. Not idempotent: re-running a completed load
    /// duplicates rows, so callers must rely on checkpoint skipping.
    Append,
    /// Insert-or-replace by key tuple; safe to re-run.
    Upsert { key_columns: Vec<String> },
    /// Delete the target partition once, then append; safe to re-run
    /// as a whole.
    TruncatePartition { partition_column: String },
}

impl WriteStrategy {
    pub fn upsert(key_columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::Upsert {
            key_columns: key_columns.into_iter().map(Into::into).collect(),
        }
    }

    pub fn truncate_partition(partition_column: impl Into<String>) -> Self {
        Self::TruncatePartition {
            partition_column: partition_column.into(),
        }
    }

    /// Whether re-running a load with this strategy leaves the target
    /// unchanged.
    pub fn is_idempotent(&self) -> bool {
        !matches!(self, Self::Append)
    }
}

/// Key tuple of one row, in key-column order. Null and absent both
/// render empty so keys always compare.
pub(crate) fn key_tuple(row: &Record, key_columns: &[String]) -> Vec<String> {
    key_columns
        .iter()
        .map(|c| row.get(c).map(value_key).unwrap_or_default())
        .collect()
}

/// Collapse rows sharing a key tuple down to the last occurrence,
/// keeping first-appearance order. Upserts need at most one row per
/// key: Postgres rejects an `ON CONFLICT DO UPDATE` statement that
/// touches the same row twice, and legacy batches do carry duplicate
/// natural keys.
pub(crate) fn collapse_duplicate_keys(rows: &[Record], key_columns: &[String]) -> Vec<Record> {
    let mut positions: HashMap<Vec<String>, usize> = HashMap::with_capacity(rows.len());
    let mut collapsed: Vec<Record> = Vec::with_capacity(rows.len());
    for row in rows {
        match positions.get(&key_tuple(row, key_columns)) {
            Some(&i) => collapsed[i] = row.clone(),
            None => {
                positions.insert(key_tuple(row, key_columns), collapsed.len());
                collapsed.push(row.clone());
            }
        }
    }
    collapsed
}

/// Writes successive batches to one table under one strategy.
///
/// Holds the per-table write state (whether the partition was already
/// cleared), so one `Loader` serves exactly one table attempt.
pub struct Loader {
    dest: Arc<dyn Destination>,
    table: String,
    strategy: WriteStrategy,
    partition_key: String,
    truncated: bool,
}

impl Loader {
    pub fn new(
        dest: Arc<dyn Destination>,
        table: impl Into<String>,
        strategy: WriteStrategy,
        partition_key: impl Into<String>,
    ) -> Self {
        Self {
            dest,
            table: table.into(),
            strategy,
            partition_key: partition_key.into(),
            truncated: false,
        }
    }

    /// Write one batch; returns rows written. Empty batches write
    /// nothing but still clear the partition under truncate-reload, so
    /// a source that shrank to zero rows still empties its partition.
    pub async fn write(&mut self, batch: &Batch) -> Result<u64, LoadError> {
        if let WriteStrategy::TruncatePartition { partition_column } = &self.strategy {
            if !self.truncated {
                let deleted = self
                    .dest
                    .delete_partition(&self.table, partition_column, &self.partition_key)
                    .await?;
                debug!(table = %self.table, partition = %self.partition_key, deleted, "cleared partition");
                self.truncated = true;
            }
        }

        if batch.is_empty() {
            return Ok(0);
        }

        let written = match &self.strategy {
            WriteStrategy::Append | WriteStrategy::TruncatePartition { .. } => {
                self.dest.insert_rows(&self.table, &batch.records).await?
            }
            WriteStrategy::Upsert { key_columns } => {
                self.dest
                    .upsert_rows(&self.table, &batch.records, key_columns)
                    .await?
            }
        };
        debug!(table = %self.table, rows = written, "wrote batch");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Record;
    use serde_json::json;

    fn row(id: i64, name: &str, part: &str) -> Record {
        let mut r = Record::new();
        r.insert("id".into(), json!(id));
        r.insert("name".into(), json!(name));
        r.insert("part".into(), json!(part));
        r
    }

    #[tokio::test]
    async fn test_append_writes_all_batches() {
        let dest = Arc::new(MemoryDestination::new());
        let mut loader = Loader::new(dest.clone(), "t", WriteStrategy::Append, "2024");

        let n = loader
            .write(&Batch::from_records(vec![row(1, "a", "2024")]))
            .await
            .unwrap();
        assert_eq!(n, 1);
        loader
            .write(&Batch::from_records(vec![row(2, "b", "2024")]))
            .await
            .unwrap();
        assert_eq!(dest.count_rows("t", None).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_truncate_partition_clears_once() {
        let dest = Arc::new(MemoryDestination::new());
        dest.insert_rows("t", &[row(1, "old", "2024"), row(2, "keep", "2023")])
            .await
            .unwrap();

        let mut loader = Loader::new(
            dest.clone(),
            "t",
            WriteStrategy::truncate_partition("part"),
            "2024",
        );
        loader
            .write(&Batch::from_records(vec![row(3, "new", "2024")]))
            .await
            .unwrap();
        loader
            .write(&Batch::from_records(vec![row(4, "new2", "2024")]))
            .await
            .unwrap();

        // Old 2024 row gone, 2023 row untouched, both new rows present
        assert_eq!(dest.count_rows("t", None).await.unwrap(), 3);
        assert_eq!(
            dest.count_rows("t", Some(("part", "2023"))).await.unwrap(),
            1
        );
        assert_eq!(
            dest.count_rows("t", Some(("part", "2024"))).await.unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_empty_batch_still_truncates() {
        let dest = Arc::new(MemoryDestination::new());
        dest.insert_rows("t", &[row(1, "old", "2024")]).await.unwrap();

        let mut loader = Loader::new(
            dest.clone(),
            "t",
            WriteStrategy::truncate_partition("part"),
            "2024",
        );
        let n = loader.write(&Batch::default()).await.unwrap();
        assert_eq!(n, 0);
        assert_eq!(dest.count_rows("t", None).await.unwrap(), 0);
    }

    #[test]
    fn test_collapse_duplicate_keys_last_wins() {
        let keys = vec!["id".to_string()];
        let rows = vec![
            row(1, "first", "2024"),
            row(2, "other", "2024"),
            row(1, "second", "2024"),
        ];

        let collapsed = collapse_duplicate_keys(&rows, &keys);
        assert_eq!(collapsed.len(), 2);
        // First-appearance order, last value per key
        assert_eq!(collapsed[0]["id"], json!(1));
        assert_eq!(collapsed[0]["name"], json!("second"));
        assert_eq!(collapsed[1]["id"], json!(2));
    }

    #[test]
    fn test_collapse_keeps_distinct_keys_untouched() {
        let keys = vec!["id".to_string()];
        let rows = vec![row(1, "a", "2024"), row(2, "b", "2024"), row(3, "c", "2024")];
        assert_eq!(collapse_duplicate_keys(&rows, &keys), rows);
    }

    #[test]
    fn test_idempotence_flags() {
        assert!(!WriteStrategy::Append.is_idempotent());
        assert!(WriteStrategy::upsert(["id"]).is_idempotent());
        assert!(WriteStrategy::truncate_partition("part").is_idempotent());
    }
}
