//! Run statistics
//!
//! Accumulators are immutable in style: every fold consumes `self` and
//! returns the updated value, so partial state can never leak through a
//! shared reference.

use serde::Serialize;

use crate::batch::Batch;

/// Counters for one table attempt
#[derive(Debug, Clone, Default, Serialize)]
pub struct TableStats {
    pub table_name: String,
    pub batches: u64,
    /// Well-formed records produced by the extractor, before drops
    pub rows_extracted: u64,
    /// Malformed source records skipped at extraction
    pub rows_skipped: u64,
    /// Records dropped by transform rules
    pub rows_dropped: u64,
    /// Individual values nulled by transform rules
    pub values_nulled: u64,
    pub rows_loaded: u64,
}

impl TableStats {
    pub fn for_table(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            ..Self::default()
        }
    }

    /// Fold one transformed batch and its load result into the stats.
    /// Dropped records were extracted first, so they count both ways.
    pub fn absorb(mut self, batch: &Batch, rows_loaded: u64) -> Self {
        self.batches += 1;
        self.rows_extracted += batch.records.len() as u64 + batch.dropped;
        self.rows_skipped += batch.skipped;
        self.rows_dropped += batch.dropped;
        self.values_nulled += batch.nulled;
        self.rows_loaded += rows_loaded;
        self
    }
}

/// Counters for one whole run
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStats {
    pub tables_attempted: u64,
    pub tables_completed: u64,
    pub tables_failed: u64,
    pub tables_skipped: u64,
    pub total_rows_loaded: u64,
    pub tables: Vec<TableStats>,
}

impl RunStats {
    pub fn completed(mut self, table: TableStats) -> Self {
        self.tables_attempted += 1;
        self.tables_completed += 1;
        self.total_rows_loaded += table.rows_loaded;
        self.tables.push(table);
        self
    }

    pub fn failed(mut self, table: TableStats) -> Self {
        self.tables_attempted += 1;
        self.tables_failed += 1;
        self.tables.push(table);
        self
    }

    pub fn skipped(mut self) -> Self {
        self.tables_skipped += 1;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Record;
    use serde_json::json;

    #[test]
    fn test_absorb_counts_drops_as_extracted() {
        let mut rec = Record::new();
        rec.insert("id".into(), json!(1));
        let batch = Batch {
            records: vec![rec],
            skipped: 2,
            dropped: 3,
            nulled: 4,
        };

        let stats = TableStats::for_table("t").absorb(&batch, 1);
        assert_eq!(stats.batches, 1);
        assert_eq!(stats.rows_extracted, 4);
        assert_eq!(stats.rows_skipped, 2);
        assert_eq!(stats.rows_dropped, 3);
        assert_eq!(stats.values_nulled, 4);
        assert_eq!(stats.rows_loaded, 1);
    }

    #[test]
    fn test_run_stats_folds() {
        let mut loaded = TableStats::for_table("a");
        loaded.rows_loaded = 10;

        let stats = RunStats::default()
            .completed(loaded)
            .failed(TableStats::for_table("b"))
            .skipped();
        assert_eq!(stats.tables_attempted, 2);
        assert_eq!(stats.tables_completed, 1);
        assert_eq!(stats.tables_failed, 1);
        assert_eq!(stats.tables_skipped, 1);
        assert_eq!(stats.total_rows_loaded, 10);
        assert_eq!(stats.tables.len(), 2);
    }
}
