//! In-memory destination for tests and dry-run inspection

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::batch::{value_key, value_text, Record};
use crate::error::LoadError;

use super::{collapse_duplicate_keys, key_tuple, Destination};

/// A [`Destination`] backed by per-table `Vec<Record>` storage with the
/// same write semantics as the Postgres implementation.
#[derive(Default)]
pub struct MemoryDestination {
    tables: Mutex<HashMap<String, Vec<Record>>>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one table's rows, for assertions.
    pub async fn rows(&self, table: &str) -> Vec<Record> {
        self.tables
            .lock()
            .await
            .get(table)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Destination for MemoryDestination {
    async fn insert_rows(&self, table: &str, rows: &[Record]) -> Result<u64, LoadError> {
        if rows.iter().any(Record::is_empty) {
            return Err(LoadError::EmptyRow(table.to_string()));
        }
        let mut tables = self.tables.lock().await;
        tables
            .entry(table.to_string())
            .or_default()
            .extend(rows.iter().cloned());
        Ok(rows.len() as u64)
    }

    async fn upsert_rows(
        &self,
        table: &str,
        rows: &[Record],
        key_columns: &[String],
    ) -> Result<u64, LoadError> {
        if rows.iter().any(Record::is_empty) {
            return Err(LoadError::EmptyRow(table.to_string()));
        }
        // Same collapse the Postgres backend applies before binding
        let rows = collapse_duplicate_keys(rows, key_columns);
        let mut tables = self.tables.lock().await;
        let stored = tables.entry(table.to_string()).or_default();
        for row in &rows {
            let key = key_tuple(row, key_columns);
            match stored
                .iter_mut()
                .find(|existing| key_tuple(existing, key_columns) == key)
            {
                Some(existing) => *existing = row.clone(),
                None => stored.push(row.clone()),
            }
        }
        Ok(rows.len() as u64)
    }

    async fn delete_partition(
        &self,
        table: &str,
        column: &str,
        partition_key: &str,
    ) -> Result<u64, LoadError> {
        let mut tables = self.tables.lock().await;
        let Some(stored) = tables.get_mut(table) else {
            return Ok(0);
        };
        let before = stored.len();
        stored.retain(|row| {
            row.get(column)
                .map(value_key)
                .map_or(true, |v| v != partition_key)
        });
        Ok((before - stored.len()) as u64)
    }

    async fn count_rows(
        &self,
        table: &str,
        partition: Option<(&str, &str)>,
    ) -> Result<i64, LoadError> {
        let tables = self.tables.lock().await;
        let Some(stored) = tables.get(table) else {
            return Ok(0);
        };
        let count = match partition {
            None => stored.len(),
            Some((column, key)) => stored
                .iter()
                .filter(|row| row.get(column).map(value_key).as_deref() == Some(key))
                .count(),
        };
        Ok(count as i64)
    }

    async fn fetch_keys(&self, table: &str, key_column: &str) -> Result<Vec<String>, LoadError> {
        let tables = self.tables.lock().await;
        let Some(stored) = tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(stored
            .iter()
            .filter_map(|row| row.get(key_column).and_then(value_text))
            .collect())
    }

    async fn fetch_numeric(&self, table: &str, column: &str) -> Result<Vec<f64>, LoadError> {
        let tables = self.tables.lock().await;
        let Some(stored) = tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(stored
            .iter()
            .filter_map(|row| row.get(column).and_then(serde_json::Value::as_f64))
            .collect())
    }
}
