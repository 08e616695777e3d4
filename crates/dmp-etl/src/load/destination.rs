//! Destination seam
//!
//! The loader and validator talk to the target store through this trait.
//! Production uses [`super::PgDestination`]; tests use the in-memory
//! implementation.

use async_trait::async_trait;

use crate::batch::Record;
use crate::error::LoadError;

#[async_trait]
pub trait Destination: Send + Sync {
    /// Append rows; returns the count written. All-or-nothing per call.
    async fn insert_rows(&self, table: &str, rows: &[Record]) -> Result<u64, LoadError>;

    /// Insert rows, replacing existing rows that share the key tuple.
    /// Rows within the batch sharing a key tuple collapse to the last
    /// occurrence. Returns the count written (inserted plus replaced).
    async fn upsert_rows(
        &self,
        table: &str,
        rows: &[Record],
        key_columns: &[String],
    ) -> Result<u64, LoadError>;

    /// Delete every row whose partition column equals the key; returns
    /// the count deleted.
    async fn delete_partition(
        &self,
        table: &str,
        column: &str,
        partition_key: &str,
    ) -> Result<u64, LoadError>;

    /// Row count, optionally restricted to one `(column, key)` partition.
    async fn count_rows(
        &self,
        table: &str,
        partition: Option<(&str, &str)>,
    ) -> Result<i64, LoadError>;

    /// Non-null values of one column in text form, for key diffing.
    async fn fetch_keys(&self, table: &str, key_column: &str) -> Result<Vec<String>, LoadError>;

    /// Non-null values of one numeric column, for bounds checks.
    async fn fetch_numeric(&self, table: &str, column: &str) -> Result<Vec<f64>, LoadError>;
}
