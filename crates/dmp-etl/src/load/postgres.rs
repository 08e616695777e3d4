//! Postgres destination
//!
//! Rows travel to the server as a jsonb array and land through
//! `jsonb_populate_recordset`, so the writer needs no compile-time
//! knowledge of target column types. Each batch is one transaction.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use tracing::instrument;

use crate::batch::Record;
use crate::error::LoadError;

use super::Destination;

pub struct PgDestination {
    pool: PgPool,
}

impl PgDestination {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Double-quote an identifier for safe interpolation into DDL/DML.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn rows_as_jsonb(rows: &[Record]) -> Value {
    Value::Array(rows.iter().cloned().map(Value::Object).collect())
}

#[async_trait]
impl Destination for PgDestination {
    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn insert_rows(&self, table: &str, rows: &[Record]) -> Result<u64, LoadError> {
        if rows.iter().any(Record::is_empty) {
            return Err(LoadError::EmptyRow(table.to_string()));
        }
        let table_ident = quote_ident(table);
        let sql = format!(
            "INSERT INTO {table_ident} \
             SELECT * FROM jsonb_populate_recordset(NULL::{table_ident}, $1)"
        );

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(&sql)
            .bind(rows_as_jsonb(rows))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn upsert_rows(
        &self,
        table: &str,
        rows: &[Record],
        key_columns: &[String],
    ) -> Result<u64, LoadError> {
        if rows.iter().any(Record::is_empty) {
            return Err(LoadError::EmptyRow(table.to_string()));
        }
        // One row per key tuple: a statement updating the same conflict
        // target twice is a cardinality violation in Postgres
        let rows = super::collapse_duplicate_keys(rows, key_columns);
        let Some(first) = rows.first() else {
            return Ok(0);
        };

        let table_ident = quote_ident(table);
        let conflict_cols = key_columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");

        // Non-key columns come from the first row; batches from one
        // extractor share a column set.
        let updates = first
            .keys()
            .filter(|c| !key_columns.iter().any(|k| k == *c))
            .map(|c| {
                let ident = quote_ident(c);
                format!("{ident} = EXCLUDED.{ident}")
            })
            .collect::<Vec<_>>()
            .join(", ");

        let conflict_action = if updates.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {updates}")
        };

        let sql = format!(
            "INSERT INTO {table_ident} \
             SELECT * FROM jsonb_populate_recordset(NULL::{table_ident}, $1) \
             ON CONFLICT ({conflict_cols}) {conflict_action}"
        );

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(&sql)
            .bind(rows_as_jsonb(&rows))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn delete_partition(
        &self,
        table: &str,
        column: &str,
        partition_key: &str,
    ) -> Result<u64, LoadError> {
        // Compare as text so the partition column's type does not matter
        let sql = format!(
            "DELETE FROM {} WHERE {}::text = $1",
            quote_ident(table),
            quote_ident(column)
        );
        let result = sqlx::query(&sql)
            .bind(partition_key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn count_rows(
        &self,
        table: &str,
        partition: Option<(&str, &str)>,
    ) -> Result<i64, LoadError> {
        let count = match partition {
            None => {
                let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
                sqlx::query_scalar::<_, i64>(&sql).fetch_one(&self.pool).await?
            }
            Some((column, key)) => {
                let sql = format!(
                    "SELECT COUNT(*) FROM {} WHERE {}::text = $1",
                    quote_ident(table),
                    quote_ident(column)
                );
                sqlx::query_scalar::<_, i64>(&sql)
                    .bind(key)
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count)
    }

    async fn fetch_keys(&self, table: &str, key_column: &str) -> Result<Vec<String>, LoadError> {
        let col = quote_ident(key_column);
        let sql = format!(
            "SELECT {col}::text FROM {} WHERE {col} IS NOT NULL",
            quote_ident(table)
        );
        let keys = sqlx::query_scalar::<_, String>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(keys)
    }

    async fn fetch_numeric(&self, table: &str, column: &str) -> Result<Vec<f64>, LoadError> {
        let col = quote_ident(column);
        let sql = format!(
            "SELECT {col}::float8 FROM {} WHERE {col} IS NOT NULL",
            quote_ident(table)
        );
        let values = sqlx::query_scalar::<_, f64>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(values)
    }
}
