//! Error taxonomy for the ETL core
//!
//! Per-record problems (malformed source rows, unparseable values) are not
//! errors: they are absorbed locally as counters on the batch. The types
//! here cover the fatal tiers only: a source that cannot be read, a batch
//! with the wrong shape, a write that violates constraints, or a tracker
//! invariant violation.

use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Fatal extraction failures (a malformed individual record is skipped
/// and counted instead)
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("source unreadable: {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error reading source: {0}")]
    Io(#[from] std::io::Error),

    #[error("error reading delimited source: {0}")]
    Csv(#[from] csv::Error),

    #[error("invalid source layout: {0}")]
    Layout(String),
}

/// Fatal transform failures. Only shape errors abort a table attempt;
/// individual bad values are nulled or dropped by the rules themselves.
#[derive(Error, Debug)]
pub enum TransformError {
    #[error("rule '{rule}' requires columns missing from batch: {missing:?}")]
    Shape { rule: String, missing: Vec<String> },
}

/// Fatal load failures (constraint violation, connection loss)
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("database write failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("cannot write records with no columns to table '{0}'")]
    EmptyRow(String),
}

/// Run tracker failures and invariant violations
#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("run {0} not found")]
    RunNotFound(Uuid),

    #[error("table log {0} not found")]
    LogNotFound(Uuid),

    #[error("run {0} is already closed")]
    RunClosed(Uuid),

    #[error("invalid status transition: {0}")]
    InvalidTransition(String),

    #[error("rows_affected must be set exactly when status is completed")]
    CompletionInvariant,

    #[error("unexpected value in tracker store: {0}")]
    Corrupt(String),
}

/// Validator failures. A source/target mismatch is not an error, it is a
/// FAIL verdict in the report; these cover I/O and query failures only.
#[derive(Error, Debug)]
pub enum ValidateError {
    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error("target query failed: {0}")]
    Load(#[from] LoadError),
}

/// Umbrella error for pipeline execution
#[derive(Error, Debug)]
pub enum EtlError {
    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Validate(#[from] ValidateError),
}
