//! DMP ETL Core
//!
//! Extracts records from heterogeneous legacy sources, transforms them
//! through a composable rule chain, loads them into a relational store,
//! and durably tracks run/checkpoint state so interrupted migrations can
//! be resumed and reconciled against source truth.
//!
//! The pieces compose left to right:
//!
//! - [`extract`]: batch-producing readers for delimited, fixed-width,
//!   fixed-length binary, and dump-style sources
//! - [`transform`]: ordered chains of pure, deterministic rules
//! - [`load`]: write strategies (append / upsert / truncate-reload)
//!   against a [`load::Destination`]
//! - [`track`]: persisted run and per-table checkpoint state
//! - [`validate`]: source/target reconciliation reports
//! - [`pipeline`]: the orchestrator tying the stages together

pub mod batch;
pub mod db;
pub mod error;
pub mod extract;
pub mod load;
pub mod pipeline;
pub mod stats;
pub mod track;
pub mod transform;
pub mod validate;

pub use batch::{Batch, Record};
pub use error::{EtlError, ExtractError, LoadError, TrackerError, TransformError, ValidateError};
pub use pipeline::{FailurePolicy, Pipeline, PipelineConfig, PipelineOutcome, TableJob};
