//! DMP Common Library
//!
//! Shared types, utilities, and error handling for the DMP workspace.
//!
//! This crate provides functionality used across all workspace members:
//!
//! - **Error Handling**: Custom error types and result types
//! - **Checksums**: Content checksums for source/target reconciliation
//! - **Logging**: Centralized `tracing` initialization

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checksum;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{DmpError, Result};
