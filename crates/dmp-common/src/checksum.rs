//! Checksum utilities for source/target reconciliation
//!
//! Two flavors are provided: a streaming SHA-256 over raw bytes (file
//! audit trails) and an order-independent checksum over canonicalized
//! record sets, used to compare a source against what was loaded.

use crate::error::{DmpError, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Compute the SHA-256 checksum of a file
pub fn compute_file_checksum(path: impl AsRef<Path>) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    compute_checksum(&mut file)
}

/// Compute the SHA-256 checksum of any readable source
pub fn compute_checksum<R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Verify the SHA-256 checksum of a file against an expected value
pub fn verify_file_checksum(path: impl AsRef<Path>, expected: &str) -> Result<bool> {
    let actual = compute_file_checksum(path)?;
    if actual == expected {
        Ok(true)
    } else {
        Err(DmpError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

/// Canonical text form of a field-named record.
///
/// Fields are sorted by name and joined with unit separators so that the
/// same logical record always produces the same bytes regardless of field
/// order. Null renders as the empty string.
pub fn canonical_record(fields: &serde_json::Map<String, Value>) -> String {
    let mut keys: Vec<&String> = fields.keys().collect();
    keys.sort();

    let mut out = String::new();
    for key in keys {
        out.push_str(key);
        out.push('=');
        match &fields[key.as_str()] {
            Value::Null => {}
            Value::String(s) => out.push_str(s),
            other => out.push_str(&other.to_string()),
        }
        out.push('\u{1f}');
    }
    out
}

/// Order-independent checksum over a set of records.
///
/// Each record is hashed individually; the per-record digests are sorted
/// before the final hash, so two record sets with the same content but
/// different ordering produce the same checksum.
#[derive(Debug, Default)]
pub struct RecordSetChecksum {
    digests: Vec<[u8; 32]>,
}

impl RecordSetChecksum {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one record to the set
    pub fn add(&mut self, fields: &serde_json::Map<String, Value>) {
        let digest = Sha256::digest(canonical_record(fields).as_bytes());
        self.digests.push(digest.into());
    }

    /// Number of records added so far
    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }

    /// Finalize into a hex checksum
    pub fn finish(mut self) -> String {
        self.digests.sort_unstable();
        let mut hasher = Sha256::new();
        for digest in &self.digests {
            hasher.update(digest);
        }
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    fn record(pairs: &[(&str, Value)]) -> serde_json::Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_compute_checksum_sha256() {
        let data = b"hello world";
        let mut cursor = Cursor::new(data);
        let checksum = compute_checksum(&mut cursor).unwrap();
        assert_eq!(
            checksum,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_canonical_record_is_field_order_independent() {
        let a = record(&[("name", json!("ada")), ("year", json!(1980))]);
        let b = record(&[("year", json!(1980)), ("name", json!("ada"))]);
        assert_eq!(canonical_record(&a), canonical_record(&b));
    }

    #[test]
    fn test_canonical_record_null_renders_empty() {
        let a = record(&[("name", Value::Null)]);
        assert_eq!(canonical_record(&a), "name=\u{1f}");
    }

    #[test]
    fn test_record_set_checksum_is_row_order_independent() {
        let r1 = record(&[("id", json!(1))]);
        let r2 = record(&[("id", json!(2))]);

        let mut forward = RecordSetChecksum::new();
        forward.add(&r1);
        forward.add(&r2);

        let mut reverse = RecordSetChecksum::new();
        reverse.add(&r2);
        reverse.add(&r1);

        assert_eq!(forward.finish(), reverse.finish());
    }

    #[test]
    fn test_record_set_checksum_detects_content_change() {
        let mut a = RecordSetChecksum::new();
        a.add(&record(&[("id", json!(1))]));

        let mut b = RecordSetChecksum::new();
        b.add(&record(&[("id", json!(2))]));

        assert_ne!(a.finish(), b.finish());
    }
}
