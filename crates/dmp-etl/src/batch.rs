//! Record batches flowing through the pipeline

use serde_json::{Map, Value};

/// One field-named record. Values are JSON scalars: strings for text,
/// numbers where a source decoded them, null for absent/unparseable.
pub type Record = Map<String, Value>;

/// One batch of records plus the per-record bookkeeping accumulated while
/// producing it. Counters are carried on the batch (not mutated in shared
/// state) so each stage returns an updated value the caller folds.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub records: Vec<Record>,
    /// Malformed source records skipped during extraction
    pub skipped: u64,
    /// Records dropped by transform rules (dedup, unmappable)
    pub dropped: u64,
    /// Individual values nulled by transform rules
    pub nulled: u64,
}

impl Batch {
    pub fn from_records(records: Vec<Record>) -> Self {
        Self {
            records,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether any record in the batch carries the named column.
    ///
    /// Sparse formats (dump-style blocks) legitimately omit fields per
    /// record; a column is only "missing" when no record has it at all.
    pub fn has_column(&self, column: &str) -> bool {
        self.records.iter().any(|r| r.contains_key(column))
    }
}

/// Text form of a value, or `None` for null. Used by transform rules and
/// key comparisons; numbers render in their JSON form.
pub fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Key form of a value: like [`value_text`] but null maps to the empty
/// string so keys always compare.
pub fn value_key(value: &Value) -> String {
    value_text(value).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_has_column_checks_any_record() {
        let mut a = Record::new();
        a.insert("id".into(), json!(1));
        let mut b = Record::new();
        b.insert("name".into(), json!("x"));

        let batch = Batch::from_records(vec![a, b]);
        assert!(batch.has_column("id"));
        assert!(batch.has_column("name"));
        assert!(!batch.has_column("missing"));
    }

    #[test]
    fn test_value_text() {
        assert_eq!(value_text(&json!("abc")), Some("abc".to_string()));
        assert_eq!(value_text(&json!(42)), Some("42".to_string()));
        assert_eq!(value_text(&Value::Null), None);
        assert_eq!(value_key(&Value::Null), "");
    }
}
