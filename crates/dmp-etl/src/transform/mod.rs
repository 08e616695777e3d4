//! Transform rule chains
//!
//! Rules are pure and deterministic: the same input batch always yields
//! the same output batch, and the only effects are the returned records
//! plus counters folded onto the batch. Bad individual values are nulled
//! or dropped by the rule; only a batch missing a required column
//! entirely aborts the table attempt.

pub mod rules;

use crate::batch::Batch;
use crate::error::TransformError;

pub use rules::{Deduplicate, MapCode, NormalizeDate, NormalizePhone, SplitName};

/// One transformation step. `apply` consumes and returns the batch so
/// rules can drop records and bump counters without shared state.
pub trait TransformRule: Send + Sync {
    fn name(&self) -> &str;

    /// Columns the rule reads; the chain verifies them before applying.
    fn required_columns(&self) -> Vec<String>;

    fn apply(&self, batch: Batch) -> Batch;
}

/// An ordered list of rules applied left to right.
#[derive(Default)]
pub struct TransformChain {
    rules: Vec<Box<dyn TransformRule>>,
}

impl TransformChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, rule: impl TransformRule + 'static) -> Self {
        self.rules.push(Box::new(rule));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Run the chain over one batch. Before each rule, its required
    /// columns must appear in at least one record; empty batches pass
    /// through untouched.
    pub fn apply(&self, mut batch: Batch) -> Result<Batch, TransformError> {
        for rule in &self.rules {
            if batch.is_empty() {
                continue;
            }
            let missing: Vec<String> = rule
                .required_columns()
                .into_iter()
                .filter(|c| !batch.has_column(c))
                .collect();
            if !missing.is_empty() {
                return Err(TransformError::Shape {
                    rule: rule.name().to_string(),
                    missing,
                });
            }
            batch = rule.apply(batch);
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Record;
    use serde_json::json;

    struct Upper(String);

    impl TransformRule for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        fn required_columns(&self) -> Vec<String> {
            vec![self.0.clone()]
        }

        fn apply(&self, mut batch: Batch) -> Batch {
            for record in &mut batch.records {
                if let Some(serde_json::Value::String(s)) = record.get_mut(&self.0) {
                    *s = s.to_uppercase();
                }
            }
            batch
        }
    }

    fn record(col: &str, v: &str) -> Record {
        let mut r = Record::new();
        r.insert(col.into(), json!(v));
        r
    }

    #[test]
    fn test_chain_applies_in_order() {
        let chain = TransformChain::new().with_rule(Upper("name".into()));
        let batch = Batch::from_records(vec![record("name", "alice")]);
        let out = chain.apply(batch).unwrap();
        assert_eq!(out.records[0]["name"], "ALICE");
    }

    #[test]
    fn test_missing_required_column_is_shape_error() {
        let chain = TransformChain::new().with_rule(Upper("name".into()));
        let batch = Batch::from_records(vec![record("other", "x")]);
        let err = chain.apply(batch).unwrap_err();
        assert!(matches!(err, TransformError::Shape { .. }));
    }

    #[test]
    fn test_empty_batch_passes_through() {
        let chain = TransformChain::new().with_rule(Upper("name".into()));
        let out = chain.apply(Batch::default()).unwrap();
        assert!(out.is_empty());
    }
}
