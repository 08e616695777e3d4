//! Built-in transform rules
//!
//! Each rule repairs one class of legacy-data problem. Unrepairable
//! values become null (counted on the batch) with a warning naming the
//! column and raw value; the record itself survives unless the rule is
//! explicitly a dropping rule.

use std::collections::{BTreeMap, HashSet};

use chrono::NaiveDate;
use serde_json::Value;
use tracing::warn;

use crate::batch::{value_key, value_text, Batch};

use super::TransformRule;

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%d-%b-%Y", "%Y%m%d", "%m-%d-%Y"];

/// Normalizes assorted legacy date spellings to ISO `YYYY-MM-DD`.
pub struct NormalizeDate {
    columns: Vec<String>,
}

impl NormalizeDate {
    pub fn new(columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }

    fn parse(raw: &str) -> Option<NaiveDate> {
        let raw = raw.trim();
        DATE_FORMATS
            .iter()
            .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
    }
}

impl TransformRule for NormalizeDate {
    fn name(&self) -> &str {
        "normalize_date"
    }

    fn required_columns(&self) -> Vec<String> {
        self.columns.clone()
    }

    fn apply(&self, mut batch: Batch) -> Batch {
        for record in &mut batch.records {
            for column in &self.columns {
                let Some(value) = record.get(column) else {
                    continue;
                };
                let Some(raw) = value_text(value) else {
                    continue;
                };
                if raw.trim().is_empty() {
                    record.insert(column.clone(), Value::Null);
                    continue;
                }
                match Self::parse(&raw) {
                    Some(date) => {
                        record.insert(
                            column.clone(),
                            Value::String(date.format("%Y-%m-%d").to_string()),
                        );
                    }
                    None => {
                        warn!(column = %column, raw = %raw, "unparseable date, nulling");
                        record.insert(column.clone(), Value::Null);
                        batch.nulled += 1;
                    }
                }
            }
        }
        batch
    }
}

/// Normalizes North American phone numbers to `NNN-NNN-NNNN`.
pub struct NormalizePhone {
    columns: Vec<String>,
}

impl NormalizePhone {
    pub fn new(columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }

    fn normalize(raw: &str) -> Option<String> {
        let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
        let digits = digits.strip_prefix('1').filter(|d| d.len() == 10).map_or(
            digits.as_str(),
            |stripped| stripped,
        );
        if digits.len() != 10 {
            return None;
        }
        Some(format!(
            "{}-{}-{}",
            &digits[0..3],
            &digits[3..6],
            &digits[6..10]
        ))
    }
}

impl TransformRule for NormalizePhone {
    fn name(&self) -> &str {
        "normalize_phone"
    }

    fn required_columns(&self) -> Vec<String> {
        self.columns.clone()
    }

    fn apply(&self, mut batch: Batch) -> Batch {
        for record in &mut batch.records {
            for column in &self.columns {
                let Some(raw) = record.get(column).and_then(value_text) else {
                    continue;
                };
                if raw.trim().is_empty() {
                    record.insert(column.clone(), Value::Null);
                    continue;
                }
                match Self::normalize(&raw) {
                    Some(phone) => {
                        record.insert(column.clone(), Value::String(phone));
                    }
                    None => {
                        warn!(column = %column, raw = %raw, "unparseable phone, nulling");
                        record.insert(column.clone(), Value::Null);
                        batch.nulled += 1;
                    }
                }
            }
        }
        batch
    }
}

/// Maps legacy code values through a caller-supplied table.
///
/// Unmapped codes either null the value or drop the whole record,
/// depending on `drop_unmapped`.
pub struct MapCode {
    column: String,
    mapping: BTreeMap<String, String>,
    drop_unmapped: bool,
}

impl MapCode {
    pub fn new(
        column: impl Into<String>,
        mapping: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Self {
        Self {
            column: column.into(),
            mapping: mapping
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            drop_unmapped: false,
        }
    }

    pub fn drop_unmapped(mut self) -> Self {
        self.drop_unmapped = true;
        self
    }
}

impl TransformRule for MapCode {
    fn name(&self) -> &str {
        "map_code"
    }

    fn required_columns(&self) -> Vec<String> {
        vec![self.column.clone()]
    }

    fn apply(&self, mut batch: Batch) -> Batch {
        let mut kept = Vec::with_capacity(batch.records.len());
        for mut record in batch.records {
            let raw = record.get(&self.column).and_then(value_text);
            match raw {
                None => kept.push(record),
                Some(code) => match self.mapping.get(code.trim()) {
                    Some(mapped) => {
                        record.insert(self.column.clone(), Value::String(mapped.clone()));
                        kept.push(record);
                    }
                    None if self.drop_unmapped => {
                        warn!(column = %self.column, code = %code, "unmapped code, dropping record");
                        batch.dropped += 1;
                    }
                    None => {
                        warn!(column = %self.column, code = %code, "unmapped code, nulling");
                        record.insert(self.column.clone(), Value::Null);
                        batch.nulled += 1;
                        kept.push(record);
                    }
                },
            }
        }
        batch.records = kept;
        batch
    }
}

/// Splits a combined name column into first/last columns.
///
/// `"Last, First"` splits on the comma; otherwise the final token is the
/// last name and everything before it the first.
pub struct SplitName {
    source: String,
    first_column: String,
    last_column: String,
}

impl SplitName {
    pub fn new(
        source: impl Into<String>,
        first_column: impl Into<String>,
        last_column: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            first_column: first_column.into(),
            last_column: last_column.into(),
        }
    }

    fn split(raw: &str) -> (String, String) {
        if let Some((last, first)) = raw.split_once(',') {
            return (first.trim().to_string(), last.trim().to_string());
        }
        match raw.trim().rsplit_once(char::is_whitespace) {
            Some((first, last)) => (first.trim().to_string(), last.trim().to_string()),
            None => (String::new(), raw.trim().to_string()),
        }
    }
}

impl TransformRule for SplitName {
    fn name(&self) -> &str {
        "split_name"
    }

    fn required_columns(&self) -> Vec<String> {
        vec![self.source.clone()]
    }

    fn apply(&self, mut batch: Batch) -> Batch {
        for record in &mut batch.records {
            let Some(raw) = record.get(&self.source).and_then(value_text) else {
                record.insert(self.first_column.clone(), Value::Null);
                record.insert(self.last_column.clone(), Value::Null);
                continue;
            };
            let (first, last) = Self::split(&raw);
            record.insert(
                self.first_column.clone(),
                if first.is_empty() {
                    Value::Null
                } else {
                    Value::String(first)
                },
            );
            record.insert(self.last_column.clone(), Value::String(last));
        }
        batch
    }
}

/// Drops within-batch duplicates by key tuple; the first occurrence wins.
pub struct Deduplicate {
    key_columns: Vec<String>,
}

impl Deduplicate {
    pub fn new(key_columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            key_columns: key_columns.into_iter().map(Into::into).collect(),
        }
    }
}

impl TransformRule for Deduplicate {
    fn name(&self) -> &str {
        "deduplicate"
    }

    fn required_columns(&self) -> Vec<String> {
        self.key_columns.clone()
    }

    fn apply(&self, mut batch: Batch) -> Batch {
        let mut seen = HashSet::new();
        let mut kept = Vec::with_capacity(batch.records.len());
        for record in batch.records {
            let key: Vec<String> = self
                .key_columns
                .iter()
                .map(|c| record.get(c).map(value_key).unwrap_or_default())
                .collect();
            if seen.insert(key) {
                kept.push(record);
            } else {
                batch.dropped += 1;
            }
        }
        batch.records = kept;
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Record;
    use crate::transform::TransformChain;
    use serde_json::json;

    fn record(pairs: &[(&str, Value)]) -> Record {
        let mut r = Record::new();
        for (k, v) in pairs {
            r.insert((*k).to_string(), v.clone());
        }
        r
    }

    #[test]
    fn test_date_formats_normalized() {
        let rule = NormalizeDate::new(["d"]);
        let batch = Batch::from_records(vec![
            record(&[("d", json!("01/15/2024"))]),
            record(&[("d", json!("2024-01-15"))]),
            record(&[("d", json!("15-Jan-2024"))]),
            record(&[("d", json!("20240115"))]),
            record(&[("d", json!("01-15-2024"))]),
        ]);
        let out = rule.apply(batch);
        for rec in &out.records {
            assert_eq!(rec["d"], "2024-01-15");
        }
        assert_eq!(out.nulled, 0);
    }

    #[test]
    fn test_unparseable_date_nulled_and_counted() {
        let rule = NormalizeDate::new(["d"]);
        let batch = Batch::from_records(vec![record(&[("d", json!("not-a-date"))])]);
        let out = rule.apply(batch);
        assert_eq!(out.records[0]["d"], Value::Null);
        assert_eq!(out.nulled, 1);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_date_rule_is_deterministic() {
        let rule = NormalizeDate::new(["d"]);
        let batch = Batch::from_records(vec![record(&[("d", json!("01/15/2024"))])]);
        let a = rule.apply(batch.clone());
        let b = rule.apply(batch);
        assert_eq!(a.records, b.records);
        assert_eq!(a.nulled, b.nulled);
    }

    #[test]
    fn test_phone_normalization() {
        let rule = NormalizePhone::new(["p"]);
        let batch = Batch::from_records(vec![
            record(&[("p", json!("(555) 123-4567"))]),
            record(&[("p", json!("1-555-123-4567"))]),
            record(&[("p", json!("5551234567"))]),
            record(&[("p", json!("12345"))]),
        ]);
        let out = rule.apply(batch);
        assert_eq!(out.records[0]["p"], "555-123-4567");
        assert_eq!(out.records[1]["p"], "555-123-4567");
        assert_eq!(out.records[2]["p"], "555-123-4567");
        assert_eq!(out.records[3]["p"], Value::Null);
        assert_eq!(out.nulled, 1);
    }

    #[test]
    fn test_map_code_null_vs_drop() {
        let mapping = [("NG", "natural_gas"), ("SUN", "solar")];

        let nulling = MapCode::new("fuel", mapping);
        let out = nulling.apply(Batch::from_records(vec![
            record(&[("fuel", json!("NG"))]),
            record(&[("fuel", json!("??"))]),
        ]));
        assert_eq!(out.records[0]["fuel"], "natural_gas");
        assert_eq!(out.records[1]["fuel"], Value::Null);
        assert_eq!(out.nulled, 1);

        let dropping = MapCode::new("fuel", mapping).drop_unmapped();
        let out = dropping.apply(Batch::from_records(vec![
            record(&[("fuel", json!("SUN"))]),
            record(&[("fuel", json!("??"))]),
        ]));
        assert_eq!(out.len(), 1);
        assert_eq!(out.dropped, 1);
    }

    #[test]
    fn test_split_name_both_shapes() {
        let rule = SplitName::new("name", "first_name", "last_name");
        let out = rule.apply(Batch::from_records(vec![
            record(&[("name", json!("Curie, Marie"))]),
            record(&[("name", json!("Ada Lovelace"))]),
            record(&[("name", json!("Plato"))]),
        ]));
        assert_eq!(out.records[0]["first_name"], "Marie");
        assert_eq!(out.records[0]["last_name"], "Curie");
        assert_eq!(out.records[1]["first_name"], "Ada");
        assert_eq!(out.records[1]["last_name"], "Lovelace");
        assert_eq!(out.records[2]["first_name"], Value::Null);
        assert_eq!(out.records[2]["last_name"], "Plato");
    }

    #[test]
    fn test_deduplicate_first_wins() {
        let rule = Deduplicate::new(["id"]);
        let out = rule.apply(Batch::from_records(vec![
            record(&[("id", json!("1")), ("v", json!("first"))]),
            record(&[("id", json!("2")), ("v", json!("other"))]),
            record(&[("id", json!("1")), ("v", json!("second"))]),
        ]));
        assert_eq!(out.len(), 2);
        assert_eq!(out.dropped, 1);
        assert_eq!(out.records[0]["v"], "first");
    }

    #[test]
    fn test_chain_composes_rules() {
        let chain = TransformChain::new()
            .with_rule(NormalizeDate::new(["hired"]))
            .with_rule(Deduplicate::new(["id"]));
        let out = chain
            .apply(Batch::from_records(vec![
                record(&[("id", json!("1")), ("hired", json!("01/15/2024"))]),
                record(&[("id", json!("1")), ("hired", json!("01/16/2024"))]),
            ]))
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out.records[0]["hired"], "2024-01-15");
        assert_eq!(out.dropped, 1);
    }
}
