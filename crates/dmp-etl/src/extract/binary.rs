//! Fixed-length binary record extraction
//!
//! The file is a sequence of equal-length records; a caller-declared
//! layout names each field, gives its byte offset and length, and says
//! how to decode it. The layout is validated once at open time.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use serde_json::Value;
use tracing::warn;

use crate::batch::{Batch, Record};
use crate::error::ExtractError;

use super::{open_source, Encoding, Extractor};

/// How a binary field's bytes decode into a value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Text, trimmed of trailing spaces and NUL padding
    Text,
    /// ASCII digits (optionally space-padded); blank decodes to null
    AsciiInt,
    /// Big-endian unsigned 32-bit integer (length must be 4)
    U32Be,
    /// Big-endian signed 32-bit integer (length must be 4)
    I32Be,
}

#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: String,
    pub offset: usize,
    pub length: usize,
    pub kind: FieldKind,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, offset: usize, length: usize, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            offset,
            length,
            kind,
        }
    }
}

/// Declared shape of one fixed-length binary record
#[derive(Debug, Clone)]
pub struct RecordLayout {
    pub record_len: usize,
    pub fields: Vec<FieldSpec>,
}

impl RecordLayout {
    pub fn new(record_len: usize, fields: Vec<FieldSpec>) -> Self {
        Self { record_len, fields }
    }

    fn validate(&self) -> Result<(), ExtractError> {
        if self.record_len == 0 || self.fields.is_empty() {
            return Err(ExtractError::Layout(
                "binary layout needs a record length and at least one field".to_string(),
            ));
        }
        for field in &self.fields {
            if field.offset + field.length > self.record_len {
                return Err(ExtractError::Layout(format!(
                    "field '{}' extends past record length {}",
                    field.name, self.record_len
                )));
            }
            match field.kind {
                FieldKind::U32Be | FieldKind::I32Be if field.length != 4 => {
                    return Err(ExtractError::Layout(format!(
                        "field '{}' is a 32-bit integer but declares length {}",
                        field.name, field.length
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

pub struct FixedBinaryExtractor {
    reader: BufReader<File>,
    layout: RecordLayout,
    encoding: Encoding,
    batch_size: usize,
    record_index: u64,
    done: bool,
}

impl FixedBinaryExtractor {
    pub fn open(
        path: &Path,
        layout: RecordLayout,
        encoding: Encoding,
        batch_size: usize,
    ) -> Result<Self, ExtractError> {
        layout.validate()?;
        let file = open_source(path)?;
        Ok(Self {
            reader: BufReader::new(file),
            layout,
            encoding,
            batch_size,
            record_index: 0,
            done: false,
        })
    }

    /// Decode one raw record, or `None` when a field fails to parse.
    fn decode_record(&self, raw: &[u8]) -> Option<Record> {
        let mut record = Record::new();
        for field in &self.layout.fields {
            let bytes = &raw[field.offset..field.offset + field.length];
            let value = match field.kind {
                FieldKind::Text => {
                    let text = self.encoding.decode(bytes);
                    Value::String(text.trim_end_matches([' ', '\0']).to_string())
                }
                FieldKind::AsciiInt => {
                    let text = self.encoding.decode(bytes);
                    let trimmed = text.trim_matches([' ', '\0']);
                    if trimmed.is_empty() {
                        Value::Null
                    } else {
                        Value::Number(trimmed.parse::<i64>().ok()?.into())
                    }
                }
                FieldKind::U32Be => {
                    let arr: [u8; 4] = bytes.try_into().ok()?;
                    Value::Number(u64::from(u32::from_be_bytes(arr)).into())
                }
                FieldKind::I32Be => {
                    let arr: [u8; 4] = bytes.try_into().ok()?;
                    Value::Number(i64::from(i32::from_be_bytes(arr)).into())
                }
            };
            record.insert(field.name.clone(), value);
        }
        Some(record)
    }
}

impl Extractor for FixedBinaryExtractor {
    fn next_batch(&mut self) -> Result<Option<Batch>, ExtractError> {
        if self.done {
            return Ok(None);
        }

        let mut batch = Batch::default();
        let mut raw = vec![0u8; self.layout.record_len];
        while batch.records.len() < self.batch_size {
            let mut filled = 0;
            while filled < raw.len() {
                let n = self.reader.read(&mut raw[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                self.done = true;
                break;
            }
            self.record_index += 1;

            if filled < raw.len() {
                // Truncated trailing record
                self.done = true;
                batch.skipped += 1;
                warn!(
                    record = self.record_index,
                    bytes = filled,
                    expected = raw.len(),
                    "skipping truncated trailing binary record"
                );
                break;
            }

            match self.decode_record(&raw) {
                Some(record) => batch.records.push(record),
                None => {
                    batch.skipped += 1;
                    warn!(
                        record = self.record_index,
                        "skipping binary record with unparseable field"
                    );
                }
            }
        }

        if batch.records.is_empty() && batch.skipped == 0 {
            Ok(None)
        } else {
            Ok(Some(batch))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::SourceSpec;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn layout() -> RecordLayout {
        RecordLayout::new(
            12,
            vec![
                FieldSpec::new("code", 0, 4, FieldKind::Text),
                FieldSpec::new("qty", 4, 4, FieldKind::AsciiInt),
                FieldSpec::new("total", 8, 4, FieldKind::U32Be),
            ],
        )
    }

    #[test]
    fn test_binary_records_decoded() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(b"AB  ").unwrap();
        f.write_all(b"  42").unwrap();
        f.write_all(&1000u32.to_be_bytes()).unwrap();
        f.write_all(b"CD\0\0").unwrap();
        f.write_all(b"    ").unwrap();
        f.write_all(&7u32.to_be_bytes()).unwrap();

        let spec = SourceSpec::fixed_binary(f.path(), layout());
        let mut ex = crate::extract::open(&spec, 100).unwrap();
        let batch = ex.next_batch().unwrap().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.records[0]["code"], "AB");
        assert_eq!(batch.records[0]["qty"], json!(42));
        assert_eq!(batch.records[0]["total"], json!(1000));
        assert_eq!(batch.records[1]["code"], "CD");
        assert_eq!(batch.records[1]["qty"], Value::Null);
    }

    #[test]
    fn test_truncated_trailing_record_skipped() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(b"AB    42").unwrap();
        f.write_all(&1u32.to_be_bytes()).unwrap();
        f.write_all(b"partial").unwrap();

        let spec = SourceSpec::fixed_binary(f.path(), layout());
        let mut ex = crate::extract::open(&spec, 100).unwrap();
        let batch = ex.next_batch().unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.skipped, 1);
        assert!(ex.next_batch().unwrap().is_none());
    }

    #[test]
    fn test_unparseable_ascii_int_skips_record() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(b"AB  XXXX").unwrap();
        f.write_all(&1u32.to_be_bytes()).unwrap();

        let spec = SourceSpec::fixed_binary(f.path(), layout());
        let mut ex = crate::extract::open(&spec, 100).unwrap();
        let batch = ex.next_batch().unwrap().unwrap();
        assert_eq!(batch.len(), 0);
        assert_eq!(batch.skipped, 1);
    }

    #[test]
    fn test_layout_validation() {
        let bad = RecordLayout::new(4, vec![FieldSpec::new("x", 2, 4, FieldKind::Text)]);
        assert!(bad.validate().is_err());

        let bad_int = RecordLayout::new(8, vec![FieldSpec::new("n", 0, 2, FieldKind::U32Be)]);
        assert!(bad_int.validate().is_err());
    }
}
