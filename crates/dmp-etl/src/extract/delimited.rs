//! Delimited text extraction (CSV and variants)

use std::fs::File;
use std::path::Path;

use csv::{ByteRecord, ReaderBuilder};
use tracing::warn;

use crate::batch::{Batch, Record};
use crate::error::ExtractError;

use super::{open_source, Encoding, Extractor};

/// Streams a delimited file in batches. Records whose field count does
/// not match the header are skipped and counted, never propagated.
pub struct DelimitedExtractor {
    reader: csv::Reader<File>,
    headers: Vec<String>,
    encoding: Encoding,
    batch_size: usize,
    line: u64,
    done: bool,
}

impl DelimitedExtractor {
    pub fn open(
        path: &Path,
        delimiter: u8,
        has_header: bool,
        encoding: Encoding,
        batch_size: usize,
    ) -> Result<Self, ExtractError> {
        let file = open_source(path)?;
        let mut reader = ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(false)
            .flexible(true)
            .from_reader(file);

        let mut headers = Vec::new();
        let mut line = 0u64;
        if has_header {
            let mut raw = ByteRecord::new();
            if reader.read_byte_record(&mut raw)? {
                line = 1;
                headers = raw
                    .iter()
                    .enumerate()
                    .map(|(i, field)| {
                        let field = if i == 0 {
                            field.strip_prefix(&[0xEF, 0xBB, 0xBF][..]).unwrap_or(field)
                        } else {
                            field
                        };
                        encoding.decode(field).trim().to_string()
                    })
                    .collect();
            }
        }

        Ok(Self {
            reader,
            headers,
            encoding,
            batch_size,
            line,
            done: false,
        })
    }

    fn decode_record(&self, raw: &ByteRecord) -> Record {
        let mut record = Record::new();
        for (name, field) in self.headers.iter().zip(raw.iter()) {
            record.insert(
                name.clone(),
                serde_json::Value::String(self.encoding.decode(field)),
            );
        }
        record
    }
}

impl Extractor for DelimitedExtractor {
    fn next_batch(&mut self) -> Result<Option<Batch>, ExtractError> {
        if self.done {
            return Ok(None);
        }

        let mut batch = Batch::default();
        let mut raw = ByteRecord::new();
        while batch.records.len() < self.batch_size {
            if !self.reader.read_byte_record(&mut raw)? {
                self.done = true;
                break;
            }
            self.line += 1;

            // Headerless sources name columns positionally off the first record
            if self.headers.is_empty() {
                self.headers = (1..=raw.len()).map(|i| format!("column_{i}")).collect();
            }

            if raw.len() != self.headers.len() {
                batch.skipped += 1;
                warn!(
                    line = self.line,
                    expected = self.headers.len(),
                    actual = raw.len(),
                    "skipping record with mismatched field count"
                );
                continue;
            }

            batch.records.push(self.decode_record(&raw));
        }

        if batch.records.is_empty() && batch.skipped == 0 {
            Ok(None)
        } else {
            Ok(Some(batch))
        }
    }
}
