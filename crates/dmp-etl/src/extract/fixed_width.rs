//! Fixed-width text extraction
//!
//! Each line is sliced into byte spans declared by the caller. Slicing
//! happens on raw bytes before decoding, so Latin-1 sources keep their
//! declared column positions.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use tracing::warn;

use crate::batch::{Batch, Record};
use crate::error::ExtractError;

use super::{open_source, Encoding, Extractor};

/// One named byte span within a fixed-width line
#[derive(Debug, Clone)]
pub struct ColumnSpan {
    pub name: String,
    /// Zero-based byte offset within the line
    pub start: usize,
    pub width: usize,
}

impl ColumnSpan {
    pub fn new(name: impl Into<String>, start: usize, width: usize) -> Self {
        Self {
            name: name.into(),
            start,
            width,
        }
    }
}

pub struct FixedWidthExtractor {
    reader: BufReader<File>,
    columns: Vec<ColumnSpan>,
    encoding: Encoding,
    batch_size: usize,
    line: u64,
    done: bool,
}

impl FixedWidthExtractor {
    pub fn open(
        path: &Path,
        columns: Vec<ColumnSpan>,
        encoding: Encoding,
        batch_size: usize,
    ) -> Result<Self, ExtractError> {
        if columns.is_empty() {
            return Err(ExtractError::Layout(
                "fixed-width source needs at least one column span".to_string(),
            ));
        }
        let file = open_source(path)?;
        Ok(Self {
            reader: BufReader::new(file),
            columns,
            encoding,
            batch_size,
            line: 0,
            done: false,
        })
    }

    fn parse_line(&self, raw: &[u8]) -> Option<Record> {
        let mut record = Record::new();
        for span in &self.columns {
            let end = span.start + span.width;
            if end > raw.len() {
                return None;
            }
            let text = self.encoding.decode(&raw[span.start..end]);
            record.insert(
                span.name.clone(),
                serde_json::Value::String(text.trim().to_string()),
            );
        }
        Some(record)
    }
}

impl Extractor for FixedWidthExtractor {
    fn next_batch(&mut self) -> Result<Option<Batch>, ExtractError> {
        if self.done {
            return Ok(None);
        }

        let mut batch = Batch::default();
        let mut buf = Vec::new();
        while batch.records.len() < self.batch_size {
            buf.clear();
            let n = self.reader.read_until(b'\n', &mut buf)?;
            if n == 0 {
                self.done = true;
                break;
            }
            self.line += 1;

            while buf.last() == Some(&b'\n') || buf.last() == Some(&b'\r') {
                buf.pop();
            }
            if buf.is_empty() {
                continue;
            }

            match self.parse_line(&buf) {
                Some(record) => batch.records.push(record),
                None => {
                    batch.skipped += 1;
                    warn!(
                        line = self.line,
                        length = buf.len(),
                        "skipping line shorter than declared column spans"
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
