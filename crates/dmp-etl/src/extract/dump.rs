//! Dump-style block extraction
//!
//! Parses sources laid out as tagged-line blocks: each line starts with a
//! key token, each block ends with a terminator line (`//` by default).
//! Repeated keys within a block concatenate; continuation lines (leading
//! whitespace) extend the previous key. One block becomes one record, so
//! records are sparse by nature.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde_json::Value;
use tracing::warn;

use crate::batch::{Batch, Record};
use crate::error::ExtractError;

use super::{open_source, Encoding, Extractor};

pub struct DumpExtractor {
    reader: BufReader<File>,
    terminator: String,
    encoding: Encoding,
    batch_size: usize,
    line: u64,
    done: bool,
}

impl DumpExtractor {
    pub fn open(
        path: &Path,
        terminator: String,
        encoding: Encoding,
        batch_size: usize,
    ) -> Result<Self, ExtractError> {
        if terminator.is_empty() {
            return Err(ExtractError::Layout(
                "dump terminator must not be empty".to_string(),
            ));
        }
        let file = open_source(path)?;
        Ok(Self {
            reader: BufReader::new(file),
            terminator,
            encoding,
            batch_size,
            line: 0,
            done: false,
        })
    }

    /// Read lines until the next terminator (or EOF), building one record.
    /// Returns `Ok(None)` at EOF with no open block.
    fn next_block(&mut self, batch: &mut Batch) -> Result<Option<Record>, ExtractError> {
        let mut record = Record::new();
        let mut last_key: Option<String> = None;
        let mut saw_content = false;

        let mut buf = Vec::new();
        loop {
            buf.clear();
            let n = self.reader.read_until(b'\n', &mut buf)?;
            if n == 0 {
                self.done = true;
                // EOF flushes a block left open without its terminator
                return Ok(saw_content.then_some(record));
            }
            self.line += 1;

            let text = self.encoding.decode(&buf);
            let line = text.trim_end_matches(['\n', '\r']);
            if line.trim().is_empty() {
                continue;
            }
            if line.trim_end() == self.terminator {
                return Ok(saw_content.then_some(record));
            }

            if line.starts_with(char::is_whitespace) {
                // Continuation of the previous key's value
                match &last_key {
                    Some(key) => append_field(&mut record, key, line.trim()),
                    None => {
                        batch.skipped += 1;
                        warn!(
                            line = self.line,
                            "skipping continuation line with no preceding key"
                        );
                    }
                }
                continue;
            }

            let (key, value) = match line.split_once(char::is_whitespace) {
                Some((k, v)) => (k, v.trim()),
                None => (line, ""),
            };
            let key = key.to_lowercase();
            append_field(&mut record, &key, value);
            last_key = Some(key);
            saw_content = true;
        }
    }
}

fn append_field(record: &mut Record, key: &str, value: &str) {
    match record.get_mut(key) {
        Some(Value::String(existing)) => {
            if !value.is_empty() {
                if !existing.is_empty() {
                    existing.push(' ');
                }
                existing.push_str(value);
            }
        }
        _ => {
            record.insert(key.to_string(), Value::String(value.to_string()));
        }
    }
}

impl Extractor for DumpExtractor {
    fn next_batch(&mut self) -> Result<Option<Batch>, ExtractError> {
        if self.done {
            return Ok(None);
        }

        let mut batch = Batch::default();
        while batch.records.len() < self.batch_size && !self.done {
            if let Some(record) = self.next_block(&mut batch)? {
                batch.records.push(record);
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
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_dump(contents: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_blocks_become_records() {
        let f = write_dump("ID rec1\nDE first record\n//\nID rec2\nDE second\n//\n");
        let spec = SourceSpec::dump(f.path());
        let mut ex = crate::extract::open(&spec, 100).unwrap();
        let batch = ex.next_batch().unwrap().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.records[0]["id"], "rec1");
        assert_eq!(batch.records[1]["de"], "second");
        assert!(ex.next_batch().unwrap().is_none());
    }

    #[test]
    fn test_repeated_keys_concatenate() {
        let f = write_dump("ID rec1\nDE part one\nDE part two\n//\n");
        let spec = SourceSpec::dump(f.path());
        let mut ex = crate::extract::open(&spec, 100).unwrap();
        let batch = ex.next_batch().unwrap().unwrap();
        assert_eq!(batch.records[0]["de"], "part one part two");
    }

    #[test]
    fn test_continuation_lines_extend_previous_key() {
        let f = write_dump("ID rec1\nSQ MKTA YLLA\n     VLSP ADKT\n//\n");
        let spec = SourceSpec::dump(f.path());
        let mut ex = crate::extract::open(&spec, 100).unwrap();
        let batch = ex.next_batch().unwrap().unwrap();
        assert_eq!(batch.records[0]["sq"], "MKTA YLLA VLSP ADKT");
    }

    #[test]
    fn test_eof_flushes_open_block() {
        let f = write_dump("ID rec1\n//\nID rec2\nDE no terminator");
        let spec = SourceSpec::dump(f.path());
        let mut ex = crate::extract::open(&spec, 100).unwrap();
        let batch = ex.next_batch().unwrap().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.records[1]["id"], "rec2");
    }

    #[test]
    fn test_orphan_continuation_counted_malformed() {
        let f = write_dump("   dangling\nID rec1\n//\n");
        let spec = SourceSpec::dump(f.path());
        let mut ex = crate::extract::open(&spec, 100).unwrap();
        let batch = ex.next_batch().unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.skipped, 1);
    }
}
