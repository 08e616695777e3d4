//! Source extractors
//!
//! Every extractor shares the same contract: given a [`SourceSpec`] and a
//! batch size, produce a lazy, finite, non-restartable sequence of record
//! batches in source order. Malformed individual records are skipped and
//! counted on the batch with a warning; only an unreadable source is
//! fatal. Sources are never mutated.

pub mod binary;
pub mod delimited;
pub mod dump;
pub mod fixed_width;

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::batch::Batch;
use crate::error::ExtractError;

pub use binary::{FieldKind, FieldSpec, FixedBinaryExtractor, RecordLayout};
pub use delimited::DelimitedExtractor;
pub use dump::DumpExtractor;
pub use fixed_width::{ColumnSpan, FixedWidthExtractor};

/// Character encoding of a text source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    Latin1,
}

impl Encoding {
    /// Decode raw bytes in this encoding (UTF-8 decodes lossily).
    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            Encoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Encoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
        }
    }

    /// Guess the encoding from a leading sample of the source.
    ///
    /// A UTF-8 BOM or a cleanly decodable sample means UTF-8. A decode
    /// error with no error length is a character cut off at the sample
    /// edge and still counts as UTF-8; an actual invalid sequence means
    /// Latin-1.
    pub fn detect(sample: &[u8]) -> Encoding {
        if sample.starts_with(&[0xEF, 0xBB, 0xBF]) {
            return Encoding::Utf8;
        }
        match std::str::from_utf8(sample) {
            Ok(_) => Encoding::Utf8,
            Err(e) if e.error_len().is_none() => Encoding::Utf8,
            Err(_) => Encoding::Latin1,
        }
    }
}

/// Source format, chosen by the caller rather than inferred from the file.
#[derive(Debug, Clone)]
pub enum SourceFormat {
    /// Delimited text (CSV and friends)
    Delimited { delimiter: u8, has_header: bool },
    /// Fixed-width text lines sliced by declared column spans
    FixedWidth { columns: Vec<ColumnSpan> },
    /// Fixed-length binary records decoded by a declared field layout
    FixedBinary { layout: RecordLayout },
    /// Dump-style tagged-line blocks ending with a terminator line
    Dump { terminator: String },
}

/// Descriptor of one source artifact
#[derive(Debug, Clone)]
pub struct SourceSpec {
    pub path: PathBuf,
    pub format: SourceFormat,
    /// Explicit encoding; `None` means auto-detect from the file head
    pub encoding: Option<Encoding>,
}

impl SourceSpec {
    /// Comma-delimited text with a header row
    pub fn csv(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            format: SourceFormat::Delimited {
                delimiter: b',',
                has_header: true,
            },
            encoding: None,
        }
    }

    pub fn delimited(path: impl Into<PathBuf>, delimiter: u8, has_header: bool) -> Self {
        Self {
            path: path.into(),
            format: SourceFormat::Delimited {
                delimiter,
                has_header,
            },
            encoding: None,
        }
    }

    pub fn fixed_width(path: impl Into<PathBuf>, columns: Vec<ColumnSpan>) -> Self {
        Self {
            path: path.into(),
            format: SourceFormat::FixedWidth { columns },
            encoding: None,
        }
    }

    pub fn fixed_binary(path: impl Into<PathBuf>, layout: RecordLayout) -> Self {
        Self {
            path: path.into(),
            format: SourceFormat::FixedBinary { layout },
            encoding: None,
        }
    }

    pub fn dump(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            format: SourceFormat::Dump {
                terminator: "//".to_string(),
            },
            encoding: None,
        }
    }

    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = Some(encoding);
        self
    }

    /// The descriptor recorded in table logs
    pub fn descriptor(&self) -> String {
        self.path.display().to_string()
    }
}

/// The shared batch-producing contract.
///
/// `next_batch` returns `Ok(None)` once the source is exhausted; the
/// sequence is not restartable.
pub trait Extractor: Send {
    fn next_batch(&mut self) -> Result<Option<Batch>, ExtractError>;
}

/// Open the extractor variant selected by the source spec.
pub fn open(spec: &SourceSpec, batch_size: usize) -> Result<Box<dyn Extractor>, ExtractError> {
    let encoding = match spec.encoding {
        Some(e) => e,
        None => detect_file_encoding(&spec.path)?,
    };

    match &spec.format {
        SourceFormat::Delimited {
            delimiter,
            has_header,
        } => Ok(Box::new(DelimitedExtractor::open(
            &spec.path,
            *delimiter,
            *has_header,
            encoding,
            batch_size,
        )?)),
        SourceFormat::FixedWidth { columns } => Ok(Box::new(FixedWidthExtractor::open(
            &spec.path,
            columns.clone(),
            encoding,
            batch_size,
        )?)),
        SourceFormat::FixedBinary { layout } => Ok(Box::new(FixedBinaryExtractor::open(
            &spec.path,
            layout.clone(),
            encoding,
            batch_size,
        )?)),
        SourceFormat::Dump { terminator } => Ok(Box::new(DumpExtractor::open(
            &spec.path,
            terminator.clone(),
            encoding,
            batch_size,
        )?)),
    }
}

/// Open a source file read-only, mapping the failure to the fatal
/// extraction error.
pub(crate) fn open_source(path: &Path) -> Result<File, ExtractError> {
    File::open(path).map_err(|source| ExtractError::Unreadable {
        path: path.to_path_buf(),
        source,
    })
}

fn detect_file_encoding(path: &Path) -> Result<Encoding, ExtractError> {
    let mut file = open_source(path)?;
    let mut sample = [0u8; 8192];
    let n = file.read(&mut sample)?;
    Ok(Encoding::detect(&sample[..n]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_detect_utf8() {
        assert_eq!(Encoding::detect(b"plain ascii"), Encoding::Utf8);
        assert_eq!(Encoding::detect("héllo".as_bytes()), Encoding::Utf8);
        assert_eq!(Encoding::detect(&[0xEF, 0xBB, 0xBF, b'a']), Encoding::Utf8);
    }

    #[test]
    fn test_encoding_detect_latin1() {
        // 0xE9 is 'é' in Latin-1 and invalid mid-stream UTF-8
        assert_eq!(
            Encoding::detect(b"caf\xe9 con leche, por favor"),
            Encoding::Latin1
        );
    }

    #[test]
    fn test_encoding_detect_latin1_near_sample_edge() {
        // An invalid sequence close to the end of the sample is still
        // Latin-1; only a multibyte character cut off exactly at the
        // edge counts as UTF-8 truncation.
        assert_eq!(Encoding::detect(b"caf\xe9s"), Encoding::Latin1);
        assert_eq!(Encoding::detect(b"num\xe9ro"), Encoding::Latin1);
        // 0xC3 opens a 2-byte sequence and the sample ends mid-character
        assert_eq!(Encoding::detect(b"caf\xc3"), Encoding::Utf8);
    }

    #[test]
    fn test_latin1_decode() {
        assert_eq!(Encoding::Latin1.decode(b"caf\xe9"), "café");
    }

    #[test]
    fn test_unreadable_source_is_fatal() {
        let spec = SourceSpec::csv("/nonexistent/source.csv");
        let err = open(&spec, 100).err();
        assert!(matches!(err, Some(ExtractError::Unreadable { .. })));
    }
}
