//! Uniform row extraction across CSV, Excel and JSON sources.
//!
//! [`extract()`] resolves the source format, reads the file and returns an [`Extraction`]: the
//! ordered column labels plus a lazy, non-restartable iterator of [`RawRow`]s aligned to them.
//! Header detection for tabular sources lives here and is shared by the CSV and workbook readers.

mod delimited;
mod json;
mod workbook;

use std::{borrow::Cow, fmt, path::Path, str::FromStr};

use chrono::NaiveDateTime;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::{
    data::{looks_like_boolean, normalize_numeric, parse_timestamp},
    error::{ImportError, ImportResult},
};

pub(crate) const HEADER_DETECTION_SAMPLE_ROWS: usize = 6;

const COMMON_HEADER_TOKENS: &[&str] = &[
    "address",
    "age",
    "amount",
    "city",
    "code",
    "country",
    "created",
    "date",
    "description",
    "email",
    "first_name",
    "id",
    "last_name",
    "name",
    "phone",
    "price",
    "quantity",
    "status",
    "total",
    "type",
    "updated",
];

/// Tokens read as missing values in tabular sources.
const MISSING_VALUE_TOKENS: &[&str] = &["na", "n/a", "#n/a", "null", "nan", "none"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    Csv,
    Excel,
    Json,
}

impl SourceFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "csv" | "tsv" | "txt" => Some(SourceFormat::Csv),
            "xlsx" | "xlsm" | "xls" | "xlsb" | "ods" => Some(SourceFormat::Excel),
            "json" => Some(SourceFormat::Json),
            _ => None,
        }
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SourceFormat::Csv => "csv",
            SourceFormat::Excel => "excel",
            SourceFormat::Json => "json",
        };
        f.write_str(label)
    }
}

impl FromStr for SourceFormat {
    type Err = ImportError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "csv" | "tsv" => Ok(SourceFormat::Csv),
            "excel" | "xlsx" | "xls" => Ok(SourceFormat::Excel),
            "json" => Ok(SourceFormat::Json),
            other => Err(ImportError::Config(format!("Unsupported file format '{other}'"))),
        }
    }
}

/// An untyped scalar as it appeared in the source.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Timestamp(NaiveDateTime),
}

impl RawValue {
    /// Text cell from a tabular source; blanks and missing-value tokens become [`RawValue::Null`].
    pub fn from_cell(text: &str) -> Self {
        let trimmed = text.trim();
        if trimmed.is_empty() || is_missing_token(trimmed) {
            RawValue::Null
        } else {
            RawValue::Text(text.to_string())
        }
    }

    pub fn is_null(&self) -> bool {
        match self {
            RawValue::Null => true,
            RawValue::Text(text) => text.trim().is_empty(),
            _ => false,
        }
    }

    pub fn as_text(&self) -> Cow<'_, str> {
        match self {
            RawValue::Null => Cow::Borrowed(""),
            RawValue::Text(text) => Cow::Borrowed(text.as_str()),
            RawValue::Integer(value) => Cow::Owned(value.to_string()),
            RawValue::Float(value) => Cow::Owned(value.to_string()),
            RawValue::Boolean(value) => Cow::Owned(value.to_string()),
            RawValue::Timestamp(value) => {
                Cow::Owned(value.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
            }
        }
    }
}

fn is_missing_token(trimmed: &str) -> bool {
    let lowered = trimmed.to_ascii_lowercase();
    MISSING_VALUE_TOKENS.contains(&lowered.as_str())
}

/// One source record, positionally aligned with [`Extraction::headers`].
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    /// 1-based position among the data rows of the file.
    pub ordinal: usize,
    pub values: Vec<RawValue>,
}

impl RawRow {
    pub fn get(&self, index: usize) -> &RawValue {
        self.values.get(index).unwrap_or(&RawValue::Null)
    }

    /// Pads or truncates the row to `width` cells.
    pub(crate) fn fit_to(mut self, width: usize) -> Self {
        self.values.resize(width, RawValue::Null);
        self
    }
}

pub type RowIter = Box<dyn Iterator<Item = ImportResult<RawRow>> + Send>;

#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    pub format: Option<SourceFormat>,
    pub delimiter: Option<u8>,
    pub encoding: Option<String>,
    /// `Some(true)` forces the first row to be read as a header, `Some(false)` forbids it.
    pub header: Option<bool>,
}

pub struct Extraction {
    pub format: SourceFormat,
    pub headers: Vec<String>,
    pub has_headers: bool,
    pub delimiter: Option<u8>,
    pub encoding: Option<&'static str>,
    pub rows: RowIter,
}

impl fmt::Debug for Extraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extraction")
            .field("format", &self.format)
            .field("headers", &self.headers)
            .field("has_headers", &self.has_headers)
            .field("delimiter", &self.delimiter)
            .field("encoding", &self.encoding)
            .finish_non_exhaustive()
    }
}

pub fn resolve_format(path: &Path, declared: Option<SourceFormat>) -> ImportResult<SourceFormat> {
    declared
        .or_else(|| SourceFormat::from_path(path))
        .ok_or_else(|| {
            ImportError::parse(
                path,
                "Cannot determine the file format from its extension; pass --format",
            )
        })
}

pub fn extract(path: &Path, options: &ExtractOptions) -> ImportResult<Extraction> {
    if !path.is_file() {
        return Err(ImportError::parse(path, "File not found"));
    }
    let extraction = match resolve_format(path, options.format)? {
        SourceFormat::Csv => delimited::extract(path, options)?,
        SourceFormat::Excel => workbook::extract(path, options)?,
        SourceFormat::Json => json::extract(path)?,
    };
    if extraction.headers.is_empty() {
        return Err(ImportError::parse(
            path,
            format!("No columns found; the {} input is empty", extraction.format),
        ));
    }
    Ok(extraction)
}

/// Placeholder labels used when a source has no header row.
pub fn generate_column_names(count: usize) -> Vec<String> {
    (1..=count).map(|idx| format!("column_{idx}")).collect()
}

/// Decides whether `rows[0]` is a header, looking at up to the next few rows for contrast.
pub(crate) fn detect_header(rows: &[Vec<String>], header_override: Option<bool>) -> bool {
    if let Some(forced) = header_override {
        return forced;
    }
    let Some((first, rest)) = rows.split_first() else {
        return true;
    };
    let rest = &rest[..rest.len().min(HEADER_DETECTION_SAMPLE_ROWS - 1)];

    // A first row whose width disagrees with every following row is data from a ragged file,
    // not a header.
    if !rest.is_empty() && rest.iter().all(|row| row.len() != first.len()) {
        return false;
    }
    infer_has_header(first, rest)
}

fn token_is_common_header(value: &str) -> bool {
    let normalized = value
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|ch| match ch {
            ' ' | '-' | '/' => '_',
            other => other,
        })
        .collect::<String>();
    !normalized.is_empty() && COMMON_HEADER_TOKENS.contains(&normalized.as_str())
}

fn value_is_data_like(value: &str) -> bool {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return false;
    }
    looks_like_boolean(trimmed)
        || normalize_numeric(trimmed).is_some()
        || parse_timestamp(trimmed).is_some()
}

fn value_is_header_like(value: &str) -> bool {
    let trimmed = value.trim();
    if trimmed.is_empty() || value_is_data_like(trimmed) {
        return false;
    }
    trimmed.chars().any(|c| c.is_alphabetic()) || token_is_common_header(trimmed)
}

fn infer_has_header(first_row: &[String], other_rows: &[Vec<String>]) -> bool {
    let header_like_first = first_row
        .iter()
        .filter(|value| value_is_header_like(value))
        .count();
    let data_like_first = first_row
        .iter()
        .filter(|value| value_is_data_like(value))
        .count();

    if header_like_first == 0 || data_like_first > header_like_first {
        return false;
    }
    if other_rows.is_empty() {
        return header_like_first >= 2
            || first_row.iter().any(|value| token_is_common_header(value));
    }

    let mut header_signal = 0usize;
    let mut data_signal = 0usize;
    for (column, first_value) in first_row.iter().enumerate() {
        let other_has_data = other_rows
            .iter()
            .filter_map(|row| row.get(column))
            .any(|value| value_is_data_like(value));
        if value_is_header_like(first_value) && other_has_data {
            header_signal += 1;
        } else if value_is_data_like(first_value) && other_has_data {
            data_signal += 1;
        }
    }

    if header_signal != data_signal {
        return header_signal > data_signal;
    }
    // Every column is text: a header only if the first row differs from the rest, e.g. it
    // repeats no value found below it and uses familiar header words.
    let repeats_below = first_row.iter().enumerate().any(|(column, value)| {
        other_rows
            .iter()
            .filter_map(|row| row.get(column))
            .any(|other| other.trim().eq_ignore_ascii_case(value.trim()))
    });
    !repeats_below
        && (first_row.iter().any(|value| token_is_common_header(value))
            || header_like_first == first_row.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(lines: &[&[&str]]) -> Vec<Vec<String>> {
        lines
            .iter()
            .map(|line| line.iter().map(|v| v.to_string()).collect())
            .collect()
    }

    #[test]
    fn header_detected_over_numeric_rows() {
        let sample = rows(&[&["email", "age"], &["a@x.com", "30"], &["b@x.com", "41"]]);
        assert!(detect_header(&sample, None));
    }

    #[test]
    fn numeric_first_row_is_data() {
        let sample = rows(&[&["1", "2.5"], &["2", "3.5"]]);
        assert!(!detect_header(&sample, None));
    }

    #[test]
    fn ragged_first_row_is_data() {
        let sample = rows(&[&["alpha"], &["beta", "gamma"], &["delta", "omega"]]);
        assert!(!detect_header(&sample, None));
    }

    #[test]
    fn override_wins_over_heuristics() {
        let sample = rows(&[&["1", "2"], &["3", "4"]]);
        assert!(detect_header(&sample, Some(true)));
    }

    #[test]
    fn missing_tokens_become_null() {
        assert_eq!(RawValue::from_cell(" N/A "), RawValue::Null);
        assert_eq!(RawValue::from_cell("  "), RawValue::Null);
        assert_eq!(
            RawValue::from_cell("Nancy"),
            RawValue::Text("Nancy".to_string())
        );
    }

    #[test]
    fn format_resolves_from_extension() {
        assert_eq!(
            SourceFormat::from_path(Path::new("data.XLSX")),
            Some(SourceFormat::Excel)
        );
        assert!(resolve_format(Path::new("data.bin"), None).is_err());
        assert_eq!(
            resolve_format(Path::new("data.bin"), Some(SourceFormat::Json)).unwrap(),
            SourceFormat::Json
        );
    }
}
