//! I/O utilities for source-file decoding, delimiter sniffing and CSV reader construction.
//!
//! - **Encoding**: input bytes are decoded up front via `encoding_rs`, either with a caller
//!   supplied label or by trying the candidates in [`ENCODING_CANDIDATES`] in order.
//! - **Delimiter**: comma, semicolon or tab, sniffed from the first lines of decoded text.
//! - **Readers**: CSV readers are flexible so ragged rows can be padded downstream.

use std::{fs, io::Read, path::Path};

use encoding_rs::Encoding;
use log::debug;

use crate::error::{ImportError, ImportResult};

pub const DEFAULT_CSV_DELIMITER: u8 = b',';
pub const DELIMITER_CANDIDATES: &[u8] = &[b',', b';', b'\t'];
pub const DELIMITER_SAMPLE_LINES: usize = 10;

/// Tried in order; the first encoding that decodes the whole input without error wins.
/// `encoding_rs` follows WHATWG, so the `latin1` label resolves to windows-1252.
pub const ENCODING_CANDIDATES: &[&str] = &["utf-8", "latin1", "windows-1252"];

pub fn resolve_encoding(label: &str) -> ImportResult<&'static Encoding> {
    Encoding::for_label(label.trim().as_bytes())
        .ok_or_else(|| ImportError::Config(format!("Unknown encoding '{label}'")))
}

pub fn read_source_bytes(path: &Path) -> ImportResult<Vec<u8>> {
    fs::read(path).map_err(|err| ImportError::parse(path, format!("Reading file: {err}")))
}

pub fn decode_bytes(bytes: &[u8], encoding: &'static Encoding) -> Option<String> {
    let (text, had_errors) = encoding.decode_with_bom_removal(bytes);
    if had_errors {
        None
    } else {
        Some(text.into_owned())
    }
}

/// Decodes `bytes` with the forced encoding, or the first candidate that succeeds.
pub fn decode_source(
    path: &Path,
    bytes: &[u8],
    forced: Option<&'static Encoding>,
) -> ImportResult<(String, &'static Encoding)> {
    if let Some(encoding) = forced {
        return decode_bytes(bytes, encoding)
            .map(|text| (text, encoding))
            .ok_or_else(|| {
                ImportError::parse(path, format!("Input is not valid {}", encoding.name()))
            });
    }
    for label in ENCODING_CANDIDATES {
        let Some(encoding) = Encoding::for_label(label.as_bytes()) else {
            continue;
        };
        if let Some(text) = decode_bytes(bytes, encoding) {
            debug!("Decoded {:?} as {}", path, encoding.name());
            return Ok((text, encoding));
        }
    }
    Err(ImportError::parse(
        path,
        format!(
            "No supported encoding decodes the input (tried {})",
            ENCODING_CANDIDATES.join(", ")
        ),
    ))
}

/// Picks the delimiter whose per-line field count is consistent and largest across the sample.
pub fn sniff_delimiter(text: &str) -> u8 {
    let lines = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .take(DELIMITER_SAMPLE_LINES)
        .collect::<Vec<_>>();
    if lines.is_empty() {
        return DEFAULT_CSV_DELIMITER;
    }

    let mut best: Option<(u8, bool, usize)> = None;
    for &candidate in DELIMITER_CANDIDATES {
        let counts = lines
            .iter()
            .map(|line| count_unquoted(line, candidate))
            .collect::<Vec<_>>();
        let first = counts[0];
        if first == 0 {
            continue;
        }
        let consistent = counts.iter().all(|count| *count == first);
        let total = counts.iter().sum::<usize>();
        let better = match best {
            None => true,
            Some((_, best_consistent, best_total)) => {
                (consistent && !best_consistent)
                    || (consistent == best_consistent && total > best_total)
            }
        };
        if better {
            best = Some((candidate, consistent, total));
        }
    }
    best.map(|(delimiter, _, _)| delimiter)
        .unwrap_or(DEFAULT_CSV_DELIMITER)
}

fn count_unquoted(line: &str, delimiter: u8) -> usize {
    let mut in_quotes = false;
    let mut count = 0usize;
    for byte in line.bytes() {
        if byte == b'"' {
            in_quotes = !in_quotes;
        } else if byte == delimiter && !in_quotes {
            count += 1;
        }
    }
    count
}

pub fn open_csv_reader<R>(reader: R, delimiter: u8) -> csv::Reader<R>
where
    R: Read,
{
    let mut builder = csv::ReaderBuilder::new();
    builder
        .has_headers(false)
        .delimiter(delimiter)
        .double_quote(true)
        .flexible(true);
    builder.from_reader(reader)
}

pub(crate) fn printable_delimiter(delimiter: u8) -> String {
    match delimiter {
        b',' => ",".to_string(),
        b'\t' => "\\t".to_string(),
        other => (other as char).to_string(),
    }
}
