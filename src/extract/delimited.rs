use std::{io::Cursor, path::Path};

use log::{debug, info};

use super::{
    ExtractOptions, Extraction, HEADER_DETECTION_SAMPLE_ROWS, RawRow, RawValue, SourceFormat,
    detect_header, generate_column_names,
};
use crate::{
    error::{ImportError, ImportResult},
    io_utils,
};

pub(super) fn extract(path: &Path, options: &ExtractOptions) -> ImportResult<Extraction> {
    let forced_encoding = options
        .encoding
        .as_deref()
        .map(io_utils::resolve_encoding)
        .transpose()?;
    let bytes = io_utils::read_source_bytes(path)?;
    let (text, encoding) = io_utils::decode_source(path, &bytes, forced_encoding)?;
    drop(bytes);

    let delimiter = options
        .delimiter
        .unwrap_or_else(|| io_utils::sniff_delimiter(&text));
    info!(
        "Reading {:?} as {} with delimiter '{}'",
        path,
        encoding.name(),
        io_utils::printable_delimiter(delimiter)
    );

    let sample = sample_records(path, &text, delimiter)?;
    let has_headers = detect_header(&sample, options.header);
    let width = if has_headers {
        sample.first().map(Vec::len).unwrap_or(0)
    } else {
        sample.iter().map(Vec::len).max().unwrap_or(0)
    };
    let headers = match (has_headers, sample.first()) {
        (true, Some(first)) => first.clone(),
        _ => generate_column_names(width),
    };
    debug!("Detected header row: {has_headers}; columns: {headers:?}");

    let owned_path = path.to_path_buf();
    let skip = usize::from(has_headers);
    let total = count_records(&text, delimiter).saturating_sub(skip);
    let rows = io_utils::open_csv_reader(Cursor::new(text.into_bytes()), delimiter)
        .into_records()
        .filter(|record| !is_blank(record))
        .skip(skip)
        .enumerate()
        .map(move |(idx, record)| {
            let record = record.map_err(|err| {
                ImportError::parse(&owned_path, format!("Reading row {}: {err}", idx + 1))
            })?;
            let values = record.iter().map(RawValue::from_cell).collect();
            Ok(RawRow {
                ordinal: idx + 1,
                values,
            }
            .fit_to(width))
        });

    Ok(Extraction {
        format: SourceFormat::Csv,
        headers,
        has_headers,
        delimiter: Some(delimiter),
        encoding: Some(encoding.name()),
        rows: Box::new(CountedRows {
            inner: rows,
            remaining: total,
        }),
    })
}

fn is_blank(record: &csv::Result<csv::StringRecord>) -> bool {
    matches!(record, Ok(r) if r.iter().all(|f| f.trim().is_empty()))
}

/// Records (malformed ones included) that the row iterator will yield, header row included.
fn count_records(text: &str, delimiter: u8) -> usize {
    io_utils::open_csv_reader(text.as_bytes(), delimiter)
        .records()
        .filter(|record| !is_blank(record))
        .count()
}

/// Gives the filtered record stream an exact length so loaders can report progress totals.
struct CountedRows<I> {
    inner: I,
    remaining: usize,
}

impl<I: Iterator> Iterator for CountedRows<I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.inner.next()?;
        self.remaining = self.remaining.saturating_sub(1);
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

fn sample_records(path: &Path, text: &str, delimiter: u8) -> ImportResult<Vec<Vec<String>>> {
    let mut reader = io_utils::open_csv_reader(text.as_bytes(), delimiter);
    let mut sample = Vec::new();
    for record in reader.records() {
        let record =
            record.map_err(|err| ImportError::parse(path, format!("Malformed CSV: {err}")))?;
        if record.iter().all(|field| field.trim().is_empty()) {
            continue;
        }
        sample.push(record.iter().map(str::to_string).collect());
        if sample.len() >= HEADER_DETECTION_SAMPLE_ROWS {
            break;
        }
    }
    Ok(sample)
}
