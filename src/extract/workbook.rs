use std::path::Path;

use calamine::{Data, Reader, open_workbook_auto};
use log::{info, warn};

use super::{
    ExtractOptions, Extraction, HEADER_DETECTION_SAMPLE_ROWS, RawRow, RawValue, SourceFormat,
    detect_header, generate_column_names,
};
use crate::{
    data::parse_timestamp,
    error::{ImportError, ImportResult},
};

/// Largest float that still converts to `i64` without saturating.
const MAX_EXACT_INTEGER: f64 = 9_007_199_254_740_992.0;

pub(super) fn extract(path: &Path, options: &ExtractOptions) -> ImportResult<Extraction> {
    let mut workbook = open_workbook_auto(path)
        .map_err(|err| ImportError::parse(path, format!("Opening workbook: {err}")))?;
    let sheet_names = workbook.sheet_names();
    if sheet_names.len() > 1 {
        warn!(
            "Workbook {:?} has {} worksheets; only '{}' is imported",
            path,
            sheet_names.len(),
            sheet_names[0]
        );
    }
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| ImportError::parse(path, "Workbook has no worksheets"))?
        .map_err(|err| ImportError::parse(path, format!("Reading first worksheet: {err}")))?;

    let grid = range
        .rows()
        .map(|row| row.iter().map(cell_value).collect::<Vec<_>>())
        .filter(|row| !row.iter().all(RawValue::is_null))
        .collect::<Vec<_>>();

    let sample = grid
        .iter()
        .take(HEADER_DETECTION_SAMPLE_ROWS)
        .map(|row| row.iter().map(|v| v.as_text().into_owned()).collect())
        .collect::<Vec<Vec<String>>>();
    let has_headers = !grid.is_empty() && detect_header(&sample, options.header);
    let width = grid.iter().map(Vec::len).max().unwrap_or(0);
    let headers = match (has_headers, sample.first()) {
        (true, Some(first)) => first.clone(),
        _ => generate_column_names(width),
    };
    info!(
        "Reading worksheet '{}' of {:?} ({} data row(s))",
        sheet_names.first().map(String::as_str).unwrap_or_default(),
        path,
        grid.len() - usize::from(has_headers)
    );

    let header_width = headers.len();
    let rows = grid
        .into_iter()
        .skip(usize::from(has_headers))
        .enumerate()
        .map(move |(idx, values)| {
            Ok(RawRow {
                ordinal: idx + 1,
                values,
            }
            .fit_to(header_width))
        });

    Ok(Extraction {
        format: SourceFormat::Excel,
        headers,
        has_headers,
        delimiter: None,
        encoding: None,
        rows: Box::new(rows),
    })
}

fn cell_value(cell: &Data) -> RawValue {
    match cell {
        Data::Empty | Data::Error(_) => RawValue::Null,
        Data::String(text) => RawValue::from_cell(text),
        Data::Int(value) => RawValue::Integer(*value),
        Data::Float(value) => {
            if value.fract() == 0.0 && value.abs() < MAX_EXACT_INTEGER {
                RawValue::Integer(*value as i64)
            } else {
                RawValue::Float(*value)
            }
        }
        Data::Bool(value) => RawValue::Boolean(*value),
        Data::DateTime(value) => value
            .as_datetime()
            .map(RawValue::Timestamp)
            .unwrap_or(RawValue::Null),
        Data::DateTimeIso(text) => parse_timestamp(text)
            .map(RawValue::Timestamp)
            .unwrap_or_else(|| RawValue::Text(text.clone())),
        Data::DurationIso(text) => RawValue::Text(text.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_floats_become_integers() {
        assert_eq!(cell_value(&Data::Float(42.0)), RawValue::Integer(42));
        assert_eq!(cell_value(&Data::Float(4.5)), RawValue::Float(4.5));
    }

    #[test]
    fn error_and_blank_cells_are_null() {
        assert_eq!(cell_value(&Data::Empty), RawValue::Null);
        assert_eq!(cell_value(&Data::String("n/a".to_string())), RawValue::Null);
    }
}
