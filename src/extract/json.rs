use std::{collections::HashMap, path::Path};

use log::info;
use serde_json::{Map, Value};

use super::{Extraction, RawRow, RawValue, SourceFormat};
use crate::{
    error::{ImportError, ImportResult},
    io_utils,
};

const KEY_SEPARATOR: &str = "_";

pub(super) fn extract(path: &Path) -> ImportResult<Extraction> {
    let bytes = io_utils::read_source_bytes(path)?;
    let document: Value = serde_json::from_slice(&bytes)
        .map_err(|err| ImportError::parse(path, format!("Invalid JSON: {err}")))?;
    let (records, source) = locate_records(path, document)?;
    info!(
        "Reading {} JSON record(s) from {:?} ({source})",
        records.len(),
        path
    );

    let mut headers = FlatHeaders::default();
    let mut flattened = Vec::with_capacity(records.len());
    for (idx, record) in records.into_iter().enumerate() {
        let Value::Object(object) = record else {
            return Err(ImportError::parse(
                path,
                format!("Record {} is not an object", idx + 1),
            ));
        };
        let mut fields = Vec::new();
        flatten_object(&mut Vec::new(), object, &mut fields);
        let cells = fields
            .into_iter()
            .map(|(field_path, value)| (headers.column_for(field_path), value))
            .collect::<Vec<_>>();
        flattened.push(cells);
    }

    let width = headers.names.len();
    let rows = flattened
        .into_iter()
        .enumerate()
        .map(move |(idx, cells)| {
            let mut values = vec![RawValue::Null; width];
            for (column, value) in cells {
                values[column] = value;
            }
            Ok(RawRow {
                ordinal: idx + 1,
                values,
            })
        });

    Ok(Extraction {
        format: SourceFormat::Json,
        headers: headers.names,
        has_headers: true,
        delimiter: None,
        encoding: None,
        rows: Box::new(rows),
    })
}

/// Finds the records array: the document itself, or its first array-valued field.
fn locate_records(path: &Path, document: Value) -> ImportResult<(Vec<Value>, String)> {
    match document {
        Value::Array(records) => Ok((records, "top-level array".to_string())),
        Value::Object(object) => object
            .into_iter()
            .find_map(|(key, value)| match value {
                Value::Array(records) => Some((records, format!("field '{key}'"))),
                _ => None,
            })
            .ok_or_else(|| ImportError::parse(path, "JSON object has no array-valued field")),
        _ => Err(ImportError::parse(
            path,
            "Expected an array of objects or an object holding one",
        )),
    }
}

/// Column labels for flattened field paths. Two distinct paths that join to the same label
/// (`{"a_b": 1, "a": {"b": 2}}`) get numbered suffixes, so no value is dropped.
#[derive(Debug, Default)]
struct FlatHeaders {
    names: Vec<String>,
    by_path: HashMap<Vec<String>, usize>,
}

impl FlatHeaders {
    fn column_for(&mut self, field_path: Vec<String>) -> usize {
        if let Some(&column) = self.by_path.get(&field_path) {
            return column;
        }
        let base = field_path.join(KEY_SEPARATOR);
        let mut label = base.clone();
        let mut suffix = 2usize;
        while self.names.contains(&label) {
            label = format!("{base}{KEY_SEPARATOR}{suffix}");
            suffix += 1;
        }
        let column = self.names.len();
        self.names.push(label);
        self.by_path.insert(field_path, column);
        column
    }
}

fn flatten_object(
    prefix: &mut Vec<String>,
    object: Map<String, Value>,
    out: &mut Vec<(Vec<String>, RawValue)>,
) {
    for (key, value) in object {
        prefix.push(key);
        match value {
            Value::Object(nested) => flatten_object(prefix, nested, out),
            other => out.push((prefix.clone(), scalar_value(other))),
        }
        prefix.pop();
    }
}

fn scalar_value(value: Value) -> RawValue {
    match value {
        Value::Null => RawValue::Null,
        Value::Bool(flag) => RawValue::Boolean(flag),
        Value::Number(number) => {
            if let Some(int) = number.as_i64() {
                RawValue::Integer(int)
            } else if number.is_u64() {
                RawValue::Text(number.to_string())
            } else {
                number
                    .as_f64()
                    .map(RawValue::Float)
                    .unwrap_or_else(|| RawValue::Text(number.to_string()))
            }
        }
        Value::String(text) => RawValue::Text(text),
        nested @ (Value::Array(_) | Value::Object(_)) => RawValue::Text(nested.to_string()),
    }
}
