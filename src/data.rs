//! Typed values and the coercion rules that turn raw scalars into them.
//!
//! The same parsers drive inference (a value "is" a type when it coerces to it) and loading,
//! so a column inferred from a sample never rejects one of its own sampled values.

use std::{fmt, str::FromStr};

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{
    error::{ImportError, ImportResult},
    extract::RawValue,
    schema::{ColumnSpec, ColumnType},
};

/// Date-time layouts tried in order after RFC 3339: ISO-8601 first, then locale variants.
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
    "%m/%d/%Y %H:%M",
    "%d.%m.%Y %H:%M:%S",
    "%d.%m.%Y %H:%M",
    "%d-%m-%Y %H:%M:%S",
];

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d", "%Y/%m/%d", "%d/%m/%Y", "%m/%d/%Y", "%d.%m.%Y", "%d-%m-%Y",
];

const OFFSET_DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%d %H:%M:%S%#z"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Integer(i64),
    Decimal(Decimal),
    Boolean(bool),
    Timestamp(NaiveDateTime),
    Text(String),
}

impl Value {
    pub fn column_type(&self) -> ColumnType {
        match self {
            Value::Integer(_) => ColumnType::Integer,
            Value::Decimal(_) => ColumnType::Decimal,
            Value::Boolean(_) => ColumnType::Boolean,
            Value::Timestamp(_) => ColumnType::Timestamp,
            Value::Text(_) => ColumnType::Text,
        }
    }

    pub fn as_display(&self) -> String {
        match self {
            Value::Integer(i) => i.to_string(),
            Value::Decimal(d) => d.to_string(),
            Value::Boolean(b) => b.to_string(),
            Value::Timestamp(ts) => ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string(),
            Value::Text(s) => s.clone(),
        }
    }

    /// Canonical text used to compare conflict-key values across rows and database results.
    pub fn key_text(&self) -> String {
        match self {
            Value::Decimal(d) => d.normalize().to_string(),
            other => other.as_display(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_display())
    }
}

/// Strips surrounding whitespace and comma thousands separators, returning a plain numeric
/// literal, or `None` when `value` is not a number.
pub fn normalize_numeric(value: &str) -> Option<String> {
    let trimmed = value.trim();
    let (sign, body) = match trimmed.strip_prefix(['-', '+']) {
        Some(rest) => (&trimmed[..1], rest),
        None => ("", trimmed),
    };
    let (mantissa, exponent) = match body.find(['e', 'E']) {
        Some(pos) => (&body[..pos], Some(&body[pos + 1..])),
        None => (body, None),
    };
    let (integer_part, fraction) = match mantissa.split_once('.') {
        Some((int, frac)) => (int, Some(frac)),
        None => (mantissa, None),
    };

    let integer_digits = if integer_part.contains(',') {
        let mut groups = integer_part.split(',');
        let lead = groups.next()?;
        if lead.is_empty() || lead.len() > 3 || !lead.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let mut digits = lead.to_string();
        for group in groups {
            if group.len() != 3 || !group.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            digits.push_str(group);
        }
        digits
    } else {
        if !integer_part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        integer_part.to_string()
    };

    if let Some(frac) = fraction
        && !frac.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    let fraction_len = fraction.map(str::len).unwrap_or(0);
    if integer_digits.is_empty() && fraction_len == 0 {
        return None;
    }
    if let Some(exp) = exponent {
        let digits = exp.strip_prefix(['-', '+']).unwrap_or(exp);
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
    }

    let mut normalized = String::with_capacity(trimmed.len());
    normalized.push_str(sign);
    normalized.push_str(if integer_digits.is_empty() { "0" } else { &integer_digits });
    if let Some(frac) = fraction.filter(|f| !f.is_empty()) {
        normalized.push('.');
        normalized.push_str(frac);
    }
    if let Some(exp) = exponent {
        normalized.push('e');
        normalized.push_str(exp);
    }
    Some(normalized)
}

pub fn parse_integer(value: &str) -> Option<i64> {
    let normalized = normalize_numeric(value)?;
    if normalized.contains(['.', 'e']) {
        return None;
    }
    normalized.parse().ok()
}

pub fn parse_decimal(value: &str) -> Option<Decimal> {
    let normalized = normalize_numeric(value)?;
    if normalized.contains('e') {
        Decimal::from_scientific(&normalized).ok()
    } else {
        Decimal::from_str(&normalized).ok()
    }
}

pub fn looks_like_boolean(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "false" | "t" | "f" | "yes" | "no" | "y" | "n"
    )
}

pub fn parse_boolean(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "1" => Some(true),
        "false" | "f" | "no" | "n" | "0" => Some(false),
        _ => None,
    }
}

/// Parses a timestamp, trying RFC 3339 then the fixed list of layouts. Offsets are normalized
/// to UTC; a bare date means midnight.
pub fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    let trimmed = value.trim();
    if trimmed.len() < 6 {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.naive_utc());
    }
    for fmt in OFFSET_DATETIME_FORMATS {
        if let Ok(parsed) = DateTime::parse_from_str(trimmed, fmt) {
            return Some(parsed.naive_utc());
        }
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Some(parsed);
        }
    }
    DATE_FORMATS.iter().find_map(|fmt| {
        NaiveDate::parse_from_str(trimmed, fmt)
            .ok()
            .map(|date| date.and_time(NaiveTime::MIN))
    })
}

fn mismatch(raw: &RawValue, column: &str) -> ImportError {
    ImportError::RowCoercion {
        value: raw.as_text().into_owned(),
        column: column.to_string(),
    }
}

/// Coerces one raw scalar into `ty`. Nulls and blanks become `None`.
pub fn coerce_value(raw: &RawValue, ty: ColumnType, column: &str) -> ImportResult<Option<Value>> {
    if raw.is_null() {
        return Ok(None);
    }
    let coerced = match (ty, raw) {
        (ColumnType::Text, RawValue::Text(text)) => Some(Value::Text(text.clone())),
        (ColumnType::Text, other) => Some(Value::Text(other.as_text().into_owned())),

        (ColumnType::Integer, RawValue::Integer(i)) => Some(Value::Integer(*i)),
        (ColumnType::Integer, RawValue::Float(f)) if f.fract() == 0.0 && f.abs() < 9.0e15 => {
            Some(Value::Integer(*f as i64))
        }
        (ColumnType::Integer, RawValue::Text(text)) => parse_integer(text).map(Value::Integer),

        (ColumnType::Decimal, RawValue::Integer(i)) => Some(Value::Decimal(Decimal::from(*i))),
        (ColumnType::Decimal, RawValue::Float(f)) if f.is_finite() => {
            parse_decimal(&f.to_string()).map(Value::Decimal)
        }
        (ColumnType::Decimal, RawValue::Text(text)) => parse_decimal(text).map(Value::Decimal),

        (ColumnType::Boolean, RawValue::Boolean(b)) => Some(Value::Boolean(*b)),
        (ColumnType::Boolean, RawValue::Integer(i @ (0 | 1))) => Some(Value::Boolean(*i == 1)),
        (ColumnType::Boolean, RawValue::Text(text)) => parse_boolean(text).map(Value::Boolean),

        (ColumnType::Timestamp, RawValue::Timestamp(ts)) => Some(Value::Timestamp(*ts)),
        (ColumnType::Timestamp, RawValue::Text(text)) => {
            parse_timestamp(text).map(Value::Timestamp)
        }

        _ => None,
    };
    coerced
        .map(Some)
        .ok_or_else(|| mismatch(raw, column))
}

pub fn coerce_row(values: &[RawValue], columns: &[ColumnSpec]) -> ImportResult<Vec<Option<Value>>> {
    columns
        .iter()
        .enumerate()
        .map(|(idx, column)| {
            let raw = values.get(idx).unwrap_or(&RawValue::Null);
            coerce_value(raw, column.column_type, &column.name)
        })
        .collect()
}
