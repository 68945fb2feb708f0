//! Schema model and the inference engine that derives it from sampled rows.
//!
//! This module owns [`SchemaDescriptor`] (the desired shape of the target table),
//! [`ColumnSpec`] per-column metadata, the five-member [`ColumnType`] lattice, and
//! [`infer_schema`], which samples extracted rows to resolve each column's type.
//!
//! ## Responsibilities
//!
//! - Column-name normalization and collision handling
//! - Type inference: the least type in `INTEGER < DECIMAL < BOOLEAN < TIMESTAMP < TEXT` that
//!   every sampled value coerces to
//! - Nullability detection
//! - YAML persistence of descriptors via `serde_yaml`

use std::{
    collections::HashSet,
    fmt,
    fs::File,
    io::BufReader,
    path::Path,
    str::FromStr,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{
    data::coerce_value,
    error::{ImportError, ImportResult},
    extract::{RawRow, RawValue},
};

pub const DEFAULT_SAMPLE_ROWS: usize = 2000;
pub const SURROGATE_KEY_COLUMN: &str = "import_id";
pub const CREATED_AT_COLUMN: &str = "created_at";
pub const UPDATED_AT_COLUMN: &str = "updated_at";
pub const RESERVED_COLUMNS: &[&str] = &[SURROGATE_KEY_COLUMN, CREATED_AT_COLUMN, UPDATED_AT_COLUMN];

/// PostgreSQL truncates identifiers beyond 63 bytes.
const MAX_IDENTIFIER_LEN: usize = 63;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColumnType {
    Integer,
    Decimal,
    Boolean,
    Timestamp,
    Text,
}

impl ColumnType {
    /// All types in widening order.
    pub const ORDERED: [ColumnType; 5] = [
        ColumnType::Integer,
        ColumnType::Decimal,
        ColumnType::Boolean,
        ColumnType::Timestamp,
        ColumnType::Text,
    ];

    pub fn pg_type(self) -> &'static str {
        match self {
            ColumnType::Integer => "BIGINT",
            ColumnType::Decimal => "NUMERIC",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Timestamp => "TIMESTAMP",
            ColumnType::Text => "TEXT",
        }
    }

    /// Maps an `information_schema.columns.data_type` value onto the lattice.
    ///
    /// Types that would silently round what the loader binds (`date`, `real`,
    /// `double precision`) have no mapping, so reconciliation reports them as conflicts.
    pub fn from_pg_data_type(data_type: &str) -> Option<Self> {
        match data_type.trim().to_ascii_lowercase().as_str() {
            "bigint" | "integer" | "smallint" => Some(ColumnType::Integer),
            "numeric" | "decimal" => Some(ColumnType::Decimal),
            "boolean" => Some(ColumnType::Boolean),
            "timestamp without time zone" | "timestamp with time zone" => {
                Some(ColumnType::Timestamp)
            }
            "text" | "character varying" | "character" => Some(ColumnType::Text),
            _ => None,
        }
    }

    fn bit(self) -> u8 {
        1 << (self as u8)
    }

    /// Least upper bound in the widening order.
    pub fn join(self, other: ColumnType) -> ColumnType {
        self.max(other)
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Decimal => "DECIMAL",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Timestamp => "TIMESTAMP",
            ColumnType::Text => "TEXT",
        };
        f.write_str(label)
    }
}

impl FromStr for ColumnType {
    type Err = ImportError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "INTEGER" | "INT" | "BIGINT" => Ok(ColumnType::Integer),
            "DECIMAL" | "NUMERIC" | "FLOAT" => Ok(ColumnType::Decimal),
            "BOOLEAN" | "BOOL" => Ok(ColumnType::Boolean),
            "TIMESTAMP" | "DATETIME" | "DATE" => Ok(ColumnType::Timestamp),
            "TEXT" | "STRING" => Ok(ColumnType::Text),
            other => Err(ImportError::Config(format!("Unknown column type '{other}'"))),
        }
    }
}

/// The set of types a single value coerces to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeSet(u8);

impl TypeSet {
    pub const ALL: TypeSet = TypeSet(0b1_1111);

    pub fn of(raw: &RawValue) -> Self {
        let mask = ColumnType::ORDERED
            .iter()
            .filter(|ty| coerce_value(raw, **ty, "").is_ok())
            .fold(0u8, |acc, ty| acc | ty.bit());
        TypeSet(mask | ColumnType::Text.bit())
    }

    pub fn contains(self, ty: ColumnType) -> bool {
        self.0 & ty.bit() != 0
    }

    pub fn intersect(self, other: TypeSet) -> Self {
        TypeSet(self.0 & other.0)
    }

    /// The narrowest member; TEXT when nothing narrower fits.
    pub fn narrowest(self) -> ColumnType {
        ColumnType::ORDERED
            .into_iter()
            .find(|ty| self.contains(*ty))
            .unwrap_or(ColumnType::Text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(default, rename = "source", skip_serializing_if = "String::is_empty")]
    pub source_label: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_primary_key: bool,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, column_type: ColumnType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            source_label: String::new(),
            column_type,
            nullable,
            is_primary_key: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub schema_name: String,
    pub table_name: String,
    pub columns: Vec<ColumnSpec>,
}

impl SchemaDescriptor {
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn qualified_table(&self) -> String {
        format!(
            "{}.{}",
            quote_identifier(&self.schema_name),
            quote_identifier(&self.table_name)
        )
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Opening schema file {path:?}"))?;
        let reader = BufReader::new(file);
        let descriptor: SchemaDescriptor =
            serde_yaml::from_reader(reader).context("Parsing schema YAML")?;
        descriptor.ensure_unique_names()?;
        Ok(descriptor)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path).with_context(|| format!("Creating schema file {path:?}"))?;
        serde_yaml::to_writer(file, self).context("Writing schema YAML")
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Serializing schema to YAML string")
    }

    fn ensure_unique_names(&self) -> ImportResult<()> {
        let mut seen = HashSet::new();
        for column in &self.columns {
            if !seen.insert(column.name.as_str()) {
                return Err(ImportError::conflict(
                    &column.name,
                    "column name appears more than once",
                ));
            }
        }
        Ok(())
    }
}

/// The column whose unique constraint decides between insert and update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictKey {
    column: String,
}

impl ConflictKey {
    /// Resolves a caller-supplied column label against the descriptor's normalized names.
    pub fn resolve(descriptor: &SchemaDescriptor, label: &str) -> ImportResult<Self> {
        let normalized = normalize_identifier(label);
        let column = descriptor
            .columns
            .iter()
            .find(|c| c.name == normalized || c.source_label == label)
            .ok_or_else(|| {
                ImportError::conflict(
                    label,
                    format!(
                        "conflict key is not a column of the input (available: {})",
                        descriptor.column_names().join(", ")
                    ),
                )
            })?;
        Ok(Self {
            column: column.name.clone(),
        })
    }

    pub fn column(&self) -> &str {
        &self.column
    }
}

impl fmt::Display for ConflictKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.column)
    }
}

pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Lowercases, collapses non-alphanumeric runs into one underscore and trims underscores.
pub fn normalize_identifier(label: &str) -> String {
    let mut normalized = String::with_capacity(label.len());
    let mut pending_separator = false;
    for ch in label.chars() {
        if ch.is_alphanumeric() {
            if pending_separator && !normalized.is_empty() {
                normalized.push('_');
            }
            pending_separator = false;
            normalized.extend(ch.to_lowercase());
        } else {
            pending_separator = true;
        }
    }
    normalized.truncate(floor_char_boundary(&normalized, MAX_IDENTIFIER_LEN - 4));
    normalized.trim_end_matches('_').to_string()
}

/// Largest index `<= max` that does not split a UTF-8 sequence in `text`.
pub(crate) fn floor_char_boundary(text: &str, max: usize) -> usize {
    if max >= text.len() {
        return text.len();
    }
    (0..=max)
        .rev()
        .find(|&idx| text.is_char_boundary(idx))
        .unwrap_or(0)
}

/// Normalized, unique column names for `headers`; loader-managed names count as taken.
pub fn column_names(headers: &[String]) -> Vec<String> {
    let mut used = RESERVED_COLUMNS
        .iter()
        .map(|name| name.to_string())
        .collect::<HashSet<_>>();
    headers
        .iter()
        .enumerate()
        .map(|(idx, header)| {
            let mut base = normalize_identifier(header);
            if base.is_empty() {
                base = format!("column_{}", idx + 1);
            }
            let mut candidate = base.clone();
            let mut suffix = 2usize;
            while used.contains(&candidate) {
                candidate = format!("{base}_{suffix}");
                suffix += 1;
            }
            used.insert(candidate.clone());
            candidate
        })
        .collect()
}

#[derive(Debug, Clone)]
struct ColumnAccumulator {
    accepted: TypeSet,
    non_null: usize,
    nulls: usize,
}

impl ColumnAccumulator {
    fn new() -> Self {
        Self {
            accepted: TypeSet::ALL,
            non_null: 0,
            nulls: 0,
        }
    }

    fn update(&mut self, value: &RawValue) {
        if value.is_null() {
            self.nulls += 1;
            return;
        }
        self.non_null += 1;
        self.accepted = self.accepted.intersect(TypeSet::of(value));
    }

    fn decide(&self) -> ColumnType {
        if self.non_null == 0 {
            return ColumnType::Text;
        }
        self.accepted.narrowest()
    }
}

#[derive(Debug, Clone, Default)]
pub struct InferenceStats {
    sample_values: Vec<Option<String>>,
    rows_read: usize,
}

impl InferenceStats {
    pub fn sample_value(&self, index: usize) -> Option<&str> {
        self.sample_values
            .get(index)
            .and_then(|value| value.as_deref())
    }

    pub fn rows_read(&self) -> usize {
        self.rows_read
    }
}

/// Infers a descriptor from up to `sample_rows` rows (0 reads everything).
///
/// The rows consumed while sampling are returned so callers can replay them ahead of the rest
/// of the stream.
pub fn infer_schema<I>(
    headers: &[String],
    rows: &mut I,
    sample_rows: usize,
    schema_name: &str,
    table_name: &str,
) -> ImportResult<(SchemaDescriptor, InferenceStats, Vec<RawRow>)>
where
    I: Iterator<Item = ImportResult<RawRow>>,
{
    let mut accumulators = vec![ColumnAccumulator::new(); headers.len()];
    let mut samples: Vec<Option<String>> = vec![None; headers.len()];
    let mut sampled = Vec::new();

    while sample_rows == 0 || sampled.len() < sample_rows {
        let Some(row) = rows.next() else {
            break;
        };
        let row = row?;
        for (idx, accumulator) in accumulators.iter_mut().enumerate() {
            let value = row.get(idx);
            accumulator.update(value);
            if samples[idx].is_none() && !value.is_null() {
                samples[idx] = Some(value.as_text().into_owned());
            }
        }
        sampled.push(row);
    }

    let names = column_names(headers);
    let columns = names
        .into_iter()
        .zip(headers)
        .zip(&accumulators)
        .map(|((name, label), accumulator)| ColumnSpec {
            name,
            source_label: label.clone(),
            column_type: accumulator.decide(),
            nullable: accumulator.nulls > 0 || accumulator.non_null == 0,
            is_primary_key: false,
        })
        .collect();

    let descriptor = SchemaDescriptor {
        schema_name: schema_name.to_string(),
        table_name: table_name.to_string(),
        columns,
    };
    let stats = InferenceStats {
        sample_values: samples,
        rows_read: sampled.len(),
    };
    Ok((descriptor, stats, sampled))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn raw_rows(values: &[&[&str]]) -> Vec<ImportResult<RawRow>> {
        values
            .iter()
            .enumerate()
            .map(|(idx, row)| {
                Ok(RawRow {
                    ordinal: idx + 1,
                    values: row.iter().map(|v| RawValue::from_cell(v)).collect(),
                })
            })
            .collect()
    }

    fn infer(headers: &[&str], values: &[&[&str]]) -> SchemaDescriptor {
        let headers = headers.iter().map(|h| h.to_string()).collect::<Vec<_>>();
        let mut rows = raw_rows(values).into_iter();
        infer_schema(&headers, &mut rows, 0, "s", "t").unwrap().0
    }

    #[test]
    fn normalize_identifier_collapses_runs() {
        assert_eq!(normalize_identifier("  Order ID # "), "order_id");
        assert_eq!(normalize_identifier("E-mail--Address"), "e_mail_address");
        assert_eq!(normalize_identifier("$$$"), "");
    }

    #[test]
    fn normalize_identifier_keeps_unicode_letters() {
        assert_eq!(normalize_identifier("Beløp (NOK)"), "beløp_nok");
        assert_eq!(normalize_identifier("Größe"), "größe");
        assert_eq!(normalize_identifier("名前"), "名前");
        let long = "é".repeat(40);
        let normalized = normalize_identifier(&long);
        assert_eq!(normalized, "é".repeat(29));
        assert!(normalized.len() <= 59);
    }

    #[test]
    fn column_names_resolve_collisions_and_placeholders() {
        let headers = ["Name", "name", "", "created_at"]
            .iter()
            .map(|h| h.to_string())
            .collect::<Vec<_>>();
        assert_eq!(
            column_names(&headers),
            vec!["name", "name_2", "column_3", "created_at_2"]
        );
    }

    #[test]
    fn infers_each_member_of_the_lattice() {
        let schema = infer(
            &["id", "price", "active", "seen", "note"],
            &[
                &["1", "1.5", "yes", "2024-01-01", "hello"],
                &["2", "2", "no", "2024-01-02T10:00:00", "3"],
            ],
        );
        let types = schema
            .columns
            .iter()
            .map(|c| c.column_type)
            .collect::<Vec<_>>();
        assert_eq!(
            types,
            vec![
                ColumnType::Integer,
                ColumnType::Decimal,
                ColumnType::Boolean,
                ColumnType::Timestamp,
                ColumnType::Text
            ]
        );
    }

    #[test]
    fn zero_one_columns_stay_integer_until_a_word_appears() {
        let schema = infer(&["flag"], &[&["1"], &["0"]]);
        assert_eq!(schema.columns[0].column_type, ColumnType::Integer);
        let schema = infer(&["flag"], &[&["1"], &["0"], &["yes"]]);
        assert_eq!(schema.columns[0].column_type, ColumnType::Boolean);
        let schema = infer(&["flag"], &[&["2"], &["yes"]]);
        assert_eq!(schema.columns[0].column_type, ColumnType::Text);
    }

    #[test]
    fn empty_column_is_nullable_text() {
        let schema = infer(&["a", "b"], &[&["1", ""], &["2", "NA"]]);
        assert_eq!(schema.columns[1].column_type, ColumnType::Text);
        assert!(schema.columns[1].nullable);
        assert!(!schema.columns[0].nullable);
    }

    #[test]
    fn sampling_limits_rows_and_returns_them() {
        let headers = vec!["n".to_string()];
        let mut rows = raw_rows(&[&["1"], &["2"], &["x"]]).into_iter();
        let (schema, stats, sampled) = infer_schema(&headers, &mut rows, 2, "s", "t").unwrap();
        assert_eq!(schema.columns[0].column_type, ColumnType::Integer);
        assert_eq!(stats.rows_read(), 2);
        assert_eq!(sampled.len(), 2);
        assert_eq!(rows.count(), 1);
    }

    #[test]
    fn conflict_key_resolves_by_label_or_normalized_name() {
        let schema = infer(&["E-Mail", "Age"], &[&["a@x.com", "3"]]);
        assert_eq!(ConflictKey::resolve(&schema, "E-Mail").unwrap().column(), "e_mail");
        assert_eq!(ConflictKey::resolve(&schema, "e_mail").unwrap().column(), "e_mail");
        assert!(matches!(
            ConflictKey::resolve(&schema, "email"),
            Err(ImportError::SchemaConflict { .. })
        ));
    }

    #[test]
    fn descriptor_round_trips_through_yaml() {
        let schema = infer(&["id", "name"], &[&["1", "Ann"]]);
        let yaml = schema.to_yaml_string().unwrap();
        let parsed: SchemaDescriptor = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, schema);
        assert!(yaml.contains("type: INTEGER"));
    }

    proptest! {
        #[test]
        fn integer_columns_widen_to_text_on_any_word(
            values in prop::collection::vec(-100_000i64..100_000, 1..40),
            position in 0usize..40,
        ) {
            let mut cells = values.iter().map(|v| v.to_string()).collect::<Vec<_>>();
            let all_ints = cells.iter().map(|c| vec![c.as_str()]).collect::<Vec<_>>();
            let refs = all_ints.iter().map(|r| r.as_slice()).collect::<Vec<_>>();
            prop_assert_eq!(infer(&["n"], &refs).columns[0].column_type, ColumnType::Integer);

            let at = position % (cells.len() + 1);
            cells.insert(at, "pending".to_string());
            let mixed = cells.iter().map(|c| vec![c.as_str()]).collect::<Vec<_>>();
            let refs = mixed.iter().map(|r| r.as_slice()).collect::<Vec<_>>();
            prop_assert_eq!(infer(&["n"], &refs).columns[0].column_type, ColumnType::Text);
        }
    }
}
