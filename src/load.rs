//! Batched, transactional upsert of coerced rows.
//!
//! Rows are coerced against the resolved descriptor, grouped into batches that never repeat a
//! conflict-key value and never exceed the bind-parameter limit, then written with one
//! `INSERT ... ON CONFLICT DO UPDATE` per batch. Every batch commits or rolls back on its own.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use clap::ValueEnum;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sqlx::{
    PgConnection, PgPool, Postgres, QueryBuilder, Row,
    postgres::PgRow,
    query_builder::Separated,
};

use crate::{
    data::{Value, coerce_row},
    error::{ImportError, ImportResult, is_transient},
    extract::RawRow,
    report::{ImportOutcome, ImportReport},
    schema::{ColumnType, ConflictKey, SchemaDescriptor, UPDATED_AT_COLUMN, quote_identifier},
};

/// PostgreSQL's limit on bind parameters in one statement.
pub const MAX_BIND_PARAMETERS: usize = 65_535;
pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_MAX_ATTEMPTS: usize = 3;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// How a batch learns whether each row was inserted or updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutcomeStrategy {
    /// `RETURNING (xmax = 0)` reported by the upsert itself.
    #[default]
    Returning,
    /// Existence query on the conflict key inside the batch transaction.
    PreCheck,
}

#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub batch_size: usize,
    pub strategy: OutcomeStrategy,
    pub max_attempts: usize,
    pub retry_backoff: Duration,
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            strategy: OutcomeStrategy::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            cancel: None,
        }
    }
}

impl LoadOptions {
    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Rows per statement, bounded so binds never exceed [`MAX_BIND_PARAMETERS`].
    pub fn effective_batch_size(&self, column_count: usize) -> usize {
        let limit = MAX_BIND_PARAMETERS / column_count.max(1);
        self.batch_size.clamp(1, limit.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadProgress {
    pub rows_processed: usize,
    pub total_rows: Option<usize>,
    pub batches_committed: usize,
}

#[derive(Debug)]
struct PendingRow {
    ordinal: usize,
    key: String,
    values: Vec<Option<Value>>,
}

struct BatchWriter<'a> {
    pool: &'a PgPool,
    descriptor: &'a SchemaDescriptor,
    key_column: &'a str,
    key_type: ColumnType,
    table: String,
    strategy: OutcomeStrategy,
}

impl BatchWriter<'_> {
    fn upsert_statement(&self, rows: &[PendingRow], returning: bool) -> QueryBuilder<'static, Postgres> {
        let columns = self
            .descriptor
            .columns
            .iter()
            .map(|c| quote_identifier(&c.name))
            .collect::<Vec<_>>();
        let mut builder =
            QueryBuilder::new(format!("INSERT INTO {} ({}) ", self.table, columns.join(", ")));
        builder.push_values(rows, |mut separated, row| {
            for (column, value) in self.descriptor.columns.iter().zip(&row.values) {
                bind_value(&mut separated, column.column_type, value.as_ref());
            }
        });

        let key = quote_identifier(self.key_column);
        let mut assignments = self
            .descriptor
            .columns
            .iter()
            .filter(|c| c.name != self.key_column)
            .map(|c| {
                let name = quote_identifier(&c.name);
                format!("{name} = EXCLUDED.{name}")
            })
            .collect::<Vec<_>>();
        assignments.push(format!("{UPDATED_AT_COLUMN} = now()"));
        builder.push(format!(
            " ON CONFLICT ({key}) DO UPDATE SET {}",
            assignments.join(", ")
        ));
        if returning {
            builder.push(format!(
                " RETURNING {key}::{}, (xmax = 0) AS inserted",
                self.key_type.pg_type()
            ));
        }
        builder
    }

    async fn existing_keys(
        &self,
        conn: &mut PgConnection,
        rows: &[PendingRow],
    ) -> Result<HashSet<String>, sqlx::Error> {
        let key_index = self.key_index();
        let key = quote_identifier(self.key_column);
        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "SELECT {key}::{} FROM {} WHERE {key} IN (",
            self.key_type.pg_type(),
            self.table
        ));
        let mut separated = builder.separated(", ");
        for row in rows {
            bind_value(&mut separated, self.key_type, row.values[key_index].as_ref());
        }
        builder.push(")");
        let found = builder.build().fetch_all(&mut *conn).await?;
        found
            .iter()
            .map(|row| decode_key(row, self.key_type))
            .collect()
    }

    fn key_index(&self) -> usize {
        self.descriptor
            .column_index(self.key_column)
            .unwrap_or_default()
    }

    async fn write_once(&self, rows: &[PendingRow]) -> Result<Vec<ImportOutcome>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let outcomes: Vec<ImportOutcome> = match self.strategy {
            OutcomeStrategy::Returning => {
                let returned = self
                    .upsert_statement(rows, true)
                    .build()
                    .fetch_all(&mut *tx)
                    .await?;
                let mut inserted = HashMap::with_capacity(returned.len());
                for row in &returned {
                    inserted.insert(decode_key(row, self.key_type)?, row.try_get::<bool, _>(1)?);
                }
                rows.iter()
                    .map(|row| match inserted.get(&row.key) {
                        Some(true) => ImportOutcome::inserted(row.ordinal),
                        Some(false) => ImportOutcome::updated(row.ordinal),
                        None => ImportOutcome::rejected(row.ordinal, "database reported no row"),
                    })
                    .collect()
            }
            OutcomeStrategy::PreCheck => {
                let existing = self.existing_keys(&mut tx, rows).await?;
                self.upsert_statement(rows, false)
                    .build()
                    .execute(&mut *tx)
                    .await?;
                rows.iter()
                    .map(|row| {
                        if existing.contains(&row.key) {
                            ImportOutcome::updated(row.ordinal)
                        } else {
                            ImportOutcome::inserted(row.ordinal)
                        }
                    })
                    .collect()
            }
        };
        tx.commit().await?;
        Ok(outcomes)
    }

    /// Writes `rows` in one transaction, retrying transient failures with linear backoff.
    async fn write_with_retry(
        &self,
        rows: &[PendingRow],
        options: &LoadOptions,
    ) -> Result<Vec<ImportOutcome>, (sqlx::Error, usize)> {
        let max_attempts = options.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.write_once(rows).await {
                Ok(outcomes) => return Ok(outcomes),
                Err(err) if is_transient(&err) && attempt < max_attempts => {
                    warn!("Attempt {attempt}/{max_attempts} failed with a transient error: {err}");
                    tokio::time::sleep(options.retry_backoff * attempt as u32).await;
                    attempt += 1;
                }
                Err(err) => return Err((err, attempt)),
            }
        }
    }
}

fn bind_value(
    separated: &mut Separated<'_, 'static, Postgres, &'static str>,
    column_type: ColumnType,
    value: Option<&Value>,
) {
    match value {
        Some(Value::Integer(v)) => separated.push_bind(*v),
        Some(Value::Decimal(v)) => separated.push_bind(*v),
        Some(Value::Boolean(v)) => separated.push_bind(*v),
        Some(Value::Timestamp(v)) => separated.push_bind(*v),
        Some(Value::Text(v)) => separated.push_bind(v.clone()),
        None => match column_type {
            ColumnType::Integer => separated.push_bind(None::<i64>),
            ColumnType::Decimal => separated.push_bind(None::<rust_decimal::Decimal>),
            ColumnType::Boolean => separated.push_bind(None::<bool>),
            ColumnType::Timestamp => separated.push_bind(None::<chrono::NaiveDateTime>),
            ColumnType::Text => separated.push_bind(None::<String>),
        },
    };
}

/// Reads column 0 of a returned row as the canonical key text for `key_type`.
fn decode_key(row: &PgRow, key_type: ColumnType) -> Result<String, sqlx::Error> {
    let value = match key_type {
        ColumnType::Integer => Value::Integer(row.try_get(0)?),
        ColumnType::Decimal => Value::Decimal(row.try_get(0)?),
        ColumnType::Boolean => Value::Boolean(row.try_get(0)?),
        ColumnType::Timestamp => Value::Timestamp(row.try_get(0)?),
        ColumnType::Text => Value::Text(row.try_get(0)?),
    };
    Ok(value.key_text())
}

fn database_message(err: &sqlx::Error) -> String {
    match err {
        sqlx::Error::Database(db) => db.message().to_string(),
        other => other.to_string(),
    }
}

/// Coerces a raw row, rejecting it on a type mismatch or a missing conflict-key value.
fn prepare_row(
    row: RawRow,
    descriptor: &SchemaDescriptor,
    key_index: usize,
    key_column: &str,
) -> Result<PendingRow, ImportOutcome> {
    let values = coerce_row(&row.values, &descriptor.columns)
        .map_err(|err| ImportOutcome::rejected(row.ordinal, err.to_string()))?;
    let key = values[key_index]
        .as_ref()
        .map(Value::key_text)
        .ok_or_else(|| {
            ImportOutcome::rejected(row.ordinal, format!("missing conflict key: {key_column}"))
        })?;
    Ok(PendingRow {
        ordinal: row.ordinal,
        key,
        values,
    })
}

struct LoadRun<'a, F> {
    writer: BatchWriter<'a>,
    options: &'a LoadOptions,
    report: ImportReport,
    progress: F,
    total_rows: Option<usize>,
    batch_number: usize,
}

impl<F: FnMut(&LoadProgress)> LoadRun<'_, F> {
    async fn flush(&mut self, batch: &mut Vec<PendingRow>) {
        if batch.is_empty() {
            return;
        }
        self.batch_number += 1;
        let rows = std::mem::take(batch);
        debug!(
            "Writing batch {} ({} row(s))",
            self.batch_number,
            rows.len()
        );

        match self.writer.write_with_retry(&rows, self.options).await {
            Ok(outcomes) => {
                self.report.extend(outcomes);
                self.report.batches_committed += 1;
            }
            Err((err, attempts)) if is_transient(&err) => {
                let reason = ImportError::BatchWrite {
                    batch: self.batch_number,
                    attempts,
                    reason: err.to_string(),
                }
                .to_string();
                warn!("{reason}; rejecting {} row(s)", rows.len());
                self.report.extend(
                    rows.iter()
                        .map(|row| ImportOutcome::rejected(row.ordinal, reason.clone())),
                );
                self.report.batches_failed += 1;
            }
            Err((err, _)) if rows.len() == 1 => {
                self.report
                    .record(ImportOutcome::rejected(rows[0].ordinal, database_message(&err)));
                self.report.batches_failed += 1;
            }
            Err((err, _)) => {
                warn!(
                    "Batch {} failed ({}); retrying its {} row(s) individually",
                    self.batch_number,
                    database_message(&err),
                    rows.len()
                );
                self.report.batches_failed += 1;
                for row in rows.chunks(1) {
                    match self.writer.write_with_retry(row, self.options).await {
                        Ok(outcomes) => self.report.extend(outcomes),
                        Err((err, _)) => self
                            .report
                            .record(ImportOutcome::rejected(row[0].ordinal, database_message(&err))),
                    }
                }
            }
        }

        (self.progress)(&LoadProgress {
            rows_processed: self.report.rows_read,
            total_rows: self.total_rows,
            batches_committed: self.report.batches_committed,
        });
    }
}

/// Coerces and upserts `rows` into the table described by `descriptor`.
///
/// Row-level and batch-level failures are recorded in the returned report; only an extraction
/// error propagates.
pub async fn load<I, F>(
    pool: &PgPool,
    rows: I,
    descriptor: &SchemaDescriptor,
    key: &ConflictKey,
    options: &LoadOptions,
    progress: F,
) -> ImportResult<ImportReport>
where
    I: Iterator<Item = ImportResult<RawRow>>,
    F: FnMut(&LoadProgress),
{
    let started = Instant::now();
    let key_index = descriptor.column_index(key.column()).ok_or_else(|| {
        ImportError::conflict(key.column(), "conflict key is not one of the imported columns")
    })?;
    let key_type = descriptor.columns[key_index].column_type;
    let batch_size = options.effective_batch_size(descriptor.columns.len());
    let total_rows = match rows.size_hint() {
        (lower, Some(upper)) if lower == upper => Some(lower),
        _ => None,
    };
    info!(
        "Loading into {} in batches of up to {batch_size} row(s), conflict key {key}",
        descriptor.qualified_table()
    );

    let mut run = LoadRun {
        writer: BatchWriter {
            pool,
            descriptor,
            key_column: key.column(),
            key_type,
            table: descriptor.qualified_table(),
            strategy: options.strategy,
        },
        options,
        report: ImportReport::new(format!("{}.{}", descriptor.schema_name, descriptor.table_name)),
        progress,
        total_rows,
        batch_number: 0,
    };

    let mut batch: Vec<PendingRow> = Vec::with_capacity(batch_size);
    let mut batch_keys: HashSet<String> = HashSet::new();
    for row in rows {
        if options.is_cancelled() {
            run.report.cancelled = true;
            break;
        }
        match prepare_row(row?, descriptor, key_index, key.column()) {
            Err(rejected) => run.report.record(rejected),
            Ok(pending) => {
                if batch_keys.contains(&pending.key) {
                    run.flush(&mut batch).await;
                    batch_keys.clear();
                }
                batch_keys.insert(pending.key.clone());
                batch.push(pending);
                if batch.len() >= batch_size {
                    run.flush(&mut batch).await;
                    batch_keys.clear();
                }
            }
        }
    }
    if options.is_cancelled() {
        run.report.cancelled = true;
    }
    if !run.report.cancelled {
        run.flush(&mut batch).await;
    } else {
        warn!(
            "Import cancelled; {} pending row(s) were not written",
            batch.len()
        );
    }

    let mut report = run.report;
    report.rejected.sort_by_key(|outcome| outcome.ordinal);
    report.elapsed = started.elapsed();
    info!(
        "Loaded {}: {} inserted, {} updated, {} rejected",
        report.table,
        report.inserted,
        report.updated,
        report.rejected_count()
    );
    Ok(report)
}
