//! Caller-facing entry points that chain extraction, inference, reconciliation and loading.

use std::{
    path::Path,
    sync::{Arc, atomic::AtomicBool},
};

use log::info;
use sqlx::PgPool;

use crate::{
    config::{ImportConfig, TargetConfig},
    error::ImportResult,
    extract::{self, ExtractOptions, RawRow, RowIter, SourceFormat},
    load::{self, LoadOptions, LoadProgress},
    reconcile::{self, ReconcilePlan},
    report::ImportReport,
    schema::{self, ConflictKey, DEFAULT_SAMPLE_ROWS, InferenceStats, SchemaDescriptor},
};

/// A descriptor inferred from a source together with the rows still to be loaded.
pub struct Inference {
    pub descriptor: SchemaDescriptor,
    pub stats: InferenceStats,
    pub format: SourceFormat,
    pub has_headers: bool,
    pub delimiter: Option<u8>,
    pub encoding: Option<&'static str>,
    /// Every data row of the source, sampled rows included.
    pub rows: Box<dyn Iterator<Item = ImportResult<RawRow>> + Send>,
}

impl std::fmt::Debug for Inference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inference")
            .field("descriptor", &self.descriptor)
            .field("format", &self.format)
            .field("has_headers", &self.has_headers)
            .finish_non_exhaustive()
    }
}

pub fn inspect(
    path: &Path,
    options: &ExtractOptions,
    target: &TargetConfig,
    sample_rows: usize,
) -> ImportResult<Inference> {
    let extraction = extract::extract(path, options)?;
    let mut rows: RowIter = extraction.rows;
    let (descriptor, stats, sampled) = schema::infer_schema(
        &extraction.headers,
        &mut rows,
        sample_rows,
        &target.schema_name,
        &target.table_name,
    )?;
    info!(
        "Inferred {} column(s) from {} sampled row(s) of {:?}",
        descriptor.columns.len(),
        stats.rows_read(),
        path
    );
    Ok(Inference {
        descriptor,
        stats,
        format: extraction.format,
        has_headers: extraction.has_headers,
        delimiter: extraction.delimiter,
        encoding: extraction.encoding,
        rows: Box::new(sampled.into_iter().map(Ok).chain(rows)),
    })
}

pub fn infer(
    path: &Path,
    options: &ExtractOptions,
    target: &TargetConfig,
) -> ImportResult<SchemaDescriptor> {
    inspect(path, options, target, DEFAULT_SAMPLE_ROWS).map(|inference| inference.descriptor)
}

pub async fn reconcile(
    pool: &PgPool,
    descriptor: &SchemaDescriptor,
    key: &ConflictKey,
) -> ImportResult<SchemaDescriptor> {
    reconcile::reconcile(pool, descriptor, key).await
}

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
    load::load(pool, rows, descriptor, key, options, progress).await
}

/// Extraction settings, cancellation and progress reporting for [`import_file_with`].
pub struct ImportRequest<'a, F> {
    pub extract: &'a ExtractOptions,
    pub cancel: Option<Arc<AtomicBool>>,
    pub progress: F,
}

pub async fn import_file(config: &ImportConfig, path: &Path) -> ImportResult<ImportReport> {
    import_file_with(
        config,
        path,
        ImportRequest {
            extract: &ExtractOptions::default(),
            cancel: None,
            progress: |_: &LoadProgress| {},
        },
    )
    .await
}

/// Runs every stage against `path`; reconciliation commits before the first batch loads.
pub async fn import_file_with<F>(
    config: &ImportConfig,
    path: &Path,
    request: ImportRequest<'_, F>,
) -> ImportResult<ImportReport>
where
    F: FnMut(&LoadProgress),
{
    config.validate()?;
    let inference = inspect(path, request.extract, &config.target, config.sample_rows)?;
    let key = ConflictKey::resolve(&inference.descriptor, &config.target.conflict_key)?;
    let pool = config.database.connect().await?;
    let resolved = reconcile(&pool, &inference.descriptor, &key).await?;
    let options = LoadOptions {
        cancel: request.cancel,
        ..config.load_options()
    };
    let report = load(
        &pool,
        inference.rows,
        &resolved,
        &key,
        &options,
        request.progress,
    )
    .await;
    pool.close().await;
    report
}

/// Infers the descriptor and plans reconciliation without changing the database.
pub async fn plan_import(
    config: &ImportConfig,
    path: &Path,
    extract: &ExtractOptions,
) -> ImportResult<(SchemaDescriptor, ReconcilePlan)> {
    config.validate()?;
    let inference = inspect(path, extract, &config.target, config.sample_rows)?;
    let key = ConflictKey::resolve(&inference.descriptor, &config.target.conflict_key)?;
    let pool = config.database.connect().await?;
    let plan = reconcile::preview(&pool, &inference.descriptor, &key).await;
    pool.close().await;
    Ok((inference.descriptor, plan?))
}
