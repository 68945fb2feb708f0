pub mod catalog;
pub mod cli;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod extract;
pub mod io_utils;
pub mod load;
pub mod reconcile;
pub mod report;
pub mod schema;
pub mod table;

use std::{
    env,
    path::Path,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::{LevelFilter, debug, info, warn};

use crate::{
    cli::{Cli, Commands, DatabaseArgs, TableArgs},
    config::ImportConfig,
    engine::ImportRequest,
    load::LoadProgress,
};

static LOGGER: OnceLock<()> = OnceLock::new();

fn init_logging() {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            builder.filter_module("pg_import", LevelFilter::Info);
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
}

pub fn run() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Infer(args) => handle_infer(config_path, &args),
        Commands::Preview(args) => handle_preview(&args),
        Commands::Import(args) => block_on(handle_import(config_path, &args)),
        Commands::Info(args) => block_on(handle_info(config_path, &args)),
        Commands::View(args) => block_on(handle_view(config_path, &args)),
        Commands::Tables(args) => block_on(handle_tables(config_path, &args)),
        Commands::Ping(args) => block_on(handle_ping(config_path, &args)),
    }
}

fn block_on<F: Future<Output = Result<()>>>(future: F) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("Starting async runtime")?;
    runtime.block_on(future)
}

fn load_config(
    config_path: Option<&Path>,
    database: Option<&DatabaseArgs>,
    target: &TableArgs,
) -> Result<ImportConfig> {
    let mut config = ImportConfig::load(config_path).context("Loading configuration")?;
    if let Some(database) = database {
        if let Some(url) = &database.database_url {
            config.database.url = Some(url.clone());
        }
        if let Some(host) = &database.host {
            config.database.host = host.clone();
        }
        if let Some(port) = database.port {
            config.database.port = port;
        }
        if let Some(name) = &database.db_name {
            config.database.name = name.clone();
        }
        if let Some(user) = &database.user {
            config.database.user = user.clone();
        }
        if let Some(max) = database.max_connections {
            config.database.max_connections = max;
        }
    }
    if let Some(schema) = &target.schema {
        config.target.schema_name = schema.clone();
    }
    if let Some(table) = &target.table {
        config.target.table_name = table.clone();
    }
    Ok(config)
}

fn handle_infer(config_path: Option<&Path>, args: &cli::InferArgs) -> Result<()> {
    let mut config = load_config(config_path, None, &args.target)?;
    if let Some(sample_rows) = args.sample_rows {
        config.sample_rows = sample_rows;
    }
    let inference = engine::inspect(
        &args.source.input,
        &args.source.extract_options(),
        &config.target,
        config.sample_rows,
    )
    .with_context(|| format!("Inferring schema from {:?}", args.source.input))?;

    info!(
        "Format: {}; header row: {}; delimiter: {}; encoding: {}",
        inference.format,
        inference.has_headers,
        inference
            .delimiter
            .map(io_utils::printable_delimiter)
            .unwrap_or_else(|| "-".to_string()),
        inference.encoding.unwrap_or("-")
    );
    let headers = ["#", "name", "source", "type", "nullable", "sample"]
        .iter()
        .map(|h| h.to_string())
        .collect::<Vec<_>>();
    let rows = inference
        .descriptor
        .columns
        .iter()
        .enumerate()
        .map(|(idx, column)| {
            vec![
                (idx + 1).to_string(),
                column.name.clone(),
                column.source_label.clone(),
                column.column_type.to_string(),
                column.nullable.to_string(),
                inference
                    .stats
                    .sample_value(idx)
                    .unwrap_or_default()
                    .to_string(),
            ]
        })
        .collect::<Vec<_>>();
    table::print_table(&headers, &rows);

    if let Some(output) = &args.output {
        inference
            .descriptor
            .save(output)
            .with_context(|| format!("Writing schema to {output:?}"))?;
        info!(
            "Inferred schema for {} column(s) written to {:?}",
            inference.descriptor.columns.len(),
            output
        );
    }
    Ok(())
}

fn handle_preview(args: &cli::PreviewArgs) -> Result<()> {
    let extraction = extract::extract(&args.source.input, &args.source.extract_options())
        .with_context(|| format!("Reading {:?}", args.source.input))?;
    let headers = extraction.headers.clone();
    let mut rows = Vec::new();
    for row in extraction.rows.take(args.rows) {
        let row = row?;
        rows.push(
            row.values
                .iter()
                .map(|value| value.as_text().into_owned())
                .collect::<Vec<_>>(),
        );
    }
    table::print_table(&headers, &rows);
    info!(
        "Displayed {} row(s) from {:?}",
        rows.len(),
        args.source.input
    );
    Ok(())
}

fn cancel_on_ctrl_c() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let handle = Arc::clone(&flag);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing the current batch before stopping");
            handle.store(true, Ordering::SeqCst);
        }
    });
    flag
}

async fn handle_import(config_path: Option<&Path>, args: &cli::ImportArgs) -> Result<()> {
    let mut config = load_config(config_path, Some(&args.database), &args.target)?;
    if let Some(key) = &args.conflict_key {
        config.target.conflict_key = key.clone();
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(sample_rows) = args.sample_rows {
        config.sample_rows = sample_rows;
    }
    if let Some(strategy) = args.strategy {
        config.strategy = strategy;
    }
    config.validate()?;
    let extract_options = args.source.extract_options();

    if args.dry_run {
        let (descriptor, plan) =
            engine::plan_import(&config, &args.source.input, &extract_options).await?;
        info!(
            "Dry run for {} ({} column(s))",
            descriptor.qualified_table(),
            descriptor.columns.len()
        );
        if plan.is_empty() {
            println!("-- no schema changes required");
        }
        for statement in plan.statements() {
            println!("{statement};");
        }
        return Ok(());
    }

    let request = ImportRequest {
        extract: &extract_options,
        cancel: Some(cancel_on_ctrl_c()),
        progress: |progress: &LoadProgress| match progress.total_rows {
            Some(total) => info!(
                "Processed {}/{} row(s), {} batch(es) committed",
                progress.rows_processed, total, progress.batches_committed
            ),
            None => info!(
                "Processed {} row(s), {} batch(es) committed",
                progress.rows_processed, progress.batches_committed
            ),
        },
    };
    let report = engine::import_file_with(&config, &args.source.input, request)
        .await
        .with_context(|| format!("Importing {:?}", args.source.input))?;
    print!("{}", report.render());

    if let Some(path) = &args.report {
        let json = serde_json::to_string_pretty(&report).context("Serializing import report")?;
        std::fs::write(path, json).with_context(|| format!("Writing report to {path:?}"))?;
        debug!("Report written to {path:?}");
    }
    if report.is_failed() {
        bail!(
            "no rows were stored ({} rejected)",
            report.rejected_count()
        );
    }
    Ok(())
}

async fn handle_info(config_path: Option<&Path>, args: &cli::InfoArgs) -> Result<()> {
    let config = load_config(config_path, Some(&args.database), &args.target)?;
    let pool = config.database.connect().await?;
    let info = catalog::table_info(&pool, &config.target.schema_name, &config.target.table_name)
        .await;
    pool.close().await;
    let info = info?;

    println!("Table: {}.{}", info.schema_name, info.table_name);
    if !info.exists {
        println!("Exists: no");
        return Ok(());
    }
    println!("Exists: yes");
    println!("Rows: {}", info.row_count);
    let headers = ["column", "type", "unique"]
        .iter()
        .map(|h| h.to_string())
        .collect::<Vec<_>>();
    let rows = info
        .columns
        .iter()
        .map(|column| {
            vec![
                column.name.clone(),
                column.data_type.clone(),
                info.unique_columns.contains(&column.name).to_string(),
            ]
        })
        .collect::<Vec<_>>();
    table::print_table(&headers, &rows);
    Ok(())
}

async fn handle_view(config_path: Option<&Path>, args: &cli::ViewArgs) -> Result<()> {
    let config = load_config(config_path, Some(&args.database), &args.target)?;
    let pool = config.database.connect().await?;
    let sample = catalog::sample_rows(
        &pool,
        &config.target.schema_name,
        &config.target.table_name,
        args.limit,
    )
    .await;
    pool.close().await;

    let qualified = format!(
        "{}.{}",
        config.target.schema_name, config.target.table_name
    );
    let Some(sample) = sample? else {
        bail!("Table {qualified} does not exist");
    };
    if sample.rows.is_empty() {
        info!("Table {qualified} has no rows");
        return Ok(());
    }
    let rows = sample
        .rows
        .into_iter()
        .map(|row| row.into_iter().map(Option::unwrap_or_default).collect())
        .collect::<Vec<Vec<String>>>();
    table::print_table(&sample.columns, &rows);
    info!("Showing {} most recent row(s) of {qualified}", rows.len());
    Ok(())
}

async fn handle_tables(config_path: Option<&Path>, args: &cli::TablesArgs) -> Result<()> {
    let target = TableArgs {
        schema: args.schema.clone(),
        table: None,
    };
    let config = load_config(config_path, Some(&args.database), &target)?;
    let pool = config.database.connect().await?;
    let tables = catalog::list_tables(&pool, &config.target.schema_name).await;
    pool.close().await;
    let tables = tables?;
    if tables.is_empty() {
        info!("No tables in schema '{}'", config.target.schema_name);
    }
    for table in tables {
        println!("{table}");
    }
    Ok(())
}

async fn handle_ping(config_path: Option<&Path>, args: &cli::PingArgs) -> Result<()> {
    let config = load_config(config_path, Some(&args.database), &TableArgs::default())?;
    let pool = config.database.connect().await?;
    let version = catalog::ping(&pool).await;
    pool.close().await;
    println!("Connected to {}: {}", config.database.describe(), version?);
    Ok(())
}
