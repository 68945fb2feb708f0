//! Read-only database queries behind the `ping`, `tables`, `info` and `view` commands.

use sqlx::{PgPool, Row};

use crate::{
    error::{ImportError, ImportResult},
    reconcile::{self, LiveColumn},
    schema::{SURROGATE_KEY_COLUMN, UPDATED_AT_COLUMN, quote_identifier},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub schema_name: String,
    pub table_name: String,
    pub exists: bool,
    pub row_count: i64,
    pub columns: Vec<LiveColumn>,
    pub unique_columns: Vec<String>,
}

/// The most recently written rows of a table, every value rendered as text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSample {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

pub async fn ping(pool: &PgPool) -> ImportResult<String> {
    let (version,): (String,) = sqlx::query_as("SELECT version()")
        .fetch_one(pool)
        .await
        .map_err(|err| ImportError::Connection(err.to_string()))?;
    Ok(version)
}

pub async fn list_tables(pool: &PgPool, schema_name: &str) -> ImportResult<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT table_name::text FROM information_schema.tables \
         WHERE table_schema = $1 AND table_type = 'BASE TABLE' ORDER BY table_name",
    )
    .bind(schema_name)
    .fetch_all(pool)
    .await
    .map_err(|err| ImportError::from_sqlx(err, schema_name))?;
    Ok(rows.into_iter().map(|(name,)| name).collect())
}

pub async fn table_info(
    pool: &PgPool,
    schema_name: &str,
    table_name: &str,
) -> ImportResult<TableInfo> {
    let mut conn = pool
        .acquire()
        .await
        .map_err(|err| ImportError::from_sqlx(err, "acquiring connection"))?;
    let live = reconcile::introspect(&mut conn, schema_name, table_name).await?;
    let Some(table) = live.table else {
        return Ok(TableInfo {
            schema_name: schema_name.to_string(),
            table_name: table_name.to_string(),
            exists: false,
            row_count: 0,
            columns: Vec::new(),
            unique_columns: Vec::new(),
        });
    };

    let count_sql = format!(
        "SELECT COUNT(*) FROM {}.{}",
        quote_identifier(schema_name),
        quote_identifier(table_name)
    );
    let (row_count,): (i64,) = sqlx::query_as(&count_sql)
        .fetch_one(&mut *conn)
        .await
        .map_err(|err| ImportError::from_sqlx(err, table_name))?;

    Ok(TableInfo {
        schema_name: schema_name.to_string(),
        table_name: table_name.to_string(),
        exists: true,
        row_count,
        columns: table.columns,
        unique_columns: table.unique_columns,
    })
}

/// Orders newest first by `updated_at`, else by `import_id`, else leaves the order unspecified.
fn sample_query(schema_name: &str, table_name: &str, columns: &[LiveColumn]) -> String {
    let select = columns
        .iter()
        .map(|column| format!("{}::text", quote_identifier(&column.name)))
        .collect::<Vec<_>>()
        .join(", ");
    let has = |name: &str| columns.iter().any(|column| column.name == name);
    let order = [UPDATED_AT_COLUMN, SURROGATE_KEY_COLUMN]
        .into_iter()
        .find(|name| has(*name))
        .map(|name| format!(" ORDER BY {} DESC", quote_identifier(name)))
        .unwrap_or_default();
    format!(
        "SELECT {select} FROM {}.{}{order} LIMIT $1",
        quote_identifier(schema_name),
        quote_identifier(table_name)
    )
}

/// Reads up to `limit` of the latest rows, or `None` when the table does not exist.
pub async fn sample_rows(
    pool: &PgPool,
    schema_name: &str,
    table_name: &str,
    limit: usize,
) -> ImportResult<Option<TableSample>> {
    let mut conn = pool
        .acquire()
        .await
        .map_err(|err| ImportError::from_sqlx(err, "acquiring connection"))?;
    let live = reconcile::introspect(&mut conn, schema_name, table_name).await?;
    let Some(table) = live.table else {
        return Ok(None);
    };
    if table.columns.is_empty() {
        return Ok(Some(TableSample {
            columns: Vec::new(),
            rows: Vec::new(),
        }));
    }

    let sql = sample_query(schema_name, table_name, &table.columns);
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let fetched = sqlx::query(&sql)
        .bind(limit)
        .fetch_all(&mut *conn)
        .await
        .map_err(|err| ImportError::from_sqlx(err, table_name))?;
    let rows = fetched
        .iter()
        .map(|row| {
            (0..table.columns.len())
                .map(|idx| row.try_get::<Option<String>, _>(idx))
                .collect::<Result<Vec<_>, _>>()
        })
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| ImportError::from_sqlx(err, table_name))?;

    Ok(Some(TableSample {
        columns: table.columns.into_iter().map(|column| column.name).collect(),
        rows,
    }))
}
