//! Live-schema introspection and the diff-and-widen reconciliation protocol.
//!
//! [`plan`] is a pure function from the desired [`SchemaDescriptor`] and the introspected
//! [`LiveSchema`] to a list of [`SchemaChange`]s plus the resolved descriptor. [`reconcile`]
//! introspects, plans and executes that list inside one transaction.

use std::fmt;

use log::{debug, info};
use sqlx::{PgConnection, PgPool};

use crate::{
    error::{ImportError, ImportResult},
    schema::{
        CREATED_AT_COLUMN, ColumnSpec, ColumnType, ConflictKey, SURROGATE_KEY_COLUMN,
        SchemaDescriptor, UPDATED_AT_COLUMN, floor_char_boundary, quote_identifier,
    },
};

const MAX_IDENTIFIER_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveColumn {
    pub name: String,
    pub data_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveTable {
    pub columns: Vec<LiveColumn>,
    /// Columns covered by a single-column, non-partial unique index.
    pub unique_columns: Vec<String>,
}

impl LiveTable {
    pub fn column(&self, name: &str) -> Option<&LiveColumn> {
        self.columns.iter().find(|c| c.name == name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveSchema {
    pub schema_exists: bool,
    pub table: Option<LiveTable>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaChange {
    CreateSchema,
    CreateTable { columns: Vec<ColumnSpec>, key: String },
    AddColumn { name: String, column_type: ColumnType },
    WidenColumn { name: String, from: ColumnType, to: ColumnType },
    AddTimestampColumn { name: &'static str },
    AddUniqueConstraint { column: String },
}

impl SchemaChange {
    /// The column a failure of this change should be reported against.
    fn subject(&self) -> &str {
        match self {
            SchemaChange::CreateSchema | SchemaChange::CreateTable { .. } => "<table>",
            SchemaChange::AddColumn { name, .. } | SchemaChange::WidenColumn { name, .. } => {
                name.as_str()
            }
            SchemaChange::AddTimestampColumn { name } => name,
            SchemaChange::AddUniqueConstraint { column } => column.as_str(),
        }
    }

    pub fn to_sql(&self, schema_name: &str, table_name: &str) -> String {
        let table = format!(
            "{}.{}",
            quote_identifier(schema_name),
            quote_identifier(table_name)
        );
        match self {
            SchemaChange::CreateSchema => {
                format!("CREATE SCHEMA IF NOT EXISTS {}", quote_identifier(schema_name))
            }
            SchemaChange::CreateTable { columns, key } => {
                let mut definitions = vec![format!("{SURROGATE_KEY_COLUMN} BIGSERIAL PRIMARY KEY")];
                definitions.extend(columns.iter().map(|column| {
                    format!(
                        "{} {}",
                        quote_identifier(&column.name),
                        column.column_type.pg_type()
                    )
                }));
                definitions.push(timestamp_definition(CREATED_AT_COLUMN));
                definitions.push(timestamp_definition(UPDATED_AT_COLUMN));
                definitions.push(format!(
                    "CONSTRAINT {} UNIQUE ({})",
                    quote_identifier(&unique_constraint_name(table_name, key)),
                    quote_identifier(key)
                ));
                format!(
                    "CREATE TABLE IF NOT EXISTS {table} (\n    {}\n)",
                    definitions.join(",\n    ")
                )
            }
            SchemaChange::AddColumn { name, column_type } => format!(
                "ALTER TABLE {table} ADD COLUMN IF NOT EXISTS {} {}",
                quote_identifier(name),
                column_type.pg_type()
            ),
            SchemaChange::WidenColumn { name, to, .. } => format!(
                "ALTER TABLE {table} ALTER COLUMN {} TYPE {}",
                quote_identifier(name),
                to.pg_type()
            ),
            SchemaChange::AddTimestampColumn { name } => format!(
                "ALTER TABLE {table} ADD COLUMN IF NOT EXISTS {}",
                timestamp_definition(name)
            ),
            SchemaChange::AddUniqueConstraint { column } => format!(
                "ALTER TABLE {table} ADD CONSTRAINT {} UNIQUE ({})",
                quote_identifier(&unique_constraint_name(table_name, column)),
                quote_identifier(column)
            ),
        }
    }
}

impl fmt::Display for SchemaChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaChange::CreateSchema => write!(f, "create schema"),
            SchemaChange::CreateTable { columns, .. } => {
                write!(f, "create table with {} column(s)", columns.len())
            }
            SchemaChange::AddColumn { name, column_type } => {
                write!(f, "add column {name} {column_type}")
            }
            SchemaChange::WidenColumn { name, from, to } => {
                write!(f, "widen column {name} {from} -> {to}")
            }
            SchemaChange::AddTimestampColumn { name } => write!(f, "add column {name} TIMESTAMPTZ"),
            SchemaChange::AddUniqueConstraint { column } => {
                write!(f, "add unique constraint on {column}")
            }
        }
    }
}

fn timestamp_definition(name: &str) -> String {
    format!("{name} TIMESTAMPTZ NOT NULL DEFAULT now()")
}

fn unique_constraint_name(table: &str, column: &str) -> String {
    let mut name = format!("{table}_{column}_key");
    name.truncate(floor_char_boundary(&name, MAX_IDENTIFIER_LEN));
    name
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub changes: Vec<SchemaChange>,
    /// The descriptor with every column carrying the type it will have in the live table.
    pub resolved: SchemaDescriptor,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn statements(&self) -> Vec<String> {
        self.changes
            .iter()
            .map(|change| change.to_sql(&self.resolved.schema_name, &self.resolved.table_name))
            .collect()
    }
}

/// Decides how an existing column of `live` type can hold values inferred as `inferred`.
fn resolve_existing(
    column: &str,
    live: &LiveColumn,
    inferred: ColumnType,
) -> ImportResult<(ColumnType, Option<SchemaChange>)> {
    let Some(live_type) = ColumnType::from_pg_data_type(&live.data_type) else {
        return Err(ImportError::conflict(
            column,
            format!(
                "existing column type '{}' cannot hold {inferred} values",
                live.data_type
            ),
        ));
    };
    match (live_type, inferred) {
        // Already at least as wide; per-row coercion rejects values that still don't fit.
        (live_type, inferred) if live_type >= inferred => Ok((live_type, None)),
        (ColumnType::Integer, ColumnType::Decimal) => Ok((
            ColumnType::Decimal,
            Some(SchemaChange::WidenColumn {
                name: column.to_string(),
                from: ColumnType::Integer,
                to: ColumnType::Decimal,
            }),
        )),
        (live_type, inferred) => Err(ImportError::conflict(
            column,
            format!("existing {live_type} column cannot be widened to hold {inferred} values"),
        )),
    }
}

/// Computes the changes that make the live table a superset of `desired`.
pub fn plan(
    desired: &SchemaDescriptor,
    key: &ConflictKey,
    live: &LiveSchema,
) -> ImportResult<ReconcilePlan> {
    if desired.column(key.column()).is_none() {
        return Err(ImportError::conflict(
            key.column(),
            "conflict key is not one of the imported columns",
        ));
    }

    let mut changes = Vec::new();
    if !live.schema_exists {
        changes.push(SchemaChange::CreateSchema);
    }

    let Some(table) = &live.table else {
        changes.push(SchemaChange::CreateTable {
            columns: desired.columns.clone(),
            key: key.column().to_string(),
        });
        return Ok(ReconcilePlan {
            changes,
            resolved: desired.clone(),
        });
    };

    let mut resolved = desired.clone();
    for column in &mut resolved.columns {
        match table.column(&column.name) {
            Some(existing) => {
                let (resolved_type, change) =
                    resolve_existing(&column.name, existing, column.column_type)?;
                column.column_type = resolved_type;
                changes.extend(change);
            }
            None => changes.push(SchemaChange::AddColumn {
                name: column.name.clone(),
                column_type: column.column_type,
            }),
        }
    }

    for name in [CREATED_AT_COLUMN, UPDATED_AT_COLUMN] {
        if table.column(name).is_none() {
            changes.push(SchemaChange::AddTimestampColumn { name });
        }
    }

    if !table.unique_columns.iter().any(|c| c == key.column()) {
        changes.push(SchemaChange::AddUniqueConstraint {
            column: key.column().to_string(),
        });
    }

    Ok(ReconcilePlan { changes, resolved })
}

/// Reads the schema, columns and single-column unique indexes of the target table.
pub async fn introspect(
    conn: &mut PgConnection,
    schema_name: &str,
    table_name: &str,
) -> ImportResult<LiveSchema> {
    let context = format!("{schema_name}.{table_name}");
    let (schema_exists,): (bool,) = sqlx::query_as(
        "SELECT EXISTS (SELECT 1 FROM information_schema.schemata WHERE schema_name = $1)",
    )
    .bind(schema_name)
    .fetch_one(&mut *conn)
    .await
    .map_err(|err| ImportError::from_sqlx(err, &context))?;

    let columns: Vec<(String, String)> = sqlx::query_as(
        "SELECT column_name::text, data_type::text FROM information_schema.columns \
         WHERE table_schema = $1 AND table_name = $2 ORDER BY ordinal_position",
    )
    .bind(schema_name)
    .bind(table_name)
    .fetch_all(&mut *conn)
    .await
    .map_err(|err| ImportError::from_sqlx(err, &context))?;

    if columns.is_empty() {
        return Ok(LiveSchema {
            schema_exists,
            table: None,
        });
    }

    let unique: Vec<(String,)> = sqlx::query_as(
        "SELECT a.attname::text FROM pg_index i \
         JOIN pg_class c ON c.oid = i.indrelid \
         JOIN pg_namespace n ON n.oid = c.relnamespace \
         JOIN pg_attribute a ON a.attrelid = c.oid AND a.attnum = i.indkey[0] \
         WHERE n.nspname = $1 AND c.relname = $2 \
           AND i.indisunique AND i.indnatts = 1 AND i.indpred IS NULL",
    )
    .bind(schema_name)
    .bind(table_name)
    .fetch_all(&mut *conn)
    .await
    .map_err(|err| ImportError::from_sqlx(err, &context))?;

    Ok(LiveSchema {
        schema_exists,
        table: Some(LiveTable {
            columns: columns
                .into_iter()
                .map(|(name, data_type)| LiveColumn { name, data_type })
                .collect(),
            unique_columns: unique.into_iter().map(|(name,)| name).collect(),
        }),
    })
}

/// Plans reconciliation against the live database without applying anything.
pub async fn preview(
    pool: &PgPool,
    desired: &SchemaDescriptor,
    key: &ConflictKey,
) -> ImportResult<ReconcilePlan> {
    let mut conn = pool
        .acquire()
        .await
        .map_err(|err| ImportError::from_sqlx(err, "acquiring connection"))?;
    let live = introspect(&mut conn, &desired.schema_name, &desired.table_name).await?;
    plan(desired, key, &live)
}

/// Brings the live table in line with `desired` in a single transaction and returns the
/// resolved descriptor.
pub async fn reconcile(
    pool: &PgPool,
    desired: &SchemaDescriptor,
    key: &ConflictKey,
) -> ImportResult<SchemaDescriptor> {
    let qualified = desired.qualified_table();
    let mut tx = pool
        .begin()
        .await
        .map_err(|err| ImportError::from_sqlx(err, "starting reconciliation"))?;

    // Serializes concurrent runs against the same table until commit.
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(&qualified)
        .execute(&mut *tx)
        .await
        .map_err(|err| ImportError::from_sqlx(err, &qualified))?;

    let live = introspect(&mut tx, &desired.schema_name, &desired.table_name).await?;
    let plan = plan(desired, key, &live)?;
    if plan.is_empty() {
        debug!("Table {qualified} already matches the inferred schema");
        tx.commit()
            .await
            .map_err(|err| ImportError::from_sqlx(err, &qualified))?;
        return Ok(plan.resolved);
    }

    for change in &plan.changes {
        let sql = change.to_sql(&desired.schema_name, &desired.table_name);
        debug!("Applying: {sql}");
        sqlx::query(&sql)
            .execute(&mut *tx)
            .await
            .map_err(|err| ImportError::from_sqlx(err, change.subject()))?;
    }
    tx.commit()
        .await
        .map_err(|err| ImportError::from_sqlx(err, &qualified))?;
    info!(
        "Reconciled {qualified}: {}",
        plan.changes
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    );
    Ok(plan.resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(columns: &[(&str, ColumnType)]) -> SchemaDescriptor {
        SchemaDescriptor {
            schema_name: "data_import_schema".to_string(),
            table_name: "people".to_string(),
            columns: columns
                .iter()
                .map(|(name, ty)| ColumnSpec::new(*name, *ty, true))
                .collect(),
        }
    }

    fn live_table(columns: &[(&str, &str)], unique: &[&str]) -> LiveSchema {
        LiveSchema {
            schema_exists: true,
            table: Some(LiveTable {
                columns: columns
                    .iter()
                    .map(|(name, data_type)| LiveColumn {
                        name: name.to_string(),
                        data_type: data_type.to_string(),
                    })
                    .collect(),
                unique_columns: unique.iter().map(|c| c.to_string()).collect(),
            }),
        }
    }

    fn reconciled_people() -> LiveSchema {
        live_table(
            &[
                ("import_id", "bigint"),
                ("email", "text"),
                ("age", "bigint"),
                ("created_at", "timestamp with time zone"),
                ("updated_at", "timestamp with time zone"),
            ],
            &["import_id", "email"],
        )
    }

    #[test]
    fn missing_schema_and_table_are_created() {
        let desired = descriptor(&[("email", ColumnType::Text), ("age", ColumnType::Integer)]);
        let key = ConflictKey::resolve(&desired, "email").unwrap();
        let plan = plan(&desired, &key, &LiveSchema::default()).unwrap();
        assert_eq!(plan.changes.len(), 2);
        assert_eq!(plan.changes[0], SchemaChange::CreateSchema);
        let statements = plan.statements();
        assert_eq!(
            statements[0],
            "CREATE SCHEMA IF NOT EXISTS \"data_import_schema\""
        );
        assert!(statements[1].contains("import_id BIGSERIAL PRIMARY KEY"));
        assert!(statements[1].contains("\"age\" BIGINT"));
        assert!(statements[1].contains("CONSTRAINT \"people_email_key\" UNIQUE (\"email\")"));
        assert!(statements[1].contains("updated_at TIMESTAMPTZ NOT NULL DEFAULT now()"));
    }

    #[test]
    fn reconciled_table_plans_nothing() {
        let desired = descriptor(&[("email", ColumnType::Text), ("age", ColumnType::Integer)]);
        let key = ConflictKey::resolve(&desired, "email").unwrap();
        let plan = plan(&desired, &key, &reconciled_people()).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.resolved, desired);
    }

    #[test]
    fn new_columns_audit_columns_and_key_constraint_are_added() {
        let desired = descriptor(&[("email", ColumnType::Text), ("city", ColumnType::Text)]);
        let key = ConflictKey::resolve(&desired, "email").unwrap();
        let live = live_table(&[("email", "character varying")], &[]);
        let plan = plan(&desired, &key, &live).unwrap();
        assert_eq!(
            plan.changes,
            vec![
                SchemaChange::AddColumn {
                    name: "city".to_string(),
                    column_type: ColumnType::Text
                },
                SchemaChange::AddTimestampColumn { name: "created_at" },
                SchemaChange::AddTimestampColumn { name: "updated_at" },
                SchemaChange::AddUniqueConstraint {
                    column: "email".to_string()
                },
            ]
        );
    }

    #[test]
    fn integer_column_widens_to_numeric() {
        let desired = descriptor(&[("email", ColumnType::Text), ("age", ColumnType::Decimal)]);
        let key = ConflictKey::resolve(&desired, "email").unwrap();
        let plan = plan(&desired, &key, &reconciled_people()).unwrap();
        assert_eq!(
            plan.statements(),
            vec!["ALTER TABLE \"data_import_schema\".\"people\" ALTER COLUMN \"age\" TYPE NUMERIC"]
        );
        assert_eq!(plan.resolved.columns[1].column_type, ColumnType::Decimal);
    }

    #[test]
    fn wider_live_column_is_kept() {
        let desired = descriptor(&[("email", ColumnType::Integer), ("age", ColumnType::Integer)]);
        let key = ConflictKey::resolve(&desired, "email").unwrap();
        let plan = plan(&desired, &key, &reconciled_people()).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.resolved.columns[0].column_type, ColumnType::Text);
    }

    #[test]
    fn boolean_live_column_accepts_integer_flags() {
        let desired = descriptor(&[("email", ColumnType::Text), ("active", ColumnType::Integer)]);
        let key = ConflictKey::resolve(&desired, "email").unwrap();
        let live = live_table(
            &[
                ("email", "text"),
                ("active", "boolean"),
                ("created_at", "timestamp with time zone"),
                ("updated_at", "timestamp with time zone"),
            ],
            &["email"],
        );
        let plan = plan(&desired, &key, &live).unwrap();
        assert!(plan.is_empty(), "{:?}", plan.changes);
        assert_eq!(plan.resolved.columns[1].column_type, ColumnType::Boolean);
    }

    #[test]
    fn timestamp_live_column_keeps_its_type_for_decimals() {
        let desired = descriptor(&[("email", ColumnType::Text), ("seen", ColumnType::Decimal)]);
        let key = ConflictKey::resolve(&desired, "email").unwrap();
        let live = live_table(
            &[("email", "text"), ("seen", "timestamp without time zone")],
            &["email"],
        );
        let plan = plan(&desired, &key, &live).unwrap();
        assert_eq!(plan.resolved.columns[1].column_type, ColumnType::Timestamp);
    }

    #[test]
    fn lossy_live_types_conflict() {
        let desired = descriptor(&[("email", ColumnType::Text), ("seen", ColumnType::Timestamp)]);
        let key = ConflictKey::resolve(&desired, "email").unwrap();
        for data_type in ["date", "real", "double precision"] {
            let live = live_table(&[("email", "text"), ("seen", data_type)], &["email"]);
            let err = plan(&desired, &key, &live).unwrap_err();
            assert!(
                matches!(err, ImportError::SchemaConflict { ref column, .. } if column == "seen"),
                "{data_type}: {err}"
            );
        }
    }

    #[test]
    fn text_data_into_integer_column_conflicts() {
        let desired = descriptor(&[("email", ColumnType::Text), ("age", ColumnType::Text)]);
        let key = ConflictKey::resolve(&desired, "email").unwrap();
        let err = plan(&desired, &key, &reconciled_people()).unwrap_err();
        assert!(matches!(err, ImportError::SchemaConflict { ref column, .. } if column == "age"));
    }

    #[test]
    fn unknown_live_types_conflict() {
        let desired = descriptor(&[("email", ColumnType::Text), ("tags", ColumnType::Text)]);
        let key = ConflictKey::resolve(&desired, "email").unwrap();
        let live = live_table(&[("email", "text"), ("tags", "jsonb")], &["email"]);
        assert!(plan(&desired, &key, &live).is_err());
    }
}
