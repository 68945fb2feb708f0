//! Run configuration: built-in defaults, an optional YAML file, `.env` plus environment
//! variables, then command-line flags, in increasing precedence.

use std::{fs::File, io::BufReader, path::Path, str::FromStr, time::Duration};

use log::debug;
use serde::{Deserialize, Serialize};
use sqlx::{
    PgPool,
    postgres::{PgConnectOptions, PgPoolOptions},
};

use crate::{
    error::{ImportError, ImportResult},
    load::{DEFAULT_BATCH_SIZE, LoadOptions, OutcomeStrategy},
    schema::DEFAULT_SAMPLE_ROWS,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// A full connection URL; overrides the discrete fields when set.
    #[serde(skip_serializing)]
    pub url: Option<String>,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            name: "postgres".to_string(),
            user: "postgres".to_string(),
            password: None,
            url: None,
            max_connections: 5,
            acquire_timeout_secs: 30,
        }
    }
}

impl DatabaseConfig {
    pub fn connect_options(&self) -> ImportResult<PgConnectOptions> {
        if let Some(url) = self.url.as_deref().filter(|url| !url.trim().is_empty()) {
            return PgConnectOptions::from_str(url)
                .map_err(|err| ImportError::Config(format!("Invalid database URL: {err}")));
        }
        let mut options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.name)
            .username(&self.user);
        if let Some(password) = &self.password {
            options = options.password(password);
        }
        Ok(options)
    }

    /// Connection target without credentials, for log and error messages.
    pub fn describe(&self) -> String {
        match &self.url {
            Some(url) => match url.rsplit_once('@') {
                Some((_, host)) => host.to_string(),
                None => url.clone(),
            },
            None => format!("{}@{}:{}/{}", self.user, self.host, self.port, self.name),
        }
    }

    pub async fn connect(&self) -> ImportResult<PgPool> {
        let options = self.connect_options()?;
        debug!("Connecting to {}", self.describe());
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(Duration::from_secs(self.acquire_timeout_secs))
            .connect_with(options)
            .await
            .map_err(|err| ImportError::Connection(format!("{}: {err}", self.describe())))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TargetConfig {
    pub schema_name: String,
    pub table_name: String,
    pub conflict_key: String,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            schema_name: "data_import_schema".to_string(),
            table_name: "imported_data".to_string(),
            conflict_key: "email".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImportConfig {
    pub database: DatabaseConfig,
    pub target: TargetConfig,
    pub batch_size: usize,
    /// Rows sampled for inference; 0 samples every row.
    pub sample_rows: usize,
    pub strategy: OutcomeStrategy,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            target: TargetConfig::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            sample_rows: DEFAULT_SAMPLE_ROWS,
            strategy: OutcomeStrategy::default(),
        }
    }
}

impl ImportConfig {
    /// Defaults, then `config_file`, then `.env` and the process environment.
    pub fn load(config_file: Option<&Path>) -> ImportResult<Self> {
        let mut config = match config_file {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        if let Ok(path) = dotenvy::dotenv() {
            debug!("Loaded environment from {path:?}");
        }
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> ImportResult<Self> {
        let file = File::open(path)
            .map_err(|err| ImportError::Config(format!("Opening {path:?}: {err}")))?;
        serde_yaml::from_reader(BufReader::new(file))
            .map_err(|err| ImportError::Config(format!("Parsing {path:?}: {err}")))
    }

    /// Overlays values found through `lookup`, which maps variable names to values.
    pub fn apply_env<F>(&mut self, lookup: F) -> ImportResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        if let Some(host) = var("DB_HOST") {
            self.database.host = host;
        }
        if let Some(port) = var("DB_PORT") {
            self.database.port = parse_env("DB_PORT", &port)?;
        }
        if let Some(name) = var("DB_NAME") {
            self.database.name = name;
        }
        if let Some(user) = var("DB_USER") {
            self.database.user = user;
        }
        if let Some(password) = var("DB_PASSWORD") {
            self.database.password = Some(password);
        }
        if let Some(url) = var("DATABASE_URL") {
            self.database.url = Some(url);
        }
        if let Some(schema) = var("SCHEMA_NAME") {
            self.target.schema_name = schema;
        }
        if let Some(table) = var("TABLE_NAME") {
            self.target.table_name = table;
        }
        if let Some(key) = var("CONFLICT_KEY") {
            self.target.conflict_key = key;
        }
        if let Some(batch) = var("BATCH_SIZE") {
            self.batch_size = parse_env("BATCH_SIZE", &batch)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> ImportResult<()> {
        if self.batch_size == 0 {
            return Err(ImportError::Config("batch size must be at least 1".to_string()));
        }
        if self.database.max_connections == 0 {
            return Err(ImportError::Config(
                "max_connections must be at least 1".to_string(),
            ));
        }
        for (label, value) in [
            ("schema name", &self.target.schema_name),
            ("table name", &self.target.table_name),
            ("conflict key", &self.target.conflict_key),
        ] {
            if value.trim().is_empty() {
                return Err(ImportError::Config(format!("{label} must not be empty")));
            }
        }
        Ok(())
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            batch_size: self.batch_size,
            strategy: self.strategy,
            ..LoadOptions::default()
        }
    }
}

fn parse_env<T: FromStr>(name: &str, value: &str) -> ImportResult<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|err| ImportError::Config(format!("{name}='{value}': {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = ImportConfig::default();
        assert_eq!(config.database.describe(), "postgres@localhost:5432/postgres");
        assert_eq!(config.target.schema_name, "data_import_schema");
        assert_eq!(config.target.table_name, "imported_data");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn environment_overrides_defaults() {
        let mut config = ImportConfig::default();
        config
            .apply_env(env(&[
                ("DB_HOST", "db.internal"),
                ("DB_PORT", "6543"),
                ("TABLE_NAME", "customers"),
                ("BATCH_SIZE", "250"),
                ("SCHEMA_NAME", ""),
            ]))
            .unwrap();
        assert_eq!(config.database.host, "db.internal");
        assert_eq!(config.database.port, 6543);
        assert_eq!(config.target.table_name, "customers");
        assert_eq!(config.target.schema_name, "data_import_schema");
        assert_eq!(config.batch_size, 250);
    }

    #[test]
    fn malformed_numbers_are_config_errors() {
        let mut config = ImportConfig::default();
        let err = config.apply_env(env(&[("DB_PORT", "http")])).unwrap_err();
        assert!(matches!(err, ImportError::Config(_)));
    }

    #[test]
    fn validation_rejects_zero_batch_and_empty_names() {
        let mut config = ImportConfig::default();
        config.batch_size = 0;
        assert!(config.validate().is_err());
        let mut config = ImportConfig::default();
        config.target.conflict_key = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn yaml_file_overrides_defaults_partially() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("import.yml");
        std::fs::write(
            &path,
            "target:\n  table_name: orders\n  conflict_key: order_id\nstrategy: pre-check\n",
        )
        .unwrap();
        let config = ImportConfig::from_yaml_file(&path).unwrap();
        assert_eq!(config.target.table_name, "orders");
        assert_eq!(config.target.schema_name, "data_import_schema");
        assert_eq!(config.strategy, OutcomeStrategy::PreCheck);
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
    }

    #[test]
    fn url_takes_precedence_and_is_redacted() {
        let config = DatabaseConfig {
            url: Some("postgres://admin:secret@db:5433/app".to_string()),
            ..DatabaseConfig::default()
        };
        assert!(config.connect_options().is_ok());
        assert_eq!(config.describe(), "db:5433/app");
    }
}
