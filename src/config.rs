//! Configuration loader and validator for the movies sync service.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnectOptions;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::connector::RetryPolicy;
use crate::model::Bookmark;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
    #[error("Invalid setting {key}: {reason}")]
    Setting { key: &'static str, reason: String },
    #[error("Unknown connector kind: {0}")]
    UnknownConnector(String),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub retry: Retry,
    pub source: Source,
    pub index: Index,
    pub state: State,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct App {
    pub chunk_size: usize,
    pub bulk_chunk_size: usize,
    pub poll_interval_ms: u64,
    #[serde(default = "default_state_key")]
    pub state_key: String,
    #[serde(default)]
    pub initial: Initial,
}

/// Bookmark written on first run or on reset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Initial {
    pub id: Uuid,
    pub updated_at: DateTime<Utc>,
}

impl Default for Initial {
    fn default() -> Self {
        let sentinel = Bookmark::sentinel();
        Self {
            id: sentinel.last_id,
            updated_at: sentinel.last_updated_at,
        }
    }
}

/// Connection retry budget shared by every backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Retry {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            initial_delay_ms: 100,
            max_delay_ms: 30_000,
        }
    }
}

/// Relational source settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Source {
    pub connector: String,
    pub query_path: String,
    #[serde(default)]
    pub postgres: Option<Postgres>,
    #[serde(default)]
    pub sqlite: Option<Sqlite>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Postgres {
    pub dbname: String,
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sqlite {
    pub path: String,
}

/// Search index settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Index {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_index_name")]
    pub name: String,
}

/// Key-value state store settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct State {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub db: i64,
}

fn default_state_key() -> String {
    "migrate_control".to_string()
}

fn default_index_name() -> String {
    "movies".to_string()
}

impl App {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn initial_bookmark(&self) -> Bookmark {
        Bookmark::new(self.initial.id, self.initial.updated_at)
    }
}

impl Retry {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

impl Postgres {
    /// Options are built field by field so credentials never pass through
    /// URL parsing.
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.dbname)
    }
}

impl Sqlite {
    pub fn url(&self) -> String {
        if self.path.starts_with("sqlite:") {
            self.path.clone()
        } else {
            format!("sqlite://{}", self.path)
        }
    }
}

impl Index {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}/", self.host, self.port)
    }
}

impl State {
    pub fn url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.db)
    }
}

impl Config {
    /// Overlay endpoints and secrets from the environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(pg) = self.source.postgres.as_mut() {
            if let Some(password) = lookup("PG_PASSWORD") {
                pg.password = password;
            }
            if let Some(host) = lookup("PG_HOST") {
                pg.host = host;
            }
        }
        if let Some(host) = lookup("ES_HOST") {
            self.index.host = host;
        }
        if let Some(host) = lookup("RS_HOST") {
            self.state.host = host;
        }
    }
}

/// Load configuration from a YAML file, apply env overrides and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let mut cfg: Config = serde_yaml::from_str(&content)?;
    cfg.apply_env();
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.chunk_size == 0 {
        return Err(ConfigError::Invalid("app.chunk_size must be > 0"));
    }
    if cfg.app.bulk_chunk_size == 0 {
        return Err(ConfigError::Invalid("app.bulk_chunk_size must be > 0"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.app.state_key.trim().is_empty() {
        return Err(ConfigError::Invalid("app.state_key must be non-empty"));
    }

    if cfg.retry.max_attempts == 0 {
        return Err(ConfigError::Invalid("retry.max_attempts must be > 0"));
    }
    if cfg.retry.max_delay_ms < cfg.retry.initial_delay_ms {
        return Err(ConfigError::Invalid(
            "retry.max_delay_ms must be >= retry.initial_delay_ms",
        ));
    }

    if cfg.source.query_path.trim().is_empty() {
        return Err(ConfigError::Invalid("source.query_path must be non-empty"));
    }
    let kind: crate::connector::ConnectorKind = cfg.source.connector.parse()?;
    match kind {
        crate::connector::ConnectorKind::Relational => {
            let Some(pg) = &cfg.source.postgres else {
                return Err(ConfigError::Invalid("source.postgres is required"));
            };
            if pg.dbname.trim().is_empty() {
                return Err(ConfigError::Invalid("source.postgres.dbname must be non-empty"));
            }
            if pg.user.trim().is_empty() {
                return Err(ConfigError::Invalid("source.postgres.user must be non-empty"));
            }
            if pg.host.trim().is_empty() {
                return Err(ConfigError::Invalid("source.postgres.host must be non-empty"));
            }
        }
        crate::connector::ConnectorKind::Embedded => {
            let Some(sqlite) = &cfg.source.sqlite else {
                return Err(ConfigError::Invalid("source.sqlite is required"));
            };
            if sqlite.path.trim().is_empty() {
                return Err(ConfigError::Invalid("source.sqlite.path must be non-empty"));
            }
        }
        _ => {
            return Err(ConfigError::Invalid(
                "source.connector must be relational or embedded",
            ))
        }
    }

    if cfg.index.host.trim().is_empty() {
        return Err(ConfigError::Invalid("index.host must be non-empty"));
    }
    if cfg.index.name.trim().is_empty() {
        return Err(ConfigError::Invalid("index.name must be non-empty"));
    }
    if cfg.state.host.trim().is_empty() {
        return Err(ConfigError::Invalid("state.host must be non-empty"));
    }

    Ok(())
}

/// Returns a complete sample configuration.
pub fn example() -> &'static str {
    r#"app:
  chunk_size: 100
  bulk_chunk_size: 50
  poll_interval_ms: 10000
  state_key: "migrate_control"
  initial:
    id: "00000000-0000-0000-0000-000000000000"
    updated_at: "1970-01-01T00:00:00Z"

retry:
  max_attempts: 30
  initial_delay_ms: 100
  max_delay_ms: 30000

source:
  connector: "relational"
  query_path: "queries/movies.sql"
  postgres:
    dbname: "movies_database"
    user: "app"
    password: "123qwe"
    host: "127.0.0.1"
    port: 5432

index:
  host: "127.0.0.1"
  port: 9200
  name: "movies"

state:
  host: "127.0.0.1"
  port: 6379
  db: 0
"#
}
