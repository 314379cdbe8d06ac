//! Connector factory: one retry-wrapped entry point per backend.
//!
//! Every handle is an owned connection; dropping it closes the socket, so a
//! scope exit (including `?` on an error) always releases the backend.
//! A failed establishment never yields a handle: an exhausted retry budget
//! is a `SyncError::Connection`, missing or unusable settings are a
//! `SyncError::Config`.

use sqlx::{Connection as _, PgConnection, SqliteConnection};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::config::{Config, ConfigError};
use crate::error::SyncError;
use crate::index::ElasticIndex;

mod retry;

pub use retry::{retry_call, with_backoff, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectorKind {
    Embedded,
    Relational,
    Index,
    KeyValue,
}

impl ConnectorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorKind::Embedded => "embedded",
            ConnectorKind::Relational => "relational",
            ConnectorKind::Index => "index",
            ConnectorKind::KeyValue => "keyvalue",
        }
    }
}

impl fmt::Display for ConnectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectorKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "embedded" | "sqlite" | "sql" => Ok(ConnectorKind::Embedded),
            "relational" | "postgres" | "pg" => Ok(ConnectorKind::Relational),
            "index" | "elasticsearch" | "es" => Ok(ConnectorKind::Index),
            "keyvalue" | "redis" | "rs" => Ok(ConnectorKind::KeyValue),
            _ => Err(ConfigError::UnknownConnector(s.to_string())),
        }
    }
}

/// A live backend connection.
pub enum Connection {
    Embedded(SqliteConnection),
    Relational(PgConnection),
    Index(ElasticIndex),
    KeyValue(redis::aio::MultiplexedConnection),
}

impl Connection {
    pub fn kind(&self) -> ConnectorKind {
        match self {
            Connection::Embedded(_) => ConnectorKind::Embedded,
            Connection::Relational(_) => ConnectorKind::Relational,
            Connection::Index(_) => ConnectorKind::Index,
            Connection::KeyValue(_) => ConnectorKind::KeyValue,
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Connection").field(&self.kind()).finish()
    }
}

#[derive(Debug, Clone)]
pub struct ConnectorFactory {
    cfg: Arc<Config>,
    policy: RetryPolicy,
}

impl ConnectorFactory {
    pub fn new(cfg: Arc<Config>) -> Self {
        let policy = cfg.retry.policy();
        Self { cfg, policy }
    }

    pub fn with_policy(cfg: Arc<Config>, policy: RetryPolicy) -> Self {
        Self { cfg, policy }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    #[instrument(skip(self))]
    pub async fn connect(&self, kind: ConnectorKind) -> Result<Connection, SyncError> {
        let conn = match kind {
            ConnectorKind::Embedded => Connection::Embedded(self.connect_embedded().await?),
            ConnectorKind::Relational => Connection::Relational(self.connect_relational().await?),
            ConnectorKind::Index => Connection::Index(self.connect_index().await?),
            ConnectorKind::KeyValue => Connection::KeyValue(self.connect_keyvalue().await?),
        };
        debug!(backend = %kind, "connected");
        Ok(conn)
    }

    pub async fn connect_embedded(&self) -> Result<SqliteConnection, SyncError> {
        let Some(sqlite) = &self.cfg.source.sqlite else {
            return Err(ConfigError::Invalid("source.sqlite is required").into());
        };
        let url = expand_sqlite_url(&sqlite.url());
        Ok(with_backoff(&self.policy, "embedded", || SqliteConnection::connect(&url)).await?)
    }

    pub async fn connect_relational(&self) -> Result<PgConnection, SyncError> {
        let Some(pg) = &self.cfg.source.postgres else {
            return Err(ConfigError::Invalid("source.postgres is required").into());
        };
        let options = pg.connect_options();
        Ok(with_backoff(&self.policy, "relational", || PgConnection::connect_with(&options)).await?)
    }

    pub async fn connect_index(&self) -> Result<ElasticIndex, SyncError> {
        let index = ElasticIndex::from_config(&self.cfg.index, self.cfg.app.bulk_chunk_size)
            .map_err(|err| unusable_setting("index", err))?
            .with_retry(self.policy);
        with_backoff(&self.policy, "index", || index.ping()).await?;
        Ok(index)
    }

    pub async fn connect_keyvalue(&self) -> Result<redis::aio::MultiplexedConnection, SyncError> {
        let client = redis::Client::open(self.cfg.state.url())
            .map_err(|err| unusable_setting("state", err))?;
        let conn = with_backoff(&self.policy, "keyvalue", || {
            let client = client.clone();
            async move {
                let mut conn = client.get_multiplexed_async_connection().await?;
                redis::cmd("PING")
                    .query_async::<_, String>(&mut conn)
                    .await?;
                Ok::<_, redis::RedisError>(conn)
            }
        })
        .await?;
        Ok(conn)
    }
}

fn unusable_setting(key: &'static str, err: impl fmt::Display) -> SyncError {
    ConfigError::Setting {
        key,
        reason: err.to_string(),
    }
    .into()
}

/// Expand a leading `~/` in a file-backed SQLite URL. In-memory and
/// non-sqlite URLs pass through untouched.
fn expand_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }
    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let Some(home_relative) = path_with_query.strip_prefix("~/") else {
        return url.to_string();
    };
    match std::env::var("HOME") {
        Ok(home) => format!("sqlite://{}/{}", home.trim_end_matches('/'), home_relative),
        Err(_) => url.to_string(),
    }
}
