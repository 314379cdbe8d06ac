//! Relational source: query-set loading and batch readers.
//!
//! - `postgres`: server-side cursor over the relational backend.
//! - `sqlite`: paged reader over the embedded-file backend.
//!
//! Both implement [`BatchReader`]; the orchestrator only sees the trait.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::path::{Path, PathBuf};

use crate::config::ConfigError;
use crate::connector::{ConnectorFactory, ConnectorKind};
use crate::error::{ReadError, SyncError};
use crate::model::{Batch, Bookmark};

pub mod postgres;
pub mod sqlite;

pub use postgres::PostgresReader;
pub use sqlite::SqliteReader;

/// Finite, non-restartable sequence of batches from one query execution.
pub type BatchStream = BoxStream<'static, Result<Batch, ReadError>>;

#[async_trait]
pub trait BatchReader: Send + Sync {
    /// Execute `query` once and stream its rows in batches of `batch_size`.
    /// The stream ends after the first empty fetch.
    async fn read(&self, query: &str, batch_size: usize) -> Result<BatchStream, SyncError>;
}

/// Build the reader matching `source.connector`.
pub fn reader_for(factory: &ConnectorFactory) -> Result<Box<dyn BatchReader>, ConfigError> {
    match factory.config().source.connector.parse::<ConnectorKind>()? {
        ConnectorKind::Relational => Ok(Box::new(PostgresReader::new(factory.clone()))),
        ConnectorKind::Embedded => Ok(Box::new(SqliteReader::new(factory.clone()))),
        _ => Err(ConfigError::Invalid(
            "source.connector must be relational or embedded",
        )),
    }
}

/// External SQL file holding the select statement, re-read every cycle.
#[derive(Debug, Clone)]
pub struct QuerySet {
    path: PathBuf,
}

impl QuerySet {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<String, ReadError> {
        tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| ReadError::QuerySet {
                path: self.path.display().to_string(),
                source,
            })
    }

    pub async fn render(&self, bookmark: &Bookmark) -> Result<String, ReadError> {
        Ok(render(&self.load().await?, bookmark))
    }
}

/// Substitute `{last_id}` and `{last_updated_at}` and drop a trailing `;` so
/// the statement can be wrapped as a subquery. The timestamp keeps the
/// source's own text so string-ordered columns compare like for like.
pub fn render(template: &str, bookmark: &Bookmark) -> String {
    let rendered = template
        .replace("{last_id}", &bookmark.last_id.hyphenated().to_string())
        .replace(
            "{last_updated_at}",
            &bookmark.updated_at_text().replace('\'', "''"),
        );
    rendered
        .trim_end()
        .trim_end_matches(';')
        .trim_end()
        .to_string()
}
