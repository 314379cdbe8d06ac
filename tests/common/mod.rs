#![allow(dead_code)]

use async_trait::async_trait;
use movies_sync::config::{self, Config};
use movies_sync::connector::{ConnectorFactory, RetryPolicy};
use movies_sync::error::{IndexError, SyncError};
use movies_sync::index::IndexWriter;
use movies_sync::model::{Ack, Document};
use movies_sync::state::{StateRecord, StateStore};
use sqlx::{Connection, SqliteConnection};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const QUERY: &str = "SELECT id, title, description, imdb_rating, genres, directors, \
actors_names, writers_names, actors, writers, updated_at
FROM movies
WHERE updated_at > '{last_updated_at}'
   OR (updated_at = '{last_updated_at}' AND id > '{last_id}')
ORDER BY updated_at, id;
";

pub const TS: &str = "2024-01-01T00:00:00+00:00";

pub fn id(n: u128) -> Uuid {
    Uuid::from_u128(n)
}

pub fn instant_retries(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
    }
}

/// On-disk SQLite source plus a query file, both in a temp dir.
pub struct Source {
    pub dir: TempDir,
    pub db_path: PathBuf,
    pub query_path: PathBuf,
}

impl Source {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("movies.db");
        let query_path = dir.path().join("movies.sql");
        std::fs::write(&query_path, QUERY).unwrap();

        let mut conn = connect_rwc(&db_path).await;
        sqlx::query(
            "CREATE TABLE movies (
                id TEXT PRIMARY KEY,
                title TEXT,
                description TEXT,
                imdb_rating REAL,
                genres TEXT,
                directors TEXT,
                actors_names TEXT,
                writers_names TEXT,
                actors TEXT,
                writers TEXT,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&mut conn)
        .await
        .unwrap();
        Self {
            dir,
            db_path,
            query_path,
        }
    }

    pub async fn insert(&self, n: u128, title: Option<&str>, updated_at: &str) {
        let mut conn = connect_rwc(&self.db_path).await;
        sqlx::query(
            "INSERT INTO movies (id, title, imdb_rating, genres, actors, updated_at)
             VALUES (?, ?, 7.1, ?, ?, ?)",
        )
        .bind(id(n).to_string())
        .bind(title)
        .bind(r#"[{"name":"Drama"}]"#)
        .bind(format!(r#"[{{"id":"{}","name":"Actor {n}"}}]"#, id(1000 + n)))
        .bind(updated_at)
        .execute(&mut conn)
        .await
        .unwrap();
    }

    pub fn config(&self, chunk_size: usize) -> Arc<Config> {
        let mut cfg: Config = serde_yaml::from_str(config::example()).unwrap();
        cfg.source.connector = "embedded".into();
        cfg.source.postgres = None;
        cfg.source.sqlite = Some(config::Sqlite {
            path: self.db_path.to_string_lossy().to_string(),
        });
        cfg.source.query_path = self.query_path.to_string_lossy().to_string();
        cfg.app.chunk_size = chunk_size;
        config::validate(&cfg).unwrap();
        Arc::new(cfg)
    }

    pub fn factory(&self, chunk_size: usize) -> ConnectorFactory {
        ConnectorFactory::with_policy(self.config(chunk_size), instant_retries(3))
    }
}

async fn connect_rwc(path: &Path) -> SqliteConnection {
    SqliteConnection::connect(&format!("sqlite://{}?mode=rwc", path.display()))
        .await
        .unwrap()
}

/// Index fake: records every bulk call and fails scripted ids once.
#[derive(Clone, Default)]
pub struct RecordingIndex {
    fail_once: Arc<Mutex<HashSet<Uuid>>>,
    calls: Arc<Mutex<Vec<Vec<Document>>>>,
    stored: Arc<Mutex<HashMap<Uuid, Document>>>,
}

impl RecordingIndex {
    pub fn failing_once(ids: impl IntoIterator<Item = Uuid>) -> Self {
        Self {
            fail_once: Arc::new(Mutex::new(ids.into_iter().collect())),
            ..Default::default()
        }
    }

    pub async fn calls(&self) -> Vec<Vec<Document>> {
        self.calls.lock().await.clone()
    }

    pub async fn upserted_ids(&self) -> Vec<Uuid> {
        self.calls()
            .await
            .into_iter()
            .flatten()
            .map(|doc| doc.id)
            .collect()
    }

    pub async fn stored(&self, id: Uuid) -> Option<Document> {
        self.stored.lock().await.get(&id).cloned()
    }

    pub async fn stored_count(&self) -> usize {
        self.stored.lock().await.len()
    }
}

#[async_trait]
impl IndexWriter for RecordingIndex {
    async fn bulk_upsert(&self, documents: &[Document]) -> Result<Vec<Ack>, IndexError> {
        self.calls.lock().await.push(documents.to_vec());
        let mut fail_once = self.fail_once.lock().await;
        let mut stored = self.stored.lock().await;
        Ok(documents
            .iter()
            .map(|doc| {
                if fail_once.remove(&doc.id) {
                    Ack::failed(doc.id, "simulated rejection")
                } else {
                    stored.insert(doc.id, doc.clone());
                    Ack::ok(doc.id)
                }
            })
            .collect())
    }
}

/// Index fake whose bulk requests always fail as a whole.
pub struct DownIndex;

#[async_trait]
impl IndexWriter for DownIndex {
    async fn bulk_upsert(&self, _documents: &[Document]) -> Result<Vec<Ack>, IndexError> {
        Err(IndexError::Status {
            status: 503,
            body: "unavailable".into(),
        })
    }
}

#[derive(Clone, Default)]
pub struct MemoryStateStore {
    records: Arc<Mutex<HashMap<String, StateRecord>>>,
    writes: Arc<Mutex<usize>>,
}

impl MemoryStateStore {
    pub async fn writes(&self) -> usize {
        *self.writes.lock().await
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<StateRecord>, SyncError> {
        Ok(self.records.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, record: &StateRecord) -> Result<(), SyncError> {
        self.records
            .lock()
            .await
            .entry(key.to_string())
            .or_default()
            .extend(record.clone());
        *self.writes.lock().await += 1;
        Ok(())
    }
}
