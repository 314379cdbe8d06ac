mod common;

use common::{instant_retries, MemoryStateStore, RecordingIndex, Source};
use futures::TryStreamExt;
use movies_sync::config::{self, Config};
use movies_sync::connector::{Connection, ConnectorFactory, ConnectorKind};
use movies_sync::db::{BatchReader, QuerySet, SqliteReader};
use movies_sync::error::{ConfigError, SyncError};
use movies_sync::model::{parse_timestamp, Bookmark};
use movies_sync::state::BookmarkStore;
use movies_sync::sync::Syncer;
use std::sync::Arc;
use uuid::Uuid;

fn missing_sqlite_config() -> Arc<Config> {
    let mut cfg: Config = serde_yaml::from_str(config::example()).unwrap();
    cfg.source.connector = "embedded".into();
    cfg.source.sqlite = Some(config::Sqlite {
        path: "/nonexistent-dir/movies.db".into(),
    });
    Arc::new(cfg)
}

#[tokio::test]
async fn embedded_connector_yields_live_handle() {
    let source = Source::new().await;
    let factory = source.factory(10);
    let conn = factory.connect(ConnectorKind::Embedded).await.unwrap();
    assert_eq!(conn.kind(), ConnectorKind::Embedded);
    assert!(matches!(conn, Connection::Embedded(_)));
}

#[tokio::test]
async fn exhausted_retries_surface_connection_error() {
    let factory = ConnectorFactory::with_policy(missing_sqlite_config(), instant_retries(3));
    let err = factory.connect(ConnectorKind::Embedded).await.unwrap_err();
    match err {
        SyncError::Connection(err) => {
            assert_eq!(err.backend, "embedded");
            assert_eq!(err.attempts, 3);
        }
        other => panic!("expected connection error, got {other}"),
    }
}

#[tokio::test]
async fn missing_source_section_is_a_configuration_error() {
    let mut cfg: Config = serde_yaml::from_str(config::example()).unwrap();
    cfg.source.postgres = None;
    let factory = ConnectorFactory::with_policy(Arc::new(cfg), instant_retries(3));

    let err = factory.connect(ConnectorKind::Relational).await.unwrap_err();
    assert!(matches!(err, SyncError::Config(ConfigError::Invalid(msg)) if msg.contains("source.postgres")));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn connection_failure_is_fatal_for_the_loop() {
    let dir = tempfile::tempdir().unwrap();
    let query_path = dir.path().join("q.sql");
    std::fs::write(&query_path, common::QUERY).unwrap();

    let factory = ConnectorFactory::with_policy(missing_sqlite_config(), instant_retries(2));
    let reader = SqliteReader::new(factory);
    let index = RecordingIndex::default();
    let state = MemoryStateStore::default();
    let syncer = Syncer::new(
        &reader,
        &index,
        BookmarkStore::new(&state, "migrate_control", Bookmark::sentinel()),
        QuerySet::new(&query_path),
        10,
    );

    let err = syncer
        .run_until(std::time::Duration::from_secs(3600), std::future::pending())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Connection(_)));
    assert!(err.is_fatal());
    assert!(index.calls().await.is_empty());
}

#[tokio::test]
async fn reader_streams_fixed_size_batches_until_empty() {
    let source = Source::new().await;
    for n in 1..=5 {
        source.insert(n, Some("m"), common::TS).await;
    }
    let reader = SqliteReader::new(source.factory(2));
    let query = movies_sync::db::render(common::QUERY, &Bookmark::sentinel());

    let batches: Vec<_> = reader.read(&query, 2).await.unwrap().try_collect().await.unwrap();
    let sizes: Vec<usize> = batches.iter().map(|b| b.len()).collect();
    assert_eq!(sizes, vec![2, 2, 1]);
    let first_id = batches[0].records[0].fields["id"].as_str().unwrap();
    assert_eq!(first_id, common::id(1).to_string());
}

#[tokio::test]
async fn bookmark_round_trip_and_sentinel_default() {
    let state = MemoryStateStore::default();
    let initial = Bookmark::new(Uuid::nil(), parse_timestamp("2000-01-01T00:00:00Z").unwrap());
    let store = BookmarkStore::new(&state, "migrate_control", initial.clone());

    assert_eq!(store.load().await.unwrap(), initial);

    let bookmark = Bookmark::new(common::id(77), parse_timestamp("2024-05-05T05:05:05Z").unwrap());
    store.save(&bookmark).await.unwrap();
    assert_eq!(store.load().await.unwrap(), bookmark);

    assert_eq!(store.reset().await.unwrap(), initial);
    assert_eq!(store.load().await.unwrap(), initial);
}
