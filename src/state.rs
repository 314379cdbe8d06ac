//! Replication state kept in the key-value store.
//!
//! One hash per key; the bookmark lives under `app.state_key` with fields
//! `id`, `updated_at` and `updated_at_source` (the source's own timestamp
//! text, empty when unknown). Single writer assumed, no locking.
use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::connector::{retry_call, ConnectorFactory};
use crate::error::{StateError, SyncError};
use crate::model::{parse_timestamp, Bookmark};

pub type StateRecord = HashMap<String, String>;

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<StateRecord>, SyncError>;
    async fn set(&self, key: &str, record: &StateRecord) -> Result<(), SyncError>;
}

/// Redis-backed store. Each call opens a scoped connection through the
/// factory, so a restarted Redis is picked up on the next call.
#[derive(Debug, Clone)]
pub struct RedisStateStore {
    factory: ConnectorFactory,
}

impl RedisStateStore {
    pub fn new(factory: ConnectorFactory) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Option<StateRecord>, SyncError> {
        let factory = &self.factory;
        let record: StateRecord = retry_call(factory.policy(), "keyvalue", transient, move || async move {
            let mut conn = factory.connect_keyvalue().await?;
            let record: StateRecord = conn.hgetall(key).await.map_err(StateError::from)?;
            Ok(record)
        })
        .await?;
        Ok((!record.is_empty()).then_some(record))
    }

    #[instrument(skip(self, record))]
    async fn set(&self, key: &str, record: &StateRecord) -> Result<(), SyncError> {
        let factory = &self.factory;
        let pairs: Vec<(&str, &str)> = record
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let pairs = &pairs[..];
        retry_call(factory.policy(), "keyvalue", transient, move || async move {
            let mut conn = factory.connect_keyvalue().await?;
            conn.hset_multiple::<_, _, _, ()>(key, pairs)
                .await
                .map_err(StateError::from)?;
            Ok(())
        })
        .await
    }
}

/// Commands are re-sent over a fresh connection when the link dropped or
/// timed out mid-call. An unreachable server is already a connection error.
fn transient(err: &SyncError) -> bool {
    matches!(err, SyncError::State(err) if err.is_transient())
}

/// Typed view of the bookmark record.
pub struct BookmarkStore<'a> {
    store: &'a dyn StateStore,
    key: String,
    initial: Bookmark,
}

impl<'a> BookmarkStore<'a> {
    pub fn new(store: &'a dyn StateStore, key: impl Into<String>, initial: Bookmark) -> Self {
        Self {
            store,
            key: key.into(),
            initial,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Stored bookmark, or the configured sentinel when nothing is stored yet.
    pub async fn load(&self) -> Result<Bookmark, SyncError> {
        match self.store.get(&self.key).await? {
            Some(record) => {
                let bookmark = decode(&self.key, &record)?;
                debug!(last_id = %bookmark.last_id, last_updated_at = %bookmark.last_updated_at, "bookmark loaded");
                Ok(bookmark)
            }
            None => {
                info!(key = %self.key, "no bookmark stored; starting from sentinel");
                Ok(self.initial.clone())
            }
        }
    }

    pub async fn save(&self, bookmark: &Bookmark) -> Result<(), SyncError> {
        self.store.set(&self.key, &encode(bookmark)).await?;
        debug!(last_id = %bookmark.last_id, last_updated_at = %bookmark.last_updated_at, "bookmark saved");
        Ok(())
    }

    pub async fn reset(&self) -> Result<Bookmark, SyncError> {
        self.save(&self.initial).await?;
        info!(key = %self.key, "bookmark reset to sentinel");
        Ok(self.initial.clone())
    }
}

pub fn encode(bookmark: &Bookmark) -> StateRecord {
    HashMap::from([
        ("id".to_string(), bookmark.last_id.to_string()),
        ("updated_at".to_string(), bookmark.last_updated_at.to_rfc3339()),
        (
            "updated_at_source".to_string(),
            bookmark.source_text.clone().unwrap_or_default(),
        ),
    ])
}

pub fn decode(key: &str, record: &StateRecord) -> Result<Bookmark, StateError> {
    let malformed = |reason: String| StateError::Malformed {
        key: key.to_string(),
        reason,
    };
    let id = record
        .get("id")
        .ok_or_else(|| malformed("missing field `id`".into()))?;
    let id = Uuid::parse_str(id).map_err(|err| malformed(format!("bad id {id:?}: {err}")))?;
    let updated_at = record
        .get("updated_at")
        .ok_or_else(|| malformed("missing field `updated_at`".into()))?;
    let updated_at = parse_timestamp(updated_at)
        .ok_or_else(|| malformed(format!("bad updated_at {updated_at:?}")))?;
    let mut bookmark = Bookmark::new(id, updated_at);
    if let Some(text) = record.get("updated_at_source").filter(|t| !t.is_empty()) {
        bookmark = bookmark.with_source_text(text.as_str());
    }
    Ok(bookmark)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let bookmark = Bookmark::new(
            Uuid::from_u128(42),
            parse_timestamp("2023-05-06T07:08:09.5Z").unwrap(),
        );
        let record = encode(&bookmark);
        assert_eq!(record["id"], "00000000-0000-0000-0000-00000000002a");
        assert_eq!(decode("k", &record).unwrap(), bookmark);
    }

    #[test]
    fn source_text_survives_and_is_cleared_on_overwrite() {
        let held = Bookmark::new(
            Uuid::from_u128(2),
            parse_timestamp("2021-06-16 20:14:02.000000+00").unwrap(),
        )
        .with_source_text("2021-06-16 20:14:02.000000+00");
        let mut stored = encode(&held);
        assert_eq!(decode("k", &stored).unwrap(), held);

        // HSET merges fields, so a later write without source text must blank it.
        stored.extend(encode(&Bookmark::sentinel()));
        assert_eq!(decode("k", &stored).unwrap(), Bookmark::sentinel());
    }

    #[test]
    fn dropped_links_are_retried_but_bad_records_are_not() {
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        assert!(transient(&SyncError::State(StateError::Redis(reset.into()))));
        assert!(!transient(&SyncError::State(StateError::Malformed {
            key: "k".into(),
            reason: "bad id".into(),
        })));
    }

    #[test]
    fn decode_accepts_python_style_timestamps() {
        let record = HashMap::from([
            ("id".to_string(), Uuid::nil().to_string()),
            ("updated_at".to_string(), "2021-06-16 20:14:09.221838".to_string()),
        ]);
        assert!(decode("k", &record).is_ok());
    }

    #[test]
    fn decode_rejects_malformed_records() {
        let record = HashMap::from([("id".to_string(), "nope".to_string())]);
        assert!(matches!(
            decode("migrate_control", &record),
            Err(StateError::Malformed { key, .. }) if key == "migrate_control"
        ));
    }
}
