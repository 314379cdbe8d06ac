use chrono::{DateTime, FixedOffset, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Persisted replication cursor: the last record whose outcome is settled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Bookmark {
    pub last_id: Uuid,
    pub last_updated_at: DateTime<Utc>,
    /// `updated_at` exactly as the source row carried it. Queries compare
    /// against this text so a source that orders timestamps as strings sees
    /// the same representation it stores.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_text: Option<String>,
}

impl Bookmark {
    pub fn new(last_id: Uuid, last_updated_at: DateTime<Utc>) -> Self {
        Self {
            last_id,
            last_updated_at,
            source_text: None,
        }
    }

    pub fn with_source_text(mut self, text: impl Into<String>) -> Self {
        self.source_text = Some(text.into());
        self
    }

    /// Timestamp as it should appear in a query: the source's own text when
    /// known, RFC3339 otherwise.
    pub fn updated_at_text(&self) -> String {
        match &self.source_text {
            Some(text) => text.clone(),
            None => self
                .last_updated_at
                .to_rfc3339_opts(SecondsFormat::AutoSi, false),
        }
    }

    /// Nil UUID at the Unix epoch.
    pub fn sentinel() -> Self {
        Self::new(Uuid::nil(), DateTime::<Utc>::UNIX_EPOCH)
    }
}

/// One source row as an ordered mapping of column name to value.
///
/// Nested collections arrive pre-aggregated by the query as JSON arrays.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceRecord {
    pub fields: Map<String, Value>,
}

impl SourceRecord {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.fields.get(column).filter(|v| !v.is_null())
    }

    /// Position of this row in source order, if its id is readable.
    ///
    /// A missing or unreadable `updated_at` keeps the previous timestamp.
    pub fn position(&self, previous: &Bookmark) -> Option<Bookmark> {
        let id = self
            .get("id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())?;
        let parsed = self
            .get("updated_at")
            .and_then(Value::as_str)
            .and_then(|text| parse_timestamp(text).map(|at| (at, text)));
        Some(match parsed {
            Some((at, text)) => Bookmark::new(id, at).with_source_text(text),
            None => Bookmark {
                last_id: id,
                ..previous.clone()
            },
        })
    }
}

impl From<Map<String, Value>> for SourceRecord {
    fn from(fields: Map<String, Value>) -> Self {
        Self::new(fields)
    }
}

/// Ordered, bounded group of source rows moved through one pipeline pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub records: Vec<SourceRecord>,
}

impl Batch {
    pub fn new(records: Vec<SourceRecord>) -> Self {
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Person {
    pub id: Uuid,
    pub name: String,
}

/// Search index document for one movie.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub imdb_rating: Option<f64>,
    pub genres: Vec<String>,
    pub directors: Vec<String>,
    pub actors_names: Vec<String>,
    pub writers_names: Vec<String>,
    pub actors: Vec<Person>,
    pub writers: Vec<Person>,
}

/// Per-document outcome of a bulk upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    pub id: Uuid,
    pub success: bool,
    pub detail: Option<String>,
}

impl Ack {
    pub fn ok(id: Uuid) -> Self {
        Self {
            id,
            success: true,
            detail: None,
        }
    }

    pub fn failed(id: Uuid, detail: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            detail: Some(detail.into()),
        }
    }
}

/// Accepts RFC3339 and the `YYYY-MM-DD HH:MM:SS[.f][+zz]` form Postgres prints.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"] {
        if let Ok(ts) = DateTime::<FixedOffset>::parse_from_str(raw, fmt) {
            return Some(ts.with_timezone(&Utc));
        }
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> SourceRecord {
        match value {
            Value::Object(map) => SourceRecord::new(map),
            _ => panic!("record must be an object"),
        }
    }

    #[test]
    fn position_reads_id_and_timestamp() {
        let rec = record(json!({
            "id": "00000000-0000-0000-0000-000000000003",
            "updated_at": "2024-03-01T10:00:00+00:00",
        }));
        let pos = rec.position(&Bookmark::sentinel()).unwrap();
        assert_eq!(pos.last_id.as_u128(), 3);
        assert_eq!(pos.last_updated_at.to_rfc3339(), "2024-03-01T10:00:00+00:00");
    }

    #[test]
    fn position_keeps_previous_timestamp_when_missing() {
        let prev = Bookmark::new(Uuid::nil(), parse_timestamp("2024-01-01T00:00:00Z").unwrap());
        let rec = record(json!({ "id": "00000000-0000-0000-0000-000000000009" }));
        let pos = rec.position(&prev).unwrap();
        assert_eq!(pos.last_updated_at, prev.last_updated_at);
        assert_eq!(pos.last_id.as_u128(), 9);
    }

    #[test]
    fn position_keeps_source_timestamp_text() {
        let rec = record(json!({
            "id": "00000000-0000-0000-0000-000000000004",
            "updated_at": "2021-06-16 20:14:09.221838+00",
        }));
        let pos = rec.position(&Bookmark::sentinel()).unwrap();
        assert_eq!(pos.updated_at_text(), "2021-06-16 20:14:09.221838+00");

        let next = record(json!({ "id": "00000000-0000-0000-0000-000000000005" }));
        assert_eq!(next.position(&pos).unwrap().updated_at_text(), "2021-06-16 20:14:09.221838+00");
    }

    #[test]
    fn configured_bookmark_renders_as_rfc3339() {
        assert_eq!(Bookmark::sentinel().updated_at_text(), "1970-01-01T00:00:00+00:00");
    }

    #[test]
    fn position_requires_uuid() {
        let rec = record(json!({ "id": "not-a-uuid", "updated_at": "2024-01-01T00:00:00Z" }));
        assert!(rec.position(&Bookmark::sentinel()).is_none());
    }

    #[test]
    fn parses_postgres_timestamps() {
        let a = parse_timestamp("2021-06-16 20:14:09.221838+00").unwrap();
        let b = parse_timestamp("2021-06-16T20:14:09.221838+00:00").unwrap();
        assert_eq!(a, b);
        assert!(parse_timestamp("2021-06-16 20:14:09").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }
}
