//! Shapes raw source rows into index documents.
//!
//! Pure and order-preserving: nothing here touches a backend.
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::model::{Batch, Bookmark, Document, Person, SourceRecord};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("required field `{0}` is missing")]
    Missing(&'static str),
    #[error("field `{field}` is malformed: {reason}")]
    Malformed { field: &'static str, reason: String },
}

/// One row after validation, with its place in source order.
#[derive(Debug, Clone, PartialEq)]
pub struct Prepared {
    pub position: Option<Bookmark>,
    pub outcome: Result<Document, ValidationError>,
}

/// Validate a whole batch. Failures stay in place so the caller can still
/// account for the row when moving the bookmark.
pub fn prepare_batch(batch: &Batch, previous: &Bookmark) -> Vec<Prepared> {
    let mut cursor = previous.clone();
    batch
        .records
        .iter()
        .map(|record| {
            let position = record.position(&cursor);
            if let Some(pos) = &position {
                cursor = pos.clone();
            }
            Prepared {
                position,
                outcome: validate(record),
            }
        })
        .collect()
}

pub fn validate(record: &SourceRecord) -> Result<Document, ValidationError> {
    let id = match record.get("id") {
        None => return Err(ValidationError::Missing("id")),
        Some(value) => parse_uuid(value, "id")?,
    };
    let title = match record.get("title") {
        None => return Err(ValidationError::Missing("title")),
        Some(Value::String(s)) => s.clone(),
        Some(other) => return Err(malformed("title", format!("expected string, got {other}"))),
    };

    Ok(Document {
        id,
        title,
        description: record.get("description").and_then(Value::as_str).map(str::to_string),
        imdb_rating: record.get("imdb_rating").and_then(parse_rating),
        genres: names(record, &["genres", "genre"], "genres")?,
        directors: names(record, &["directors", "director"], "directors")?,
        actors_names: names(record, &["actors_names"], "actors_names")?,
        writers_names: names(record, &["writers_names"], "writers_names")?,
        actors: people(record, "actors")?,
        writers: people(record, "writers")?,
    })
}

fn malformed(field: &'static str, reason: impl Into<String>) -> ValidationError {
    ValidationError::Malformed {
        field,
        reason: reason.into(),
    }
}

fn parse_uuid(value: &Value, field: &'static str) -> Result<Uuid, ValidationError> {
    let raw = value
        .as_str()
        .ok_or_else(|| malformed(field, format!("expected UUID string, got {value}")))?;
    Uuid::parse_str(raw).map_err(|err| malformed(field, err.to_string()))
}

fn parse_rating(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

/// First present column among `columns`, as a list of elements. Absent means empty.
fn elements<'a>(
    record: &'a SourceRecord,
    columns: &[&str],
    field: &'static str,
) -> Result<Vec<&'a Value>, ValidationError> {
    let Some(value) = columns.iter().find_map(|c| record.get(c)) else {
        return Ok(Vec::new());
    };
    let Value::Array(items) = value else {
        return Err(malformed(field, format!("expected array, got {value}")));
    };
    // Outer joins aggregated with json_agg yield [null] for "no rows".
    Ok(items.iter().filter(|v| !v.is_null()).collect())
}

fn names(
    record: &SourceRecord,
    columns: &[&str],
    field: &'static str,
) -> Result<Vec<String>, ValidationError> {
    elements(record, columns, field)?
        .into_iter()
        .map(|item| match item {
            Value::String(s) => Ok(s.clone()),
            Value::Object(obj) => obj
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| malformed(field, "element without a string `name`")),
            other => Err(malformed(field, format!("unexpected element {other}"))),
        })
        .collect()
}

fn people(record: &SourceRecord, field: &'static str) -> Result<Vec<Person>, ValidationError> {
    elements(record, &[field], field)?
        .into_iter()
        .map(|item| {
            let id = item
                .get("id")
                .ok_or_else(|| malformed(field, "element without `id`"))
                .and_then(|v| parse_uuid(v, field))?;
            let name = item
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| malformed(field, "element without a string `name`"))?;
            Ok(Person {
                id,
                name: name.to_string(),
            })
        })
        .collect()
}
