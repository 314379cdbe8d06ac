use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::{Map, Number, Value};
use sqlx::sqlite::{Sqlite, SqliteRow};
use sqlx::{Column, Connection, Executor, Row, SqliteConnection, TypeInfo, ValueRef};
use tracing::{debug, instrument};

use super::{BatchReader, BatchStream};
use crate::connector::ConnectorFactory;
use crate::error::{ReadError, SyncError};
use crate::model::{Batch, SourceRecord};

/// Reads the embedded-file source page by page inside one read transaction,
/// so every page sees the same snapshot.
#[derive(Debug, Clone)]
pub struct SqliteReader {
    factory: ConnectorFactory,
}

impl SqliteReader {
    pub fn new(factory: ConnectorFactory) -> Self {
        Self { factory }
    }
}

struct Page {
    conn: SqliteConnection,
    sql: String,
    batch_size: i64,
    offset: i64,
}

#[async_trait]
impl BatchReader for SqliteReader {
    #[instrument(skip_all, fields(batch_size = batch_size))]
    async fn read(&self, query: &str, batch_size: usize) -> Result<BatchStream, SyncError> {
        let mut conn = self.factory.connect_embedded().await?;
        Executor::execute(&mut conn, sqlx::raw_sql("BEGIN"))
            .await
            .map_err(ReadError::from)?;

        let page = Page {
            conn,
            sql: format!("SELECT * FROM ({query}) LIMIT ? OFFSET ?"),
            batch_size: batch_size.max(1) as i64,
            offset: 0,
        };
        Ok(stream::try_unfold(page, next_page).boxed())
    }
}

async fn next_page(mut page: Page) -> Result<Option<(Batch, Page)>, ReadError> {
    let sql = page.sql.clone();
    let query = sqlx::query::<Sqlite>(&sql).bind(page.batch_size).bind(page.offset);
    let rows = Executor::fetch_all(&mut page.conn, query).await?;
    if rows.is_empty() {
        Executor::execute(&mut page.conn, sqlx::raw_sql("COMMIT")).await?;
        page.conn.close().await?;
        debug!(rows_read = page.offset, "source exhausted");
        return Ok(None);
    }
    let records = rows
        .iter()
        .map(decode_row)
        .collect::<Result<Vec<_>, _>>()?;
    page.offset += records.len() as i64;
    Ok(Some((Batch::new(records), page)))
}

/// Map a row to an ordered column -> JSON mapping. TEXT cells holding a JSON
/// array or object (SQLite's json functions return TEXT) become nested values.
fn decode_row(row: &SqliteRow) -> Result<SourceRecord, ReadError> {
    let mut fields = Map::with_capacity(row.columns().len());
    for column in row.columns() {
        let i = column.ordinal();
        let raw = row.try_get_raw(i)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            let type_name = raw.type_info().name().to_string();
            match type_name.as_str() {
                "INTEGER" => Value::from(row.try_get_unchecked::<i64, _>(i)?),
                "REAL" => Number::from_f64(row.try_get_unchecked::<f64, _>(i)?)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
                "BLOB" => {
                    let bytes: Vec<u8> = row.try_get_unchecked(i)?;
                    Value::String(String::from_utf8_lossy(&bytes).into_owned())
                }
                _ => text_value(row.try_get_unchecked::<String, _>(i)?),
            }
        };
        fields.insert(column.name().to_string(), value);
    }
    Ok(SourceRecord::new(fields))
}

fn text_value(text: String) -> Value {
    let trimmed = text.trim_start();
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(nested) = serde_json::from_str::<Value>(&text) {
            return nested;
        }
    }
    Value::String(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_text_becomes_nested() {
        assert_eq!(text_value(r#"[{"name":"Drama"}]"#.into()), json!([{ "name": "Drama" }]));
        assert_eq!(text_value("[not json".into()), json!("[not json"));
        assert_eq!(text_value("plain".into()), json!("plain"));
    }

    #[tokio::test]
    async fn decodes_columns_in_select_order() {
        let mut conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
        let row = sqlx::query(
            "SELECT 'abc' AS id, 7.5 AS imdb_rating, 3 AS n, NULL AS description, json_array('x') AS genres",
        )
        .fetch_one(&mut conn)
        .await
        .unwrap();
        let record = decode_row(&row).unwrap();
        let keys: Vec<&str> = record.fields.keys().map(String::as_str).collect();
        assert_eq!(keys, ["id", "imdb_rating", "n", "description", "genres"]);
        assert_eq!(record.fields["imdb_rating"], json!(7.5));
        assert_eq!(record.fields["n"], json!(3));
        assert!(record.fields["description"].is_null());
        assert_eq!(record.fields["genres"], json!(["x"]));
    }
}
