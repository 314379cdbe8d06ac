use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{Connection, Executor, PgConnection, Row};
use tracing::{debug, instrument};

use super::{BatchReader, BatchStream};
use crate::connector::ConnectorFactory;
use crate::error::{ReadError, SyncError};
use crate::model::{Batch, SourceRecord};

const CURSOR: &str = "movies_sync_cursor";

/// Reads the relational source through a server-side cursor.
///
/// The rendered query runs once inside a read-only transaction; every row is
/// projected to a single JSON object with `row_to_json`, so column order and
/// nested aggregates survive unchanged.
#[derive(Debug, Clone)]
pub struct PostgresReader {
    factory: ConnectorFactory,
}

impl PostgresReader {
    pub fn new(factory: ConnectorFactory) -> Self {
        Self { factory }
    }
}

pub fn declare_statement(query: &str) -> String {
    format!(
        "BEGIN READ ONLY; DECLARE {CURSOR} NO SCROLL CURSOR FOR \
         SELECT row_to_json(src)::text AS record FROM ({query}) AS src"
    )
}

pub fn fetch_statement(batch_size: usize) -> String {
    format!("FETCH FORWARD {} FROM {CURSOR}", batch_size.max(1))
}

#[async_trait]
impl BatchReader for PostgresReader {
    #[instrument(skip_all, fields(batch_size = batch_size))]
    async fn read(&self, query: &str, batch_size: usize) -> Result<BatchStream, SyncError> {
        let mut conn = self.factory.connect_relational().await?;
        let declare = declare_statement(query);
        Executor::execute(&mut conn, sqlx::raw_sql(&declare))
            .await
            .map_err(ReadError::from)?;
        debug!("cursor declared");

        let fetch = fetch_statement(batch_size);
        let batches = stream::try_unfold((conn, fetch), |(conn, fetch)| next_batch(conn, fetch));
        Ok(batches.boxed())
    }
}

async fn next_batch(
    mut conn: PgConnection,
    fetch: String,
) -> Result<Option<(Batch, (PgConnection, String))>, ReadError> {
    let rows = Executor::fetch_all(&mut conn, sqlx::raw_sql(&fetch)).await?;
    if rows.is_empty() {
        let close = format!("CLOSE {CURSOR}; COMMIT");
        Executor::execute(&mut conn, sqlx::raw_sql(&close)).await?;
        conn.close().await?;
        debug!("cursor exhausted");
        return Ok(None);
    }
    let records = rows
        .iter()
        .map(decode_row)
        .collect::<Result<Vec<_>, _>>()?;
    debug!(rows = records.len(), "fetched batch");
    Ok(Some((Batch::new(records), (conn, fetch))))
}

fn decode_row(row: &PgRow) -> Result<SourceRecord, ReadError> {
    let raw: String = row.try_get("record")?;
    match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Object(fields)) => Ok(SourceRecord::new(fields)),
        Ok(other) => Err(ReadError::Row(other.to_string())),
        Err(err) => Err(ReadError::Row(err.to_string())),
    }
}
