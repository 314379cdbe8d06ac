use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::config;
use crate::connector::{retry_call, RetryPolicy};
use crate::error::IndexError;
use crate::model::{Ack, Document};

pub mod model;

use model::BulkResponse;

/// Write side of the search index.
#[async_trait]
pub trait IndexWriter: Send + Sync {
    /// Insert-or-replace every document; returns one ack per document, in input order.
    async fn bulk_upsert(&self, documents: &[Document]) -> Result<Vec<Ack>, IndexError>;
}

#[derive(Clone)]
pub struct ElasticIndex {
    http: Client,
    base_url: Url,
    index: String,
    chunk_size: usize,
    retry: RetryPolicy,
}

impl fmt::Debug for ElasticIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElasticIndex")
            .field("base_url", &self.base_url)
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

impl ElasticIndex {
    pub fn new(base_url: Url, index: impl Into<String>, chunk_size: usize) -> Result<Self, IndexError> {
        let http = Client::builder()
            .user_agent("movies-sync/0.1")
            .no_proxy()
            .build()?;
        Ok(Self {
            http,
            base_url,
            index: index.into(),
            chunk_size: chunk_size.max(1),
            retry: RetryPolicy::default(),
        })
    }

    /// Backoff applied to bulk requests that fail transiently.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// `chunk_size` is the number of documents sent per bulk request.
    pub fn from_config(cfg: &config::Index, chunk_size: usize) -> Result<Self, IndexError> {
        let base_url = Url::parse(&cfg.base_url())
            .map_err(|err| IndexError::Response(format!("invalid index url: {err}")))?;
        Self::new(base_url, cfg.name.clone(), chunk_size)
    }

    pub fn index_name(&self) -> &str {
        &self.index
    }

    pub async fn ping(&self) -> Result<(), IndexError> {
        let res = self.http.get(self.base_url.clone()).send().await?;
        if !res.status().is_success() {
            return Err(IndexError::Status {
                status: res.status().as_u16(),
                body: res.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    pub fn build_request(&self, body: String) -> Result<reqwest::Request, IndexError> {
        let endpoint = self
            .base_url
            .join("_bulk")
            .map_err(|err| IndexError::Response(format!("invalid index url: {err}")))?;
        Ok(self
            .http
            .post(endpoint)
            .header("Content-Type", "application/x-ndjson")
            .body(body)
            .build()?)
    }

    #[instrument(skip_all, fields(index = %self.index, docs = documents.len()))]
    async fn send_chunk(&self, documents: &[Document]) -> Result<Vec<Ack>, IndexError> {
        let body = build_bulk_body(&self.index, documents)?;
        let payload = retry_call(&self.retry, "index", IndexError::is_transient, || {
            self.post_bulk(body.clone())
        })
        .await?;
        acks_from_response(documents, payload)
    }

    async fn post_bulk(&self, body: String) -> Result<BulkResponse, IndexError> {
        let request = self.build_request(body)?;
        let res = self.http.execute(request).await?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(%status, "bulk request rejected");
            return Err(IndexError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let payload: BulkResponse = res.json().await?;
        debug!(errors = payload.errors, items = payload.items.len(), "bulk response");
        Ok(payload)
    }
}

#[async_trait]
impl IndexWriter for ElasticIndex {
    async fn bulk_upsert(&self, documents: &[Document]) -> Result<Vec<Ack>, IndexError> {
        let mut acks = Vec::with_capacity(documents.len());
        for chunk in documents.chunks(self.chunk_size) {
            acks.extend(self.send_chunk(chunk).await?);
        }
        Ok(acks)
    }
}

/// NDJSON body: an `index` action line followed by the `_source` line per document.
pub fn build_bulk_body(index: &str, documents: &[Document]) -> Result<String, IndexError> {
    let mut body = String::new();
    for doc in documents {
        let action = json!({ "index": { "_index": index, "_id": doc.id.to_string() } });
        let source = serde_json::to_string(doc)
            .map_err(|err| IndexError::Response(format!("unserializable document {}: {err}", doc.id)))?;
        body.push_str(&action.to_string());
        body.push('\n');
        body.push_str(&source);
        body.push('\n');
    }
    Ok(body)
}

/// Map bulk items back onto the submitted documents. Items are matched by
/// `_id`; a document with no matching item is reported as failed.
pub fn acks_from_response(documents: &[Document], payload: BulkResponse) -> Result<Vec<Ack>, IndexError> {
    let mut by_id: HashMap<Uuid, Ack> = HashMap::with_capacity(payload.items.len());
    for item in payload.items {
        let Some((_, item)) = item.into_iter().next() else {
            return Err(IndexError::Response("empty bulk item".into()));
        };
        let Some(id) = item.id.as_deref().and_then(|s| Uuid::parse_str(s).ok()) else {
            return Err(IndexError::Response(format!("bulk item without a valid _id: {:?}", item.id)));
        };
        let ack = if (200..300).contains(&item.status) && item.error.is_none() {
            Ack::ok(id)
        } else {
            let detail = item
                .error
                .as_ref()
                .map(describe_error)
                .unwrap_or_else(|| format!("status {}", item.status));
            Ack::failed(id, detail)
        };
        by_id.insert(id, ack);
    }

    Ok(documents
        .iter()
        .map(|doc| {
            by_id
                .remove(&doc.id)
                .unwrap_or_else(|| Ack::failed(doc.id, "missing from bulk response"))
        })
        .collect())
}

fn describe_error(error: &Value) -> String {
    let kind = error.get("type").and_then(Value::as_str);
    let reason = error.get("reason").and_then(Value::as_str);
    match (kind, reason) {
        (Some(kind), Some(reason)) => format!("{kind}: {reason}"),
        (Some(kind), None) => kind.to_string(),
        _ => error.to_string(),
    }
}
