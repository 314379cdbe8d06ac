//! The replication loop: bookmark -> query -> (validate -> upsert)* -> bookmark.
//!
//! Batches are handled strictly one after another. The bookmark only moves
//! across records whose outcome is settled: acknowledged by the index, or
//! rejected by validation (skipped for good). The first failed ack stops the
//! cycle; the next cycle reads again from that record.
use futures::TryStreamExt;
use std::collections::HashMap;
use std::future::Future;
use std::task::Poll;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::db::{BatchReader, QuerySet};
use crate::error::SyncError;
use crate::index::IndexWriter;
use crate::model::{Ack, Bookmark, Document};
use crate::state::BookmarkStore;
use crate::transform::{self, Prepared};

#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub start: Bookmark,
    pub end: Bookmark,
    pub batches: usize,
    pub rows: usize,
    pub upserted: usize,
    pub rejected: usize,
    pub failed: usize,
    /// Set when a failed ack stopped the cycle early.
    pub halted_at: Option<Uuid>,
}

impl CycleReport {
    fn starting_at(bookmark: Bookmark) -> Self {
        Self {
            start: bookmark.clone(),
            end: bookmark,
            batches: 0,
            rows: 0,
            upserted: 0,
            rejected: 0,
            failed: 0,
            halted_at: None,
        }
    }

    pub fn advanced(&self) -> bool {
        self.start != self.end
    }
}

/// Where the bookmark may move after one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Advance {
    pub bookmark: Bookmark,
    pub halted_at: Option<Uuid>,
}

/// Walk `prepared` in source order and stop at the first document whose ack
/// is missing or failed.
pub fn advance(previous: &Bookmark, prepared: &[Prepared], acks: &[Ack]) -> Advance {
    let status: HashMap<Uuid, bool> = acks.iter().map(|a| (a.id, a.success)).collect();
    let mut bookmark = previous.clone();
    for entry in prepared {
        match &entry.outcome {
            Ok(doc) if !status.get(&doc.id).copied().unwrap_or(false) => {
                return Advance {
                    bookmark,
                    halted_at: Some(doc.id),
                };
            }
            _ => {
                if let Some(position) = &entry.position {
                    bookmark = position.clone();
                }
            }
        }
    }
    Advance {
        bookmark,
        halted_at: None,
    }
}

pub struct Syncer<'a> {
    reader: &'a dyn BatchReader,
    index: &'a dyn IndexWriter,
    bookmarks: BookmarkStore<'a>,
    queries: QuerySet,
    batch_size: usize,
}

impl<'a> Syncer<'a> {
    pub fn new(
        reader: &'a dyn BatchReader,
        index: &'a dyn IndexWriter,
        bookmarks: BookmarkStore<'a>,
        queries: QuerySet,
        batch_size: usize,
    ) -> Self {
        Self {
            reader,
            index,
            bookmarks,
            queries,
            batch_size: batch_size.max(1),
        }
    }

    pub fn bookmarks(&self) -> &BookmarkStore<'a> {
        &self.bookmarks
    }

    /// One pass over everything newer than the stored bookmark.
    #[instrument(skip_all)]
    pub async fn run_cycle(&self) -> Result<CycleReport, SyncError> {
        let start = self.bookmarks.load().await?;
        let query = self.queries.render(&start).await?;
        let mut batches = self.reader.read(&query, self.batch_size).await?;

        let mut report = CycleReport::starting_at(start);
        while let Some(batch) = batches.try_next().await? {
            report.batches += 1;
            report.rows += batch.len();

            let prepared = transform::prepare_batch(&batch, &report.end);
            for entry in &prepared {
                if let Err(err) = &entry.outcome {
                    report.rejected += 1;
                    warn!(
                        record_id = ?entry.position.as_ref().map(|p| p.last_id),
                        error = %err,
                        "record failed validation; skipped"
                    );
                }
            }

            let documents: Vec<Document> = prepared
                .iter()
                .filter_map(|entry| entry.outcome.as_ref().ok().cloned())
                .collect();
            let acks = if documents.is_empty() {
                Vec::new()
            } else {
                self.index.bulk_upsert(&documents).await?
            };
            for ack in &acks {
                if ack.success {
                    report.upserted += 1;
                } else {
                    report.failed += 1;
                    warn!(id = %ack.id, detail = ?ack.detail, "index rejected document");
                }
            }

            let step = advance(&report.end, &prepared, &acks);
            if step.bookmark != report.end {
                self.bookmarks.save(&step.bookmark).await?;
                report.end = step.bookmark;
            }
            if let Some(id) = step.halted_at {
                warn!(%id, last_id = %report.end.last_id, "bookmark held before failed document");
                report.halted_at = Some(id);
                break;
            }
        }
        Ok(report)
    }

    /// Poll until `shutdown` resolves. A stop request is honoured between
    /// cycles. Fatal errors end the loop; others are retried next poll.
    pub async fn run_until<F>(&self, poll_interval: Duration, shutdown: F) -> Result<(), SyncError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            match self.run_cycle().await {
                Ok(report) if report.rows == 0 => {
                    info!(last_id = %report.end.last_id, "no new records");
                }
                Ok(report) => {
                    info!(
                        batches = report.batches,
                        rows = report.rows,
                        upserted = report.upserted,
                        rejected = report.rejected,
                        failed = report.failed,
                        last_id = %report.end.last_id,
                        last_updated_at = %report.end.last_updated_at,
                        "cycle complete"
                    );
                }
                Err(err) if err.is_fatal() => {
                    error!(error = %err, "unrecoverable failure; stopping");
                    return Err(err);
                }
                Err(err) => {
                    error!(error = %err, "cycle aborted; retrying after poll interval");
                }
            }

            tokio::select! {
                _ = &mut shutdown => {
                    info!("stop requested");
                    return Ok(());
                }
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }
}

/// Install the Ctrl-C handler now and return a future that resolves once the
/// signal arrives. Tokio only hooks SIGINT when `ctrl_c()` is first polled, so
/// this polls it once before handing it out; a signal sent while the first
/// cycle runs is then caught instead of killing the process.
pub async fn interrupt() -> impl Future<Output = ()> + Send {
    let mut ctrl_c = Box::pin(tokio::signal::ctrl_c());
    let early = futures::poll!(ctrl_c.as_mut());
    async move {
        let received = match early {
            Poll::Ready(received) => received,
            Poll::Pending => ctrl_c.await,
        };
        if let Err(err) = received {
            error!(?err, "failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    }
}
