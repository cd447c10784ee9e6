//! Single-writer persistence stage fed through a bounded queue.

use async_trait::async_trait;
use metrics::counter;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::error::{PipelineError, StoreError};
use crate::models::NewIndicator;
use crate::storage::{with_retry, IndicatorStore, RetryPolicy};

const QUEUE_DEPTH: usize = 16;

/// The one store operation the writer task needs.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IndicatorSink: Send + Sync {
    async fn upsert_indicators(&self, source: &str, rows: &[NewIndicator]) -> Result<usize, StoreError>;
}

#[async_trait]
impl<T: IndicatorStore + ?Sized> IndicatorSink for T {
    async fn upsert_indicators(&self, source: &str, rows: &[NewIndicator]) -> Result<usize, StoreError> {
        IndicatorStore::upsert_indicators(self, source, rows).await
    }
}

/// Result of persisting one source's rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SaveOutcome {
    pub saved: usize,
    pub chunks: usize,
    pub failed_chunks: usize,
    pub failed_rows: usize,
}

impl SaveOutcome {
    pub fn all_failed(&self) -> bool {
        self.chunks > 0 && self.failed_chunks == self.chunks
    }
}

struct WriteRequest {
    source: String,
    rows: Vec<NewIndicator>,
    reply: oneshot::Sender<SaveOutcome>,
}

/// Handle to the writer task. Requests are applied one at a time in
/// arrival order; rows of a request are written in `batch_size` chunks.
#[derive(Clone)]
pub struct WriteQueue {
    tx: mpsc::Sender<WriteRequest>,
}

impl WriteQueue {
    /// Spawn the writer task. Must be called inside a tokio runtime.
    pub fn spawn<S>(store: Arc<S>, batch_size: usize, policy: RetryPolicy) -> Self
    where
        S: IndicatorSink + ?Sized + 'static,
    {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        tokio::spawn(run_writer(store, rx, batch_size.max(1), policy));
        Self { tx }
    }

    pub async fn save(&self, source: &str, rows: Vec<NewIndicator>) -> Result<SaveOutcome, PipelineError> {
        if rows.is_empty() {
            return Ok(SaveOutcome::default());
        }
        let (reply, outcome) = oneshot::channel();
        self.tx
            .send(WriteRequest {
                source: source.to_string(),
                rows,
                reply,
            })
            .await
            .map_err(|_| PipelineError::QueueClosed)?;
        outcome.await.map_err(|_| PipelineError::QueueClosed)
    }
}

async fn run_writer<S: IndicatorSink + ?Sized>(
    store: Arc<S>,
    mut rx: mpsc::Receiver<WriteRequest>,
    batch_size: usize,
    policy: RetryPolicy,
) {
    while let Some(request) = rx.recv().await {
        let outcome = write_chunks(store.as_ref(), &request.source, &request.rows, batch_size, policy).await;
        // The requester may have given up; the rows are committed either way.
        let _ = request.reply.send(outcome);
    }
    tracing::debug!("Write queue closed, writer exiting");
}

async fn write_chunks<S: IndicatorSink + ?Sized>(
    store: &S,
    source: &str,
    rows: &[NewIndicator],
    batch_size: usize,
    policy: RetryPolicy,
) -> SaveOutcome {
    let mut outcome = SaveOutcome::default();
    for (batch, chunk) in rows.chunks(batch_size).enumerate() {
        outcome.chunks += 1;
        match with_retry(policy, "upsert_indicators", || store.upsert_indicators(source, chunk)).await {
            Ok(written) => outcome.saved += written,
            Err(e) => {
                tracing::error!(
                    source,
                    batch,
                    rows = chunk.len(),
                    error = %e,
                    "Batch write failed after retries, skipping"
                );
                counter!("feedforge_batch_write_failures_total", "source" => source.to_string()).increment(1);
                outcome.failed_chunks += 1;
                outcome.failed_rows += chunk.len();
            }
        }
    }
    outcome
}
