use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::batch::Batch;
use crate::error::PipelineError;
use crate::executor::BatchExecutor;
use crate::rate_limiter::SharedRateLimiter;
use crate::stats::StatEvent;

/// Counters shared by all workers of one run.
#[derive(Debug, Default)]
pub struct Counters {
    pub batches: AtomicU64,
    pub executions: AtomicU64,
    pub items: AtomicU64,
}

impl Counters {
    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    pub fn items(&self) -> u64 {
        self.items.load(Ordering::Relaxed)
    }
}

pub struct Worker<B: Batch> {
    pub(crate) id: usize,
    pub(crate) rx: flume::Receiver<B>,
    pub(crate) executor: Arc<dyn BatchExecutor<B>>,
    pub(crate) stats_tx: mpsc::Sender<StatEvent>,
    pub(crate) warm_run: bool,
    pub(crate) limiter: Option<SharedRateLimiter>,
    pub(crate) counters: Arc<Counters>,
    pub(crate) cancel: CancellationToken,
}

impl<B: Batch> Worker<B> {
    /// Pull batches until the channel is closed and empty, or the run is
    /// cancelled. Returns the number of batches this worker executed.
    pub async fn run(self) -> Result<u64, PipelineError> {
        let mut processed = 0u64;

        loop {
            let batch = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("Worker {} cancelled after {} batches", self.id, processed);
                    return Ok(processed);
                }
                received = self.rx.recv_async() => match received {
                    Ok(batch) => batch,
                    Err(_) => break,
                },
            };

            if let Some(limiter) = &self.limiter {
                limiter.acquire().await;
            }
            self.execute(&batch, false).await?;
            if self.warm_run {
                self.execute(&batch, true).await?;
            }

            self.counters.batches.fetch_add(1, Ordering::Relaxed);
            self.counters
                .items
                .fetch_add(batch.len() as u64, Ordering::Relaxed);
            processed += 1;
            // `batch` is dropped here, releasing any pooled buffer it holds.
        }

        debug!("Worker {} drained after {} batches", self.id, processed);
        Ok(processed)
    }

    async fn execute(&self, batch: &B, warm: bool) -> Result<(), PipelineError> {
        let latency_ms =
            self.executor
                .execute(batch)
                .await
                .map_err(|source| PipelineError::Execution {
                    worker: self.id,
                    label: batch.label().to_string(),
                    source,
                })?;
        self.counters.executions.fetch_add(1, Ordering::Relaxed);

        let event = if warm {
            StatEvent::warm(batch.label(), latency_ms)
        } else {
            StatEvent::cold(batch.label(), latency_ms)
        };
        self.stats_tx
            .send(event)
            .await
            .map_err(|_| PipelineError::StatsClosed)
    }
}
