//! Reads records from a [`RecordSource`], groups them into batches and pushes
//! complete batches onto the bounded batch channel.
//!
//! The producer runs on a blocking thread: both reading the input and sending
//! into a full channel block it, which is what bounds memory.

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::batch::BatchBuilder;
use crate::error::PipelineError;
use crate::source::RecordSource;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerStats {
    pub records: u64,
    pub batches: u64,
}

pub struct Producer<S, BB> {
    source: S,
    builder: BB,
    batch_size: usize,
    limit: Option<u64>,
}

impl<S, BB> Producer<S, BB>
where
    S: RecordSource,
    BB: BatchBuilder<Record = S::Record>,
{
    pub fn new(source: S, builder: BB, batch_size: usize, limit: Option<u64>) -> Self {
        Self {
            source,
            builder,
            batch_size,
            limit,
        }
    }

    /// Scan the whole input. Returns once every batch, including a trailing
    /// partial one, has been accepted by the channel. The sender is dropped
    /// on return.
    pub fn run(
        mut self,
        tx: flume::Sender<BB::Batch>,
        cancel: CancellationToken,
    ) -> Result<ProducerStats, PipelineError> {
        let mut stats = ProducerStats::default();

        loop {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            if self.limit.is_some_and(|limit| stats.records >= limit) {
                debug!("Record limit of {} reached", stats.records);
                break;
            }
            let record = match self.source.next_record()? {
                Some(record) => record,
                None => break,
            };
            stats.records += 1;
            self.builder.push(record);

            if self.builder.len() >= self.batch_size {
                self.send(&tx, &mut stats)?;
            }
        }

        if !self.builder.is_empty() {
            self.send(&tx, &mut stats)?;
        }

        debug!(
            "Producer done: {} records in {} batches",
            stats.records, stats.batches
        );
        Ok(stats)
    }

    fn send(
        &mut self,
        tx: &flume::Sender<BB::Batch>,
        stats: &mut ProducerStats,
    ) -> Result<(), PipelineError> {
        let batch = self.builder.finish();
        // Fails only once every worker has gone away.
        tx.send(batch).map_err(|_| PipelineError::Cancelled)?;
        stats.batches += 1;
        Ok(())
    }
}
