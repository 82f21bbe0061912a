//! Run coordinator: launch, ingest, drain, report.
//!
//! One [`Pipeline`] value owns the configuration and executor of a run; the
//! channels, counters and cancellation token are created fresh by every call
//! to [`Pipeline::run`], so several pipelines can coexist in one process.

use std::sync::Arc;
use std::time::Instant;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::batch::{Batch, BatchBuilder};
use crate::config::{PipelineConfig, StatsConfig};
use crate::error::PipelineError;
use crate::executor::BatchExecutor;
use crate::processor::StatProcessor;
use crate::producer::Producer;
use crate::rate_limiter::SharedRateLimiter;
use crate::report::{RunCounts, RunReport};
use crate::source::RecordSource;
use crate::worker::{Counters, Worker};

pub struct Pipeline<B: Batch> {
    config: PipelineConfig,
    stats: StatsConfig,
    executor: Arc<dyn BatchExecutor<B>>,
}

impl<B: Batch> Pipeline<B> {
    pub fn new(
        config: PipelineConfig,
        stats: StatsConfig,
        executor: Arc<dyn BatchExecutor<B>>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            config,
            stats,
            executor,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run the pipeline to completion over `source`.
    ///
    /// On success every batch read has been executed exactly once (twice with
    /// warm runs). On the first fatal error the remaining stages are cancelled,
    /// collected statistics are discarded and that error is returned.
    pub async fn run<S, BB>(&self, source: S, builder: BB) -> Result<RunReport, PipelineError>
    where
        S: RecordSource,
        BB: BatchBuilder<Record = S::Record, Batch = B>,
    {
        let workers = self.config.workers;
        let cancel = CancellationToken::new();
        let counters = Arc::new(Counters::default());
        let limiter = self
            .config
            .max_batches_per_sec
            .map(SharedRateLimiter::new);

        // Launch
        let (stats_tx, processor) = StatProcessor::new(&self.stats, workers, cancel.clone());
        let processor = processor.with_warm_split(self.config.warm_run);
        let stats_handle = processor.spawn();

        let (batch_tx, batch_rx) = flume::bounded::<B>(workers);
        let mut pool = JoinSet::new();
        for id in 0..workers {
            let worker = Worker {
                id,
                rx: batch_rx.clone(),
                executor: self.executor.clone(),
                stats_tx: stats_tx.clone(),
                warm_run: self.config.warm_run,
                limiter: limiter.clone(),
                counters: counters.clone(),
                cancel: cancel.clone(),
            };
            pool.spawn(worker.run());
        }
        drop(batch_rx);

        info!(
            "Starting run: {} workers, batch size {}, executor {}{}",
            workers,
            self.config.batch_size,
            self.executor.name(),
            if self.config.warm_run { ", warm runs" } else { "" }
        );
        let start = Instant::now();

        // Ingest
        let producer = Producer::new(
            source,
            builder,
            self.config.batch_size,
            self.config.record_limit(),
        );
        let producer_tx = batch_tx.clone();
        let producer_cancel = cancel.clone();
        let mut producer_handle =
            tokio::task::spawn_blocking(move || producer.run(producer_tx, producer_cancel));

        let produced = loop {
            tokio::select! {
                result = &mut producer_handle => match flatten(result) {
                    Ok(stats) => break stats,
                    Err(e) => return Err(abort(e, &cancel, &mut pool).await),
                },
                Some(result) = pool.join_next() => match flatten(result) {
                    Ok(n) => warn!("Worker exited during ingest after {} batches", n),
                    Err(e) => return Err(abort(e, &cancel, &mut pool).await),
                },
            }
        };
        info!(
            "Input done: {} records in {} batches",
            produced.records, produced.batches
        );

        // Drain
        drop(batch_tx);
        while let Some(result) = pool.join_next().await {
            if let Err(e) = flatten(result) {
                return Err(abort(e, &cancel, &mut pool).await);
            }
        }
        drop(stats_tx);
        let summary = stats_handle.await?.ok_or(PipelineError::Cancelled)?;

        // Report
        let elapsed_secs = start.elapsed().as_secs_f64();
        let counts = RunCounts {
            records_read: produced.records,
            batches: counters.batches(),
            executions: counters.executions(),
            items: counters.items(),
        };
        if counts.batches != produced.batches {
            warn!(
                "Produced {} batches but executed {}",
                produced.batches, counts.batches
            );
        }

        Ok(RunReport::new(
            workers,
            self.config.batch_size,
            self.config.warm_run,
            counts,
            elapsed_secs,
            summary,
        ))
    }
}

fn flatten<T>(result: Result<Result<T, PipelineError>, JoinError>) -> Result<T, PipelineError> {
    result?
}

/// Cancel every stage and wait for the workers to stop. Returns the error to
/// surface: the first one that is not merely a consequence of cancellation.
async fn abort(
    first: PipelineError,
    cancel: &CancellationToken,
    pool: &mut JoinSet<Result<u64, PipelineError>>,
) -> PipelineError {
    cancel.cancel();

    let mut surfaced = first;
    while let Some(result) = pool.join_next().await {
        if let Err(e) = flatten(result) {
            if is_secondary(&surfaced) && !is_secondary(&e) {
                surfaced = e;
            }
        }
    }

    error!("Run aborted in {} stage: {}", surfaced.stage(), surfaced);
    surfaced
}

fn is_secondary(e: &PipelineError) -> bool {
    matches!(e, PipelineError::Cancelled | PipelineError::StatsClosed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{LineBatch, LineBatchBuilder};
    use crate::error::InputError;
    use crate::executor::{ExecuteFuture, MockExecutor};
    use crate::pool::BufferPool;
    use crate::source::{IterSource, LineSource};
    use crate::worker::tests::{RecordingExecutor, TestBatch};
    use std::collections::HashSet;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct TestBuilder {
        next_id: u64,
        records: Vec<u64>,
    }

    impl BatchBuilder for TestBuilder {
        type Record = u64;
        type Batch = TestBatch;

        fn push(&mut self, record: u64) {
            self.records.push(record);
        }

        fn len(&self) -> usize {
            self.records.len()
        }

        fn finish(&mut self) -> TestBatch {
            let id = self.next_id;
            self.next_id += 1;
            TestBatch {
                id,
                records: std::mem::take(&mut self.records),
            }
        }
    }

    fn quiet() -> StatsConfig {
        StatsConfig {
            print_every_ms: 0,
            burn_in: 0,
        }
    }

    fn test_pipeline(
        config: PipelineConfig,
        executor: Arc<dyn BatchExecutor<TestBatch>>,
    ) -> Pipeline<TestBatch> {
        Pipeline::new(config, quiet(), executor).unwrap()
    }

    fn records(n: u64) -> IterSource<impl Iterator<Item = Result<u64, InputError>> + Send> {
        IterSource::new((0..n).map(Ok))
    }

    #[tokio::test]
    async fn test_single_worker_preserves_order() {
        let executor = Arc::new(RecordingExecutor::default());
        let pipeline = test_pipeline(PipelineConfig::new(2, 1), executor.clone());

        let report = pipeline.run(records(5), TestBuilder::default()).await.unwrap();

        let seen = executor.seen.lock().clone();
        assert_eq!(seen, vec![(0, 2), (1, 2), (2, 1)]);
        assert_eq!(report.batches, 3);
        assert_eq!(report.executions, 3);
        assert_eq!(report.items, 5);
        assert_eq!(report.records_read, 5);
        assert_eq!(report.all.count, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_every_batch_executed_exactly_once() {
        let executor = Arc::new(RecordingExecutor::default());
        let pipeline = test_pipeline(PipelineConfig::new(7, 8), executor.clone());

        let report = pipeline
            .run(records(1000), TestBuilder::default())
            .await
            .unwrap();

        let seen = executor.seen.lock().clone();
        let ids: HashSet<u64> = seen.iter().map(|(id, _)| *id).collect();
        assert_eq!(seen.len(), 143);
        assert_eq!(ids.len(), 143, "a batch was executed twice");
        assert_eq!(seen.iter().map(|(_, n)| n).sum::<usize>(), 1000);
        assert_eq!(report.items, 1000);
        assert_eq!(report.groups.len(), 1);
        assert_eq!(report.all.count, 143);
    }

    #[tokio::test]
    async fn test_warm_run_doubles_measurements() {
        let executor = Arc::new(RecordingExecutor::default());
        let config = PipelineConfig::new(1, 3).with_warm_run(true);
        let pipeline = test_pipeline(config, executor.clone());

        let report = pipeline.run(records(4), TestBuilder::default()).await.unwrap();

        assert_eq!(executor.seen.lock().len(), 8);
        assert_eq!(report.executions, 8);
        assert_eq!(report.batches, 4);
        let labels: Vec<(&str, u64)> = report
            .groups
            .iter()
            .map(|g| (g.label.as_str(), g.stats.count))
            .collect();
        assert!(labels.contains(&("test", 4)));
        assert!(labels.contains(&("test_warm", 4)));
        assert_eq!(report.all.count, 8);
    }

    #[tokio::test]
    async fn test_execution_error_aborts_without_report() {
        let executor = Arc::new(RecordingExecutor {
            fail_on: Some(3),
            ..Default::default()
        });
        let pipeline = test_pipeline(PipelineConfig::new(1, 2), executor);

        let err = pipeline
            .run(records(50), TestBuilder::default())
            .await
            .unwrap_err();
        match err {
            PipelineError::Execution { label, source, .. } => {
                assert_eq!(label, "test");
                assert!(source.to_string().contains("batch 3"));
            }
            other => panic!("expected execution error, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_input_error_aborts() {
        let executor = Arc::new(RecordingExecutor::default());
        let pipeline = test_pipeline(PipelineConfig::new(2, 2), executor);

        let source = IterSource::new(vec![
            Ok(1),
            Ok(2),
            Ok(3),
            Err(InputError::Parse {
                line: 4,
                message: "unexpected EOF".into(),
            }),
        ]);
        let err = pipeline.run(source, TestBuilder::default()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Input(_)), "{err}");
        assert_eq!(err.stage(), "input");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let executor: Arc<dyn BatchExecutor<TestBatch>> = Arc::new(RecordingExecutor::default());
        assert!(matches!(
            Pipeline::new(PipelineConfig::new(0, 1), quiet(), executor.clone()),
            Err(PipelineError::Config(_))
        ));
        assert!(Pipeline::new(PipelineConfig::new(1, 0), quiet(), executor).is_err());
    }

    #[tokio::test]
    async fn test_empty_input_completes() {
        let executor = Arc::new(RecordingExecutor::default());
        let pipeline = test_pipeline(PipelineConfig::new(10, 4), executor);

        let report = pipeline.run(records(0), TestBuilder::default()).await.unwrap();
        assert_eq!(report.batches, 0);
        assert_eq!(report.all.count, 0);
        assert!(report.groups.is_empty());
    }

    /// Blocks every execution until the test hands out permits.
    struct GatedExecutor {
        gate: tokio::sync::Semaphore,
    }

    impl BatchExecutor<TestBatch> for GatedExecutor {
        fn name(&self) -> &'static str {
            "gated"
        }

        fn execute<'a>(&'a self, _batch: &'a TestBatch) -> ExecuteFuture<'a> {
            Box::pin(async move {
                self.gate.acquire().await?.forget();
                Ok(0.5)
            })
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_backpressure_bounds_read_ahead() {
        let read = Arc::new(AtomicU64::new(0));
        let counter = read.clone();
        let source = IterSource::new((0..100u64).map(move |i| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(i)
        }));

        let executor = Arc::new(GatedExecutor {
            gate: tokio::sync::Semaphore::new(0),
        });
        let pipeline = test_pipeline(PipelineConfig::new(1, 1), executor.clone());

        let run = tokio::spawn(async move { pipeline.run(source, TestBuilder::default()).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        // One batch executing, one queued, one built and waiting on the channel.
        let ahead = read.load(Ordering::SeqCst);
        assert!(ahead <= 3, "producer read {ahead} records ahead of a stalled worker");

        executor.gate.add_permits(100);
        let report = run.await.unwrap().unwrap();
        assert_eq!(report.items, 100);
        assert_eq!(read.load(Ordering::SeqCst), 100);
    }

    #[tokio::test]
    async fn test_line_pipeline_returns_buffers_to_pool() {
        let pool = BufferPool::new(256, 8);
        let input: String = (0..25).map(|i| format!("cpu,host=h{i} usage={i}\n")).collect();
        let executor: Arc<dyn BatchExecutor<LineBatch>> = Arc::new(MockExecutor::new(0));
        let pipeline = Pipeline::new(PipelineConfig::new(10, 2), quiet(), executor).unwrap();

        let report = pipeline
            .run(
                LineSource::new(Cursor::new(input)),
                LineBatchBuilder::new(pool.clone(), "write"),
            )
            .await
            .unwrap();

        assert_eq!(report.batches, 3);
        assert_eq!(report.items, 25);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.checkouts(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_burn_in_with_warm_run_keeps_groups_paired() {
        for (workers, n) in [(1, 5u64), (4, 40)] {
            let executor: Arc<dyn BatchExecutor<TestBatch>> =
                Arc::new(RecordingExecutor::default());
            let stats = StatsConfig {
                print_every_ms: 0,
                burn_in: 2,
            };
            let config = PipelineConfig::new(1, workers).with_warm_run(true);
            let pipeline = Pipeline::new(config, stats, executor).unwrap();

            let report = pipeline.run(records(n), TestBuilder::default()).await.unwrap();

            let labels: Vec<(&str, u64)> = report
                .groups
                .iter()
                .map(|g| (g.label.as_str(), g.stats.count))
                .collect();
            assert_eq!(labels, vec![("test", n - 2), ("test_warm", n - 2)], "workers={workers}");
            assert_eq!(report.burned_in, 2);
            assert_eq!(report.cold.unwrap().count, n - 2);
            assert_eq!(report.warm.unwrap().count, n - 2);
            assert_eq!(report.all.count, 2 * (n - 2));
            assert_eq!(report.executions, 2 * n);
        }
    }

    #[tokio::test]
    async fn test_rate_limited_run_executes_every_batch() {
        let executor = Arc::new(RecordingExecutor::default());
        let mut config = PipelineConfig::new(1, 3);
        config.max_batches_per_sec = Some(20);
        let pipeline = test_pipeline(config, executor.clone());

        let start = std::time::Instant::now();
        let report = pipeline.run(records(25), TestBuilder::default()).await.unwrap();

        // One second of burst, then 5 more permits at 20/s.
        assert!(start.elapsed() >= Duration::from_millis(150), "{:?}", start.elapsed());
        assert_eq!(report.batches, 25);
        assert_eq!(executor.seen.lock().len(), 25);
        let ids: HashSet<u64> = executor.seen.lock().iter().map(|(id, _)| *id).collect();
        assert_eq!(ids.len(), 25);
    }

    #[tokio::test]
    async fn test_pipelines_run_side_by_side() {
        let a = Arc::new(RecordingExecutor::default());
        let b = Arc::new(RecordingExecutor::default());
        let pa = test_pipeline(PipelineConfig::new(3, 2), a.clone());
        let pb = test_pipeline(PipelineConfig::new(5, 3), b.clone());

        let (ra, rb) = tokio::join!(
            pa.run(records(30), TestBuilder::default()),
            pb.run(records(30), TestBuilder::default())
        );
        assert_eq!(ra.unwrap().batches, 10);
        assert_eq!(rb.unwrap().batches, 6);
        assert_eq!(a.seen.lock().len(), 10);
        assert_eq!(b.seen.lock().len(), 6);
    }
}
