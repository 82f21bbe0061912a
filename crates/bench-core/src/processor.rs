//! Single owner of all stat groups. Workers send [`StatEvent`]s over a
//! channel; the processor merges them and hands back a [`StatSummary`] once
//! every sender is gone.

use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::StatsConfig;
use crate::stats::{StatAggregator, StatEvent, StatSummary};

pub struct StatProcessor {
    rx: mpsc::Receiver<StatEvent>,
    aggregator: StatAggregator,
    print_interval: Option<Duration>,
    workers: usize,
    cancel: CancellationToken,
}

impl StatProcessor {
    /// Create the processor together with the sender workers clone.
    pub fn new(
        config: &StatsConfig,
        workers: usize,
        cancel: CancellationToken,
    ) -> (mpsc::Sender<StatEvent>, Self) {
        // One slot per worker keeps the event queue as bounded as the batch queue.
        let (tx, rx) = mpsc::channel(workers.max(1));
        let processor = Self {
            rx,
            aggregator: StatAggregator::new(config.burn_in),
            print_interval: config.print_interval(),
            workers,
            cancel,
        };
        (tx, processor)
    }

    /// Keep cold and warm aggregates apart; used for warm runs.
    pub fn with_warm_split(mut self, enabled: bool) -> Self {
        self.aggregator = self.aggregator.with_warm_split(enabled);
        self
    }

    /// Run until the event channel is closed and drained.
    ///
    /// Resolves to `None` when the run was cancelled; partial statistics are
    /// dropped in that case.
    pub fn spawn(self) -> JoinHandle<Option<StatSummary>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Option<StatSummary> {
        let start = Instant::now();
        // A disabled interval still needs a timer for select!; it is never polled.
        let period = self.print_interval.unwrap_or(Duration::from_secs(3600));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("Stat processor cancelled, discarding partial statistics");
                    return None;
                }
                event = self.rx.recv() => {
                    match event {
                        Some(event) => {
                            self.aggregator.record(&event);
                        }
                        None => break,
                    }
                }
                _ = ticker.tick(), if self.print_interval.is_some() => {
                    self.print_progress(start.elapsed());
                }
            }
        }

        let summary = self.aggregator.into_summary();
        info!(
            "Stat processor drained: {} measurements from {} workers ({} burned in)",
            summary.events, self.workers, summary.burned_in
        );
        Some(summary)
    }

    fn print_progress(&self, elapsed: Duration) {
        let all = self.aggregator.all();
        let secs = elapsed.as_secs_f64();
        let rate = if secs > 0.0 {
            self.aggregator.events() as f64 / secs
        } else {
            0.0
        };
        info!(
            "Progress: after {} requests with {} workers: {:.2} req/sec, {}",
            self.aggregator.events(),
            self.workers,
            rate,
            all
        );
    }
}
