//! Bounded-concurrency batch scheduler.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use seisync_core::{defaults, Error, Result};

use crate::config::SchedulerConfig;
use crate::handler::{ItemOutcome, ItemWorker};

/// Cooperative stop signal shared by every run it is passed to.
///
/// Stopping prevents further dispatch; in-flight items finish.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for StopHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StopHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    /// Receiver that observes the stop request.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Counts of one scheduler run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    /// Items handed to the run.
    pub selected: u64,
    pub completed: u64,
    pub errored: u64,
    /// Left `pending` after a retryable failure.
    pub deferred: u64,
    /// Claim lost to a concurrent run.
    pub skipped: u64,
    /// Never dispatched because of a stop request.
    pub not_dispatched: u64,
    /// Still pending beyond the selection limit.
    pub remaining: u64,
}

impl BatchSummary {
    fn record(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Completed => self.completed += 1,
            ItemOutcome::Errored => self.errored += 1,
            ItemOutcome::Deferred => self.deferred += 1,
            ItemOutcome::Skipped => self.skipped += 1,
        }
    }

    /// Items that finished processing in this run.
    pub fn processed(&self) -> u64 {
        self.completed + self.errored + self.deferred + self.skipped
    }

    /// Sum of several runs, e.g. one per scope.
    pub fn merge(mut self, other: &BatchSummary) -> Self {
        self.selected += other.selected;
        self.completed += other.completed;
        self.errored += other.errored;
        self.deferred += other.deferred;
        self.skipped += other.skipped;
        self.not_dispatched += other.not_dispatched;
        self.remaining += other.remaining;
        self
    }
}

/// Event emitted by the scheduler.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    RunStarted {
        run_id: Uuid,
        worker: &'static str,
        selected: u64,
    },
    ItemStarted {
        run_id: Uuid,
        key: String,
    },
    ItemFinished {
        run_id: Uuid,
        key: String,
        outcome: ItemOutcome,
    },
    StopRequested {
        run_id: Uuid,
    },
    RunFinished {
        run_id: Uuid,
        summary: BatchSummary,
    },
}

/// Runs a worker over a list of items with at most `batch_size` in
/// flight, refilling the pool as workers finish.
pub struct BatchScheduler {
    config: SchedulerConfig,
    stop: StopHandle,
    event_tx: broadcast::Sender<SchedulerEvent>,
}

impl BatchScheduler {
    pub fn new(config: SchedulerConfig, stop: StopHandle) -> Self {
        let (event_tx, _) = broadcast::channel(defaults::EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            stop,
            event_tx,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn stop_handle(&self) -> &StopHandle {
        &self.stop
    }

    /// Get a receiver for scheduler events.
    pub fn events(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.event_tx.subscribe()
    }

    /// Process `items` with `worker`.
    ///
    /// Per-item failures never abort the run. The first infrastructure
    /// error stops dispatching, lets in-flight items finish and is
    /// returned. A panicking worker counts as errored.
    pub async fn run<W: ItemWorker>(&self, items: Vec<W::Item>, worker: Arc<W>) -> Result<BatchSummary> {
        let run_id = Uuid::new_v4();
        let start = Instant::now();
        let batch_size = self.config.batch_size.max(1);
        let mut summary = BatchSummary {
            selected: items.len() as u64,
            ..Default::default()
        };

        info!(
            subsystem = "scheduler",
            %run_id,
            worker = worker.name(),
            selected = summary.selected,
            batch_size,
            "Batch run started"
        );
        let _ = self.event_tx.send(SchedulerEvent::RunStarted {
            run_id,
            worker: worker.name(),
            selected: summary.selected,
        });

        let mut queue = items.into_iter();
        let mut tasks: JoinSet<(String, Result<ItemOutcome>)> = JoinSet::new();
        let mut failure: Option<Error> = None;
        let mut stop_seen = false;

        loop {
            while failure.is_none() && tasks.len() < batch_size {
                if self.stop.is_stopped() {
                    if !stop_seen {
                        stop_seen = true;
                        info!(
                            subsystem = "scheduler",
                            %run_id,
                            in_flight = tasks.len(),
                            "Stop requested, finishing in-flight items"
                        );
                        let _ = self.event_tx.send(SchedulerEvent::StopRequested { run_id });
                    }
                    break;
                }
                let Some(item) = queue.next() else {
                    break;
                };

                let key = worker.item_key(&item);
                debug!(subsystem = "scheduler", %run_id, item = %key, "Dispatching item");
                let _ = self.event_tx.send(SchedulerEvent::ItemStarted {
                    run_id,
                    key: key.clone(),
                });
                let worker = worker.clone();
                tasks.spawn(async move {
                    let outcome = worker.process(item).await;
                    (key, outcome)
                });
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };

            match joined {
                Ok((key, Ok(outcome))) => {
                    summary.record(outcome);
                    let _ = self.event_tx.send(SchedulerEvent::ItemFinished {
                        run_id,
                        key,
                        outcome,
                    });
                }
                Ok((key, Err(e))) => {
                    error!(
                        subsystem = "scheduler",
                        %run_id,
                        item = %key,
                        error_kind = e.kind(),
                        error = %e,
                        "Infrastructure failure, aborting run"
                    );
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
                Err(e) => {
                    error!(subsystem = "scheduler", %run_id, error = ?e, "Item task panicked");
                    summary.errored += 1;
                }
            }
        }

        summary.not_dispatched = queue.count() as u64;

        if let Some(e) = failure {
            warn!(
                subsystem = "scheduler",
                %run_id,
                worker = worker.name(),
                processed = summary.processed(),
                not_dispatched = summary.not_dispatched,
                duration_ms = start.elapsed().as_millis() as u64,
                "Batch run aborted"
            );
            return Err(e);
        }

        info!(
            subsystem = "scheduler",
            %run_id,
            worker = worker.name(),
            completed = summary.completed,
            errored = summary.errored,
            deferred = summary.deferred,
            skipped = summary.skipped,
            not_dispatched = summary.not_dispatched,
            duration_ms = start.elapsed().as_millis() as u64,
            "Batch run finished"
        );
        let _ = self
            .event_tx
            .send(SchedulerEvent::RunFinished { run_id, summary });

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    /// Worker whose outcome is derived from the item value.
    struct ScriptedWorker {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
        stop_after_first: Option<StopHandle>,
    }

    impl ScriptedWorker {
        fn new(delay: Duration) -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                delay,
                stop_after_first: None,
            }
        }
    }

    #[async_trait]
    impl ItemWorker for ScriptedWorker {
        type Item = u32;

        fn name(&self) -> &'static str {
            "scripted"
        }

        fn item_key(&self, item: &u32) -> String {
            item.to_string()
        }

        async fn process(&self, item: u32) -> Result<ItemOutcome> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if let Some(stop) = &self.stop_after_first {
                stop.stop();
            }

            match item {
                999 => panic!("scripted panic"),
                500 => Err(Error::Internal("store down".to_string())),
                n if n % 4 == 1 => Ok(ItemOutcome::Errored),
                n if n % 4 == 2 => Ok(ItemOutcome::Deferred),
                n if n % 4 == 3 => Ok(ItemOutcome::Skipped),
                _ => Ok(ItemOutcome::Completed),
            }
        }
    }

    fn scheduler(batch_size: usize) -> BatchScheduler {
        BatchScheduler::new(
            SchedulerConfig::default().with_batch_size(batch_size),
            StopHandle::new(),
        )
    }

    #[tokio::test]
    async fn test_counts_every_outcome() {
        let summary = scheduler(3)
            .run((0..8).collect(), Arc::new(ScriptedWorker::new(Duration::ZERO)))
            .await
            .unwrap();

        assert_eq!(summary.selected, 8);
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.errored, 2);
        assert_eq!(summary.deferred, 2);
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.not_dispatched, 0);
    }

    #[tokio::test]
    async fn test_never_exceeds_batch_size() {
        let worker = Arc::new(ScriptedWorker::new(Duration::from_millis(10)));
        scheduler(3)
            .run((0..20).map(|n| n * 4).collect(), worker.clone())
            .await
            .unwrap();
        let peak = worker.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak was {}", peak);
        assert!(peak >= 2);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let summary = scheduler(3)
            .run(Vec::new(), Arc::new(ScriptedWorker::new(Duration::ZERO)))
            .await
            .unwrap();
        assert_eq!(summary, BatchSummary::default());
    }

    #[tokio::test]
    async fn test_panicking_worker_counts_as_errored() {
        let summary = scheduler(2)
            .run(vec![0, 999, 4], Arc::new(ScriptedWorker::new(Duration::ZERO)))
            .await
            .unwrap();
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.errored, 1);
    }

    #[tokio::test]
    async fn test_infrastructure_error_aborts_run() {
        let items: Vec<u32> = std::iter::once(500).chain((1..50).map(|n| n * 4)).collect();
        let err = scheduler(1)
            .run(items, Arc::new(ScriptedWorker::new(Duration::ZERO)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[tokio::test]
    async fn test_stop_prevents_further_dispatch() {
        let stop = StopHandle::new();
        let mut worker = ScriptedWorker::new(Duration::from_millis(5));
        worker.stop_after_first = Some(stop.clone());
        let scheduler = BatchScheduler::new(SchedulerConfig::default().with_batch_size(2), stop);

        let summary = scheduler
            .run((0..10).map(|n| n * 4).collect(), Arc::new(worker))
            .await
            .unwrap();

        assert_eq!(summary.completed, 2);
        assert_eq!(summary.not_dispatched, 8);
    }

    #[tokio::test]
    async fn test_events_bracket_the_run() {
        let scheduler = scheduler(2);
        let mut events = scheduler.events();
        scheduler
            .run(vec![0, 4], Arc::new(ScriptedWorker::new(Duration::ZERO)))
            .await
            .unwrap();

        let mut finished = 0;
        let mut saw_start = false;
        let mut saw_end = false;
        while let Ok(event) = events.try_recv() {
            match event {
                SchedulerEvent::RunStarted { selected, .. } => {
                    assert_eq!(selected, 2);
                    saw_start = true;
                }
                SchedulerEvent::ItemFinished { outcome, .. } => {
                    assert_eq!(outcome, ItemOutcome::Completed);
                    finished += 1;
                }
                SchedulerEvent::RunFinished { summary, .. } => {
                    assert_eq!(summary.completed, 2);
                    saw_end = true;
                }
                _ => {}
            }
        }
        assert!(saw_start && saw_end);
        assert_eq!(finished, 2);
    }

    #[test]
    fn test_merge_summaries() {
        let a = BatchSummary {
            selected: 3,
            completed: 2,
            deferred: 1,
            ..Default::default()
        };
        let b = BatchSummary {
            selected: 1,
            errored: 1,
            remaining: 4,
            ..Default::default()
        };
        let total = a.merge(&b);
        assert_eq!(total.selected, 4);
        assert_eq!(total.processed(), 4);
        assert_eq!(total.remaining, 4);
    }
}
