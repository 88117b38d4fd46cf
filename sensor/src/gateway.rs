use crate::metrics::{CaptureMetrics, WriteOutcome};
use crate::packet::client_key;
use crate::store::{ExpiringStore, StoreResult};
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinSet;

const FAILURE_WARN_INTERVAL: Duration = Duration::from_secs(60);
const QUEUE_FULL_WARN_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// One deferred store update: refresh the client record, then bump the flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteUnit {
    pub client_key: String,
    pub flow_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Stop accepting units and let the workers finish the queue. Falls back
    /// to [`CloseMode::Cancel`] once the drain timeout passes.
    Drain,
    /// Abort in-flight and queued units. Aborts are not failures.
    Cancel,
}

impl CloseMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseMode::Drain => "drain",
            CloseMode::Cancel => "cancel",
        }
    }
}

/// Non-blocking submission of write units to a bounded pool of workers.
///
/// Delivery is at most once: a unit that fails, or that finds the queue
/// full, is counted and logged but never retried.
pub struct WriteGateway {
    tx: mpsc::Sender<WriteUnit>,
    workers: JoinSet<()>,
    metrics: Arc<CaptureMetrics>,
    drain_timeout: Duration,
    queue_gate: Mutex<SuppressingGate>,
}

impl WriteGateway {
    /// Spawns `workers` tasks on the current runtime.
    pub fn new(
        store: Arc<dyn ExpiringStore>,
        grace_period: Duration,
        workers: usize,
        queue_depth: usize,
        metrics: Arc<CaptureMetrics>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let failures = Arc::new(Mutex::new(SuppressingGate::new(FAILURE_WARN_INTERVAL)));
        let mut set = JoinSet::new();
        for worker in 0..workers.max(1) {
            set.spawn(run_worker(worker, rx.clone(), store.clone(), grace_period, metrics.clone(), failures.clone()));
        }
        debug!("writer.event=started workers={} queue_depth={}", workers.max(1), queue_depth.max(1));
        Self {
            tx,
            workers: set,
            metrics,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            queue_gate: Mutex::new(SuppressingGate::new(QUEUE_FULL_WARN_INTERVAL)),
        }
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Schedules the write for a flow the recency cache has not seen. Never
    /// waits: returns `false` if the unit was dropped.
    pub fn write_once_new(&self, client: IpAddr, flow_key: String) -> bool {
        let unit = WriteUnit { client_key: client_key(client), flow_key };
        match self.tx.try_send(unit) {
            Ok(()) => {
                self.metrics.record_write(WriteOutcome::Submitted);
                true
            }
            Err(TrySendError::Full(unit)) => {
                self.metrics.record_write(WriteOutcome::Dropped);
                if let Some(count) = self.queue_gate.lock().record(Instant::now()) {
                    warn!("writer.event=queue_full dropped={} last_key={}", count, unit.flow_key);
                }
                false
            }
            Err(TrySendError::Closed(unit)) => {
                self.metrics.record_write(WriteOutcome::Dropped);
                trace!("writer.event=closed_drop key={}", unit.flow_key);
                false
            }
        }
    }

    /// Units accepted but not yet picked up by a worker.
    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub async fn close(self, mode: CloseMode) {
        let Self { tx, mut workers, metrics, drain_timeout, .. } = self;
        drop(tx);
        let mut mode = mode;
        if mode == CloseMode::Drain && tokio::time::timeout(drain_timeout, join_workers(&mut workers)).await.is_err() {
            warn!("writer.event=drain_timeout timeout={:?} workers={}", drain_timeout, workers.len());
            mode = CloseMode::Cancel;
        }
        if mode == CloseMode::Cancel {
            workers.abort_all();
        }
        join_workers(&mut workers).await;

        let settled = metrics.writes(WriteOutcome::Completed) + metrics.writes(WriteOutcome::Failed);
        let cancelled = metrics.writes(WriteOutcome::Submitted).saturating_sub(settled);
        for _ in 0..cancelled {
            metrics.record_write(WriteOutcome::Cancelled);
        }
        info!(
            "writer.event=closed mode={} completed={} failed={} cancelled={} dropped={}",
            mode.as_str(),
            metrics.writes(WriteOutcome::Completed),
            metrics.writes(WriteOutcome::Failed),
            cancelled,
            metrics.writes(WriteOutcome::Dropped)
        );
    }
}

async fn join_workers(workers: &mut JoinSet<()>) {
    while let Some(joined) = workers.join_next().await {
        if let Err(err) = joined {
            if !err.is_cancelled() {
                error!("writer.event=worker_panic error={}", err);
            }
        }
    }
}

async fn run_worker(
    worker: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<WriteUnit>>>,
    store: Arc<dyn ExpiringStore>,
    grace_period: Duration,
    metrics: Arc<CaptureMetrics>,
    failures: Arc<Mutex<SuppressingGate>>,
) {
    loop {
        let next = rx.lock().await.recv().await;
        let Some(unit) = next else {
            break;
        };
        match apply(store.as_ref(), &unit, grace_period).await {
            Ok(count) => {
                metrics.record_write(WriteOutcome::Completed);
                trace!("writer.event=write key={} count={}", unit.flow_key, count);
            }
            Err(err) => {
                metrics.record_write(WriteOutcome::Failed);
                if let Some(count) = failures.lock().record(Instant::now()) {
                    warn!("writer.event=write_failed worker={} failures={} key={} error={}", worker, count, unit.flow_key, err);
                }
            }
        }
    }
    trace!("writer.event=worker_stopped worker={}", worker);
}

async fn apply(store: &dyn ExpiringStore, unit: &WriteUnit, grace_period: Duration) -> StoreResult<i64> {
    store.incr_expire(&unit.client_key, grace_period).await?;
    store.incr_expire(&unit.flow_key, grace_period).await
}

/// Lets one warning through per interval and reports how many events it
/// stood for.
#[derive(Debug)]
pub(crate) struct SuppressingGate {
    interval: Duration,
    last: Option<Instant>,
    suppressed: u64,
}

impl SuppressingGate {
    pub(crate) fn new(interval: Duration) -> Self {
        Self { interval, last: None, suppressed: 0 }
    }

    pub(crate) fn record(&mut self, now: Instant) -> Option<u64> {
        self.suppressed += 1;
        match self.last {
            Some(prev) if now.saturating_duration_since(prev) < self.interval => None,
            _ => {
                self.last = Some(now);
                Some(std::mem::take(&mut self.suppressed))
            }
        }
    }
}
