use crate::config::AgentConfig;
use crate::gateway::{CloseMode, WriteGateway};
use crate::metrics::{CaptureMetrics, MetricsSnapshot};
use crate::packet::{FlowClassifier, FlowKey};
use crate::recency::RecentCache;
use crate::source::PacketSource;
use crate::store::ExpiringStore;
use ipnet::IpNet;
use log::{debug, error, info, trace};
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::{interval_at, Interval, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Shutdown was signalled. In-flight writes are cancelled.
    Shutdown,
    /// The source has no more frames. Pending writes are drained.
    Exhausted,
    /// The source failed. Pending writes are drained.
    ReadError,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::Shutdown => "shutdown",
            StopReason::Exhausted => "exhausted",
            StopReason::ReadError => "read_error",
        }
    }

    fn close_mode(self) -> CloseMode {
        match self {
            StopReason::Shutdown => CloseMode::Cancel,
            StopReason::Exhausted | StopReason::ReadError => CloseMode::Drain,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSummary {
    pub reason: StopReason,
    pub metrics: MetricsSnapshot,
}

/// Single reader loop: classify, suppress duplicates, hand new flows to the
/// write gateway. Everything but the store writes runs inline.
pub struct CaptureService {
    classifier: FlowClassifier,
    recent: RecentCache<FlowKey>,
    gateway: WriteGateway,
    metrics: Arc<CaptureMetrics>,
    snaplen: usize,
    stats_interval: Option<Duration>,
}

impl CaptureService {
    pub const IDENT: &'static str = "flow-capture";

    /// Must be called from within a Tokio runtime; write workers are spawned here.
    pub fn new(config: &AgentConfig, local: IpNet, store: Arc<dyn ExpiringStore>, metrics: Arc<CaptureMetrics>) -> Self {
        let gateway = WriteGateway::new(
            store,
            config.store.grace_period(),
            config.writer.workers,
            config.writer.queue_depth,
            metrics.clone(),
        )
        .with_drain_timeout(config.writer.drain_timeout());
        Self {
            classifier: FlowClassifier::new(local, config.capture.ignore.clone()),
            recent: RecentCache::new(config.capture.recency),
            gateway,
            metrics,
            snaplen: config.capture.snaplen,
            stats_interval: config.stats.interval(),
        }
    }

    pub fn metrics(&self) -> &Arc<CaptureMetrics> {
        &self.metrics
    }

    /// Processes one frame. Returns the flow key when a write was submitted.
    pub fn handle_frame(&mut self, frame: &[u8], now: Instant) -> Option<FlowKey> {
        self.metrics.record_frame(frame.len());
        let key = match self.classifier.classify(frame) {
            Ok(key) => key,
            Err(reason) => {
                self.metrics.record_skip(reason);
                return None;
            }
        };
        if self.recent.seen_at(&key, now) {
            self.metrics.record_suppressed();
            return None;
        }
        self.metrics.record_flow();
        trace!("capture.event=new_flow flow={}", key);
        self.gateway.write_once_new(key.client, key.key()).then_some(key)
    }

    /// Runs until `shutdown` flips to `true`, the source is exhausted, or a
    /// read fails, then closes the gateway accordingly.
    pub async fn run<S>(mut self, source: &mut S, mut shutdown: watch::Receiver<bool>) -> CaptureSummary
    where
        S: PacketSource + ?Sized,
    {
        info!("capture.event=started ident={} source=\"{}\" local={}", Self::IDENT, source.describe(), self.classifier.local_network());
        let mut buf = vec![0u8; self.snaplen];
        let mut stats = self.stats_interval.map(|period| {
            let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        let reason = if *shutdown.borrow_and_update() {
            StopReason::Shutdown
        } else {
            loop {
                tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break StopReason::Shutdown;
                        }
                    }
                    _ = next_tick(&mut stats) => {
                        info!("capture.event=stats {}", self.metrics.snapshot().log_line());
                    }
                    frame = source.next_frame(&mut buf) => match frame {
                        Ok(Some(len)) => {
                            self.handle_frame(&buf[..len], Instant::now());
                        }
                        Ok(None) => break StopReason::Exhausted,
                        Err(err) if is_transient(&err) => {
                            debug!("capture.event=read_retry error={}", err);
                        }
                        Err(err) => {
                            self.metrics.record_read_error();
                            error!("capture.event=read_failed error={}", err);
                            break StopReason::ReadError;
                        }
                    }
                }
            }
        };

        info!("capture.event=stopping reason={} pending_writes={}", reason.as_str(), self.gateway.pending());
        let Self { gateway, metrics, .. } = self;
        gateway.close(reason.close_mode()).await;
        let snapshot = metrics.snapshot();
        info!("capture.event=stopped {}", snapshot.log_line());
        CaptureSummary { reason, metrics: snapshot }
    }
}

/// Flips `shutdown` once `signal` fires. If the signal cannot be listened
/// for, the agent keeps capturing and the failure is logged.
pub async fn shutdown_on<F>(signal: F, shutdown: watch::Sender<bool>)
where
    F: Future<Output = io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            info!("=== Shutdown signal received ===");
            let _ = shutdown.send(true);
        }
        Err(e) => {
            error!("Failed to listen for shutdown signal, continuing without it: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock)
}

async fn next_tick(stats: &mut Option<Interval>) {
    match stats {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::fixtures::ipv4_frame;
    use crate::packet::{SkipReason, IPPROTO_TCP, IPPROTO_UDP};
    use crate::store::MemoryStore;
    use std::net::Ipv4Addr;

    fn service(store: Arc<MemoryStore>) -> CaptureService {
        CaptureService::new(&AgentConfig::default(), "10.0.0.0/24".parse().unwrap(), store, Arc::new(CaptureMetrics::new()))
    }

    #[tokio::test]
    async fn duplicate_frames_write_once() {
        let mut service = service(Arc::new(MemoryStore::new()));
        let frame = ipv4_frame(Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(1, 1, 1, 1), IPPROTO_UDP, 40000, 53);
        let now = Instant::now();
        assert!(service.handle_frame(&frame, now).is_some());
        assert!(service.handle_frame(&frame, now).is_none());
        assert_eq!(service.metrics().suppressed_total(), 1);
        assert_eq!(service.metrics().flows_emitted(), 1);
    }

    #[tokio::test]
    async fn skipped_frames_are_counted_by_reason() {
        let mut service = service(Arc::new(MemoryStore::new()));
        let internal = ipv4_frame(Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 0, 0, 6), IPPROTO_TCP, 1, 2);
        assert!(service.handle_frame(&internal, Instant::now()).is_none());
        assert!(service.handle_frame(&[0x45], Instant::now()).is_none());
        assert_eq!(service.metrics().skips(SkipReason::Internal), 1);
        assert_eq!(service.metrics().skips(SkipReason::Truncated), 1);
        assert_eq!(service.metrics().frames_total(), 2);
    }

    #[tokio::test]
    async fn signal_sends_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        shutdown_on(async { Ok(()) }, tx).await;
        assert!(*rx.borrow_and_update());
    }

    #[tokio::test]
    async fn failed_signal_registration_keeps_running() {
        let (tx, rx) = watch::channel(false);
        let waiter = shutdown_on(async { Err(io::Error::new(io::ErrorKind::Other, "no signal handler")) }, tx);
        assert!(tokio::time::timeout(Duration::from_millis(50), waiter).await.is_err());
        assert!(!*rx.borrow());
    }
}
