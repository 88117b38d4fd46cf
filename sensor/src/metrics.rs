use crate::packet::SkipReason;
use std::array;
use std::sync::atomic::{AtomicU64, Ordering};

/// Outcome of one submitted write unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteOutcome {
    Submitted,
    Completed,
    Failed,
    /// Queue full at submission.
    Dropped,
    /// Aborted by shutdown.
    Cancelled,
}

impl WriteOutcome {
    pub const ALL: [WriteOutcome; 5] =
        [WriteOutcome::Submitted, WriteOutcome::Completed, WriteOutcome::Failed, WriteOutcome::Dropped, WriteOutcome::Cancelled];

    pub fn as_str(self) -> &'static str {
        match self {
            WriteOutcome::Submitted => "submitted",
            WriteOutcome::Completed => "completed",
            WriteOutcome::Failed => "failed",
            WriteOutcome::Dropped => "dropped",
            WriteOutcome::Cancelled => "cancelled",
        }
    }

    pub fn index(self) -> usize {
        match self {
            WriteOutcome::Submitted => 0,
            WriteOutcome::Completed => 1,
            WriteOutcome::Failed => 2,
            WriteOutcome::Dropped => 3,
            WriteOutcome::Cancelled => 4,
        }
    }
}

/// Lock-free counters for the capture loop and the write gateway.
#[derive(Debug)]
pub struct CaptureMetrics {
    frames_total: AtomicU64,
    bytes_total: AtomicU64,
    read_errors: AtomicU64,
    flows_emitted: AtomicU64,
    suppressed_total: AtomicU64,
    skips_total: [AtomicU64; SkipReason::ALL.len()],
    writes_total: [AtomicU64; WriteOutcome::ALL.len()],
}

impl Default for CaptureMetrics {
    fn default() -> Self {
        Self {
            frames_total: AtomicU64::new(0),
            bytes_total: AtomicU64::new(0),
            read_errors: AtomicU64::new(0),
            flows_emitted: AtomicU64::new(0),
            suppressed_total: AtomicU64::new(0),
            skips_total: array::from_fn(|_| AtomicU64::new(0)),
            writes_total: array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

impl CaptureMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_frame(&self, bytes: usize) {
        self.frames_total.fetch_add(1, Ordering::Relaxed);
        self.bytes_total.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_read_error(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skip(&self, reason: SkipReason) {
        self.skips_total[reason.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_suppressed(&self) {
        self.suppressed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flow(&self) {
        self.flows_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self, outcome: WriteOutcome) {
        self.writes_total[outcome.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_total(&self) -> u64 {
        self.frames_total.load(Ordering::Relaxed)
    }

    pub fn flows_emitted(&self) -> u64 {
        self.flows_emitted.load(Ordering::Relaxed)
    }

    pub fn suppressed_total(&self) -> u64 {
        self.suppressed_total.load(Ordering::Relaxed)
    }

    pub fn skips(&self, reason: SkipReason) -> u64 {
        self.skips_total[reason.index()].load(Ordering::Relaxed)
    }

    pub fn writes(&self, outcome: WriteOutcome) -> u64 {
        self.writes_total[outcome.index()].load(Ordering::Relaxed)
    }

    pub fn skips_snapshot(&self) -> Vec<(&'static str, u64)> {
        SkipReason::ALL.iter().enumerate().map(|(idx, reason)| (reason.as_str(), self.skips_total[idx].load(Ordering::Relaxed))).collect()
    }

    pub fn writes_snapshot(&self) -> Vec<(&'static str, u64)> {
        WriteOutcome::ALL
            .iter()
            .enumerate()
            .map(|(idx, outcome)| (outcome.as_str(), self.writes_total[idx].load(Ordering::Relaxed)))
            .collect()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames: self.frames_total(),
            bytes: self.bytes_total.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            flows: self.flows_emitted(),
            suppressed: self.suppressed_total(),
            skips: self.skips_snapshot(),
            writes: self.writes_snapshot(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub frames: u64,
    pub bytes: u64,
    pub read_errors: u64,
    pub flows: u64,
    pub suppressed: u64,
    pub skips: Vec<(&'static str, u64)>,
    pub writes: Vec<(&'static str, u64)>,
}

impl MetricsSnapshot {
    /// Single `key=value` line for the periodic stats log.
    pub fn log_line(&self) -> String {
        let mut line = format!(
            "frames={} bytes={} read_errors={} flows={} suppressed={}",
            self.frames, self.bytes, self.read_errors, self.flows, self.suppressed
        );
        for (name, value) in &self.skips {
            line.push_str(&format!(" skip_{name}={value}"));
        }
        for (name, value) in &self.writes {
            line.push_str(&format!(" write_{name}={value}"));
        }
        line
    }
}
