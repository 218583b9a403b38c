use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the capture thread and the processing workers.
#[derive(Debug, Default)]
pub struct PipelineStats {
    frames_captured: AtomicU64,
    decode_failed: AtomicU64,
    records_published: AtomicU64,
    sink_failed: AtomicU64,
}

impl PipelineStats {
    pub fn record_captured(&self) {
        self.frames_captured.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_failure(&self) {
        self.decode_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_published(&self) {
        self.records_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sink_failure(&self) {
        self.sink_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Pipeline-side counters only; queue and resolver counters are merged
    /// in by the controller.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            decode_failed: self.decode_failed.load(Ordering::Relaxed),
            records_published: self.records_published.load(Ordering::Relaxed),
            sink_failed: self.sink_failed.load(Ordering::Relaxed),
            ..StatsSnapshot::default()
        }
    }
}

/// Read-only view of the diagnostics counters at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames_captured: u64,
    /// Evicted from the capture queue on overflow.
    pub frames_dropped: u64,
    pub decode_failed: u64,
    pub records_published: u64,
    pub sink_failed: u64,
    pub resolver_hits: u64,
    pub resolver_misses: u64,
    pub resolver_negative: u64,
}

impl StatsSnapshot {
    /// Frames that reached the sink, successfully or not.
    pub fn frames_processed(&self) -> u64 {
        self.records_published + self.sink_failed
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "captured={} dropped={} decode_failed={} published={} sink_failed={} resolver(hit={} miss={} negative={})",
            self.frames_captured,
            self.frames_dropped,
            self.decode_failed,
            self.records_published,
            self.sink_failed,
            self.resolver_hits,
            self.resolver_misses,
            self.resolver_negative
        )
    }
}
