// sense-pipeline/src/stats.rs
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Point-in-time copy of the pipeline counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub frames_captured: u64,
    /// Frames dropped because the engine was still busy.
    pub dropped_busy: u64,
    pub dropped_malformed: u64,
    pub predictions: u64,
    pub inference_failures: u64,
    /// Results computed for a session that had already ended.
    pub discarded_stale: u64,
    /// Longest gap between two consecutive capture timestamps.
    pub max_frame_gap: Duration,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub frames_captured: AtomicU64,
    pub dropped_busy: AtomicU64,
    pub dropped_malformed: AtomicU64,
    pub predictions: AtomicU64,
    pub inference_failures: AtomicU64,
    pub discarded_stale: AtomicU64,
    max_gap_us: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_gap(&self, gap: Duration) {
        self.max_gap_us
            .fetch_max(gap.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        PipelineStats {
            frames_captured: get(&self.frames_captured),
            dropped_busy: get(&self.dropped_busy),
            dropped_malformed: get(&self.dropped_malformed),
            predictions: get(&self.predictions),
            inference_failures: get(&self.inference_failures),
            discarded_stale: get(&self.discarded_stale),
            max_frame_gap: Duration::from_micros(get(&self.max_gap_us)),
        }
    }
}
