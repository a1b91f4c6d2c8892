use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Pipeline counters. Written by the workers, read by `Pipeline::status`.
#[derive(Debug, Default)]
pub struct PipelineStats {
    frames_captured: AtomicU64,
    frames_dropped: AtomicU64,
    frames_skipped: AtomicU64,
    capture_failures: AtomicU64,
    inference_cycles: AtomicU64,
    detector_failures: AtomicU64,
    correlator_ticks: AtomicU64,
    events_dispatched: AtomicU64,
    events_persisted: AtomicU64,
    events_abandoned: AtomicU64,
    frames_rendered: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub frames_captured: u64,
    /// Evicted from the frame channel by drop-oldest backpressure.
    pub frames_dropped: u64,
    /// Discarded by the source adapter's frame-skip.
    pub frames_skipped: u64,
    pub capture_failures: u64,
    pub inference_cycles: u64,
    pub detector_failures: u64,
    pub correlator_ticks: u64,
    pub events_dispatched: u64,
    pub events_persisted: u64,
    pub events_abandoned: u64,
    pub frames_rendered: u64,
}

fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl PipelineStats {
    pub fn frame_captured(&self) {
        bump(&self.frames_captured, 1);
    }

    pub fn frames_dropped(&self, n: u64) {
        bump(&self.frames_dropped, n);
    }

    pub fn frames_skipped(&self, n: u64) {
        bump(&self.frames_skipped, n);
    }

    pub fn capture_failed(&self) {
        bump(&self.capture_failures, 1);
    }

    pub fn inference_cycle(&self, failures: u64) {
        bump(&self.inference_cycles, 1);
        bump(&self.detector_failures, failures);
    }

    pub fn correlator_tick(&self) {
        bump(&self.correlator_ticks, 1);
    }

    pub fn event_dispatched(&self) {
        bump(&self.events_dispatched, 1);
    }

    pub fn event_persisted(&self, records: u64) {
        bump(&self.events_persisted, records);
    }

    pub fn event_abandoned(&self) {
        bump(&self.events_abandoned, 1);
    }

    pub fn frame_rendered(&self) {
        bump(&self.frames_rendered, 1);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            frames_captured: load(&self.frames_captured),
            frames_dropped: load(&self.frames_dropped),
            frames_skipped: load(&self.frames_skipped),
            capture_failures: load(&self.capture_failures),
            inference_cycles: load(&self.inference_cycles),
            detector_failures: load(&self.detector_failures),
            correlator_ticks: load(&self.correlator_ticks),
            events_dispatched: load(&self.events_dispatched),
            events_persisted: load(&self.events_persisted),
            events_abandoned: load(&self.events_abandoned),
            frames_rendered: load(&self.frames_rendered),
        }
    }
}
