//! Producer and inference loops, plus the shared stop signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::config::SharedSettings;
use crate::detect::DetectorFacade;
use crate::frame::FrameChannel;
use crate::ingest::{FrameSource, SourceAdapter};
use crate::pipeline::result_cell::SharedResultCell;
use crate::pipeline::stats::PipelineStats;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(2);
const POP_TIMEOUT: Duration = Duration::from_millis(100);
const STOP_CHECK_SLICE: Duration = Duration::from_millis(25);

/// Stop flag checked at the top of every worker loop, plus why it was raised.
#[derive(Debug, Default)]
pub struct StopSignal {
    flag: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag. The first reason wins.
    pub fn raise(&self, reason: impl Into<String>) {
        let mut current = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
        if current.is_none() {
            *current = Some(reason.into());
        }
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn flag(&self) -> &AtomicBool {
        &self.flag
    }

    /// Sleep for `duration`, waking early if the flag is raised.
    pub fn sleep(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.is_raised() {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            std::thread::sleep((deadline - now).min(STOP_CHECK_SLICE));
        }
    }
}

/// Exponential backoff: 100 ms doubling up to 2 s.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            current: INITIAL_BACKOFF,
        }
    }
}

impl Backoff {
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(MAX_BACKOFF);
        delay
    }

    pub fn reset(&mut self) {
        self.current = INITIAL_BACKOFF;
    }
}

pub(crate) struct ProducerContext {
    pub channel: Arc<FrameChannel>,
    pub stop: Arc<StopSignal>,
    pub stats: Arc<PipelineStats>,
    pub failure_limit: u32,
}

/// Read frames until stopped, end of stream, or too many consecutive failures.
/// Releases the source on exit.
pub(crate) fn run_producer(mut source: SourceAdapter, ctx: ProducerContext) {
    log::info!("producer: started ({})", source.stats().uri);
    let mut backoff = Backoff::default();
    let mut consecutive_failures = 0u32;
    let mut skipped_seen = 0u64;

    while !ctx.stop.is_raised() {
        let result = source.next_frame();

        let skipped = source.skipped();
        if skipped > skipped_seen {
            ctx.stats.frames_skipped(skipped - skipped_seen);
            skipped_seen = skipped;
        }

        match result {
            Ok(Some(frame)) => {
                consecutive_failures = 0;
                backoff.reset();
                ctx.stats.frame_captured();
                let evicted = ctx.channel.push(frame);
                if evicted > 0 {
                    ctx.stats.frames_dropped(evicted as u64);
                }
            }
            Ok(None) => {
                log::info!("producer: end of stream");
                ctx.stop.raise("frame source reached end of stream");
                break;
            }
            Err(e) => {
                consecutive_failures += 1;
                ctx.stats.capture_failed();
                if consecutive_failures >= ctx.failure_limit {
                    log::error!(
                        "producer: {} consecutive read failures, stopping: {:#}",
                        consecutive_failures,
                        e
                    );
                    ctx.stop.raise(format!(
                        "frame source failed {} times in a row: {:#}",
                        consecutive_failures, e
                    ));
                    break;
                }
                let delay = backoff.next_delay();
                log::warn!(
                    "producer: read failed ({}/{}), retrying in {:?}: {:#}",
                    consecutive_failures,
                    ctx.failure_limit,
                    delay,
                    e
                );
                ctx.stop.sleep(delay);
            }
        }
    }

    source.release();
    log::info!("producer: stopped");
}

pub(crate) struct InferenceContext {
    pub channel: Arc<FrameChannel>,
    pub cell: Arc<SharedResultCell>,
    pub settings: Arc<SharedSettings>,
    pub stop: Arc<StopSignal>,
    pub stats: Arc<PipelineStats>,
}

/// Pop the freshest frame, run every detector, publish the snapshot.
pub(crate) fn run_inference(mut detectors: DetectorFacade, ctx: InferenceContext) {
    log::info!("inference: started ({})", detectors.names().join(", "));
    while !ctx.stop.is_raised() {
        let Some(frame) = ctx.channel.pop(POP_TIMEOUT) else {
            continue;
        };
        let recall = ctx.settings.snapshot().recall_threshold;
        let output = detectors.run(&frame, recall);
        ctx.stats.inference_cycle(output.failures as u64);
        ctx.cell.publish(frame, output.sets);
    }
    log::info!("inference: stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::default();
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1600, 2000, 2000]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn first_stop_reason_wins() {
        let stop = StopSignal::new();
        assert!(!stop.is_raised());
        stop.raise("end of stream");
        stop.raise("stopped by request");
        assert!(stop.is_raised());
        assert_eq!(stop.reason().as_deref(), Some("end of stream"));
    }

    #[test]
    fn raised_signal_cuts_sleep_short() {
        let stop = StopSignal::new();
        stop.raise("test");
        let started = Instant::now();
        stop.sleep(Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
