//! Detection-correlation pipeline.
//!
//! Thread topology:
//!
//! ```text
//! producer -> FrameChannel -> inference -> SharedResultCell -+-> correlator -> finalizer threads
//!                                                            +-> renderer   -> LatestFrameSink
//! ```
//!
//! `Pipeline` owns the long-lived workers. Finalizer threads are detached and
//! not joined on shutdown.

pub mod correlator;
pub mod finalizer;
pub mod renderer;
pub mod result_cell;
pub mod stats;
pub mod workers;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::{PipelineConfig, RuntimeSettings, SharedSettings};
use crate::detect::DetectorFacade;
use crate::frame::FrameChannel;
use crate::ingest::{AdapterSettings, FrameSource, SourceAdapter};
use crate::lpr::PlateRecognizer;
use crate::storage::ViolationStore;
use crate::transport::NotificationBus;

pub use correlator::{
    anchor_roi, associate, classify_group, correlate, fallback_region, Association,
    AssociationGroup, CooldownState, Correlator, Decision, EventDispatcher, TickOutcome,
};
pub use finalizer::{FinalizeOutcome, Finalizer, ThreadDispatcher};
pub use renderer::{draw_overlay, EncodedFrame, FrameSink, LatestFrameSink, Renderer};
pub use result_cell::{ResultSnapshot, SharedResultCell};
pub use stats::{PipelineStats, StatsSnapshot};
pub use workers::{Backoff, StopSignal};

const JOIN_POLL: Duration = Duration::from_millis(10);

/// External services the finalizer talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub recognizer: Arc<dyn PlateRecognizer>,
    pub store: Arc<dyn ViolationStore>,
    pub bus: Arc<dyn NotificationBus>,
}

struct Worker {
    name: &'static str,
    handle: JoinHandle<()>,
}

struct Running {
    stop: Arc<StopSignal>,
    channel: Arc<FrameChannel>,
    workers: Vec<Worker>,
    started_at: Instant,
    source_uri: String,
    detectors: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct WorkerStatus {
    pub name: &'static str,
    pub alive: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct PipelineStatus {
    pub running: bool,
    /// Why the pipeline stopped, when it stopped on its own or by request.
    pub stop_reason: Option<String>,
    pub source_uri: Option<String>,
    pub detectors: Vec<String>,
    pub workers: Vec<WorkerStatus>,
    pub uptime_s: Option<u64>,
    pub settings: RuntimeSettings,
    pub stats: StatsSnapshot,
}

/// What `stop` managed to join.
#[derive(Clone, Debug, PartialEq)]
pub struct StopReport {
    pub reason: Option<String>,
    pub joined: Vec<&'static str>,
    /// Workers still running when the join timeout expired.
    pub detached: Vec<&'static str>,
    pub frames_discarded: usize,
}

pub struct Pipeline {
    config: PipelineConfig,
    collaborators: Collaborators,
    settings: Arc<SharedSettings>,
    stats: Arc<PipelineStats>,
    cell: Arc<SharedResultCell>,
    sink: Arc<LatestFrameSink>,
    running: Option<Running>,
    last_stop_reason: Option<String>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let settings = Arc::new(SharedSettings::new(config.runtime.clone())?);
        Ok(Self {
            config,
            collaborators,
            settings,
            stats: Arc::new(PipelineStats::default()),
            cell: Arc::new(SharedResultCell::new()),
            sink: Arc::new(LatestFrameSink::new()),
            running: None,
            last_stop_reason: None,
        })
    }

    /// Start with the production dispatcher: one finalizer thread per event.
    pub fn start(&mut self, source: Box<dyn FrameSource>, detectors: DetectorFacade) -> Result<()> {
        let finalizer = Arc::new(Finalizer::new(
            self.collaborators.recognizer.clone(),
            self.collaborators.store.clone(),
            self.collaborators.bus.clone(),
            self.config.correlator.violation_address.clone(),
            self.config.correlator.plate_jpeg_quality,
            self.stats.clone(),
        ));
        self.start_with_dispatcher(source, detectors, Box::new(ThreadDispatcher::new(finalizer)))
    }

    /// Start with a caller-supplied event dispatcher.
    ///
    /// Fails without spawning anything if the source cannot connect or a
    /// detector cannot warm up.
    pub fn start_with_dispatcher(
        &mut self,
        source: Box<dyn FrameSource>,
        mut detectors: DetectorFacade,
        dispatcher: Box<dyn EventDispatcher>,
    ) -> Result<()> {
        if let Some(running) = &self.running {
            if !running.stop.is_raised() {
                return Err(anyhow!("pipeline already running"));
            }
            // Stopped on its own; reap the old workers first.
            self.shutdown()?;
        }

        let mut source = SourceAdapter::new(
            source,
            AdapterSettings {
                frame_skip: self.config.source.frame_skip,
                max_width: match self.config.source.resize_width {
                    0 => None,
                    width => Some(width),
                },
            },
        );
        source.connect().context("connect frame source")?;
        if let Err(e) = detectors.warm_up() {
            source.release();
            return Err(e);
        }

        let source_uri = source.stats().uri;
        let detector_names = detectors.names();
        let stop = Arc::new(StopSignal::new());
        let channel = Arc::new(FrameChannel::new(self.config.channel_capacity));
        self.cell.clear();
        self.sink.clear();
        self.last_stop_reason = None;

        let correlator = Correlator::new(
            self.cell.clone(),
            self.settings.clone(),
            self.config.correlator.clone(),
            dispatcher,
            self.stats.clone(),
        );
        let renderer = self.config.renderer.enabled.then(|| {
            Renderer::new(
                self.cell.clone(),
                self.settings.clone(),
                self.config.renderer.clone(),
                self.sink.clone(),
                self.stats.clone(),
            )
        });

        let mut workers = Vec::with_capacity(4);
        let spawned = self.spawn_workers(
            &mut workers,
            source,
            detectors,
            correlator,
            renderer,
            &stop,
            &channel,
        );
        let mut running = Running {
            stop,
            channel,
            workers,
            started_at: Instant::now(),
            source_uri,
            detectors: detector_names,
        };
        if let Err(e) = spawned {
            running.stop.raise("worker spawn failed");
            let _ = self.join_workers(running);
            return Err(e);
        }

        log::info!(
            "pipeline: started {} worker(s) on {}",
            running.workers.len(),
            running.source_uri
        );
        self.running = Some(running);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_workers(
        &self,
        workers: &mut Vec<Worker>,
        source: SourceAdapter,
        detectors: DetectorFacade,
        correlator: Correlator,
        renderer: Option<Renderer>,
        stop: &Arc<StopSignal>,
        channel: &Arc<FrameChannel>,
    ) -> Result<()> {
        let producer_ctx = workers::ProducerContext {
            channel: channel.clone(),
            stop: stop.clone(),
            stats: self.stats.clone(),
            failure_limit: self.config.source.failure_limit,
        };
        workers.push(spawn_worker("producer", move || {
            workers::run_producer(source, producer_ctx)
        })?);

        let inference_ctx = workers::InferenceContext {
            channel: channel.clone(),
            cell: self.cell.clone(),
            settings: self.settings.clone(),
            stop: stop.clone(),
            stats: self.stats.clone(),
        };
        workers.push(spawn_worker("inference", move || {
            workers::run_inference(detectors, inference_ctx)
        })?);

        let correlator_stop = stop.clone();
        workers.push(spawn_worker("correlator", move || {
            correlator.run(correlator_stop.flag())
        })?);

        if let Some(renderer) = renderer {
            let renderer_stop = stop.clone();
            workers.push(spawn_worker("renderer", move || {
                renderer.run(renderer_stop.flag())
            })?);
        }
        Ok(())
    }

    /// Raise the stop flag, join workers within the configured timeout, drain
    /// the frame channel and clear the result cell.
    pub fn stop(&mut self) -> Result<StopReport> {
        match &self.running {
            Some(running) => running.stop.raise("stopped by request"),
            None => return Err(anyhow!("pipeline is not running")),
        }
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<StopReport> {
        let running = self
            .running
            .take()
            .ok_or_else(|| anyhow!("pipeline is not running"))?;
        let report = self.join_workers(running);
        self.cell.clear();
        self.last_stop_reason = report.reason.clone();
        if report.detached.is_empty() {
            log::info!("pipeline: stopped ({:?})", report.reason);
        } else {
            log::warn!(
                "pipeline: stopped with unjoined workers {:?} ({:?})",
                report.detached,
                report.reason
            );
        }
        Ok(report)
    }

    fn join_workers(&self, running: Running) -> StopReport {
        let deadline = Instant::now() + self.config.join_timeout;
        let mut pending = running.workers;
        let mut joined = Vec::new();

        while !pending.is_empty() && Instant::now() < deadline {
            let mut still_running = Vec::with_capacity(pending.len());
            for worker in pending {
                if worker.handle.is_finished() {
                    if worker.handle.join().is_err() {
                        log::error!("pipeline: {} worker panicked", worker.name);
                    }
                    joined.push(worker.name);
                } else {
                    still_running.push(worker);
                }
            }
            pending = still_running;
            if !pending.is_empty() {
                std::thread::sleep(JOIN_POLL);
            }
        }

        let frames_discarded = running.channel.drain();
        StopReport {
            reason: running.stop.reason(),
            joined,
            detached: pending.into_iter().map(|w| w.name).collect(),
            frames_discarded,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .map(|r| !r.stop.is_raised())
            .unwrap_or(false)
    }

    pub fn status(&self) -> PipelineStatus {
        let settings = (*self.settings.snapshot()).clone();
        let stats = self.stats.snapshot();
        match &self.running {
            Some(running) => PipelineStatus {
                running: !running.stop.is_raised(),
                stop_reason: running.stop.reason(),
                source_uri: Some(running.source_uri.clone()),
                detectors: running.detectors.clone(),
                workers: running
                    .workers
                    .iter()
                    .map(|w| WorkerStatus {
                        name: w.name,
                        alive: !w.handle.is_finished(),
                    })
                    .collect(),
                uptime_s: Some(running.started_at.elapsed().as_secs()),
                settings,
                stats,
            },
            None => PipelineStatus {
                running: false,
                stop_reason: self.last_stop_reason.clone(),
                source_uri: None,
                detectors: Vec::new(),
                workers: Vec::new(),
                uptime_s: None,
                settings,
                stats,
            },
        }
    }

    /// Change any of the three thresholds; `None` keeps the current value.
    pub fn set_thresholds(
        &self,
        recall: Option<f32>,
        decision: Option<f32>,
        display: Option<f32>,
    ) -> Result<Arc<RuntimeSettings>> {
        let updated = self.settings.update(|s| {
            if let Some(v) = recall {
                s.recall_threshold = v;
            }
            if let Some(v) = decision {
                s.decision_threshold = v;
            }
            if let Some(v) = display {
                s.display_threshold = v;
            }
        })?;
        log::info!(
            "pipeline: thresholds recall={} decision={} display={}",
            updated.recall_threshold,
            updated.decision_threshold,
            updated.display_threshold
        );
        Ok(updated)
    }

    pub fn update_settings(&self, settings: RuntimeSettings) -> Result<()> {
        self.settings.replace(settings)
    }

    pub fn settings(&self) -> Arc<RuntimeSettings> {
        self.settings.snapshot()
    }

    pub fn latest_frame_sink(&self) -> Arc<LatestFrameSink> {
        self.sink.clone()
    }

    pub fn result_cell(&self) -> Arc<SharedResultCell> {
        self.cell.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.running.is_some() {
            if let Err(e) = self.stop() {
                log::warn!("pipeline: stop on drop failed: {:#}", e);
            }
        }
    }
}

fn spawn_worker<F>(name: &'static str, f: F) -> Result<Worker>
where
    F: FnOnce() + Send + 'static,
{
    let handle = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .with_context(|| format!("spawn {} worker", name))?;
    Ok(Worker { name, handle })
}
