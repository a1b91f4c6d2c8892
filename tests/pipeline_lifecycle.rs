use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rider_watch::config::PipelineConfig;
use rider_watch::detect::{
    BoundingBox, Detection, DetectionSet, DetectorFacade, LabelMap, ObjectClass, RawDetection,
    ScriptedBackend,
};
use rider_watch::frame::Frame;
use rider_watch::ingest::{
    open_source, FrameSource, SourceStats, SyntheticConfig, SyntheticSource,
};
use rider_watch::lpr::StaticPlateRecognizer;
use rider_watch::pipeline::{Collaborators, Pipeline, SharedResultCell};
use rider_watch::storage::InMemoryViolationStore;
use rider_watch::transport::BroadcastBus;
use rider_watch::violation::{OwnerRecord, ViolationType};

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    store: Arc<InMemoryViolationStore>,
    bus: Arc<BroadcastBus>,
    recognizer: Arc<StaticPlateRecognizer>,
}

impl Harness {
    fn new(recognizer: StaticPlateRecognizer) -> Self {
        Self {
            store: Arc::new(InMemoryViolationStore::new()),
            bus: Arc::new(BroadcastBus::new()),
            recognizer: Arc::new(recognizer),
        }
    }

    fn found() -> Self {
        Self::new(StaticPlateRecognizer::found(OwnerRecord {
            license_plate_number: "AB1234".to_string(),
            full_name: Some("Jane Rider".to_string()),
            ..OwnerRecord::default()
        }))
    }

    fn pipeline(&self, config: PipelineConfig) -> Result<Pipeline> {
        Pipeline::new(
            config,
            Collaborators {
                recognizer: self.recognizer.clone(),
                store: self.store.clone(),
                bus: self.bus.clone(),
            },
        )
    }
}

fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.source.uri = "stub://lifecycle".to_string();
    config.source.width = 640;
    config.source.height = 360;
    config.source.frame_skip = 1;
    config.source.resize_width = 0;
    config.correlator.poll_interval = Duration::from_millis(20);
    config.renderer.fps = 30;
    config
}

fn stub_source() -> Result<Box<dyn FrameSource>> {
    open_source("stub://lifecycle", 640, 360)
}

fn crowded_scene() -> DetectorFacade {
    let scene = vec![
        RawDetection::new("plate", 0.9, BoundingBox::new(300.0, 300.0, 340.0, 315.0)),
        RawDetection::new("no-helmet", 0.8, BoundingBox::new(290.0, 230.0, 315.0, 260.0)),
        RawDetection::new("no-helmet", 0.7, BoundingBox::new(315.0, 232.0, 340.0, 262.0)),
        RawDetection::new("helmet", 0.85, BoundingBox::new(330.0, 235.0, 355.0, 265.0)),
    ];
    DetectorFacade::new(LabelMap::default())
        .with_backend(ScriptedBackend::fixed("scene", scene))
        .expect("register backend")
}

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    check()
}

/// Fails to connect; records whether it was released.
struct OfflineCamera;

impl FrameSource for OfflineCamera {
    fn connect(&mut self) -> Result<()> {
        Err(anyhow!("camera offline"))
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        Ok(None)
    }

    fn is_healthy(&self) -> bool {
        false
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: 0,
            uri: "rtsp://offline".to_string(),
        }
    }
}

/// Connects, then every read fails.
struct FlakyCamera {
    released: Arc<AtomicBool>,
}

impl FrameSource for FlakyCamera {
    fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        Err(anyhow!("decoder stalled"))
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: 0,
            uri: "rtsp://flaky".to_string(),
        }
    }

    fn release(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

#[test]
fn violation_flows_from_source_to_bus() -> Result<()> {
    let harness = Harness::found();
    let rx = harness.bus.subscribe()?;
    let mut pipeline = harness.pipeline(test_config())?;
    pipeline.start(stub_source()?, crowded_scene())?;
    assert!(pipeline.is_running());

    let first = rx.recv_timeout(WAIT)?;
    let second = rx.recv_timeout(WAIT)?;
    let mut types = vec![first.violation_type, second.violation_type];
    types.sort_by_key(|t| t.as_str());
    assert_eq!(types, vec![ViolationType::NoHelmet, ViolationType::Overload]);
    assert_eq!(first.license_plate, "AB1234");
    assert_eq!(first.owner_name.as_deref(), Some("Jane Rider"));
    // Both candidates share the one evidence crop.
    assert_eq!(first.crop_sha256, second.crop_sha256);

    let report = pipeline.stop()?;
    assert!(report.detached.is_empty(), "unjoined: {:?}", report.detached);
    assert_eq!(report.joined.len(), 4);
    assert_eq!(report.reason.as_deref(), Some("stopped by request"));
    assert!(harness.store.len() >= 2);
    assert!(harness.recognizer.calls() >= 1);

    let status = pipeline.status();
    assert!(!status.running);
    assert_eq!(status.stop_reason.as_deref(), Some("stopped by request"));
    assert!(status.stats.events_dispatched >= 1);
    assert!(status.stats.events_persisted >= 2);
    Ok(())
}

#[test]
fn renderer_publishes_annotated_jpeg() -> Result<()> {
    let harness = Harness::found();
    let mut pipeline = harness.pipeline(test_config())?;
    let sink = pipeline.latest_frame_sink();
    pipeline.start(stub_source()?, crowded_scene())?;

    let frame = sink.wait_newer(0, WAIT).expect("rendered frame");
    assert_eq!(&frame.jpeg[..2], &[0xFF, 0xD8]);
    assert!(frame.mjpeg_part().starts_with(b"--frame\r\n"));

    pipeline.stop()?;
    assert!(pipeline.stats().frames_rendered >= 1);
    Ok(())
}

#[test]
fn unrecognized_plate_abandons_event() -> Result<()> {
    let harness = Harness::new(StaticPlateRecognizer::not_found());
    let mut pipeline = harness.pipeline(test_config())?;
    pipeline.start(stub_source()?, crowded_scene())?;

    assert!(wait_until(WAIT, || pipeline.stats().events_abandoned >= 1));
    pipeline.stop()?;
    assert!(harness.store.is_empty());
    assert_eq!(pipeline.stats().events_persisted, 0);
    Ok(())
}

#[test]
fn start_and_stop_reject_wrong_state() -> Result<()> {
    let harness = Harness::found();
    let mut pipeline = harness.pipeline(test_config())?;
    assert!(pipeline.stop().is_err());

    pipeline.start(stub_source()?, crowded_scene())?;
    let err = pipeline
        .start(stub_source()?, crowded_scene())
        .expect_err("second start");
    assert!(err.to_string().contains("already running"));

    pipeline.stop()?;
    assert!(pipeline.stop().is_err());
    Ok(())
}

#[test]
fn startup_failures_leave_pipeline_stopped() -> Result<()> {
    let harness = Harness::found();
    let mut pipeline = harness.pipeline(test_config())?;

    let err = pipeline
        .start(Box::new(OfflineCamera), crowded_scene())
        .expect_err("offline camera");
    assert!(format!("{:#}", err).contains("camera offline"));
    assert!(!pipeline.is_running());

    let err = pipeline
        .start(stub_source()?, DetectorFacade::new(LabelMap::default()))
        .expect_err("no detectors");
    assert!(format!("{:#}", err).contains("no detector backends"));
    assert!(!pipeline.is_running());
    assert_eq!(pipeline.stats().frames_captured, 0);
    Ok(())
}

#[test]
fn end_of_stream_stops_pipeline_and_allows_restart() -> Result<()> {
    let harness = Harness::found();
    let mut pipeline = harness.pipeline(test_config())?;
    let finite = SyntheticSource::new(SyntheticConfig {
        uri: "stub://finite".to_string(),
        width: 640,
        height: 360,
        max_frames: Some(5),
    });
    pipeline.start(Box::new(finite), crowded_scene())?;

    assert!(wait_until(WAIT, || !pipeline.is_running()));
    assert_eq!(
        pipeline.status().stop_reason.as_deref(),
        Some("frame source reached end of stream")
    );

    // A self-stopped pipeline is reaped by the next start.
    pipeline.start(stub_source()?, crowded_scene())?;
    assert!(pipeline.is_running());
    let report = pipeline.stop()?;
    assert_eq!(report.reason.as_deref(), Some("stopped by request"));
    Ok(())
}

#[test]
fn repeated_read_failures_stop_pipeline() -> Result<()> {
    let harness = Harness::found();
    let mut config = test_config();
    config.source.failure_limit = 3;
    let mut pipeline = harness.pipeline(config)?;
    let released = Arc::new(AtomicBool::new(false));
    pipeline.start(
        Box::new(FlakyCamera {
            released: released.clone(),
        }),
        crowded_scene(),
    )?;

    assert!(wait_until(WAIT, || !pipeline.is_running()));
    let report = pipeline.stop()?;
    let reason = report.reason.unwrap_or_default();
    assert!(
        reason.starts_with("frame source failed 3 times in a row"),
        "reason: {}",
        reason
    );
    assert!(released.load(Ordering::SeqCst));
    assert_eq!(pipeline.stats().capture_failures, 3);
    Ok(())
}

#[test]
fn thresholds_change_while_running() -> Result<()> {
    let harness = Harness::found();
    let mut pipeline = harness.pipeline(test_config())?;
    pipeline.start(stub_source()?, crowded_scene())?;

    let updated = pipeline.set_thresholds(None, Some(0.9), Some(0.2))?;
    assert_eq!(updated.decision_threshold, 0.9);
    assert_eq!(updated.display_threshold, 0.2);

    // recall above decision is rejected and nothing changes.
    assert!(pipeline.set_thresholds(Some(0.95), None, None).is_err());
    assert_eq!(pipeline.settings().recall_threshold, 0.30);
    assert_eq!(pipeline.status().settings.decision_threshold, 0.9);

    pipeline.stop()?;
    Ok(())
}

#[test]
fn readers_never_see_torn_snapshots() {
    let cell = Arc::new(SharedResultCell::new());
    let done = Arc::new(AtomicBool::new(false));

    let writer = {
        let cell = cell.clone();
        let done = done.clone();
        std::thread::spawn(move || {
            for seq in 1..=2_000u64 {
                let detection = Detection::new(
                    ObjectClass::Helmet,
                    0.9,
                    BoundingBox::new(seq as f32, 0.0, seq as f32 + 1.0, 1.0),
                );
                cell.publish(
                    Frame::filled(8, 8, [0, 0, 0], seq),
                    vec![DetectionSet::new(format!("frame-{}", seq), vec![detection])],
                );
            }
            done.store(true, Ordering::SeqCst);
        })
    };

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let cell = cell.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                let mut last_generation = 0;
                while !done.load(Ordering::SeqCst) {
                    let Some(snapshot) = cell.latest() else {
                        continue;
                    };
                    assert!(snapshot.generation >= last_generation);
                    last_generation = snapshot.generation;
                    let seq = snapshot.frame.seq;
                    assert_eq!(snapshot.sets[0].source, format!("frame-{}", seq));
                    assert_eq!(snapshot.sets[0].detections[0].bbox.x1, seq as f32);
                }
            })
        })
        .collect();

    writer.join().expect("writer");
    for reader in readers {
        reader.join().expect("reader");
    }
    assert_eq!(cell.generation(), 2_000);
}
