//! rider_watchd - violation detection daemon
//!
//! This daemon:
//! 1. Loads configuration (file named by RIDER_WATCH_CONFIG, then env overrides)
//! 2. Opens the violation store, plate recognizer and notification bus
//! 3. Starts the pipeline on the configured frame source
//! 4. Logs status periodically until Ctrl-C or the pipeline stops on its own

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use rider_watch::config::PipelineConfig;
use rider_watch::detect::{BoundingBox, DetectorFacade, RawDetection, ScriptedBackend};
use rider_watch::lpr::{HttpPlateRecognizer, PlateRecognizer, StaticPlateRecognizer};
use rider_watch::pipeline::{Collaborators, Pipeline};
use rider_watch::storage::SqliteViolationStore;
use rider_watch::transport::{MqttNotificationBus, NotificationBus, NullBus};
use rider_watch::violation::OwnerRecord;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (TOML or JSON). Overrides RIDER_WATCH_CONFIG.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Frame source URI (stub://name, rtsp://..., dir:///path).
    #[arg(long)]
    source: Option<String>,
    /// ONNX detector model (requires the backend-tract feature).
    #[arg(long)]
    model: Option<PathBuf>,
    /// Class names emitted by the model, in output order.
    #[arg(long, value_delimiter = ',', default_value = "helmet,no-helmet,plate")]
    model_classes: Vec<String>,
    /// Square model input size in pixels.
    #[arg(long, default_value_t = 640)]
    model_input: u32,
    /// Run with a scripted detector and a fixed plate answer.
    #[arg(long)]
    demo: bool,
    /// Seconds between status log lines.
    #[arg(long, default_value_t = 10)]
    status_interval_s: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => PipelineConfig::load_from(path)?,
        None => PipelineConfig::load()?,
    };
    if let Some(source) = &args.source {
        config.source.uri = source.clone();
    }
    config.validate()?;

    let detectors = build_detectors(&args, &config)?;
    let recognizer = build_recognizer(&args, &config);
    let store = Arc::new(SqliteViolationStore::open(&config.db_path)?);
    let mqtt = match &config.mqtt {
        Some(mqtt) => Some(Arc::new(MqttNotificationBus::connect(
            &mqtt.broker,
            &mqtt.client_id,
            &mqtt.topic_prefix,
        )?)),
        None => None,
    };
    let bus: Arc<dyn NotificationBus> = match &mqtt {
        Some(mqtt) => mqtt.clone(),
        None => Arc::new(NullBus),
    };

    let source = rider_watch::ingest::open_source(
        &config.source.uri,
        config.source.width,
        config.source.height,
    )?;
    let status_interval = Duration::from_secs(args.status_interval_s.max(1));
    log::info!(
        "rider_watchd {} writing to {}",
        env!("CARGO_PKG_VERSION"),
        config.db_path
    );

    let mut pipeline = Pipeline::new(
        config,
        Collaborators {
            recognizer,
            store,
            bus,
        },
    )?;
    pipeline.start(source, detectors)?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    loop {
        match rx.recv_timeout(status_interval) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                log::info!("shutdown signal received, stopping pipeline...");
                break;
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }
        let status = pipeline.status();
        log::info!(
            "status running={} frames={} dropped={} cycles={} events={} persisted={} abandoned={}",
            status.running,
            status.stats.frames_captured,
            status.stats.frames_dropped,
            status.stats.inference_cycles,
            status.stats.events_dispatched,
            status.stats.events_persisted,
            status.stats.events_abandoned
        );
        if !status.running {
            log::warn!(
                "pipeline stopped: {}",
                status.stop_reason.as_deref().unwrap_or("unknown reason")
            );
            break;
        }
    }

    let report = pipeline.stop()?;
    log::info!(
        "joined {:?}, unjoined {:?}, discarded {} frame(s)",
        report.joined,
        report.detached,
        report.frames_discarded
    );
    if let Some(mqtt) = mqtt {
        mqtt.disconnect()?;
    }
    Ok(())
}

fn build_detectors(args: &Args, config: &PipelineConfig) -> Result<DetectorFacade> {
    let mut facade = DetectorFacade::new(config.labels.clone());
    if let Some(model) = &args.model {
        register_model(&mut facade, model, args)?;
    }
    if args.demo {
        facade.register(ScriptedBackend::fixed("demo-scene", demo_scene()))?;
    }
    if facade.is_empty() {
        return Err(anyhow!("no detector configured (use --model or --demo)"));
    }
    Ok(facade)
}

#[cfg(feature = "backend-tract")]
fn register_model(facade: &mut DetectorFacade, model: &Path, args: &Args) -> Result<()> {
    facade.register(rider_watch::detect::backends::TractYoloBackend::new(
        "onnx-model",
        model,
        args.model_input,
        args.model_classes.clone(),
    )?)
}

#[cfg(not(feature = "backend-tract"))]
fn register_model(_facade: &mut DetectorFacade, model: &Path, _args: &Args) -> Result<()> {
    Err(anyhow!(
        "--model {} requires the backend-tract feature",
        model.display()
    ))
}

fn build_recognizer(args: &Args, config: &PipelineConfig) -> Arc<dyn PlateRecognizer> {
    if let Some(url) = &config.lpr.url {
        return Arc::new(HttpPlateRecognizer::new(url.clone(), config.lpr.timeout));
    }
    if args.demo {
        return Arc::new(StaticPlateRecognizer::found(OwnerRecord {
            license_plate_number: "DEMO001".to_string(),
            full_name: Some("Demo Owner".to_string()),
            ..OwnerRecord::default()
        }));
    }
    log::warn!("no plate recognition service configured; every event will be abandoned");
    Arc::new(StaticPlateRecognizer::not_found())
}

/// One plate with three riders above it, two without helmets.
fn demo_scene() -> Vec<RawDetection> {
    vec![
        RawDetection::new("plate", 0.9, BoundingBox::new(300.0, 300.0, 340.0, 315.0)),
        RawDetection::new("no-helmet", 0.8, BoundingBox::new(290.0, 220.0, 315.0, 250.0)),
        RawDetection::new("no-helmet", 0.7, BoundingBox::new(315.0, 225.0, 340.0, 255.0)),
        RawDetection::new("helmet", 0.85, BoundingBox::new(330.0, 230.0, 355.0, 260.0)),
    ]
}
