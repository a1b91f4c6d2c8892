use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crate::detect::LabelMap;
use crate::violation::FineSchedule;

const DEFAULT_SOURCE_URI: &str = "stub://front_gate";
const DEFAULT_SOURCE_WIDTH: u32 = 1280;
const DEFAULT_SOURCE_HEIGHT: u32 = 720;
const DEFAULT_FRAME_SKIP: u32 = 2;
const DEFAULT_RESIZE_WIDTH: u32 = 640;
const DEFAULT_FAILURE_LIMIT: u32 = 50;
const DEFAULT_CHANNEL_CAPACITY: usize = crate::frame::DEFAULT_CHANNEL_CAPACITY;

const DEFAULT_RECALL_THRESHOLD: f32 = 0.30;
const DEFAULT_DECISION_THRESHOLD: f32 = 0.65;
const DEFAULT_DISPLAY_THRESHOLD: f32 = 0.50;
const DEFAULT_COOLDOWN_MS: u64 = 3_000;
const DEFAULT_OCCUPANCY_LIMIT: usize = 2;

const DEFAULT_POLL_MS: u64 = 200;
const DEFAULT_VIOLATION_ADDRESS: &str = "unconfigured location";
const DEFAULT_PLATE_JPEG_QUALITY: u8 = 65;

const DEFAULT_RENDER_FPS: u32 = 15;
const DEFAULT_DISPLAY_WIDTH: u32 = 1024;
const DEFAULT_STREAM_JPEG_QUALITY: u8 = 75;

const DEFAULT_DB_PATH: &str = "violations.db";
const DEFAULT_LPR_TIMEOUT_MS: u64 = 3_000;
const DEFAULT_MQTT_CLIENT_ID: &str = "rider-watch";
const DEFAULT_MQTT_TOPIC_PREFIX: &str = "rider_watch";
const DEFAULT_JOIN_TIMEOUT_MS: u64 = 2_000;

// -------------------- File layer --------------------

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PipelineConfigFile {
    db_path: Option<String>,
    channel_capacity: Option<usize>,
    join_timeout_ms: Option<u64>,
    source: Option<SourceConfigFile>,
    thresholds: Option<ThresholdConfigFile>,
    correlator: Option<CorrelatorConfigFile>,
    renderer: Option<RendererConfigFile>,
    lpr: Option<LprConfigFile>,
    mqtt: Option<MqttConfigFile>,
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SourceConfigFile {
    uri: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    frame_skip: Option<u32>,
    resize_width: Option<u32>,
    failure_limit: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ThresholdConfigFile {
    recall: Option<f32>,
    decision: Option<f32>,
    display: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CorrelatorConfigFile {
    poll_ms: Option<u64>,
    cooldown_ms: Option<u64>,
    occupancy_limit: Option<usize>,
    violation_address: Option<String>,
    plate_jpeg_quality: Option<u8>,
    roi: Option<RoiFactors>,
    fallback_crop: Option<FallbackCrop>,
    fines: Option<FineSchedule>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RendererConfigFile {
    enabled: Option<bool>,
    fps: Option<u32>,
    display_width: Option<u32>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct LprConfigFile {
    url: Option<String>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct MqttConfigFile {
    broker: Option<String>,
    client_id: Option<String>,
    topic_prefix: Option<String>,
}

// -------------------- Resolved configuration --------------------

/// Anchor ROI expansion, in multiples of the anchor's own height (up/down) and
/// width (each side).
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RoiFactors {
    pub up: f32,
    pub down: f32,
    pub sides: f32,
}

impl Default for RoiFactors {
    fn default() -> Self {
        Self {
            up: 5.0,
            down: 0.5,
            sides: 1.0,
        }
    }
}

/// Crop around a lone rider when no anchor was found. The top edge stays at
/// the rider's head; the crop grows downward toward where a plate would be.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FallbackCrop {
    pub down: f32,
    pub sides: f32,
}

impl Default for FallbackCrop {
    fn default() -> Self {
        Self {
            down: 3.0,
            sides: 1.2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub uri: String,
    /// Frame size for synthetic sources.
    pub width: u32,
    pub height: u32,
    pub frame_skip: u32,
    /// 0 disables downscaling.
    pub resize_width: u32,
    /// Consecutive read failures before the producer stops the pipeline.
    pub failure_limit: u32,
}

#[derive(Debug, Clone)]
pub struct CorrelatorSettings {
    pub poll_interval: Duration,
    pub violation_address: String,
    pub plate_jpeg_quality: u8,
    pub roi: RoiFactors,
    pub fallback_crop: FallbackCrop,
    pub fines: FineSchedule,
}

impl Default for CorrelatorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_MS),
            violation_address: DEFAULT_VIOLATION_ADDRESS.to_string(),
            plate_jpeg_quality: DEFAULT_PLATE_JPEG_QUALITY,
            roi: RoiFactors::default(),
            fallback_crop: FallbackCrop::default(),
            fines: FineSchedule::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RendererSettings {
    pub enabled: bool,
    pub fps: u32,
    pub display_width: u32,
    pub jpeg_quality: u8,
}

impl Default for RendererSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            fps: DEFAULT_RENDER_FPS,
            display_width: DEFAULT_DISPLAY_WIDTH,
            jpeg_quality: DEFAULT_STREAM_JPEG_QUALITY,
        }
    }
}

impl RendererSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.fps.max(1)))
    }
}

#[derive(Debug, Clone)]
pub struct LprSettings {
    pub url: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker: String,
    pub client_id: String,
    pub topic_prefix: String,
}

/// Settings the control surface may change while the pipeline runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeSettings {
    /// Floor applied by the detector façade.
    pub recall_threshold: f32,
    /// Floor applied by the correlator.
    pub decision_threshold: f32,
    /// Floor applied by the renderer overlay.
    pub display_threshold: f32,
    pub cooldown: Duration,
    /// More associated riders than this is an overload violation.
    pub occupancy_limit: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            recall_threshold: DEFAULT_RECALL_THRESHOLD,
            decision_threshold: DEFAULT_DECISION_THRESHOLD,
            display_threshold: DEFAULT_DISPLAY_THRESHOLD,
            cooldown: Duration::from_millis(DEFAULT_COOLDOWN_MS),
            occupancy_limit: DEFAULT_OCCUPANCY_LIMIT,
        }
    }
}

impl RuntimeSettings {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("recall threshold", self.recall_threshold),
            ("decision threshold", self.decision_threshold),
            ("display threshold", self.display_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{} must be within [0, 1], got {}", name, value));
            }
        }
        if self.recall_threshold > self.decision_threshold {
            return Err(anyhow!(
                "recall threshold {} must not exceed decision threshold {}",
                self.recall_threshold,
                self.decision_threshold
            ));
        }
        if self.occupancy_limit == 0 {
            return Err(anyhow!("occupancy limit must be greater than zero"));
        }
        Ok(())
    }
}

/// Atomically swappable `RuntimeSettings`.
///
/// Readers take one `Arc` snapshot per tick, so a concurrent update never
/// yields a mix of old and new values within a tick.
#[derive(Debug, Default)]
pub struct SharedSettings {
    current: RwLock<Arc<RuntimeSettings>>,
}

impl SharedSettings {
    pub fn new(settings: RuntimeSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            current: RwLock::new(Arc::new(settings)),
        })
    }

    pub fn snapshot(&self) -> Arc<RuntimeSettings> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the settings after validating them. Invalid settings leave the
    /// current value in place.
    pub fn replace(&self, settings: RuntimeSettings) -> Result<()> {
        settings.validate()?;
        let mut current = self
            .current
            .write()
            .map_err(|_| anyhow!("settings lock poisoned"))?;
        *current = Arc::new(settings);
        Ok(())
    }

    /// Apply a change to a copy of the current settings and swap it in.
    pub fn update<F>(&self, f: F) -> Result<Arc<RuntimeSettings>>
    where
        F: FnOnce(&mut RuntimeSettings),
    {
        let mut current = self
            .current
            .write()
            .map_err(|_| anyhow!("settings lock poisoned"))?;
        let mut next = (**current).clone();
        f(&mut next);
        next.validate()?;
        *current = Arc::new(next);
        Ok(current.clone())
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub db_path: String,
    pub channel_capacity: usize,
    pub join_timeout: Duration,
    pub source: SourceSettings,
    pub runtime: RuntimeSettings,
    pub correlator: CorrelatorSettings,
    pub renderer: RendererSettings,
    pub lpr: LprSettings,
    pub mqtt: Option<MqttSettings>,
    pub labels: LabelMap,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::resolve(PipelineConfigFile::default())
    }
}

impl PipelineConfig {
    /// Defaults, then the file named by `RIDER_WATCH_CONFIG`, then env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("RIDER_WATCH_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load a specific file, then env overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut cfg = Self::from_file(read_config_file(path)?)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(mut file: PipelineConfigFile) -> Result<Self> {
        let labels = file.labels.take();
        let mut cfg = Self::resolve(file);
        if let Some(pairs) = labels {
            cfg.labels =
                LabelMap::from_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())))?;
        }
        Ok(cfg)
    }

    fn resolve(file: PipelineConfigFile) -> Self {
        let source = file.source.unwrap_or_default();
        let thresholds = file.thresholds.unwrap_or_default();
        let correlator = file.correlator.unwrap_or_default();
        let renderer = file.renderer.unwrap_or_default();
        let lpr = file.lpr.unwrap_or_default();

        let mqtt = file.mqtt.and_then(|mqtt| {
            mqtt.broker.map(|broker| MqttSettings {
                broker,
                client_id: mqtt
                    .client_id
                    .unwrap_or_else(|| DEFAULT_MQTT_CLIENT_ID.to_string()),
                topic_prefix: mqtt
                    .topic_prefix
                    .unwrap_or_else(|| DEFAULT_MQTT_TOPIC_PREFIX.to_string()),
            })
        });

        Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            channel_capacity: file.channel_capacity.unwrap_or(DEFAULT_CHANNEL_CAPACITY),
            join_timeout: Duration::from_millis(
                file.join_timeout_ms.unwrap_or(DEFAULT_JOIN_TIMEOUT_MS),
            ),
            source: SourceSettings {
                uri: source
                    .uri
                    .unwrap_or_else(|| DEFAULT_SOURCE_URI.to_string()),
                width: source.width.unwrap_or(DEFAULT_SOURCE_WIDTH),
                height: source.height.unwrap_or(DEFAULT_SOURCE_HEIGHT),
                frame_skip: source.frame_skip.unwrap_or(DEFAULT_FRAME_SKIP),
                resize_width: source.resize_width.unwrap_or(DEFAULT_RESIZE_WIDTH),
                failure_limit: source.failure_limit.unwrap_or(DEFAULT_FAILURE_LIMIT),
            },
            runtime: RuntimeSettings {
                recall_threshold: thresholds.recall.unwrap_or(DEFAULT_RECALL_THRESHOLD),
                decision_threshold: thresholds.decision.unwrap_or(DEFAULT_DECISION_THRESHOLD),
                display_threshold: thresholds.display.unwrap_or(DEFAULT_DISPLAY_THRESHOLD),
                cooldown: Duration::from_millis(
                    correlator.cooldown_ms.unwrap_or(DEFAULT_COOLDOWN_MS),
                ),
                occupancy_limit: correlator
                    .occupancy_limit
                    .unwrap_or(DEFAULT_OCCUPANCY_LIMIT),
            },
            correlator: CorrelatorSettings {
                poll_interval: Duration::from_millis(correlator.poll_ms.unwrap_or(DEFAULT_POLL_MS)),
                violation_address: correlator
                    .violation_address
                    .unwrap_or_else(|| DEFAULT_VIOLATION_ADDRESS.to_string()),
                plate_jpeg_quality: correlator
                    .plate_jpeg_quality
                    .unwrap_or(DEFAULT_PLATE_JPEG_QUALITY),
                roi: correlator.roi.unwrap_or_default(),
                fallback_crop: correlator.fallback_crop.unwrap_or_default(),
                fines: correlator.fines.unwrap_or_default(),
            },
            renderer: RendererSettings {
                enabled: renderer.enabled.unwrap_or(true),
                fps: renderer.fps.unwrap_or(DEFAULT_RENDER_FPS),
                display_width: renderer.display_width.unwrap_or(DEFAULT_DISPLAY_WIDTH),
                jpeg_quality: renderer.jpeg_quality.unwrap_or(DEFAULT_STREAM_JPEG_QUALITY),
            },
            lpr: LprSettings {
                url: lpr.url,
                timeout: Duration::from_millis(lpr.timeout_ms.unwrap_or(DEFAULT_LPR_TIMEOUT_MS)),
            },
            mqtt,
            labels: LabelMap::default(),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(uri) = non_empty_env("RIDER_WATCH_SOURCE") {
            self.source.uri = uri;
        }
        if let Some(path) = non_empty_env("RIDER_WATCH_DB_PATH") {
            self.db_path = path;
        }
        if let Some(url) = non_empty_env("RIDER_WATCH_LPR_URL") {
            self.lpr.url = Some(url);
        }
        if let Some(broker) = non_empty_env("RIDER_WATCH_MQTT_BROKER") {
            match self.mqtt.as_mut() {
                Some(mqtt) => mqtt.broker = broker,
                None => {
                    self.mqtt = Some(MqttSettings {
                        broker,
                        client_id: DEFAULT_MQTT_CLIENT_ID.to_string(),
                        topic_prefix: DEFAULT_MQTT_TOPIC_PREFIX.to_string(),
                    })
                }
            }
        }
        if let Some(value) = non_empty_env("RIDER_WATCH_DECISION_CONFIDENCE") {
            self.runtime.decision_threshold = value.trim().parse().map_err(|_| {
                anyhow!("RIDER_WATCH_DECISION_CONFIDENCE must be a number in [0, 1]")
            })?;
        }
        if let Some(value) = non_empty_env("RIDER_WATCH_COOLDOWN_MS") {
            let ms: u64 = value.trim().parse().map_err(|_| {
                anyhow!("RIDER_WATCH_COOLDOWN_MS must be an integer number of milliseconds")
            })?;
            self.runtime.cooldown = Duration::from_millis(ms);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.runtime.validate()?;
        if self.source.uri.trim().is_empty() {
            return Err(anyhow!("source uri must not be empty"));
        }
        if self.source.width == 0 || self.source.height == 0 {
            return Err(anyhow!("source frame size must be non-zero"));
        }
        if self.source.failure_limit == 0 {
            return Err(anyhow!("source failure limit must be greater than zero"));
        }
        if self.channel_capacity == 0 {
            return Err(anyhow!("channel capacity must be greater than zero"));
        }
        if self.correlator.poll_interval.is_zero() {
            return Err(anyhow!("correlator poll interval must be greater than zero"));
        }
        if self.join_timeout.is_zero() {
            return Err(anyhow!("join timeout must be greater than zero"));
        }
        if self.renderer.fps == 0 {
            return Err(anyhow!("renderer fps must be greater than zero"));
        }
        for (name, quality) in [
            ("plate jpeg quality", self.correlator.plate_jpeg_quality),
            ("stream jpeg quality", self.renderer.jpeg_quality),
        ] {
            if !(1..=100).contains(&quality) {
                return Err(anyhow!("{} must be within [1, 100], got {}", name, quality));
            }
        }
        let roi = &self.correlator.roi;
        let crop = &self.correlator.fallback_crop;
        for (name, factor) in [
            ("roi.up", roi.up),
            ("roi.down", roi.down),
            ("roi.sides", roi.sides),
            ("fallback_crop.down", crop.down),
            ("fallback_crop.sides", crop.sides),
        ] {
            if !factor.is_finite() || factor < 0.0 {
                return Err(anyhow!("{} must be a non-negative number", name));
            }
        }
        if self.labels.is_empty() {
            return Err(anyhow!("label map must not be empty"));
        }
        if let Some(url) = &self.lpr.url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(anyhow!("lpr url must be http(s): {}", url));
            }
        }
        if let Some(mqtt) = &self.mqtt {
            crate::transport::parse_mqtt_endpoint(&mqtt.broker)
                .with_context(|| format!("invalid mqtt broker '{}'", mqtt.broker))?;
        }
        Ok(())
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
