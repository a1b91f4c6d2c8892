use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use rider_watch::config::PipelineConfig;
use rider_watch::detect::ObjectClass;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "RIDER_WATCH_CONFIG",
        "RIDER_WATCH_SOURCE",
        "RIDER_WATCH_DB_PATH",
        "RIDER_WATCH_LPR_URL",
        "RIDER_WATCH_MQTT_BROKER",
        "RIDER_WATCH_DECISION_CONFIDENCE",
        "RIDER_WATCH_COOLDOWN_MS",
    ] {
        std::env::remove_var(key);
    }
}

fn temp_config(suffix: &str, contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    std::io::Write::write_all(&mut file, contents.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_json_config_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = temp_config(
        ".json",
        r#"{
            "db_path": "gate.db",
            "source": {
                "uri": "rtsp://camera-1/stream",
                "frame_skip": 3,
                "resize_width": 800
            },
            "thresholds": { "recall": 0.25, "decision": 0.6, "display": 0.4 },
            "correlator": {
                "cooldown_ms": 4000,
                "occupancy_limit": 3,
                "violation_address": "Main St / 5th Ave",
                "fines": { "no_helmet": 1000, "overload": 750 }
            },
            "lpr": { "url": "http://lpr.local/api/plate", "timeout_ms": 1500 }
        }"#,
    );

    std::env::set_var("RIDER_WATCH_CONFIG", file.path());
    std::env::set_var("RIDER_WATCH_DB_PATH", "override.db");
    std::env::set_var("RIDER_WATCH_DECISION_CONFIDENCE", "0.7");

    let cfg = PipelineConfig::load().expect("load config");

    assert_eq!(cfg.db_path, "override.db");
    assert_eq!(cfg.source.uri, "rtsp://camera-1/stream");
    assert_eq!(cfg.source.frame_skip, 3);
    assert_eq!(cfg.source.resize_width, 800);
    assert_eq!(cfg.runtime.recall_threshold, 0.25);
    assert_eq!(cfg.runtime.decision_threshold, 0.7);
    assert_eq!(cfg.runtime.display_threshold, 0.4);
    assert_eq!(cfg.runtime.cooldown, Duration::from_secs(4));
    assert_eq!(cfg.runtime.occupancy_limit, 3);
    assert_eq!(cfg.correlator.violation_address, "Main St / 5th Ave");
    assert_eq!(cfg.correlator.fines.no_helmet, 1000);
    assert_eq!(cfg.correlator.fines.overload, 750);
    assert_eq!(cfg.lpr.url.as_deref(), Some("http://lpr.local/api/plate"));
    assert_eq!(cfg.lpr.timeout, Duration::from_millis(1500));
    assert!(cfg.mqtt.is_none());

    clear_env();
}

#[test]
fn loads_toml_config_with_labels_and_mqtt() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = temp_config(
        ".toml",
        r#"
        [mqtt]
        broker = "mqtts://broker.local:8883"
        topic_prefix = "gate_7"

        [renderer]
        enabled = false

        [labels]
        "LP" = "plate"
        "rider-bare" = "no-helmet"
        "rider-helmet" = "helmet"
        "#,
    );
    std::env::set_var("RIDER_WATCH_COOLDOWN_MS", "1500");

    let cfg = PipelineConfig::load_from(file.path()).expect("load config");

    let mqtt = cfg.mqtt.expect("mqtt settings");
    assert_eq!(mqtt.broker, "mqtts://broker.local:8883");
    assert_eq!(mqtt.topic_prefix, "gate_7");
    assert_eq!(mqtt.client_id, "rider-watch");
    assert!(!cfg.renderer.enabled);
    assert_eq!(cfg.runtime.cooldown, Duration::from_millis(1500));
    assert_eq!(cfg.labels.classify("lp"), ObjectClass::Plate);
    assert_eq!(cfg.labels.classify("rider-bare"), ObjectClass::NoHelmet);
    // A label section replaces the built-in map.
    assert_eq!(cfg.labels.classify("motorcycle"), ObjectClass::Other);

    clear_env();
}

#[test]
fn defaults_apply_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = PipelineConfig::load().expect("defaults");
    assert_eq!(cfg.db_path, "violations.db");
    assert_eq!(cfg.source.uri, "stub://front_gate");
    assert_eq!(cfg.source.failure_limit, 50);
    assert_eq!(cfg.runtime.cooldown, Duration::from_secs(3));
    assert_eq!(cfg.correlator.plate_jpeg_quality, 65);
    assert!(cfg.lpr.url.is_none());
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let inverted = temp_config(
        ".json",
        r#"{ "thresholds": { "recall": 0.8, "decision": 0.5 } }"#,
    );
    assert!(PipelineConfig::load_from(inverted.path()).is_err());

    let unknown = temp_config(".json", r#"{ "correlator": { "cooldown": 5 } }"#);
    assert!(PipelineConfig::load_from(unknown.path()).is_err());

    let bad_label = temp_config(".toml", "[labels]\nbike = \"bicycle\"\n");
    assert!(PipelineConfig::load_from(bad_label.path()).is_err());

    let ok = temp_config(".json", "{}");
    std::env::set_var("RIDER_WATCH_DECISION_CONFIDENCE", "high");
    assert!(PipelineConfig::load_from(ok.path()).is_err());
    std::env::set_var("RIDER_WATCH_DECISION_CONFIDENCE", "1.5");
    assert!(PipelineConfig::load_from(ok.path()).is_err());
    std::env::set_var("RIDER_WATCH_DECISION_CONFIDENCE", "0.8");
    assert!(PipelineConfig::load_from(ok.path()).is_ok());

    clear_env();
}
