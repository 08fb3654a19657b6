use std::sync::Mutex;
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use presence_kernel::config::{PresenceConfig, DEFAULT_TIMEOUT_SECS};
use presence_kernel::imaging::content_key;
use presence_kernel::services::{FsObjectStore, ObjectStore};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "PRESENCE_CONFIG",
        "PRESENCE_LOCATION",
        "PRESENCE_TIMEOUT_SECS",
        "PRESENCE_MQTT_BROKER",
        "PRESENCE_OBJECT_DIR",
        "PRESENCE_VECTOR_DB",
        "PRESENCE_WEBHOOK_URL",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(suffix: &str, contents: &str) -> NamedTempFile {
    let mut file = Builder::new().suffix(suffix).tempfile().expect("temp config");
    std::io::Write::write_all(&mut file, contents.as_bytes()).expect("write config");
    file
}

const JSON_CONFIG: &str = r#"{
    "location": "warehouse",
    "timeout_secs": 120,
    "cameras": [
        {
            "name": "front",
            "regions": [
                {"name": "Entrance", "polygon": [[0,0],[100,0],[100,100],[0,100]]},
                {"name": "Yard"}
            ],
            "rois": ["Entrance"]
        },
        {
            "name": "back",
            "regions": [{"name": "Dock", "polygon": [[0,0],[50,0],[50,50]]}],
            "rois": ["Dock"],
            "timeout_secs": 30,
            "whole_frame_matches": true
        }
    ],
    "storage": {"bucket": "crops", "object_dir": "/var/lib/presence/objects"},
    "collections": {"faces": {"name": "faces_v2", "dimension": 512}},
    "services": {"vision_url": "http://vision:8000", "timeout_secs": 3},
    "notifications": {"start_template": "{region} busy at {time}", "queue_capacity": 8},
    "enrichment": {"faces": false},
    "mqtt": {"topic_prefix": "site/frames/"}
}"#;

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(".json", JSON_CONFIG);
    std::env::set_var("PRESENCE_CONFIG", file.path());
    std::env::set_var("PRESENCE_LOCATION", "depot");
    std::env::set_var("PRESENCE_VECTOR_DB", "/tmp/vectors.db");
    std::env::set_var("PRESENCE_WEBHOOK_URL", "https://hooks.example.com/T000/B000");

    let cfg = PresenceConfig::load().expect("load config");

    assert_eq!(cfg.location, "depot");
    assert_eq!(cfg.timeout, Duration::from_secs(120));
    assert_eq!(cfg.cameras.len(), 2);
    assert_eq!(cfg.cameras[0].name, "front");
    assert_eq!(cfg.cameras[0].timeout, Duration::from_secs(120));
    assert_eq!(cfg.cameras[0].rois, vec!["Entrance"]);
    assert!(cfg.cameras[0].region("Yard").unwrap().polygon.is_none());
    assert_eq!(cfg.cameras[1].timeout, Duration::from_secs(30));
    assert!(cfg.cameras[1].whole_frame_matches);
    assert_eq!(cfg.storage.bucket, "crops");
    assert_eq!(cfg.storage.vector_db.to_str(), Some("/tmp/vectors.db"));
    assert_eq!(cfg.collections.faces.name, "faces_v2");
    assert_eq!(cfg.collections.faces.dimension, 512);
    assert_eq!(cfg.collections.captions.name, "cctv_persons_action_captions");
    assert_eq!(cfg.services.vision_url, "http://vision:8000");
    assert_eq!(cfg.services.timeout, Duration::from_secs(3));
    assert_eq!(
        cfg.notifications.webhook_url.as_deref(),
        Some("https://hooks.example.com/T000/B000")
    );
    assert_eq!(cfg.notifications.templates.start, "{region} busy at {time}");
    assert_eq!(
        cfg.notifications.templates.end,
        "Person is no longer visible nearby {region}"
    );
    assert_eq!(cfg.notifications.queue_capacity, 8);
    assert!(!cfg.toggles.faces);
    assert!(cfg.toggles.captions && cfg.toggles.notify && cfg.toggles.crops);
    assert_eq!(cfg.mqtt.topic_prefix, "site/frames");

    let settings = cfg.pipeline_settings();
    assert_eq!(settings.location, "depot");
    assert_eq!(settings.bucket, "crops");
    assert!(!settings.toggles.faces);
    assert_eq!(cfg.catalog().names(), &["front".to_string(), "back".to_string()]);

    clear_env();
}

#[test]
fn defaults_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = PresenceConfig::load().expect("load defaults");
    assert_eq!(cfg.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
    assert_eq!(cfg.timeout, Duration::from_secs(240));
    assert!((cfg.footprint_ratio - 0.0425).abs() < f64::EPSILON);
    assert!((cfg.expand_ratio - 0.15).abs() < f64::EPSILON);
    assert_eq!(cfg.services.timeout, Duration::from_secs(5));
    assert!(cfg.cameras.is_empty());
    assert!(cfg.notifications.webhook_url.is_none());
    assert_eq!(cfg.notifications.templates.time_format, "%H:%M %Y-%m-%d (%A)");
    assert_eq!(cfg.mqtt.broker, "127.0.0.1:1883");

    clear_env();
}

#[test]
fn loads_toml_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".toml",
        r#"
location = "lobby"

[[cameras]]
name = "hall"
rois = ["Desk"]

[[cameras.regions]]
name = "Desk"
polygon = [[10, 10], [60, 10], [60, 60], [10, 60]]

[mqtt]
broker = "broker.local:1884"
"#,
    );
    std::env::set_var("PRESENCE_TIMEOUT_SECS", "15");

    let cfg = PresenceConfig::load_from(Some(file.path())).expect("load toml");
    assert_eq!(cfg.location, "lobby");
    assert_eq!(cfg.cameras[0].name, "hall");
    assert_eq!(cfg.cameras[0].timeout, Duration::from_secs(15));
    assert!(cfg.cameras[0].is_subscribed("Desk"));
    assert_eq!(cfg.mqtt.broker, "broker.local:1884");

    clear_env();
}

#[test]
fn rejects_invalid_configs() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cases = [
        (r#"{"timeout_secs": 0}"#, "timeout"),
        (r#"{"footprint_ratio": 1.5}"#, "footprint_ratio"),
        (
            r#"{"cameras": [{"name": "a"}, {"name": "a"}]}"#,
            "duplicate camera",
        ),
        (
            r#"{"cameras": [{"name": "a", "regions": [{"name": "r"}, {"name": "r"}]}]}"#,
            "duplicate region",
        ),
        (
            r#"{"cameras": [{"name": "a", "regions": [{"name": "r", "polygon": [[0,0],[1,1]]}]}]}"#,
            "region 'r'",
        ),
        (
            r#"{"cameras": [{"name": "a", "rois": ["nowhere"]}]}"#,
            "nowhere",
        ),
        (r#"{"services": {"face_url": "not a url"}}"#, "face_url"),
        (
            r#"{"notifications": {"time_format": "%H:%Q"}}"#,
            "time_format",
        ),
    ];
    for (json, expected) in cases {
        let file = write_config(".json", json);
        let err = PresenceConfig::load_from(Some(file.path())).expect_err(json);
        let message = format!("{:#}", err);
        assert!(
            message.contains(expected),
            "error for {} was '{}', expected '{}'",
            json,
            message,
            expected
        );
    }

    std::env::set_var("PRESENCE_TIMEOUT_SECS", "soon");
    assert!(PresenceConfig::load_from(None).is_err());

    clear_env();
}

#[test]
fn missing_config_file_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("PRESENCE_CONFIG", "/nonexistent/presence.json");
    let err = PresenceConfig::load().unwrap_err();
    assert!(err.to_string().contains("failed to read config file"));

    clear_env();
}

#[test]
fn camera_names_with_spaces_store_crops() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(".json", r#"{"cameras": [{"name": "Front Door"}]}"#);
    let cfg = PresenceConfig::load_from(Some(file.path())).expect("load config");
    assert_eq!(cfg.cameras[0].name, "Front Door");

    let dir = tempfile::tempdir().unwrap();
    let store = FsObjectStore::open(dir.path()).unwrap();
    let key = content_key(&cfg.cameras[0].name, b"person crop");
    assert_eq!(
        store.put(&cfg.storage.bucket, &key, b"person crop", "image/jpeg").unwrap(),
        key
    );
    assert!(store.path_for(&cfg.storage.bucket, &key).unwrap().exists());

    clear_env();
}
