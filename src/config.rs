use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::imaging::DEFAULT_EXPAND_RATIO;
use crate::notify::{MessageTemplates, DEFAULT_QUEUE_CAPACITY};
use crate::pipeline::{
    EnrichmentToggles, PipelineSettings, DEFAULT_BUCKET, DEFAULT_CAPTIONS_COLLECTION,
    DEFAULT_CAPTION_DIMENSION, DEFAULT_FACES_COLLECTION, DEFAULT_FACE_DIMENSION,
};
use crate::region::{Camera, CameraCatalog, Point, Polygon, Region, DEFAULT_FOOTPRINT_RATIO};
use crate::services::CollectionSchema;

/// Debounce window: how long a region stays active after the last sighting.
pub const DEFAULT_TIMEOUT_SECS: u64 = 4 * 60;

const DEFAULT_LOCATION: &str = "default";
const DEFAULT_OBJECT_DIR: &str = "objects";
const DEFAULT_VECTOR_DB: &str = "presence_vectors.db";
const DEFAULT_SERVICE_TIMEOUT_SECS: u64 = 5;
const DEFAULT_VISION_URL: &str = "http://127.0.0.1:8000";
const DEFAULT_CAPTION_MODEL: &str = "florence-large";
const DEFAULT_FACE_URL: &str = "http://127.0.0.1:5000";
const DEFAULT_FACE_MODEL: &str = "Facenet";
const DEFAULT_FACE_DETECTOR: &str = "mtcnn";
const DEFAULT_EMBEDDING_URL: &str = "http://127.0.0.1:11434";
const DEFAULT_EMBEDDING_MODEL: &str = "nomic-embed-text";
const DEFAULT_MQTT_BROKER: &str = "127.0.0.1:1883";
const DEFAULT_TOPIC_PREFIX: &str = "cameras/frames";
const DEFAULT_CLIENT_ID: &str = "presenced";
const VECTOR_FIELD: &str = "embedding";

#[derive(Debug, Deserialize, Default)]
struct PresenceConfigFile {
    location: Option<String>,
    timeout_secs: Option<u64>,
    footprint_ratio: Option<f64>,
    expand_ratio: Option<f64>,
    cameras: Option<Vec<CameraConfigFile>>,
    storage: Option<StorageConfigFile>,
    collections: Option<CollectionsConfigFile>,
    services: Option<ServicesConfigFile>,
    notifications: Option<NotificationsConfigFile>,
    enrichment: Option<EnrichmentConfigFile>,
    mqtt: Option<MqttConfigFile>,
}

#[derive(Debug, Deserialize, Clone)]
struct CameraConfigFile {
    name: String,
    regions: Option<Vec<RegionConfigFile>>,
    rois: Option<Vec<String>>,
    timeout_secs: Option<u64>,
    whole_frame_matches: Option<bool>,
}

#[derive(Debug, Deserialize, Clone)]
struct RegionConfigFile {
    name: String,
    polygon: Option<Vec<Point>>,
}

#[derive(Debug, Deserialize, Default)]
struct StorageConfigFile {
    bucket: Option<String>,
    object_dir: Option<PathBuf>,
    vector_db: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct CollectionsConfigFile {
    captions: Option<CollectionConfigFile>,
    faces: Option<CollectionConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CollectionConfigFile {
    name: Option<String>,
    dimension: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct ServicesConfigFile {
    vision_url: Option<String>,
    caption_model: Option<String>,
    face_url: Option<String>,
    face_model: Option<String>,
    face_detector: Option<String>,
    embedding_url: Option<String>,
    embedding_model: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct NotificationsConfigFile {
    webhook_url: Option<String>,
    start_template: Option<String>,
    end_template: Option<String>,
    time_format: Option<String>,
    queue_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct EnrichmentConfigFile {
    notify: Option<bool>,
    captions: Option<bool>,
    faces: Option<bool>,
    crops: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    broker: Option<String>,
    topic_prefix: Option<String>,
    client_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Site name stored with every record.
    pub location: String,
    /// Default debounce window; cameras may override it.
    pub timeout: Duration,
    pub footprint_ratio: f64,
    pub expand_ratio: f64,
    /// Built by `validate`.
    pub cameras: Vec<Camera>,
    pub storage: StorageSettings,
    pub collections: CollectionSettings,
    pub services: ServiceSettings,
    pub notifications: NotificationSettings,
    pub toggles: EnrichmentToggles,
    pub mqtt: MqttSettings,
    camera_files: Vec<CameraConfigFile>,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub bucket: String,
    pub object_dir: PathBuf,
    pub vector_db: PathBuf,
}

#[derive(Debug, Clone)]
pub struct CollectionSettings {
    pub captions: CollectionSchema,
    pub faces: CollectionSchema,
}

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub vision_url: String,
    pub caption_model: String,
    pub face_url: String,
    pub face_model: String,
    pub face_detector: String,
    pub embedding_url: String,
    pub embedding_model: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct NotificationSettings {
    /// Without a webhook, notifications go to the log.
    pub webhook_url: Option<String>,
    pub templates: MessageTemplates,
    pub queue_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker: String,
    pub topic_prefix: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl PresenceConfig {
    /// Load from the file named by `PRESENCE_CONFIG` (defaults only when
    /// unset), then apply `PRESENCE_*` overrides and validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("PRESENCE_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PresenceConfigFile) -> Self {
        let storage = file.storage.unwrap_or_default();
        let collections = file.collections.unwrap_or_default();
        let services = file.services.unwrap_or_default();
        let notifications = file.notifications.unwrap_or_default();
        let enrichment = file.enrichment.unwrap_or_default();
        let mqtt = file.mqtt.unwrap_or_default();
        let defaults = MessageTemplates::default();

        Self {
            location: file.location.unwrap_or_else(|| DEFAULT_LOCATION.to_string()),
            timeout: Duration::from_secs(file.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)),
            footprint_ratio: file.footprint_ratio.unwrap_or(DEFAULT_FOOTPRINT_RATIO),
            expand_ratio: file.expand_ratio.unwrap_or(DEFAULT_EXPAND_RATIO),
            cameras: Vec::new(),
            storage: StorageSettings {
                bucket: storage.bucket.unwrap_or_else(|| DEFAULT_BUCKET.to_string()),
                object_dir: storage
                    .object_dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_OBJECT_DIR)),
                vector_db: storage
                    .vector_db
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_VECTOR_DB)),
            },
            collections: CollectionSettings {
                captions: collection(
                    collections.captions,
                    DEFAULT_CAPTIONS_COLLECTION,
                    DEFAULT_CAPTION_DIMENSION,
                ),
                faces: collection(
                    collections.faces,
                    DEFAULT_FACES_COLLECTION,
                    DEFAULT_FACE_DIMENSION,
                ),
            },
            services: ServiceSettings {
                vision_url: services
                    .vision_url
                    .unwrap_or_else(|| DEFAULT_VISION_URL.to_string()),
                caption_model: services
                    .caption_model
                    .unwrap_or_else(|| DEFAULT_CAPTION_MODEL.to_string()),
                face_url: services
                    .face_url
                    .unwrap_or_else(|| DEFAULT_FACE_URL.to_string()),
                face_model: services
                    .face_model
                    .unwrap_or_else(|| DEFAULT_FACE_MODEL.to_string()),
                face_detector: services
                    .face_detector
                    .unwrap_or_else(|| DEFAULT_FACE_DETECTOR.to_string()),
                embedding_url: services
                    .embedding_url
                    .unwrap_or_else(|| DEFAULT_EMBEDDING_URL.to_string()),
                embedding_model: services
                    .embedding_model
                    .unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string()),
                timeout: Duration::from_secs(
                    services.timeout_secs.unwrap_or(DEFAULT_SERVICE_TIMEOUT_SECS),
                ),
            },
            notifications: NotificationSettings {
                webhook_url: notifications.webhook_url,
                templates: MessageTemplates {
                    start: notifications.start_template.unwrap_or(defaults.start),
                    end: notifications.end_template.unwrap_or(defaults.end),
                    time_format: notifications.time_format.unwrap_or(defaults.time_format),
                },
                queue_capacity: notifications
                    .queue_capacity
                    .unwrap_or(DEFAULT_QUEUE_CAPACITY),
            },
            toggles: EnrichmentToggles {
                notify: enrichment.notify.unwrap_or(true),
                captions: enrichment.captions.unwrap_or(true),
                faces: enrichment.faces.unwrap_or(true),
                crops: enrichment.crops.unwrap_or(true),
            },
            mqtt: MqttSettings {
                broker: mqtt.broker.unwrap_or_else(|| DEFAULT_MQTT_BROKER.to_string()),
                topic_prefix: mqtt
                    .topic_prefix
                    .unwrap_or_else(|| DEFAULT_TOPIC_PREFIX.to_string()),
                client_id: mqtt
                    .client_id
                    .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string()),
                username: mqtt.username,
                password: mqtt.password,
            },
            camera_files: file.cameras.unwrap_or_default(),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(location) = std::env::var("PRESENCE_LOCATION") {
            if !location.trim().is_empty() {
                self.location = location;
            }
        }
        if let Ok(timeout) = std::env::var("PRESENCE_TIMEOUT_SECS") {
            let seconds: u64 = timeout.trim().parse().map_err(|_| {
                anyhow!("PRESENCE_TIMEOUT_SECS must be an integer number of seconds")
            })?;
            self.timeout = Duration::from_secs(seconds);
        }
        if let Ok(broker) = std::env::var("PRESENCE_MQTT_BROKER") {
            if !broker.trim().is_empty() {
                self.mqtt.broker = broker;
            }
        }
        if let Ok(dir) = std::env::var("PRESENCE_OBJECT_DIR") {
            if !dir.trim().is_empty() {
                self.storage.object_dir = PathBuf::from(dir);
            }
        }
        if let Ok(db) = std::env::var("PRESENCE_VECTOR_DB") {
            if !db.trim().is_empty() {
                self.storage.vector_db = PathBuf::from(db);
            }
        }
        if let Ok(url) = std::env::var("PRESENCE_WEBHOOK_URL") {
            if !url.trim().is_empty() {
                self.notifications.webhook_url = Some(url);
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(anyhow!("timeout must be greater than zero"));
        }
        if !(self.footprint_ratio > 0.0 && self.footprint_ratio <= 1.0) {
            return Err(anyhow!(
                "footprint_ratio must be in (0, 1], got {}",
                self.footprint_ratio
            ));
        }
        if !(self.expand_ratio >= 0.0 && self.expand_ratio <= 1.0) {
            return Err(anyhow!(
                "expand_ratio must be in [0, 1], got {}",
                self.expand_ratio
            ));
        }
        if self.services.timeout.is_zero() {
            return Err(anyhow!("services.timeout_secs must be greater than zero"));
        }
        if !crate::is_valid_time_format(&self.notifications.templates.time_format) {
            return Err(anyhow!(
                "notifications.time_format '{}' is not a valid strftime pattern",
                self.notifications.templates.time_format
            ));
        }
        if self.notifications.queue_capacity == 0 {
            return Err(anyhow!("notifications.queue_capacity must be greater than zero"));
        }
        if self.collections.captions.dimension == 0 || self.collections.faces.dimension == 0 {
            return Err(anyhow!("collection dimensions must be greater than zero"));
        }
        if self.collections.captions.name == self.collections.faces.name {
            return Err(anyhow!(
                "caption and face collections must differ (both '{}')",
                self.collections.faces.name
            ));
        }
        for (name, value) in [
            ("services.vision_url", &self.services.vision_url),
            ("services.face_url", &self.services.face_url),
            ("services.embedding_url", &self.services.embedding_url),
        ] {
            validate_url(name, value)?;
        }
        if let Some(webhook) = &self.notifications.webhook_url {
            validate_url("notifications.webhook_url", webhook)?;
        }
        if self.mqtt.topic_prefix.trim_matches('/').is_empty() {
            return Err(anyhow!("mqtt.topic_prefix cannot be empty"));
        }
        self.mqtt.topic_prefix = self.mqtt.topic_prefix.trim_end_matches('/').to_string();

        self.cameras = self
            .camera_files
            .iter()
            .map(|file| build_camera(file, self.timeout))
            .collect::<Result<_>>()?;
        let mut seen = HashSet::new();
        for camera in &self.cameras {
            if !seen.insert(camera.name.as_str()) {
                return Err(anyhow!("duplicate camera '{}'", camera.name));
            }
        }
        Ok(())
    }

    pub fn catalog(&self) -> CameraCatalog {
        CameraCatalog::new(self.cameras.clone())
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            location: self.location.clone(),
            bucket: self.storage.bucket.clone(),
            footprint_ratio: self.footprint_ratio,
            expand_ratio: self.expand_ratio,
            captions: self.collections.captions.clone(),
            faces: self.collections.faces.clone(),
            templates: self.notifications.templates.clone(),
            toggles: self.toggles,
        }
    }
}

fn collection(file: Option<CollectionConfigFile>, name: &str, dimension: usize) -> CollectionSchema {
    let file = file.unwrap_or_default();
    CollectionSchema::new(
        file.name.unwrap_or_else(|| name.to_string()),
        VECTOR_FIELD,
        file.dimension.unwrap_or(dimension),
    )
}

fn build_camera(file: &CameraConfigFile, default_timeout: Duration) -> Result<Camera> {
    let name = file.name.trim();
    if name.is_empty() {
        return Err(anyhow!("camera name cannot be empty"));
    }
    if name.contains('/') || name.contains('+') || name.contains('#') {
        return Err(anyhow!("camera name '{}' cannot contain '/', '+' or '#'", name));
    }

    let mut regions = Vec::new();
    let mut region_names = HashSet::new();
    for region in file.regions.iter().flatten() {
        if region.name.trim().is_empty() {
            return Err(anyhow!("camera '{}': region name cannot be empty", name));
        }
        if !region_names.insert(region.name.clone()) {
            return Err(anyhow!(
                "camera '{}': duplicate region '{}'",
                name,
                region.name
            ));
        }
        let polygon = match &region.polygon {
            Some(points) => Some(
                Polygon::new(points.clone())
                    .with_context(|| format!("camera '{}': region '{}'", name, region.name))?,
            ),
            None => None,
        };
        regions.push(Region::new(region.name.clone(), polygon));
    }

    let rois = file.rois.clone().unwrap_or_default();
    for roi in &rois {
        if !region_names.contains(roi) {
            return Err(anyhow!(
                "camera '{}': roi '{}' does not name a region",
                name,
                roi
            ));
        }
    }

    let timeout = match file.timeout_secs {
        Some(0) => return Err(anyhow!("camera '{}': timeout_secs must be > 0", name)),
        Some(seconds) => Duration::from_secs(seconds),
        None => default_timeout,
    };
    Ok(Camera::new(name, regions, rois)
        .with_timeout(timeout)
        .with_whole_frame_matches(file.whole_frame_matches.unwrap_or(false)))
}

fn validate_url(name: &str, value: &str) -> Result<()> {
    let parsed =
        url::Url::parse(value).with_context(|| format!("{} is not a valid url: {}", name, value))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(anyhow!("{} must use http or https, got '{}'", name, other)),
    }
}

fn read_config_file(path: &Path) -> Result<PresenceConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera_file(json: &str) -> CameraConfigFile {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn camera_inherits_default_timeout() {
        let file = camera_file(
            r#"{"name": "front", "regions": [{"name": "porch", "polygon": [[0,0],[10,0],[10,10]]}], "rois": ["porch"]}"#,
        );
        let camera = build_camera(&file, Duration::from_secs(30)).unwrap();
        assert_eq!(camera.timeout, Duration::from_secs(30));
        assert!(camera.is_subscribed("porch"));
        assert!(!camera.whole_frame_matches);
    }

    #[test]
    fn rejects_short_polygon_and_unknown_roi() {
        let short = camera_file(r#"{"name": "front", "regions": [{"name": "porch", "polygon": [[0,0],[10,0]]}]}"#);
        assert!(build_camera(&short, Duration::from_secs(1)).is_err());

        let roi = camera_file(r#"{"name": "front", "regions": [{"name": "porch"}], "rois": ["gate"]}"#);
        let err = build_camera(&roi, Duration::from_secs(1)).unwrap_err();
        assert!(err.to_string().contains("gate"));
    }

    #[test]
    fn rejects_topic_wildcards_in_camera_names() {
        let file = camera_file(r#"{"name": "front/+"}"#);
        assert!(build_camera(&file, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn url_validation_requires_http() {
        assert!(validate_url("x", "http://localhost:8000").is_ok());
        assert!(validate_url("x", "ftp://localhost").is_err());
        assert!(validate_url("x", "not a url").is_err());
    }
}
