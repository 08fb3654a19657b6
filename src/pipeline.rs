//! Per-frame person orchestration.
//!
//! For every `person` detection, in detection order:
//!
//! 1. tight and expanded crops,
//! 2. tight crop persisted to the object store,
//! 3. footprint region join,
//! 4. presence signal for each overlapped subscribed region,
//! 5. caption of the expanded crop, embedded and stored,
//! 6. face scan of the tight crop, one record per face.
//!
//! Steps 2, 5 and 6 are isolated from each other: each lands in its own
//! `Option<Result<..>>` slot of the [`PersonReport`] (`None` when switched
//! off), and a failure is logged without stopping the rest.

use image::DynamicImage;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::{GeometryError, PipelineError, StorageError};
use crate::imaging;
use crate::notify::{MessageTemplates, NotificationDispatcher, RegionNotifier};
use crate::presence::{PresenceKey, PresenceRegistry, TimerScheduler, Transition};
use crate::region::{BBox, Camera, CameraCatalog, DEFAULT_FOOTPRINT_RATIO};
use crate::services::{
    CollectionSchema, FaceEmbeddingService, ObjectDetectionService, ObjectStore,
    TextEmbeddingService, VectorRecord, VectorStore,
};
use crate::{format_timestamp, Detection};

pub const DEFAULT_BUCKET: &str = "persons";
pub const DEFAULT_CAPTIONS_COLLECTION: &str = "cctv_persons_action_captions";
pub const DEFAULT_FACES_COLLECTION: &str = "master_faces";
pub const DEFAULT_CAPTION_DIMENSION: usize = 768;
pub const DEFAULT_FACE_DIMENSION: usize = 128;

/// Everything the pipeline talks to, built once at startup.
#[derive(Clone)]
pub struct Collaborators {
    pub detector: Arc<dyn ObjectDetectionService>,
    pub faces: Arc<dyn FaceEmbeddingService>,
    pub embedder: Arc<dyn TextEmbeddingService>,
    pub vectors: Arc<dyn VectorStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub notifier: Arc<NotificationDispatcher>,
}

/// Per-step switches. `crops` covers object-store persistence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EnrichmentToggles {
    pub notify: bool,
    pub captions: bool,
    pub faces: bool,
    pub crops: bool,
}

impl Default for EnrichmentToggles {
    fn default() -> Self {
        Self {
            notify: true,
            captions: true,
            faces: true,
            crops: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    /// Site name stored with every record.
    pub location: String,
    pub bucket: String,
    pub footprint_ratio: f64,
    pub expand_ratio: f64,
    pub captions: CollectionSchema,
    pub faces: CollectionSchema,
    pub templates: MessageTemplates,
    pub toggles: EnrichmentToggles,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            location: "default".to_string(),
            bucket: DEFAULT_BUCKET.to_string(),
            footprint_ratio: DEFAULT_FOOTPRINT_RATIO,
            expand_ratio: imaging::DEFAULT_EXPAND_RATIO,
            captions: CollectionSchema::new(
                DEFAULT_CAPTIONS_COLLECTION,
                "embedding",
                DEFAULT_CAPTION_DIMENSION,
            ),
            faces: CollectionSchema::new(
                DEFAULT_FACES_COLLECTION,
                "embedding",
                DEFAULT_FACE_DIMENSION,
            ),
            templates: MessageTemplates::default(),
            toggles: EnrichmentToggles::default(),
        }
    }
}

/// Outcome of one person detection.
#[derive(Debug)]
pub struct PersonReport {
    /// Position in the frame's detection list.
    pub index: usize,
    pub bbox: BBox,
    pub regions: Vec<String>,
    pub signaled: Vec<(String, Transition)>,
    pub crop_key: Option<Result<String, PipelineError>>,
    pub caption: Option<Result<String, PipelineError>>,
    /// Number of face records written.
    pub faces: Option<Result<usize, PipelineError>>,
}

impl PersonReport {
    /// Number of enrichment steps that ran and failed.
    pub fn failures(&self) -> usize {
        [
            self.crop_key.as_ref().map(Result::is_err),
            self.caption.as_ref().map(Result::is_err),
            self.faces.as_ref().map(Result::is_err),
        ]
        .into_iter()
        .filter(|failed| *failed == Some(true))
        .count()
    }
}

#[derive(Debug)]
pub struct FrameReport {
    pub camera: String,
    pub timestamp: i64,
    /// All detections in the frame, persons or not.
    pub detections: usize,
    pub persons: Vec<PersonReport>,
}

impl FrameReport {
    pub fn started(&self) -> impl Iterator<Item = &str> {
        self.persons.iter().flat_map(|person| {
            person
                .signaled
                .iter()
                .filter(|(_, transition)| *transition == Transition::Started)
                .map(|(region, _)| region.as_str())
        })
    }
}

pub struct PersonPipeline {
    catalog: Arc<CameraCatalog>,
    ctx: Collaborators,
    settings: PipelineSettings,
    presence: PresenceRegistry,
}

impl PersonPipeline {
    /// Creates the vector collections if they do not exist yet.
    pub fn new(
        catalog: Arc<CameraCatalog>,
        ctx: Collaborators,
        settings: PipelineSettings,
        scheduler: Arc<TimerScheduler>,
    ) -> Result<Self, StorageError> {
        ctx.vectors.ensure_collection(&settings.captions)?;
        ctx.vectors.ensure_collection(&settings.faces)?;
        Ok(Self {
            catalog,
            ctx,
            settings,
            presence: PresenceRegistry::new(scheduler),
        })
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn catalog(&self) -> &Arc<CameraCatalog> {
        &self.catalog
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Decode, detect and process one JPEG frame.
    pub fn process_frame(
        &self,
        camera: &str,
        jpeg: &[u8],
        timestamp: i64,
    ) -> Result<FrameReport, PipelineError> {
        let camera = self
            .catalog
            .get(camera)
            .ok_or_else(|| PipelineError::UnknownCamera(camera.to_string()))?;
        let image = imaging::decode(jpeg)?;
        let detections = self.ctx.detector.detect(jpeg)?;
        log::debug!("[{}] {} detections", camera.name, detections.len());
        Ok(self.process_detections(&camera, &image, &detections, timestamp))
    }

    /// Run the person steps over detections already computed for `image`.
    pub fn process_detections(
        &self,
        camera: &Camera,
        image: &DynamicImage,
        detections: &[Detection],
        timestamp: i64,
    ) -> FrameReport {
        let formatted = format_timestamp(timestamp, &self.settings.templates.time_format);
        let persons = detections
            .iter()
            .enumerate()
            .filter(|(_, detection)| detection.is_person())
            .map(|(index, detection)| {
                log::info!(
                    "[{}] person at [{}] bbox {:?}",
                    camera.name,
                    index,
                    detection.bbox
                );
                self.process_person(camera, image, index, &detection.bbox, timestamp, &formatted)
            })
            .collect();
        FrameReport {
            camera: camera.name.clone(),
            timestamp,
            detections: detections.len(),
            persons,
        }
    }

    fn process_person(
        &self,
        camera: &Camera,
        image: &DynamicImage,
        index: usize,
        bbox: &BBox,
        timestamp: i64,
        formatted: &str,
    ) -> PersonReport {
        let toggles = self.settings.toggles;
        let tight = encode_crop(imaging::crop(image, bbox));
        let expanded = encode_crop(imaging::crop_expanded(image, bbox, self.settings.expand_ratio));

        let crop_key = toggles
            .crops
            .then(|| self.store_crop(&camera.name, crop_input(&tight)?));

        let regions = camera.regions_for(bbox, self.settings.footprint_ratio);
        if !regions.is_empty() {
            log::info!("[{}] person overlaps {}", camera.name, regions.join(", "));
        }

        let signaled = if toggles.notify {
            self.signal_regions(camera, &regions, expanded.as_ref().ok(), formatted)
        } else {
            Vec::new()
        };

        let caption = toggles.captions.then(|| {
            self.caption_person(&camera.name, crop_input(&expanded)?, &regions, timestamp)
        });

        let faces = toggles
            .faces
            .then(|| self.scan_faces(&camera.name, crop_input(&tight)?, formatted));

        PersonReport {
            index,
            bbox: *bbox,
            regions,
            signaled,
            crop_key: crop_key.map(|r| r.map_err(|err| log_step(&camera.name, "crop", err))),
            caption: caption.map(|r| r.map_err(|err| log_step(&camera.name, "caption", err))),
            faces: faces.map(|r| r.map_err(|err| log_step(&camera.name, "faces", err))),
        }
    }

    fn store_crop(&self, camera: &str, jpeg: &[u8]) -> Result<String, PipelineError> {
        let key = imaging::content_key(camera, jpeg);
        let stored = self
            .ctx
            .objects
            .put(&self.settings.bucket, &key, jpeg, "image/jpeg")?;
        log::debug!("[{}] crop stored as {}/{}", camera, self.settings.bucket, stored);
        Ok(stored)
    }

    fn signal_regions(
        &self,
        camera: &Camera,
        regions: &[String],
        image: Option<&Vec<u8>>,
        formatted: &str,
    ) -> Vec<(String, Transition)> {
        regions
            .iter()
            .filter(|region| camera.is_subscribed(region))
            .map(|region| {
                let listener = Arc::new(RegionNotifier::new(
                    self.ctx.notifier.clone(),
                    &self.settings.templates,
                    region,
                    formatted,
                    image.cloned(),
                ));
                let key = PresenceKey::new(camera.name.clone(), region.clone());
                let transition = self.presence.signal(&key, camera.timeout, listener);
                (region.clone(), transition)
            })
            .collect()
    }

    fn caption_person(
        &self,
        camera: &str,
        jpeg: &[u8],
        regions: &[String],
        timestamp: i64,
    ) -> Result<String, PipelineError> {
        let caption = self.ctx.detector.caption(jpeg)?;
        log::info!("[{}] person is captioned as: {}", camera, caption);
        let embedding = self.ctx.embedder.embed(&caption)?;
        let record = VectorRecord::new(embedding)
            .with("caption", caption.clone())
            .with("caption_model", self.ctx.detector.caption_model())
            .with("embedding_model", self.ctx.embedder.model())
            .with("camera", camera)
            .with("location", self.settings.location.clone())
            .with("regions", regions.join(", "))
            .with("timestamp", timestamp);
        self.ctx.vectors.insert(&self.settings.captions.name, record)?;
        Ok(caption)
    }

    fn scan_faces(&self, camera: &str, jpeg: &[u8], formatted: &str) -> Result<usize, PipelineError> {
        let Some(scans) = self.ctx.faces.scan(jpeg)? else {
            log::debug!("[{}] no face found", camera);
            return Ok(0);
        };
        let mut inserted = 0;
        for scan in scans {
            let facial_area = serde_json::to_value(scan.facial_area).map_err(StorageError::from)?;
            let attributes = match &scan.attributes {
                Some(attributes) => serde_json::to_value(attributes).map_err(StorageError::from)?,
                None => json!({}),
            };
            let record = VectorRecord::new(scan.embedding)
                .with("camera", camera)
                .with("location", self.settings.location.clone())
                .with("facial_area", facial_area)
                .with("attributes", attributes)
                .with("model_name", self.ctx.faces.model_name())
                .with("detector_name", self.ctx.faces.detector_name())
                .with("processing_date", Value::from(formatted));
            self.ctx.vectors.insert(&self.settings.faces.name, record)?;
            inserted += 1;
        }
        log::debug!("[{}] stored {} face(s)", camera, inserted);
        Ok(inserted)
    }
}

fn encode_crop(crop: Result<DynamicImage, GeometryError>) -> Result<Vec<u8>, PipelineError> {
    Ok(imaging::encode_jpeg(&crop?)?)
}

/// Borrow a crop for one step, or a fresh error describing why it is missing.
fn crop_input(crop: &Result<Vec<u8>, PipelineError>) -> Result<&[u8], PipelineError> {
    match crop {
        Ok(jpeg) => Ok(jpeg),
        Err(PipelineError::Geometry(err)) => Err(PipelineError::Geometry(err.clone())),
        Err(err) => Err(PipelineError::CropUnavailable(err.to_string())),
    }
}

fn log_step(camera: &str, step: &str, err: PipelineError) -> PipelineError {
    log::warn!("[{}] {} step failed: {}", camera, step, err);
    err
}
