//! Collaborator interfaces.
//!
//! The presence kernel never talks to a detector, store or chat service
//! directly; it goes through these traits. `memory` holds in-process
//! implementations for tests and demos, `fs` and `sqlite` local persistence,
//! and `http` network clients.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{NotifyError, ServiceError, StorageError};
use crate::Detection;

pub mod fs;
pub mod http;
pub mod memory;
pub mod sqlite;

pub use fs::FsObjectStore;
pub use http::{HttpEmbeddingService, HttpFaceService, HttpVisionService, WebhookSink};
pub use memory::{
    HashEmbedder, InMemoryObjectStore, InMemoryVectorStore, LogSink, RecordingSink,
    StaticDetector, StaticFaceService,
};
pub use sqlite::SqliteVectorStore;

/// Object detection and captioning over encoded (JPEG) images.
pub trait ObjectDetectionService: Send + Sync {
    fn detect(&self, image: &[u8]) -> Result<Vec<Detection>, ServiceError>;

    fn caption(&self, image: &[u8]) -> Result<String, ServiceError>;

    /// Model identifier stored alongside captions.
    fn caption_model(&self) -> &str;
}

/// Face embedding and attribute analysis.
pub trait FaceEmbeddingService: Send + Sync {
    /// `Ok(None)` when no face is found; that is not an error.
    fn scan(&self, image: &[u8]) -> Result<Option<Vec<FaceScan>>, ServiceError>;

    fn model_name(&self) -> &str;

    fn detector_name(&self) -> &str;
}

pub trait TextEmbeddingService: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>, ServiceError>;

    fn model(&self) -> &str;
}

/// Collection-scoped vector records.
pub trait VectorStore: Send + Sync {
    /// Create the collection if missing. Idempotent; fails if it exists with
    /// a different dimension.
    fn ensure_collection(&self, schema: &CollectionSchema) -> Result<(), StorageError>;

    fn insert(&self, collection: &str, record: VectorRecord) -> Result<(), StorageError>;
}

/// Binary media by key. `put` on an existing key overwrites.
pub trait ObjectStore: Send + Sync {
    fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<String, StorageError>;
}

/// Best-effort message delivery. `images` are JPEG bytes.
pub trait NotificationSink: Send + Sync {
    fn send(&self, text: &str, images: &[Vec<u8>]) -> Result<(), NotifyError>;
}

/// Pixel area of a detected face within the scanned crop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacialArea {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FacialAttributes {
    #[serde(default)]
    pub age: Option<f32>,
    #[serde(default)]
    pub dominant_emotion: Option<String>,
    #[serde(default)]
    pub dominant_gender: Option<String>,
    #[serde(default)]
    pub dominant_race: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FaceScan {
    pub embedding: Vec<f32>,
    pub facial_area: FacialArea,
    pub attributes: Option<FacialAttributes>,
}

/// Fixed at startup: one float vector field of `dimension` per record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectionSchema {
    pub name: String,
    pub vector_field: String,
    pub dimension: usize,
}

impl CollectionSchema {
    pub fn new(name: impl Into<String>, vector_field: impl Into<String>, dimension: usize) -> Self {
        Self {
            name: name.into(),
            vector_field: vector_field.into(),
            dimension,
        }
    }
}

/// Scalar fields plus the collection's vector.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VectorRecord {
    pub fields: Map<String, Value>,
    pub vector: Vec<f32>,
}

impl VectorRecord {
    pub fn new(vector: Vec<f32>) -> Self {
        Self {
            fields: Map::new(),
            vector,
        }
    }

    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}
