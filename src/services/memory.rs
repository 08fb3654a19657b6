//! In-process collaborators for tests, demos and dry runs.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{
    CollectionSchema, FaceScan, FaceEmbeddingService, NotificationSink, ObjectDetectionService,
    ObjectStore, TextEmbeddingService, VectorRecord, VectorStore,
};
use crate::error::{NotifyError, ServiceError, StorageError};
use crate::Detection;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Detector returning a fixed detection list and caption.
pub struct StaticDetector {
    detections: Vec<Detection>,
    caption: Option<String>,
    detect_calls: AtomicUsize,
    caption_calls: AtomicUsize,
}

impl StaticDetector {
    pub fn new(detections: Vec<Detection>) -> Self {
        Self {
            detections,
            caption: Some("a person standing".to_string()),
            detect_calls: AtomicUsize::new(0),
            caption_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = Some(caption.into());
        self
    }

    /// Make every caption request fail.
    pub fn without_captions(mut self) -> Self {
        self.caption = None;
        self
    }

    pub fn detect_calls(&self) -> usize {
        self.detect_calls.load(Ordering::SeqCst)
    }

    pub fn caption_calls(&self) -> usize {
        self.caption_calls.load(Ordering::SeqCst)
    }
}

impl ObjectDetectionService for StaticDetector {
    fn detect(&self, _image: &[u8]) -> Result<Vec<Detection>, ServiceError> {
        self.detect_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.detections.clone())
    }

    fn caption(&self, _image: &[u8]) -> Result<String, ServiceError> {
        self.caption_calls.fetch_add(1, Ordering::SeqCst);
        self.caption.clone().ok_or(ServiceError::Timeout {
            service: "static-detector",
        })
    }

    fn caption_model(&self) -> &str {
        "static"
    }
}

/// Face service returning a fixed scan result.
pub struct StaticFaceService {
    result: Option<Vec<FaceScan>>,
    calls: AtomicUsize,
}

impl StaticFaceService {
    pub fn new(result: Option<Vec<FaceScan>>) -> Self {
        Self {
            result,
            calls: AtomicUsize::new(0),
        }
    }

    /// Never finds a face.
    pub fn empty() -> Self {
        Self::new(None)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl FaceEmbeddingService for StaticFaceService {
    fn scan(&self, _image: &[u8]) -> Result<Option<Vec<FaceScan>>, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.result.clone())
    }

    fn model_name(&self) -> &str {
        "static"
    }

    fn detector_name(&self) -> &str {
        "static"
    }
}

/// Deterministic text embedding derived from SHA-256 of the text.
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl TextEmbeddingService for HashEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, ServiceError> {
        let digest = Sha256::digest(text.as_bytes());
        let raw: Vec<f32> = digest
            .iter()
            .cycle()
            .take(self.dimension)
            .map(|b| f32::from(*b) / 127.5 - 1.0)
            .collect();
        let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm == 0.0 {
            return Ok(raw);
        }
        Ok(raw.into_iter().map(|v| v / norm).collect())
    }

    fn model(&self) -> &str {
        "sha256-hash"
    }
}

#[derive(Default)]
pub struct InMemoryVectorStore {
    collections: Mutex<HashMap<String, (CollectionSchema, Vec<VectorRecord>)>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self, collection: &str) -> Vec<VectorRecord> {
        lock(&self.collections)
            .get(collection)
            .map(|(_, records)| records.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, collection: &str) -> usize {
        lock(&self.collections)
            .get(collection)
            .map_or(0, |(_, records)| records.len())
    }
}

impl VectorStore for InMemoryVectorStore {
    fn ensure_collection(&self, schema: &CollectionSchema) -> Result<(), StorageError> {
        let mut collections = lock(&self.collections);
        if let Some((existing, _)) = collections.get(&schema.name) {
            if existing.dimension != schema.dimension {
                return Err(StorageError::Dimension {
                    collection: schema.name.clone(),
                    expected: existing.dimension,
                    actual: schema.dimension,
                });
            }
            return Ok(());
        }
        collections.insert(schema.name.clone(), (schema.clone(), Vec::new()));
        Ok(())
    }

    fn insert(&self, collection: &str, record: VectorRecord) -> Result<(), StorageError> {
        let mut collections = lock(&self.collections);
        let (schema, records) = collections
            .get_mut(collection)
            .ok_or_else(|| StorageError::UnknownCollection(collection.to_string()))?;
        if record.vector.len() != schema.dimension {
            return Err(StorageError::Dimension {
                collection: collection.to_string(),
                expected: schema.dimension,
                actual: record.vector.len(),
            });
        }
        records.push(record);
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<HashMap<(String, String), StoredObject>>,
    unavailable: bool,
    puts: AtomicUsize,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose every write fails, for exercising failure isolation.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        lock(&self.objects)
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.objects).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.objects).is_empty()
    }

    /// Number of `put` calls, including overwrites and failures.
    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<String, StorageError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if self.unavailable {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "object store unavailable",
            )));
        }
        lock(&self.objects).insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                bytes: bytes.to_vec(),
                content_type: content_type.to_string(),
            },
        );
        Ok(key.to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentMessage {
    pub text: String,
    pub images: usize,
}

/// Keeps every message for later inspection.
#[derive(Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<SentMessage>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<SentMessage> {
        lock(&self.messages).clone()
    }
}

impl NotificationSink for RecordingSink {
    fn send(&self, text: &str, images: &[Vec<u8>]) -> Result<(), NotifyError> {
        lock(&self.messages).push(SentMessage {
            text: text.to_string(),
            images: images.len(),
        });
        Ok(())
    }
}

/// Writes notifications to the log. Used when no webhook is configured.
pub struct LogSink;

impl NotificationSink for LogSink {
    fn send(&self, text: &str, images: &[Vec<u8>]) -> Result<(), NotifyError> {
        log::info!("notification: {} ({} images)", text, images.len());
        Ok(())
    }
}
