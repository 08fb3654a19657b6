//! Region Presence Kernel
//!
//! Turns a stream of per-frame person detections into one "presence started"
//! and one "presence ended" notification per camera region, and stores
//! person crops, captions and face embeddings along the way.
//!
//! # Architecture
//!
//! 1. **Region catalog** (`region`): named polygons per camera.
//! 2. **Spatial join** (`region::footprint`, `region::overlapping_regions`):
//!    the bottom strip of a person box decides region membership.
//! 3. **Presence debouncer** (`presence`): per (camera, region) state machine
//!    with a single shared deadline thread.
//! 4. **Person pipeline** (`pipeline`): crops, region join, presence signals
//!    and enrichment, each step reported separately.
//!
//! Collaborators (detector, face service, embeddings, vector and object
//! stores, chat sink) sit behind the traits in `services`.
//!
//! # Module Structure
//!
//! - `config`: file + environment configuration
//! - `ingest`: frame messages and per-camera workers
//! - `notify`: queued notification delivery
//! - `imaging`: decode, crop and encode

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod config;
pub mod error;
pub mod imaging;
pub mod ingest;
pub mod notify;
pub mod pipeline;
pub mod presence;
pub mod region;
pub mod services;

pub use config::PresenceConfig;
pub use error::{GeometryError, NotifyError, PipelineError, ServiceError, StateError, StorageError};
pub use ingest::{FrameMessage, WorkerPool};
pub use notify::{MessageTemplates, Notification, NotificationDispatcher, RegionNotifier};
pub use pipeline::{
    Collaborators, EnrichmentToggles, FrameReport, PersonPipeline, PersonReport, PipelineSettings,
};
pub use presence::{
    PresenceDebouncer, PresenceKey, PresenceListener, PresenceRegistry, PresenceState,
    TimerScheduler, Transition,
};
pub use region::{
    footprint, overlapping_regions, BBox, Camera, CameraCatalog, Point, Polygon, Region,
};

pub const PERSON_LABEL: &str = "person";

/// One labelled box from the object detector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub bbox: BBox,
    #[serde(default)]
    pub score: Option<f32>,
}

impl Detection {
    pub fn new(label: impl Into<String>, bbox: BBox) -> Self {
        Self {
            label: label.into(),
            bbox,
            score: None,
        }
    }

    pub fn with_score(mut self, score: f32) -> Self {
        self.score = Some(score);
        self
    }

    pub fn is_person(&self) -> bool {
        self.label == PERSON_LABEL
    }
}

/// Render unix seconds in local time with a strftime pattern. Falls back to
/// the raw number when the timestamp or pattern cannot be rendered.
pub fn format_timestamp(timestamp: i64, format: &str) -> String {
    let Some(utc) = chrono::DateTime::from_timestamp(timestamp, 0) else {
        return timestamp.to_string();
    };
    let local = utc.with_timezone(&chrono::Local);
    let mut out = String::new();
    if write!(out, "{}", local.format(format)).is_err() {
        return timestamp.to_string();
    }
    out
}

/// True when `format` contains only valid strftime items.
pub fn is_valid_time_format(format: &str) -> bool {
    !chrono::format::StrftimeItems::new(format)
        .any(|item| matches!(item, chrono::format::Item::Error))
}

pub fn now_s() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_exact_person_label_counts() {
        let bbox = BBox::new(0, 0, 10, 10).unwrap();
        assert!(Detection::new("person", bbox).is_person());
        assert!(!Detection::new("car", bbox).is_person());
        assert!(!Detection::new("persons", bbox).is_person());
    }

    #[test]
    fn timestamp_formatting() {
        // 2023-11-14 22:13 UTC: the same year in every timezone.
        assert_eq!(format_timestamp(1_700_000_000, "%Y"), "2023");
        assert_eq!(format_timestamp(i64::MAX, "%Y"), i64::MAX.to_string());
        assert!(is_valid_time_format(notify::DEFAULT_TIME_FORMAT));
        assert!(!is_valid_time_format("%Q%"));
        assert_eq!(format_timestamp(1_700_000_000, "%Q%"), "1700000000");
    }
}
