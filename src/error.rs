//! Error taxonomy for the presence kernel.
//!
//! Library code returns these typed errors so the orchestrator can tell a
//! failed enrichment call from a failed store write. Binaries and the config
//! loader wrap them in `anyhow` with context.

use thiserror::Error;

/// An enrichment collaborator (detector, captioner, face or embedding service)
/// failed or timed out.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{service}: request failed: {reason}")]
    Request { service: &'static str, reason: String },

    #[error("{service}: unexpected status {status}")]
    Status { service: &'static str, status: u16 },

    #[error("{service}: timed out")]
    Timeout { service: &'static str },

    #[error("{service}: malformed response: {reason}")]
    Decode { service: &'static str, reason: String },
}

/// Persistence (object or vector store) failed.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("collection '{0}' does not exist")]
    UnknownCollection(String),

    #[error("collection '{collection}' expects vectors of dimension {expected}, got {actual}")]
    Dimension {
        collection: String,
        expected: usize,
        actual: usize,
    },

    #[error("invalid object key '{0}'")]
    InvalidKey(String),

    #[error("record encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Malformed geometric input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GeometryError {
    #[error("degenerate bounding box ({x1},{y1},{x2},{y2})")]
    DegenerateBox { x1: i32, y1: i32, x2: i32, y2: i32 },

    #[error("coordinate {0} is outside the pixel range")]
    CoordinateOutOfRange(String),

    #[error("polygon needs at least 3 points, got {0}")]
    TooFewPoints(usize),

    #[error("crop ({x1},{y1},{x2},{y2}) lies outside the {width}x{height} frame")]
    EmptyCrop {
        x1: i32,
        y1: i32,
        x2: i32,
        y2: i32,
        width: u32,
        height: u32,
    },
}

/// Misuse of the presence debouncer's internal transitions.
///
/// Ordinary signal/timeout races never produce this error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("{key}: cannot expire an idle presence instance")]
    ExpireWhileIdle { key: String },

    #[error("{key}: no pending timer to cancel")]
    NoPendingTimer { key: String },
}

/// Notification delivery failed. Best-effort: logged, never retried here.
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("notification sink rejected message: {0}")]
    Rejected(String),

    #[error("notification dispatcher is closed")]
    Closed,

    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// Failure of a single orchestrator step. Carried in per-person reports so a
/// failed step never aborts its siblings.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("unknown camera '{0}'")]
    UnknownCamera(String),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Geometry(#[from] GeometryError),

    #[error("image encoding failed: {0}")]
    Image(#[from] image::ImageError),

    /// The person crop a step needed could not be produced.
    #[error("crop unavailable: {0}")]
    CropUnavailable(String),
}
