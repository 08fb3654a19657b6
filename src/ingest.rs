//! Frame ingestion: message parsing and per-camera workers.
//!
//! Each camera gets its own bounded queue and worker thread, so cameras run
//! in parallel while frames of one camera stay in order. When a camera's
//! queue is full the newest frame is dropped rather than stalling the
//! transport.

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::pipeline::PersonPipeline;

pub const DEFAULT_QUEUE_DEPTH: usize = 4;

/// One encoded frame as delivered by the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameMessage {
    /// Unix seconds.
    pub timestamp: i64,
    pub camera: String,
    /// JPEG bytes.
    pub payload: Vec<u8>,
}

/// Camera name from `{prefix}/{camera}`. Nested topics are not cameras.
pub fn camera_from_topic<'a>(prefix: &str, topic: &'a str) -> Option<&'a str> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    if rest.is_empty() || rest.contains('/') {
        return None;
    }
    Some(rest)
}

/// Unix seconds from a string such as `1717171717` or `1717171717.532`.
pub fn parse_timestamp(raw: &str) -> Option<i64> {
    let whole = raw.trim().split('.').next()?;
    whole.parse().ok()
}

/// `host:port`, port defaulting to 1883.
pub fn parse_broker(addr: &str) -> Result<(String, u16)> {
    let addr = addr.trim();
    let addr = addr.strip_prefix("mqtt://").unwrap_or(addr);
    match addr.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .with_context(|| format!("invalid MQTT port in '{}'", addr))?;
            if host.is_empty() {
                return Err(anyhow!("missing MQTT host in '{}'", addr));
            }
            Ok((host.to_string(), port))
        }
        None if !addr.is_empty() => Ok((addr.to_string(), 1883)),
        None => Err(anyhow!("MQTT broker address cannot be empty")),
    }
}

struct Worker {
    tx: SyncSender<FrameMessage>,
    handle: JoinHandle<()>,
}

/// One worker thread per configured camera.
pub struct WorkerPool {
    workers: HashMap<String, Worker>,
    processed: Arc<AtomicU64>,
    dropped: AtomicU64,
}

impl WorkerPool {
    pub fn spawn(pipeline: Arc<PersonPipeline>, depth: usize) -> Result<Self> {
        let processed = Arc::new(AtomicU64::new(0));
        let mut workers = HashMap::new();
        for camera in pipeline.catalog().iter() {
            let (tx, rx) = mpsc::sync_channel::<FrameMessage>(depth.max(1));
            let pipeline = pipeline.clone();
            let processed = processed.clone();
            let name = camera.name.clone();
            let handle = thread::Builder::new()
                .name(format!("worker-{}", name))
                .spawn(move || {
                    for frame in rx {
                        match pipeline.process_frame(&frame.camera, &frame.payload, frame.timestamp)
                        {
                            Ok(report) => log::debug!(
                                "[{}] frame {}: {} detections, {} persons",
                                report.camera,
                                report.timestamp,
                                report.detections,
                                report.persons.len()
                            ),
                            Err(err) => {
                                log::warn!("[{}] frame {} failed: {}", frame.camera, frame.timestamp, err)
                            }
                        }
                        processed.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .with_context(|| format!("spawn worker for camera {}", camera.name))?;
            workers.insert(camera.name.clone(), Worker { tx, handle });
        }
        log::info!("started {} camera worker(s)", workers.len());
        Ok(Self {
            workers,
            processed,
            dropped: AtomicU64::new(0),
        })
    }

    /// Queue a frame for its camera's worker without blocking.
    pub fn submit(&self, frame: FrameMessage) -> Result<()> {
        let worker = self
            .workers
            .get(&frame.camera)
            .ok_or_else(|| anyhow!("no worker for camera '{}'", frame.camera))?;
        match worker.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(frame)) => {
                self.dropped.fetch_add(1, Ordering::SeqCst);
                Err(anyhow!("[{}] queue full, frame {} dropped", frame.camera, frame.timestamp))
            }
            Err(TrySendError::Disconnected(frame)) => {
                Err(anyhow!("[{}] worker stopped", frame.camera))
            }
        }
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    /// Drain queued frames and join every worker.
    pub fn shutdown(self) {
        for (camera, worker) in self.workers {
            drop(worker.tx);
            if worker.handle.join().is_err() {
                log::error!("[{}] worker panicked", camera);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_suffix_is_the_camera() {
        assert_eq!(camera_from_topic("cameras/frames", "cameras/frames/front"), Some("front"));
        assert_eq!(camera_from_topic("cameras/frames", "cameras/frames/"), None);
        assert_eq!(camera_from_topic("cameras/frames", "cameras/frames/a/b"), None);
        assert_eq!(camera_from_topic("cameras/frames", "cameras/framesx/a"), None);
        assert_eq!(camera_from_topic("cameras/frames", "other/front"), None);
    }

    #[test]
    fn timestamps_drop_fractions() {
        assert_eq!(parse_timestamp("1717171717.532"), Some(1_717_171_717));
        assert_eq!(parse_timestamp(" 42 "), Some(42));
        assert_eq!(parse_timestamp("soon"), None);
        assert_eq!(parse_timestamp(""), None);
    }

    #[test]
    fn broker_addresses() {
        assert_eq!(parse_broker("127.0.0.1:1884").unwrap(), ("127.0.0.1".to_string(), 1884));
        assert_eq!(parse_broker("mqtt://broker").unwrap(), ("broker".to_string(), 1883));
        assert!(parse_broker(":1883").is_err());
        assert!(parse_broker("host:port").is_err());
        assert!(parse_broker("").is_err());
    }
}
