//! Notification dispatch.
//!
//! Presence callbacks fire on the signalling worker and on the scheduler
//! thread, neither of which may block on a slow chat service. The dispatcher
//! owns a bounded queue and a single delivery thread; listeners only enqueue.

use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crate::error::NotifyError;
use crate::presence::PresenceListener;
use crate::services::NotificationSink;

pub const DEFAULT_START_TEMPLATE: &str = "Found people in nearby {region} at {time}";
pub const DEFAULT_END_TEMPLATE: &str = "Person is no longer visible nearby {region}";
pub const DEFAULT_TIME_FORMAT: &str = "%H:%M %Y-%m-%d (%A)";
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub text: String,
    /// JPEG attachments.
    pub images: Vec<Vec<u8>>,
}

impl Notification {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            images: Vec::new(),
        }
    }

    pub fn with_image(mut self, jpeg: Vec<u8>) -> Self {
        self.images.push(jpeg);
        self
    }
}

/// Bounded queue in front of a `NotificationSink`.
pub struct NotificationDispatcher {
    tx: Mutex<Option<SyncSender<Notification>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationDispatcher {
    pub fn spawn(sink: Arc<dyn NotificationSink>, capacity: usize) -> std::io::Result<Arc<Self>> {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        let worker = thread::Builder::new()
            .name("presence-notify".to_string())
            .spawn(move || deliver(sink, rx))?;
        Ok(Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }))
    }

    /// Queue a message without blocking. A full queue drops the message.
    pub fn dispatch(&self, notification: Notification) -> Result<(), NotifyError> {
        let tx = lock(&self.tx);
        let Some(tx) = tx.as_ref() else {
            return Err(NotifyError::Closed);
        };
        match tx.try_send(notification) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(NotifyError::Rejected("queue full".to_string())),
            Err(TrySendError::Disconnected(_)) => Err(NotifyError::Closed),
        }
    }

    /// Stop accepting messages, deliver what is queued, and join the thread.
    pub fn shutdown(&self) {
        lock(&self.tx).take();
        if let Some(worker) = lock(&self.worker).take() {
            if worker.join().is_err() {
                log::error!("notification thread panicked");
            }
        }
    }
}

impl Drop for NotificationDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn deliver(sink: Arc<dyn NotificationSink>, rx: Receiver<Notification>) {
    for notification in rx {
        if let Err(err) = sink.send(&notification.text, &notification.images) {
            log::warn!("notification delivery failed: {}", err);
        }
    }
    log::debug!("notification queue closed");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Start/end message text. `{region}` and `{time}` are substituted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageTemplates {
    pub start: String,
    pub end: String,
    /// `chrono` strftime pattern for `{time}`.
    pub time_format: String,
}

impl Default for MessageTemplates {
    fn default() -> Self {
        Self {
            start: DEFAULT_START_TEMPLATE.to_string(),
            end: DEFAULT_END_TEMPLATE.to_string(),
            time_format: DEFAULT_TIME_FORMAT.to_string(),
        }
    }
}

impl MessageTemplates {
    pub fn render_start(&self, region: &str, time: &str) -> String {
        render(&self.start, region, time)
    }

    pub fn render_end(&self, region: &str, time: &str) -> String {
        render(&self.end, region, time)
    }
}

fn render(template: &str, region: &str, time: &str) -> String {
    template.replace("{region}", region).replace("{time}", time)
}

/// Presence listener for one region sighting: the start message carries the
/// person crop, the end message is text only.
pub struct RegionNotifier {
    dispatcher: Arc<NotificationDispatcher>,
    start_text: String,
    end_text: String,
    image: Option<Vec<u8>>,
}

impl RegionNotifier {
    pub fn new(
        dispatcher: Arc<NotificationDispatcher>,
        templates: &MessageTemplates,
        region: &str,
        time: &str,
        image: Option<Vec<u8>>,
    ) -> Self {
        Self {
            dispatcher,
            start_text: templates.render_start(region, time),
            end_text: templates.render_end(region, time),
            image,
        }
    }
}

impl PresenceListener for RegionNotifier {
    fn on_start(&self) -> Result<(), NotifyError> {
        let mut notification = Notification::text(self.start_text.clone());
        if let Some(image) = &self.image {
            notification = notification.with_image(image.clone());
        }
        self.dispatcher.dispatch(notification)
    }

    fn on_end(&self) -> Result<(), NotifyError> {
        self.dispatcher
            .dispatch(Notification::text(self.end_text.clone()))
    }
}
