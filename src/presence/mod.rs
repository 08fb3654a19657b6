//! Presence debounce engine.
//!
//! Converts per-frame "person seen in region" signals into one start and one
//! end notification per presence episode.

mod debouncer;
mod registry;
mod scheduler;

pub use debouncer::{
    PresenceDebouncer, PresenceKey, PresenceListener, PresenceState, SilentListener, Transition,
};
pub use registry::PresenceRegistry;
pub use scheduler::{TimerHandle, TimerScheduler};
