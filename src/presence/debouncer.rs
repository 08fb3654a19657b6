//! Per (camera, region) presence state machine.
//!
//! ```text
//!   Idle --signal--> Active        on_start, arm timer
//!   Active --signal--> Active      cancel + re-arm timer
//!   Active --timer--> Idle         on_end
//! ```
//!
//! `signal` and timer expiry are serialized by the instance lock. Every armed
//! timer carries the generation current at arming time; each `signal` bumps
//! the generation, so a timer that was already due when a re-arm happened
//! finds a newer generation and does nothing.
//!
//! Listeners run after the state lock is released. Each transition queues its
//! callback in a per-instance outbox under the state lock; whichever thread
//! finds the outbox idle drains it. Callbacks therefore arrive in transition
//! order, and a timer firing while `on_start` is still running only queues
//! `on_end` and returns without waiting.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use crate::error::{NotifyError, StateError};

use super::scheduler::{TimerHandle, TimerScheduler};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresenceState {
    Idle,
    Active,
}

/// What a `signal` did to the instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// Idle -> Active; `on_start` was invoked.
    Started,
    /// Already active; the end deadline moved.
    Rearmed,
}

/// Receives episode boundaries. Invoked from the signalling thread
/// (`on_start`) or the scheduler thread (`on_end`); implementations should
/// hand work off rather than block.
pub trait PresenceListener: Send + Sync {
    fn on_start(&self) -> Result<(), NotifyError>;
    fn on_end(&self) -> Result<(), NotifyError>;
}

/// Listener that ignores both events.
pub struct SilentListener;

impl PresenceListener for SilentListener {
    fn on_start(&self) -> Result<(), NotifyError> {
        Ok(())
    }

    fn on_end(&self) -> Result<(), NotifyError> {
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PresenceKey {
    pub camera: String,
    pub region: String,
}

impl PresenceKey {
    pub fn new(camera: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            camera: camera.into(),
            region: region.into(),
        }
    }
}

impl fmt::Display for PresenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.camera, self.region)
    }
}

#[derive(Clone, Copy, Debug)]
enum Callback {
    Start,
    End,
}

struct Inner {
    state: PresenceState,
    timer: Option<TimerHandle>,
    generation: u64,
    last_seen: Option<Instant>,
    episodes: u64,
    listener: Arc<dyn PresenceListener>,
    outbox: VecDeque<(Callback, Arc<dyn PresenceListener>)>,
    delivering: bool,
}

pub struct PresenceDebouncer {
    key: PresenceKey,
    timeout: Duration,
    scheduler: Arc<TimerScheduler>,
    inner: Mutex<Inner>,
    this: Weak<PresenceDebouncer>,
}

impl PresenceDebouncer {
    pub fn new(
        key: PresenceKey,
        timeout: Duration,
        scheduler: Arc<TimerScheduler>,
        listener: Arc<dyn PresenceListener>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            key,
            timeout,
            scheduler,
            inner: Mutex::new(Inner {
                state: PresenceState::Idle,
                timer: None,
                generation: 0,
                last_seen: None,
                episodes: 0,
                listener,
                outbox: VecDeque::new(),
                delivering: false,
            }),
            this: this.clone(),
        })
    }

    pub fn key(&self) -> &PresenceKey {
        &self.key
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Record that a person was seen in the region this frame.
    pub fn signal(&self) -> Transition {
        self.signal_inner(None)
    }

    /// Rebind the listener, then signal. Later callbacks (including the
    /// eventual `on_end`) use the new listener.
    pub fn signal_with(&self, listener: Arc<dyn PresenceListener>) -> Transition {
        self.signal_inner(Some(listener))
    }

    pub fn state(&self) -> PresenceState {
        self.lock_inner().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == PresenceState::Active
    }

    pub fn last_seen(&self) -> Option<Instant> {
        self.lock_inner().last_seen
    }

    /// Completed episodes (Active -> Idle transitions).
    pub fn episodes(&self) -> u64 {
        self.lock_inner().episodes
    }

    fn signal_inner(&self, listener: Option<Arc<dyn PresenceListener>>) -> Transition {
        let mut inner = self.lock_inner();
        if let Some(listener) = listener {
            inner.listener = listener;
        }
        inner.last_seen = Some(Instant::now());
        inner.generation += 1;
        let generation = inner.generation;

        let transition = match inner.state {
            PresenceState::Idle => {
                inner.state = PresenceState::Active;
                Transition::Started
            }
            PresenceState::Active => {
                if let Err(err) = self.cancel_pending(&mut inner) {
                    log::warn!("{}", err);
                }
                Transition::Rearmed
            }
        };
        inner.timer = Some(self.arm(generation));

        if transition == Transition::Started {
            log::info!("[{}] presence started", self.key);
            self.deliver(inner, Callback::Start);
        }
        transition
    }

    fn arm(&self, generation: u64) -> TimerHandle {
        let this = self.this.clone();
        self.scheduler.schedule(self.timeout, move || {
            let Some(debouncer) = this.upgrade() else {
                return;
            };
            if let Err(err) = debouncer.expire(generation) {
                log::warn!("{}", err);
            }
        })
    }

    fn cancel_pending(&self, inner: &mut Inner) -> Result<(), StateError> {
        let handle = inner.timer.take().ok_or_else(|| StateError::NoPendingTimer {
            key: self.key.to_string(),
        })?;
        // A false return means the task is already running and will see a
        // stale generation.
        self.scheduler.cancel(handle);
        Ok(())
    }

    /// Timer expiry. Returns `Ok(false)` when the timer was superseded by a
    /// later signal.
    pub(crate) fn expire(&self, generation: u64) -> Result<bool, StateError> {
        let mut inner = self.lock_inner();
        if inner.generation != generation {
            return Ok(false);
        }
        if inner.state == PresenceState::Idle {
            return Err(StateError::ExpireWhileIdle {
                key: self.key.to_string(),
            });
        }
        inner.state = PresenceState::Idle;
        inner.timer = None;
        inner.episodes += 1;
        log::info!("[{}] presence ended", self.key);
        self.deliver(inner, Callback::End);
        Ok(true)
    }

    /// Queue `callback` and, unless another thread is already draining the
    /// outbox, deliver everything queued. The state lock is never held while
    /// a listener runs.
    fn deliver(&self, mut inner: MutexGuard<'_, Inner>, callback: Callback) {
        let listener = inner.listener.clone();
        inner.outbox.push_back((callback, listener));
        if inner.delivering {
            return;
        }
        inner.delivering = true;
        drop(inner);

        loop {
            let next = {
                let mut inner = self.lock_inner();
                let next = inner.outbox.pop_front();
                if next.is_none() {
                    inner.delivering = false;
                }
                next
            };
            let Some((callback, listener)) = next else {
                return;
            };
            let result = catch_unwind(AssertUnwindSafe(|| match callback {
                Callback::Start => listener.on_start(),
                Callback::End => listener.on_end(),
            }));
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    log::warn!("[{}] {:?} notification failed: {}", self.key, callback, err)
                }
                Err(_) => log::error!("[{}] {:?} listener panicked", self.key, callback),
            }
        }
    }

    #[cfg(test)]
    fn generation(&self) -> u64 {
        self.lock_inner().generation
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for PresenceDebouncer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresenceDebouncer")
            .field("key", &self.key)
            .field("timeout", &self.timeout)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        starts: AtomicUsize,
        ends: AtomicUsize,
        fail: bool,
    }

    impl PresenceListener for Counting {
        fn on_start(&self) -> Result<(), NotifyError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(NotifyError::Rejected("sink down".into()));
            }
            Ok(())
        }

        fn on_end(&self) -> Result<(), NotifyError> {
            self.ends.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(NotifyError::Rejected("sink down".into()));
            }
            Ok(())
        }
    }

    fn debouncer(timeout: Duration, listener: Arc<Counting>) -> Arc<PresenceDebouncer> {
        let scheduler = TimerScheduler::spawn("test-presence").unwrap();
        PresenceDebouncer::new(PresenceKey::new("cam", "porch"), timeout, scheduler, listener)
    }

    #[test]
    fn first_signal_starts_episode() {
        let listener = Arc::new(Counting::default());
        let d = debouncer(Duration::from_secs(60), listener.clone());
        assert_eq!(d.state(), PresenceState::Idle);
        assert_eq!(d.signal(), Transition::Started);
        assert_eq!(d.signal(), Transition::Rearmed);
        assert_eq!(d.state(), PresenceState::Active);
        assert_eq!(listener.starts.load(Ordering::SeqCst), 1);
        assert_eq!(listener.ends.load(Ordering::SeqCst), 0);
        assert!(d.last_seen().is_some());
    }

    #[test]
    fn stale_generation_is_ignored() {
        let listener = Arc::new(Counting::default());
        let d = debouncer(Duration::from_secs(60), listener.clone());
        d.signal();
        let stale = d.generation();
        d.signal();
        assert_eq!(d.expire(stale), Ok(false));
        assert!(d.is_active());
        assert_eq!(listener.ends.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn expire_twice_is_a_state_error() {
        let listener = Arc::new(Counting::default());
        let d = debouncer(Duration::from_secs(60), listener.clone());
        d.signal();
        let current = d.generation();
        assert_eq!(d.expire(current), Ok(true));
        assert!(matches!(
            d.expire(current),
            Err(StateError::ExpireWhileIdle { .. })
        ));
        assert_eq!(listener.ends.load(Ordering::SeqCst), 1);
        assert_eq!(d.episodes(), 1);
    }

    #[test]
    fn failing_listener_does_not_block_transitions() {
        let listener = Arc::new(Counting {
            fail: true,
            ..Counting::default()
        });
        let d = debouncer(Duration::from_millis(30), listener.clone());
        assert_eq!(d.signal(), Transition::Started);
        assert!(d.is_active());
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(d.state(), PresenceState::Idle);
        assert_eq!(listener.ends.load(Ordering::SeqCst), 1);
        assert_eq!(d.signal(), Transition::Started);
    }

    #[test]
    fn signal_with_rebinds_end_listener() {
        let first = Arc::new(Counting::default());
        let second = Arc::new(Counting::default());
        let d = debouncer(Duration::from_millis(30), first.clone());
        d.signal();
        d.signal_with(second.clone());
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(first.starts.load(Ordering::SeqCst), 1);
        assert_eq!(first.ends.load(Ordering::SeqCst), 0);
        assert_eq!(second.starts.load(Ordering::SeqCst), 0);
        assert_eq!(second.ends.load(Ordering::SeqCst), 1);
    }

    /// Records callbacks; `on_start` blocks until the gate opens.
    struct Gated {
        open: Mutex<bool>,
        opened: std::sync::Condvar,
        events: Mutex<Vec<&'static str>>,
    }

    impl Gated {
        fn new() -> Self {
            Self {
                open: Mutex::new(false),
                opened: std::sync::Condvar::new(),
                events: Mutex::new(Vec::new()),
            }
        }

        fn release(&self) {
            *self.open.lock().unwrap() = true;
            self.opened.notify_all();
        }
    }

    impl PresenceListener for Gated {
        fn on_start(&self) -> Result<(), NotifyError> {
            let mut open = self.open.lock().unwrap();
            while !*open {
                open = self.opened.wait(open).unwrap();
            }
            self.events.lock().unwrap().push("start");
            Ok(())
        }

        fn on_end(&self) -> Result<(), NotifyError> {
            self.events.lock().unwrap().push("end");
            Ok(())
        }
    }

    #[test]
    fn expiry_does_not_wait_for_slow_start() {
        let scheduler = TimerScheduler::spawn("test-presence").unwrap();
        let gated = Arc::new(Gated::new());
        let d = PresenceDebouncer::new(
            PresenceKey::new("cam", "porch"),
            Duration::from_secs(60),
            scheduler,
            gated.clone(),
        );

        let starter = {
            let d = d.clone();
            std::thread::spawn(move || d.signal())
        };
        while d.state() != PresenceState::Active {
            std::thread::sleep(Duration::from_millis(5));
        }

        // on_start is still blocked: expiry and a new signal return at once.
        assert_eq!(d.expire(d.generation()), Ok(true));
        assert_eq!(d.state(), PresenceState::Idle);
        assert_eq!(d.signal(), Transition::Started);
        assert!(gated.events.lock().unwrap().is_empty());

        gated.release();
        assert_eq!(starter.join().unwrap(), Transition::Started);
        assert_eq!(*gated.events.lock().unwrap(), vec!["start", "end", "start"]);
    }

    #[test]
    fn panicking_listener_does_not_stall_delivery() {
        struct Panics;

        impl PresenceListener for Panics {
            fn on_start(&self) -> Result<(), NotifyError> {
                panic!("listener bug");
            }

            fn on_end(&self) -> Result<(), NotifyError> {
                Ok(())
            }
        }

        let listener = Arc::new(Counting::default());
        let d = debouncer(Duration::from_secs(60), listener.clone());
        d.signal_with(Arc::new(Panics));
        d.expire(d.generation()).unwrap();
        d.signal_with(listener.clone());
        assert_eq!(listener.starts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_debouncer_timer_is_harmless() {
        let scheduler = TimerScheduler::spawn("test-presence").unwrap();
        let listener = Arc::new(Counting::default());
        let d = PresenceDebouncer::new(
            PresenceKey::new("cam", "porch"),
            Duration::from_millis(20),
            scheduler.clone(),
            listener.clone(),
        );
        d.signal();
        drop(d);
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(listener.ends.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.pending(), 0);
    }
}
