use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use presence_kernel::{
    NotifyError, PresenceDebouncer, PresenceKey, PresenceListener, PresenceRegistry,
    PresenceState, TimerScheduler, Transition,
};

#[derive(Default)]
struct EventLog {
    events: Mutex<Vec<&'static str>>,
}

impl EventLog {
    fn events(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().clone()
    }

    fn count(&self, name: &str) -> usize {
        self.events().iter().filter(|event| **event == name).count()
    }
}

impl PresenceListener for EventLog {
    fn on_start(&self) -> Result<(), NotifyError> {
        self.events.lock().unwrap().push("start");
        Ok(())
    }

    fn on_end(&self) -> Result<(), NotifyError> {
        self.events.lock().unwrap().push("end");
        Ok(())
    }
}

fn debouncer(timeout: Duration) -> (Arc<PresenceDebouncer>, Arc<EventLog>) {
    let scheduler = TimerScheduler::spawn("test-timers").unwrap();
    let log = Arc::new(EventLog::default());
    let debouncer = PresenceDebouncer::new(
        PresenceKey::new("front", "Entrance"),
        timeout,
        scheduler,
        log.clone(),
    );
    (debouncer, log)
}

fn wait_for(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    done()
}

#[test]
fn expires_once_after_quiet_period() {
    let (d, log) = debouncer(Duration::from_secs(1));
    assert_eq!(d.signal(), Transition::Started);
    thread::sleep(Duration::from_millis(1100));
    assert!(wait_for(Duration::from_millis(500), || log.count("end") == 1));
    assert_eq!(log.events(), vec!["start", "end"]);
    assert_eq!(d.state(), PresenceState::Idle);

    thread::sleep(Duration::from_millis(300));
    assert_eq!(log.events(), vec!["start", "end"]);
}

#[test]
fn many_signals_in_window_start_once() {
    let (d, log) = debouncer(Duration::from_millis(200));
    for _ in 0..20 {
        d.signal();
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(log.events(), vec!["start"]);
    assert!(wait_for(Duration::from_secs(2), || log.count("end") == 1));
    assert_eq!(log.events(), vec!["start", "end"]);
    assert_eq!(d.episodes(), 1);
}

#[test]
fn rearm_before_deadline_postpones_end() {
    let timeout = Duration::from_millis(300);
    let (d, log) = debouncer(timeout);
    let started = Instant::now();
    d.signal();
    thread::sleep(Duration::from_millis(250));
    assert_eq!(d.signal(), Transition::Rearmed);

    // The original deadline (300ms) passes without an end.
    thread::sleep(Duration::from_millis(150));
    assert_eq!(log.count("end"), 0);
    assert!(d.is_active());

    assert!(wait_for(Duration::from_secs(2), || log.count("end") == 1));
    assert!(started.elapsed() >= Duration::from_millis(550));
}

#[test]
fn new_episode_after_end() {
    let (d, log) = debouncer(Duration::from_millis(50));
    d.signal();
    assert!(wait_for(Duration::from_secs(1), || log.count("end") == 1));
    assert_eq!(d.signal(), Transition::Started);
    assert!(wait_for(Duration::from_secs(1), || log.count("end") == 2));
    assert_eq!(log.events(), vec!["start", "end", "start", "end"]);
    assert_eq!(d.episodes(), 2);
}

#[test]
fn concurrent_signals_start_once() {
    let (d, log) = debouncer(Duration::from_secs(5));
    let threads = 16;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let d = d.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                (0..50).map(|_| d.signal()).collect::<Vec<_>>()
            })
        })
        .collect();
    let transitions: Vec<Transition> = handles
        .into_iter()
        .flat_map(|handle| handle.join().unwrap())
        .collect();

    let started = transitions
        .iter()
        .filter(|transition| **transition == Transition::Started)
        .count();
    assert_eq!(started, 1);
    assert_eq!(log.events(), vec!["start"]);
}

#[test]
fn short_timeout_never_delivers_end_before_start() {
    // A listener slower than the timeout: the end must still follow the start.
    struct Slow(EventLog);

    impl PresenceListener for Slow {
        fn on_start(&self) -> Result<(), NotifyError> {
            thread::sleep(Duration::from_millis(80));
            self.0.on_start()
        }

        fn on_end(&self) -> Result<(), NotifyError> {
            self.0.on_end()
        }
    }

    let scheduler = TimerScheduler::spawn("test-timers").unwrap();
    let slow = Arc::new(Slow(EventLog::default()));
    let d = PresenceDebouncer::new(
        PresenceKey::new("front", "Gate"),
        Duration::from_millis(10),
        scheduler,
        slow.clone(),
    );
    d.signal();
    assert!(wait_for(Duration::from_secs(1), || slow.0.count("end") == 1));
    assert_eq!(slow.0.events(), vec!["start", "end"]);
}

#[test]
fn registry_keeps_regions_independent() {
    let registry = PresenceRegistry::new(TimerScheduler::spawn("test-timers").unwrap());
    let entrance = PresenceKey::new("front", "Entrance");
    let yard = PresenceKey::new("front", "Yard");
    let log = Arc::new(EventLog::default());

    registry.signal(&entrance, Duration::from_millis(60), log.clone());
    registry.signal(&yard, Duration::from_secs(5), log.clone());
    assert_eq!(registry.active_regions(), vec![entrance.clone(), yard.clone()]);

    assert!(wait_for(Duration::from_secs(1), || {
        registry.active_regions() == vec![yard.clone()]
    }));
    assert_eq!(log.count("start"), 2);
    assert_eq!(log.count("end"), 1);
    assert!(registry.get(&entrance).unwrap().last_seen().is_some());
}
