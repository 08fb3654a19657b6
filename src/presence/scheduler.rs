//! Shared deadline scheduler for debounce timers.
//!
//! One background thread owns a min-heap of deadlines. Cancellation removes
//! the task from the pending map; the heap entry is discarded lazily when it
//! reaches the front. Tasks run on the scheduler thread without the
//! scheduler lock held, so they may schedule or cancel other timers, but they
//! must not block for long.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a scheduled task, used for cancellation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

#[derive(Default)]
struct SchedulerState {
    queue: BinaryHeap<Reverse<(Instant, u64)>>,
    tasks: HashMap<u64, Task>,
    next_seq: u64,
    shutdown: bool,
}

struct Shared {
    state: Mutex<SchedulerState>,
    wake: Condvar,
}

impl Shared {
    // Tasks never run under this lock, so a poisoned guard still holds
    // consistent bookkeeping.
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct TimerScheduler {
    shared: Arc<Shared>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl TimerScheduler {
    /// Start the scheduler thread.
    pub fn spawn(name: &str) -> std::io::Result<Arc<Self>> {
        let shared = Arc::new(Shared {
            state: Mutex::new(SchedulerState::default()),
            wake: Condvar::new(),
        });
        let worker = shared.clone();
        let join = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(worker))?;
        Ok(Arc::new(Self {
            shared,
            join: Mutex::new(Some(join)),
        }))
    }

    /// Run `task` once after `delay`, unless cancelled first.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let deadline = Instant::now() + delay;
        let mut state = self.shared.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.push(Reverse((deadline, seq)));
        state.tasks.insert(seq, Box::new(task));
        drop(state);
        self.shared.wake.notify_one();
        TimerHandle(seq)
    }

    /// Cancel a pending task. Returns false if it already ran or was cancelled.
    pub fn cancel(&self, handle: TimerHandle) -> bool {
        self.shared.lock().tasks.remove(&handle.0).is_some()
    }

    /// Number of tasks still waiting to run.
    pub fn pending(&self) -> usize {
        self.shared.lock().tasks.len()
    }

    /// Stop the thread. Pending tasks are dropped without running.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.lock();
            state.shutdown = true;
            state.tasks.clear();
            state.queue.clear();
        }
        self.shared.wake.notify_all();
        let join = self
            .join
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(join) = join {
            // The last handle may be dropped from inside a task.
            if join.thread().id() != std::thread::current().id() && join.join().is_err() {
                log::error!("timer scheduler thread panicked");
            }
        }
    }
}

impl Drop for TimerScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(shared: Arc<Shared>) {
    let mut state = shared.lock();
    loop {
        if state.shutdown {
            return;
        }
        let Some(&Reverse((deadline, seq))) = state.queue.peek() else {
            state = shared
                .wake
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
            continue;
        };
        if !state.tasks.contains_key(&seq) {
            state.queue.pop();
            continue;
        }
        let now = Instant::now();
        if deadline > now {
            state = shared
                .wake
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
            continue;
        }
        state.queue.pop();
        let task = state.tasks.remove(&seq);
        drop(state);
        if let Some(task) = task {
            if catch_unwind(AssertUnwindSafe(task)).is_err() {
                log::error!("timer task {} panicked", seq);
            }
        }
        state = shared.lock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn runs_tasks_in_deadline_order() {
        let scheduler = TimerScheduler::spawn("test-timers").unwrap();
        let (tx, rx) = mpsc::channel();
        for (delay, tag) in [(60, "late"), (10, "early"), (30, "middle")] {
            let tx = tx.clone();
            scheduler.schedule(Duration::from_millis(delay), move || {
                tx.send(tag).unwrap();
            });
        }
        let order: Vec<_> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(order, vec!["early", "middle", "late"]);
    }

    #[test]
    fn cancelled_task_never_runs() {
        let scheduler = TimerScheduler::spawn("test-timers").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let handle = scheduler.schedule(Duration::from_millis(20), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(scheduler.cancel(handle));
        assert!(!scheduler.cancel(handle));
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn panicking_task_does_not_stop_scheduler() {
        let scheduler = TimerScheduler::spawn("test-timers").unwrap();
        scheduler.schedule(Duration::from_millis(1), || panic!("boom"));
        let (tx, rx) = mpsc::channel();
        scheduler.schedule(Duration::from_millis(20), move || {
            tx.send(()).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
    }

    #[test]
    fn shutdown_drops_pending_tasks() {
        let scheduler = TimerScheduler::spawn("test-timers").unwrap();
        scheduler.schedule(Duration::from_secs(60), || {});
        assert_eq!(scheduler.pending(), 1);
        scheduler.shutdown();
        assert_eq!(scheduler.pending(), 0);
    }
}
