use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::debouncer::{PresenceDebouncer, PresenceKey, PresenceListener, Transition};
use super::scheduler::TimerScheduler;

/// Lazily created debouncers, one per (camera, region).
///
/// Instances live for the lifetime of the registry. The map lock is only held
/// to look up or insert; signalling happens on the instance itself.
pub struct PresenceRegistry {
    scheduler: Arc<TimerScheduler>,
    instances: Mutex<HashMap<PresenceKey, Arc<PresenceDebouncer>>>,
}

impl PresenceRegistry {
    pub fn new(scheduler: Arc<TimerScheduler>) -> Self {
        Self {
            scheduler,
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Get the instance for `key`, creating it with `timeout` and `listener`
    /// on first use. Both arguments are ignored for existing instances.
    pub fn get_or_create(
        &self,
        key: &PresenceKey,
        timeout: Duration,
        listener: Arc<dyn PresenceListener>,
    ) -> Arc<PresenceDebouncer> {
        let mut instances = self.lock();
        if let Some(existing) = instances.get(key) {
            return existing.clone();
        }
        log::debug!("[{}] creating presence instance (timeout {:?})", key, timeout);
        let debouncer =
            PresenceDebouncer::new(key.clone(), timeout, self.scheduler.clone(), listener);
        instances.insert(key.clone(), debouncer.clone());
        debouncer
    }

    /// Signal `key`, creating the instance if needed and binding `listener`
    /// for this and later callbacks.
    pub fn signal(
        &self,
        key: &PresenceKey,
        timeout: Duration,
        listener: Arc<dyn PresenceListener>,
    ) -> Transition {
        let debouncer = self.get_or_create(key, timeout, listener.clone());
        debouncer.signal_with(listener)
    }

    pub fn get(&self, key: &PresenceKey) -> Option<Arc<PresenceDebouncer>> {
        self.lock().get(key).cloned()
    }

    /// Keys currently inside a presence episode, sorted.
    pub fn active_regions(&self) -> Vec<PresenceKey> {
        let instances: Vec<_> = self.lock().values().cloned().collect();
        let mut keys: Vec<_> = instances
            .into_iter()
            .filter(|debouncer| debouncer.is_active())
            .map(|debouncer| debouncer.key().clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PresenceKey, Arc<PresenceDebouncer>>> {
        self.instances.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
