//! Configuration store seam
//!
//! The monitor never owns persisted settings. It reads them from a
//! [`ConfigStore`] supplied by the host and follows changes through
//! `on_value_change` callbacks.

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Callback invoked with the new value of a watched key.
pub type ValueCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Key/value configuration collaborator.
pub trait ConfigStore: Send + Sync {
    fn get_value(&self, key: &str) -> Option<Value>;

    /// Watch `key`. The watch lasts until the returned handle is dropped.
    fn on_value_change(&self, key: &str, callback: ValueCallback) -> WatchHandle;
}

/// Registration returned by [`ConfigStore::on_value_change`].
///
/// Dropping the handle (or calling [`WatchHandle::unsubscribe`]) removes the
/// callback.
pub struct WatchHandle {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl WatchHandle {
    pub fn new(release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle")
            .field("active", &self.release.is_some())
            .finish()
    }
}

type WatcherMap = Mutex<HashMap<u64, (String, ValueCallback)>>;

/// Process-local store for hosts without their own settings backend.
#[derive(Default)]
pub struct InMemoryConfigStore {
    values: RwLock<HashMap<String, Value>>,
    watchers: Arc<WatcherMap>,
    next_id: AtomicU64,
}

impl InMemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` and notify watchers of `key`.
    pub fn set_value(&self, key: &str, value: Value) {
        self.values.write().insert(key.to_string(), value.clone());

        // Clone the callbacks out so a watcher may call back into the store.
        let callbacks: Vec<ValueCallback> = self
            .watchers
            .lock()
            .values()
            .filter(|(watched, _)| watched == key)
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(&value);
        }
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.lock().len()
    }
}

impl ConfigStore for InMemoryConfigStore {
    fn get_value(&self, key: &str) -> Option<Value> {
        self.values.read().get(key).cloned()
    }

    fn on_value_change(&self, key: &str, callback: ValueCallback) -> WatchHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.watchers
            .lock()
            .insert(id, (key.to_string(), callback));

        let watchers: Weak<WatcherMap> = Arc::downgrade(&self.watchers);
        WatchHandle::new(move || {
            if let Some(watchers) = watchers.upgrade() {
                watchers.lock().remove(&id);
            }
        })
    }
}
