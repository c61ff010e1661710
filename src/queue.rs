//! A keyed work queue for sync workers.
//!
//! Guarantees the sync contract needs: a key is never handed to two workers
//! at once, and a key re-added while in flight runs again after the current
//! attempt finishes. Pending keys are deduplicated, so a burst of change
//! events collapses into one sync.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use tokio::sync::Notify;

pub(crate) struct TaskQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<String>,
    queued: HashSet<String>,
    active: HashSet<String>,
    // changed while a worker held them; re-queued on done()
    dirty: HashSet<String>,
}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    pub(crate) fn add(&self, key: impl Into<String>) {
        let key = key.into();
        let mut state = self.state.lock().unwrap();
        if state.active.contains(&key) {
            state.dirty.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            state.pending.push_back(key);
            self.notify.notify_one();
        }
    }

    /// Wait for a key to work on. The key stays owned by the caller until
    /// it's handed back with [TaskQueue::done].
    pub(crate) async fn next(&self) -> String {
        loop {
            if let Some(key) = self.try_next() {
                return key;
            }
            self.notify.notified().await;
        }
    }

    pub(crate) fn done(&self, key: &str) {
        let mut state = self.state.lock().unwrap();
        state.active.remove(key);
        if state.dirty.remove(key) && state.queued.insert(key.to_string()) {
            state.pending.push_back(key.to_string());
            self.notify.notify_one();
        }
    }

    fn try_next(&self) -> Option<String> {
        let mut state = self.state.lock().unwrap();
        let key = state.pending.pop_front()?;
        state.queued.remove(&key);
        state.active.insert(key.clone());
        // a single Notify permit can cover multiple adds; pass the wakeup
        // along while there's still work
        if !state.pending.is_empty() {
            self.notify.notify_one();
        }
        Some(key)
    }
}
