//! Per-conversation write serialization.
//!
//! A striped lock map keyed by conversation id. Append paths run under
//! the conversation's lock; reads never take it. Appends are short and
//! non-suspending, so a synchronous mutex is the right tool (no async
//! lock needed).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

pub struct ConversationLocks {
    locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl Default for ConversationLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` while holding the conversation's lock.
    pub fn with<R>(&self, conv: i64, f: impl FnOnce() -> R) -> R {
        let lock = {
            let mut locks = self.locks.lock();
            locks.entry(conv).or_default().clone()
        };
        let _guard = lock.lock();
        f()
    }

    /// Number of tracked conversations (for monitoring).
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }

    /// Drop entries no other thread currently holds.
    pub fn prune_idle(&self) {
        let mut locks = self.locks.lock();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1 || lock.is_locked());
    }
}
