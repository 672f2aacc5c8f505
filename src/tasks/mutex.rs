//! Per-conversation mutual exclusion.
//!
//! History reads and writes for one `(channelId, conversationId)` pair
//! are serialised through this table while unrelated conversations
//! proceed in parallel. Waiters for one key are granted in FIFO order
//! (tokio mutexes are fair). Release happens on guard drop, so every
//! path out of a critical section releases exactly once.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub struct ConversationMutex {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Held lock on one conversation key. Dropping releases.
pub struct ConversationGuard {
    _permit: OwnedMutexGuard<()>,
}

impl ConversationMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`, waiting behind earlier acquirers of
    /// the same key.
    pub async fn acquire(&self, key: &str) -> ConversationGuard {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        ConversationGuard {
            _permit: lock.lock_owned().await,
        }
    }
}
