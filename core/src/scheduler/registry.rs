use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct ActiveEntry {
    generation: u64,
    token: CancellationToken,
}

/// In-flight attempts and pending retry timers, keyed by sub-task id.
///
/// At most one attempt and one retry timer exist per sub-task at a time.
#[derive(Default)]
pub struct SubtaskRegistry {
    active: Mutex<HashMap<String, ActiveEntry>>,
    retries: Mutex<HashMap<String, JoinHandle<()>>>,
    next_generation: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SubtaskRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim the attempt slot for `subtask_id`; `None` while another attempt holds it.
    pub fn try_acquire(self: &Arc<Self>, subtask_id: &str) -> Option<ActiveGuard> {
        let mut active = lock(&self.active);
        if active.contains_key(subtask_id) {
            return None;
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        active.insert(
            subtask_id.to_string(),
            ActiveEntry {
                generation,
                token: token.clone(),
            },
        );
        Some(ActiveGuard {
            registry: Arc::clone(self),
            subtask_id: subtask_id.to_string(),
            generation,
            token,
        })
    }

    pub fn is_active(&self, subtask_id: &str) -> bool {
        lock(&self.active).contains_key(subtask_id)
    }

    /// Cancel the in-flight attempt and drop its entry.
    pub fn abort(&self, subtask_id: &str) -> bool {
        match lock(&self.active).remove(subtask_id) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    fn release(&self, subtask_id: &str, generation: u64) {
        let mut active = lock(&self.active);
        if active
            .get(subtask_id)
            .is_some_and(|entry| entry.generation == generation)
        {
            active.remove(subtask_id);
        }
    }

    /// Register a retry timer unless one is already pending.
    ///
    /// `spawn` runs under the registry lock so the timer cannot observe its
    /// own entry before it is recorded.
    pub fn schedule_retry<F>(&self, subtask_id: &str, spawn: F) -> bool
    where
        F: FnOnce() -> JoinHandle<()>,
    {
        let mut retries = lock(&self.retries);
        if retries.contains_key(subtask_id) {
            return false;
        }
        retries.insert(subtask_id.to_string(), spawn());
        true
    }

    pub fn has_retry(&self, subtask_id: &str) -> bool {
        lock(&self.retries).contains_key(subtask_id)
    }

    /// Cancel a pending retry timer.
    pub fn clear_retry(&self, subtask_id: &str) -> bool {
        match lock(&self.retries).remove(subtask_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Called by a firing timer to drop its own entry without aborting itself.
    pub fn take_retry(&self, subtask_id: &str) {
        lock(&self.retries).remove(subtask_id);
    }

    pub fn active_count(&self) -> usize {
        lock(&self.active).len()
    }

    pub fn pending_retry_count(&self) -> usize {
        lock(&self.retries).len()
    }
}

/// Holds the attempt slot; releases it on drop.
pub struct ActiveGuard {
    registry: Arc<SubtaskRegistry>,
    subtask_id: String,
    generation: u64,
    token: CancellationToken,
}

impl ActiveGuard {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.registry.release(&self.subtask_id, self.generation);
    }
}
