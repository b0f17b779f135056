//! The two-level lock set behind the three isolation modes.
//!
//! One global reader/writer gate spans the whole scheduler; a keyed table
//! holds one mutex per live task. The mode mapping:
//!
//! | Mode | Acquisition |
//! |---|---|
//! | `NonBlocking` | global gate, shared |
//! | `Blocking` | this task's mutex, then global gate shared |
//! | `GlobalBlocking` | global gate, exclusive |
//!
//! Lock order is per-task mutex first, global gate second — never the
//! reverse. Workers are the only acquisition site.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::task::TaskId;

pub(crate) struct LockTable {
    global: RwLock<()>,
    /// Written only by the dispatch loop; read by workers.
    per_task: Mutex<HashMap<TaskId, Arc<AsyncMutex<()>>>>,
}

impl LockTable {
    pub(crate) fn new() -> Self {
        Self {
            global: RwLock::new(()),
            per_task: Mutex::new(HashMap::new()),
        }
    }

    /// Create the per-task mutex for `id`. Called by the admission handler
    /// before any timer for `id` can fire.
    pub(crate) fn register(&self, id: TaskId) {
        self.table().insert(id, Arc::new(AsyncMutex::new(())));
    }

    pub(crate) fn remove(&self, id: TaskId) {
        self.table().remove(&id);
    }

    pub(crate) fn clear(&self) {
        self.table().clear();
    }

    /// The mutex for `id`, or `None` when the task has been deleted.
    pub(crate) fn task_mutex(&self, id: TaskId) -> Option<Arc<AsyncMutex<()>>> {
        self.table().get(&id).cloned()
    }

    pub(crate) async fn shared_gate(&self) -> RwLockReadGuard<'_, ()> {
        self.global.read().await
    }

    pub(crate) async fn exclusive_gate(&self) -> RwLockWriteGuard<'_, ()> {
        self.global.write().await
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, Arc<AsyncMutex<()>>>> {
        self.per_task.lock().expect("per-task lock table poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_remove_round_trip() {
        let locks = LockTable::new();
        locks.register(7);
        assert!(locks.task_mutex(7).is_some());
        locks.remove(7);
        assert!(locks.task_mutex(7).is_none());
    }

    #[test]
    fn clear_drops_every_entry() {
        let locks = LockTable::new();
        for id in 0..4 {
            locks.register(id);
        }
        locks.clear();
        for id in 0..4 {
            assert!(locks.task_mutex(id).is_none());
        }
    }
}
