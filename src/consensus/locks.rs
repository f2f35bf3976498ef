//! Fine-grained locks for the session engine.
//!
//! Votes and scores on the same row serialize through [`KeyedLocks`];
//! different rows proceed in parallel. [`ProjectLocks`] lets mutations share a
//! project while a priority calculation takes it exclusively.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// One async mutex per key, created on demand and dropped when uncontended.
pub struct KeyedLocks<K> {
    slots: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: K) -> KeyedGuard<'_, K> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(slots.entry(key.clone()).or_default())
        };
        let guard = Arc::clone(&slot).lock_owned().await;
        KeyedGuard {
            owner: self,
            key,
            slot,
            guard: Some(guard),
        }
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive access to one key of a [`KeyedLocks`].
pub struct KeyedGuard<'a, K: Eq + Hash + Clone> {
    owner: &'a KeyedLocks<K>,
    key: K,
    slot: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash + Clone> Drop for KeyedGuard<'_, K> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut slots = self.owner.slots.lock().unwrap_or_else(|e| e.into_inner());
        // map + this guard's handle; anything above that is a waiter
        if Arc::strong_count(&self.slot) == 2 {
            slots.remove(&self.key);
        }
    }
}

/// Per-project reader/writer locks.
#[derive(Default)]
pub struct ProjectLocks {
    projects: Mutex<HashMap<i64, Arc<RwLock<()>>>>,
}

impl ProjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, project_id: i64) -> Arc<RwLock<()>> {
        let mut projects = self.projects.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(projects.entry(project_id).or_default())
    }

    /// Shared access, held by ledger and magnitude mutations.
    pub async fn read(&self, project_id: i64) -> OwnedRwLockReadGuard<()> {
        self.slot(project_id).read_owned().await
    }

    /// Exclusive access, held for the duration of a priority calculation.
    pub async fn write(&self, project_id: i64) -> OwnedRwLockWriteGuard<()> {
        self.slot(project_id).write_owned().await
    }
}
