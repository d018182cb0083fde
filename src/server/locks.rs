//! Keyed locks.
//!
//! Serialise work on the same key (an identity, a target) while letting
//! work on different keys proceed. The guards are owned, so they can be
//! moved into spawned tasks and held across await points.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};


//------------ KeyedLocks ----------------------------------------------------

#[derive(Debug)]
pub struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

pub type KeyedGuard = OwnedMutexGuard<()>;

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        KeyedLocks { locks: Mutex::new(HashMap::new()) }
    }
}

impl<K: Clone + Eq + Hash> KeyedLocks<K> {
    fn entry(&self, key: &K) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().expect("poisoned lock");
        locks.entry(key.clone()).or_default().clone()
    }

    /// Waits until the lock for `key` is free and takes it.
    ///
    /// Waiters are served in FIFO order.
    pub async fn lock(&self, key: &K) -> KeyedGuard {
        self.entry(key).lock_owned().await
    }

    /// Takes the lock for `key` if nobody holds it.
    pub fn try_lock(&self, key: &K) -> Option<KeyedGuard> {
        self.entry(key).try_lock_owned().ok()
    }

    pub fn is_locked(&self, key: &K) -> bool {
        let locks = self.locks.lock().expect("poisoned lock");
        locks.get(key).map(|lock| lock.try_lock().is_err()).unwrap_or(false)
    }
}


//------------ Tests ---------------------------------------------------------
