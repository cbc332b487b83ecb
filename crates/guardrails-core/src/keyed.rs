//! Per-key state shared by concurrent fetch tasks.
//!
//! Lookups take a shared read lock on the key map; each entry has its own
//! mutex, so mutating one target's state never blocks another target.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

pub(crate) struct KeyedState<T> {
    entries: RwLock<HashMap<String, Arc<Mutex<T>>>>,
}

impl<T> KeyedState<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the entry for `key`, creating it with `init` on first use.
    pub(crate) fn entry(&self, key: &str, init: impl FnOnce() -> T) -> Arc<Mutex<T>> {
        {
            let map = self
                .entries
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(entry) = map.get(key) {
                return Arc::clone(entry);
            }
        }

        let mut map = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(init()))),
        )
    }

    /// Returns the entry for `key` without creating it.
    pub(crate) fn get(&self, key: &str) -> Option<Arc<Mutex<T>>> {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

impl<T> Default for KeyedState<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Locks an entry, recovering from poison.
pub(crate) fn lock<T>(entry: &Mutex<T>) -> MutexGuard<'_, T> {
    entry.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("Recovered from poisoned mutex");
        poisoned.into_inner()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_is_created_once() {
        let state: KeyedState<u32> = KeyedState::new();
        let a = state.entry("a", || 1);
        *lock(&a) += 1;

        let again = state.entry("a", || 100);
        assert_eq!(*lock(&again), 2);
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn keys_are_independent() {
        let state: KeyedState<u32> = KeyedState::new();
        let a = state.entry("a", || 1);
        let _guard = lock(&a);

        // Holding a's mutex must not prevent access to b.
        let b = state.entry("b", || 2);
        assert_eq!(*lock(&b), 2);
        assert!(state.get("c").is_none());
    }
}
