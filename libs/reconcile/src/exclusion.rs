//! Per-key mutual exclusion.
//!
//! A [`KeyedExclusion`] hands out at most one [`ExclusionToken`] per key.
//! Tokens are owned values, so they can travel into a spawned task and are
//! released when that task drops them, whether it finished or panicked.

use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

/// Set of keys with an operation in flight.
pub struct KeyedExclusion<K> {
    held: Arc<Mutex<HashSet<K>>>,
}

impl<K> Clone for KeyedExclusion<K> {
    fn clone(&self) -> Self {
        Self {
            held: Arc::clone(&self.held),
        }
    }
}

impl<K> Default for KeyedExclusion<K> {
    fn default() -> Self {
        Self {
            held: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedExclusion<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the token for `key`, or `None` if it is already held.
    pub fn try_acquire(&self, key: &K) -> Option<ExclusionToken<K>> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(key.clone()) {
            return None;
        }

        Some(ExclusionToken {
            key: key.clone(),
            held: Arc::clone(&self.held),
        })
    }

    /// Whether a token for `key` is currently outstanding.
    pub fn is_held(&self, key: &K) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
    }

    /// Number of outstanding tokens.
    pub fn held_count(&self) -> usize {
        self.held.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Proof that the holder is the only in-flight operation for `key`.
pub struct ExclusionToken<K: Eq + Hash> {
    key: K,
    held: Arc<Mutex<HashSet<K>>>,
}

impl<K: Eq + Hash> ExclusionToken<K> {
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Eq + Hash + fmt::Debug> fmt::Debug for ExclusionToken<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExclusionToken")
            .field("key", &self.key)
            .finish()
    }
}

impl<K: Eq + Hash> Drop for ExclusionToken<K> {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}
