//! Pending re-check tracking
//!
//! One bounded-membership set per deferred detector, tracking the flow uids
//! currently mid-defer. A key moves unseen -> pending -> resolved at most
//! once; removal on resolution is what bounds the set, so it is a
//! correctness requirement rather than an optimization.

use std::collections::HashSet;

use parking_lot::Mutex;

/// Set of flow uids waiting on a deferred re-check.
///
/// Safe against a re-check task racing the main event loop.
#[derive(Debug, Default)]
pub struct PendingSet {
    inner: Mutex<HashSet<String>>,
}

impl PendingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a key pending. Returns false if it already was, in which case
    /// the caller must not schedule a second re-check.
    pub fn mark(&self, id: &str) -> bool {
        self.inner.lock().insert(id.to_string())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().contains(id)
    }

    /// Remove a resolved key. Returns whether it was pending.
    pub fn clear(&self, id: &str) -> bool {
        self.inner.lock().remove(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_is_idempotent_per_key() {
        let set = PendingSet::new();
        assert!(set.mark("C1"));
        assert!(!set.mark("C1"));
        assert!(set.contains("C1"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn clear_resolves_a_key() {
        let set = PendingSet::new();
        set.mark("C1");
        assert!(set.clear("C1"));
        assert!(!set.contains("C1"));
        // clearing an unknown key is a no-op
        assert!(!set.clear("C1"));
        assert!(set.is_empty());
    }

    #[test]
    fn keys_are_independent() {
        let set = PendingSet::new();
        set.mark("a");
        set.mark("b");
        set.clear("a");
        assert!(!set.contains("a"));
        assert!(set.contains("b"));
    }
}
