use std::collections::{HashSet, VecDeque};

use snaprelay_core::{DEDUP_MAX_ENTRIES, DEDUP_TRIM_TO};

/// Bounded recency set of screenshot fingerprints. Insertion order is kept so
/// overflow evicts the oldest entries; the cache never exceeds
/// [`DEDUP_MAX_ENTRIES`] and trims back to the [`DEDUP_TRIM_TO`] most recent.
#[derive(Debug, Default)]
pub struct DedupCache {
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl DedupCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the key. Returns `true` if it was fresh, `false` if it was
    /// already present (a redelivery).
    pub fn observe(&mut self, key: &str) -> bool {
        if self.seen.contains(key) {
            return false;
        }
        self.seen.insert(key.to_owned());
        self.order.push_back(key.to_owned());

        if self.order.len() > DEDUP_MAX_ENTRIES {
            while self.order.len() > DEDUP_TRIM_TO {
                if let Some(evicted) = self.order.pop_front() {
                    self.seen.remove(&evicted);
                }
            }
        }
        true
    }

    /// Removes a key recorded for a message that was then rejected, so a
    /// corrected redelivery is not mistaken for a duplicate.
    pub fn forget(&mut self, key: &str) {
        if self.seen.remove(key) {
            self.order.retain(|entry| entry != key);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
