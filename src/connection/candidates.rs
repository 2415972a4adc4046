// ICE candidate buffering for the SFU
//
// Remote candidates that arrive before a remote description is applied are
// kept here, in arrival order, until they can be handed to the transport.

use parking_lot::Mutex;

use crate::signaling::IceCandidateInit;

/// FIFO buffer of remote candidates, deduplicated by signature
#[derive(Default)]
pub struct CandidateCache {
    entries: Mutex<Vec<IceCandidateInit>>,
}

impl CandidateCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a candidate; returns false if it was already buffered
    pub fn insert(&self, candidate: IceCandidateInit) -> bool {
        let mut entries = self.entries.lock();
        let signature = candidate.signature();
        if entries.iter().any(|entry| entry.signature() == signature) {
            return false;
        }
        entries.push(candidate);
        true
    }

    /// Take every buffered candidate in arrival order
    pub fn drain(&self) -> Vec<IceCandidateInit> {
        std::mem::take(&mut *self.entries.lock())
    }

    /// Drop every buffered candidate
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of buffered candidates
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_keeps_order_and_skips_duplicates() {
        let cache = CandidateCache::new();
        assert!(cache.insert(IceCandidateInit::new("c1")));
        assert!(cache.insert(IceCandidateInit::new("c2")));
        assert!(!cache.insert(IceCandidateInit::new("c1")));
        assert!(cache.insert(IceCandidateInit::new("c3")));

        let drained: Vec<_> = cache.drain().into_iter().map(|c| c.candidate).collect();
        assert_eq!(drained, vec!["c1", "c2", "c3"]);
        assert!(cache.is_empty());
        assert!(cache.drain().is_empty());
    }
}
