//! ICE candidate bookkeeping
//!
//! Candidates trickle in from both the signaling layer and the media engine's
//! callback thread, frequently duplicated during renegotiation. The store
//! keeps one de-duplicated, order-preserving set per session behind a single
//! mutex; sessions never contend with each other.

use std::collections::HashSet;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// One ICE candidate as exchanged over signaling. Identity is the full tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u32>,
}

impl IceCandidate {
    pub fn new<S: Into<String>>(
        candidate: S,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u32>,
    ) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid,
            sdp_mline_index,
        }
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    ordered: Vec<IceCandidate>,
    seen: HashSet<IceCandidate>,
    removed_total: u64,
}

/// Per-session candidate set. Removal is a recorded operation, not an undo:
/// a removed candidate stays counted in `removed_total` and may be re-added
/// later as a fresh insertion.
#[derive(Debug, Default)]
pub struct IceCandidateStore {
    inner: Mutex<StoreInner>,
}

impl IceCandidateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a candidate. Returns false (and stores nothing) on duplicates.
    pub fn add(&self, candidate: IceCandidate) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.seen.insert(candidate.clone()) {
            return false;
        }
        inner.ordered.push(candidate);
        true
    }

    /// Remove every listed candidate that is currently stored.
    /// Returns the number actually removed.
    pub fn remove_all(&self, candidates: &[IceCandidate]) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let mut removed = 0;
        for candidate in candidates {
            if inner.seen.remove(candidate) {
                inner.ordered.retain(|c| c != candidate);
                removed += 1;
            }
        }
        inner.removed_total += removed as u64;
        removed
    }

    /// Candidates in insertion order.
    pub fn list(&self) -> Vec<IceCandidate> {
        self.inner.lock().unwrap().ordered.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total candidates removed over the lifetime of the session.
    pub fn removed_total(&self) -> u64 {
        self.inner.lock().unwrap().removed_total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_candidate(n: u32) -> IceCandidate {
        IceCandidate::new(
            format!("candidate:{} 1 udp 2122260223 10.0.0.{} 54400 typ host", n, n),
            Some("audio".to_string()),
            Some(0),
        )
    }

    #[test]
    fn test_duplicate_add_is_noop() {
        let store = IceCandidateStore::new();
        let candidate = host_candidate(1);

        assert!(store.add(candidate.clone()));
        assert!(!store.add(candidate));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_identity_is_full_tuple() {
        let store = IceCandidateStore::new();
        let a = host_candidate(1);
        let mut b = a.clone();
        b.sdp_mline_index = Some(1);

        assert!(store.add(a));
        assert!(store.add(b));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_list_preserves_insertion_order() {
        let store = IceCandidateStore::new();
        let candidates: Vec<_> = (1..=5).map(host_candidate).collect();
        for c in &candidates {
            store.add(c.clone());
        }
        assert_eq!(store.list(), candidates);
    }

    #[test]
    fn test_remove_all_counts_only_present() {
        let store = IceCandidateStore::new();
        store.add(host_candidate(1));
        store.add(host_candidate(2));

        let removed = store.remove_all(&[host_candidate(1), host_candidate(9)]);
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.removed_total(), 1);
    }

    #[test]
    fn test_readd_after_removal_is_fresh_insertion() {
        let store = IceCandidateStore::new();
        let candidate = host_candidate(1);

        store.add(candidate.clone());
        store.remove_all(std::slice::from_ref(&candidate));
        assert!(store.add(candidate));
        assert_eq!(store.len(), 1);
        assert_eq!(store.removed_total(), 1);
    }

    #[test]
    fn test_concurrent_adds_from_two_threads() {
        use std::sync::Arc;

        let store = Arc::new(IceCandidateStore::new());
        let mut handles = Vec::new();
        for _ in 0..2 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                for n in 1..=50 {
                    store.add(host_candidate(n));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.len(), 50);
    }
}
