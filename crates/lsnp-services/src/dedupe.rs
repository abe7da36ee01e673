//! Duplicate-frame suppression.
//!
//! The reliable layer retransmits until acked, so every receiver must treat
//! a fingerprint as actionable at most once. The cache is a bounded map
//! from fingerprint to arrival time with TTL expiry and oldest-first
//! eviction at the cap. A duplicate observation does not refresh the entry:
//! a replayed frame never extends its own suppression window.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lsnp_core::UserId;

/// Key for duplicate suppression: who sent it, and which MESSAGE_ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub sender: UserId,
    pub message_id: String,
}

impl Fingerprint {
    pub fn new(sender: UserId, message_id: impl Into<String>) -> Self {
        Self {
            sender,
            message_id: message_id.into(),
        }
    }
}

/// Bounded, TTL'd fingerprint cache. One mutex — observe is a few map ops,
/// contention is not a concern at LAN frame rates.
pub struct DedupeCache {
    inner: Mutex<Inner>,
    cap: usize,
    ttl: Duration,
}

struct Inner {
    seen: HashMap<Fingerprint, Instant>,
    // Insertion order; entries are pushed exactly once, so the front is
    // always the oldest live entry.
    order: VecDeque<(Fingerprint, Instant)>,
}

impl DedupeCache {
    pub fn new(cap: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                seen: HashMap::new(),
                order: VecDeque::new(),
            }),
            cap: cap.max(1),
            ttl,
        }
    }

    /// Returns true iff the fingerprint has not been seen within the TTL.
    /// A true return records it.
    pub fn observe(&self, fp: Fingerprint) -> bool {
        self.observe_at(fp, Instant::now())
    }

    fn observe_at(&self, fp: Fingerprint, now: Instant) -> bool {
        let mut inner = self.inner.lock().expect("dedupe lock poisoned");

        // Expire from the front: insertion order is arrival order.
        loop {
            let expired = matches!(
                inner.order.front(),
                Some((_, at)) if now.saturating_duration_since(*at) > self.ttl
            );
            if !expired {
                break;
            }
            if let Some((fp, _)) = inner.order.pop_front() {
                inner.seen.remove(&fp);
            }
        }

        if inner.seen.contains_key(&fp) {
            return false;
        }

        inner.seen.insert(fp.clone(), now);
        inner.order.push_back((fp, now));

        if inner.order.len() > self.cap {
            if let Some((oldest, _)) = inner.order.pop_front() {
                inner.seen.remove(&oldest);
            }
        }

        true
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("dedupe lock poisoned").seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(msg: &str) -> Fingerprint {
        Fingerprint::new("alice@192.168.1.10".parse().unwrap(), msg)
    }

    #[test]
    fn first_observation_is_new_rest_are_not() {
        let cache = DedupeCache::new(16, Duration::from_secs(60));
        assert!(cache.observe(fp("m1")));
        assert!(!cache.observe(fp("m1")));
        assert!(!cache.observe(fp("m1")));
        assert!(cache.observe(fp("m2")));
    }

    #[test]
    fn same_message_id_from_different_sender_is_distinct() {
        let cache = DedupeCache::new(16, Duration::from_secs(60));
        let a = Fingerprint::new("alice@192.168.1.10".parse().unwrap(), "m1");
        let b = Fingerprint::new("bob@192.168.1.11".parse().unwrap(), "m1");
        assert!(cache.observe(a));
        assert!(cache.observe(b));
    }

    #[test]
    fn cap_evicts_oldest() {
        let cache = DedupeCache::new(3, Duration::from_secs(60));
        assert!(cache.observe(fp("m1")));
        assert!(cache.observe(fp("m2")));
        assert!(cache.observe(fp("m3")));
        assert!(cache.observe(fp("m4")));
        assert_eq!(cache.len(), 3);
        // m1 fell out, so it reads as new again.
        assert!(cache.observe(fp("m1")));
        // m4 is still hot.
        assert!(!cache.observe(fp("m4")));
    }

    #[test]
    fn ttl_expires_entries() {
        let cache = DedupeCache::new(16, Duration::from_secs(60));
        let t0 = Instant::now();
        assert!(cache.observe_at(fp("m1"), t0));
        assert!(!cache.observe_at(fp("m1"), t0 + Duration::from_secs(59)));
        // Past the TTL the fingerprint is forgotten.
        assert!(cache.observe_at(fp("m1"), t0 + Duration::from_secs(61)));
    }

    #[test]
    fn duplicate_does_not_refresh_ttl() {
        let cache = DedupeCache::new(16, Duration::from_secs(60));
        let t0 = Instant::now();
        assert!(cache.observe_at(fp("m1"), t0));
        // A replay at t+59 must not push expiry past t+60.
        assert!(!cache.observe_at(fp("m1"), t0 + Duration::from_secs(59)));
        assert!(cache.observe_at(fp("m1"), t0 + Duration::from_secs(61)));
    }
}
