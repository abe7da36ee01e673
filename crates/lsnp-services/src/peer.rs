//! Peer registry — every peer heard on the segment and when.
//!
//! Keyed by UserId: the same name on a new IP is a new entry. `last_seen`
//! is advanced by any authentic frame, not just PONG; `active` is purely a
//! function of `last_seen` against the stale threshold and is recomputed by
//! the presence sweep.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use lsnp_core::UserId;

/// A peer as currently known. `addr` is the source address of the most
/// recent frame — unicast replies go there, which also keeps multiple
/// engines on one host addressable.
#[derive(Debug, Clone)]
pub struct Peer {
    pub user_id: UserId,
    pub addr: SocketAddr,
    pub display_name: String,
    pub status: String,
    pub avatar: Option<String>,
    pub last_seen: Instant,
    pub active: bool,
}

/// Result of a registry sweep: which peers changed state.
#[derive(Debug, Default)]
pub struct SweepOutcome {
    pub went_inactive: Vec<UserId>,
    pub evicted: Vec<UserId>,
}

/// The registry — shared between the dispatcher, presence tasks, and
/// services that fan out (groups, file transfer).
#[derive(Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<DashMap<UserId, Peer>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a frame arrived from `user_id` at `addr`. Creates the
    /// peer on first sight. Returns true if the peer is new.
    pub fn observe(&self, user_id: &UserId, addr: SocketAddr) -> bool {
        let mut is_new = false;
        self.peers
            .entry(user_id.clone())
            .and_modify(|peer| {
                peer.addr = addr;
                peer.last_seen = Instant::now();
                peer.active = true;
            })
            .or_insert_with(|| {
                is_new = true;
                Peer {
                    user_id: user_id.clone(),
                    addr,
                    display_name: user_id.name().to_string(),
                    status: String::new(),
                    avatar: None,
                    last_seen: Instant::now(),
                    active: true,
                }
            });
        is_new
    }

    /// Apply a PROFILE's fields. Returns true if anything changed.
    pub fn apply_profile(
        &self,
        user_id: &UserId,
        display_name: &str,
        status: &str,
        avatar: Option<&str>,
    ) -> bool {
        match self.peers.get_mut(user_id) {
            Some(mut peer) => {
                let changed = peer.display_name != display_name
                    || peer.status != status
                    || peer.avatar.as_deref() != avatar;
                peer.display_name = display_name.to_string();
                peer.status = status.to_string();
                peer.avatar = avatar.map(str::to_string);
                changed
            }
            None => false,
        }
    }

    pub fn get(&self, user_id: &UserId) -> Option<Peer> {
        self.peers.get(user_id).map(|p| p.clone())
    }

    pub fn contains(&self, user_id: &UserId) -> bool {
        self.peers.contains_key(user_id)
    }

    /// Last observed source address for a peer, if known.
    pub fn addr_of(&self, user_id: &UserId) -> Option<SocketAddr> {
        self.peers.get(user_id).map(|p| p.addr)
    }

    /// Flag a peer inactive without touching `last_seen` (REVOKE path).
    /// Returns true if the peer existed and was active.
    pub fn mark_inactive(&self, user_id: &UserId) -> bool {
        match self.peers.get_mut(user_id) {
            Some(mut peer) => {
                let was_active = peer.active;
                peer.active = false;
                was_active
            }
            None => false,
        }
    }

    pub fn remove(&self, user_id: &UserId) -> Option<Peer> {
        self.peers.remove(user_id).map(|(_, p)| p)
    }

    pub fn active_peers(&self) -> Vec<Peer> {
        self.peers
            .iter()
            .filter(|e| e.value().active)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn all_peers(&self) -> Vec<Peer> {
        self.peers.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Flag peers unseen past `stale` and evict those unseen past `evict`.
    pub fn sweep(&self, stale: Duration, evict: Duration) -> SweepOutcome {
        self.sweep_at(Instant::now(), stale, evict)
    }

    fn sweep_at(&self, now: Instant, stale: Duration, evict: Duration) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();

        for mut entry in self.peers.iter_mut() {
            let age = now.saturating_duration_since(entry.last_seen);
            if entry.active && age > stale {
                entry.active = false;
                outcome.went_inactive.push(entry.user_id.clone());
            }
        }

        self.peers.retain(|user_id, peer| {
            let age = now.saturating_duration_since(peer.last_seen);
            if age > evict {
                outcome.evicted.push(user_id.clone());
                false
            } else {
                true
            }
        });

        outcome
    }

    /// How long ago a peer was last heard from.
    pub fn idle_for(&self, user_id: &UserId) -> Option<Duration> {
        self.peers
            .get(user_id)
            .map(|p| p.last_seen.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> UserId {
        s.parse().unwrap()
    }

    fn addr(port: u16) -> SocketAddr {
        format!("192.168.1.10:{port}").parse().unwrap()
    }

    #[test]
    fn observe_creates_then_touches() {
        let registry = PeerRegistry::new();
        assert!(registry.observe(&id("alice@192.168.1.10"), addr(50999)));
        assert!(!registry.observe(&id("alice@192.168.1.10"), addr(51000)));
        // Address follows the most recent frame.
        assert_eq!(
            registry.addr_of(&id("alice@192.168.1.10")),
            Some(addr(51000))
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn ip_change_is_a_new_peer() {
        let registry = PeerRegistry::new();
        registry.observe(&id("alice@192.168.1.10"), addr(50999));
        registry.observe(&id("alice@192.168.1.99"), "192.168.1.99:50999".parse().unwrap());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn profile_updates_fields() {
        let registry = PeerRegistry::new();
        let alice = id("alice@192.168.1.10");
        registry.observe(&alice, addr(50999));
        assert!(registry.apply_profile(&alice, "Alice", "coding", None));
        assert!(!registry.apply_profile(&alice, "Alice", "coding", None));
        let peer = registry.get(&alice).unwrap();
        assert_eq!(peer.display_name, "Alice");
        assert_eq!(peer.status, "coding");
    }

    #[test]
    fn sweep_flags_then_evicts() {
        let registry = PeerRegistry::new();
        let alice = id("alice@192.168.1.10");
        registry.observe(&alice, addr(50999));

        let now = Instant::now();
        let stale = Duration::from_secs(60);
        let evict = Duration::from_secs(300);

        // Young peer untouched.
        let outcome = registry.sweep_at(now, stale, evict);
        assert!(outcome.went_inactive.is_empty());
        assert!(outcome.evicted.is_empty());

        // Past stale: flagged but retained.
        let outcome = registry.sweep_at(now + Duration::from_secs(61), stale, evict);
        assert_eq!(outcome.went_inactive, vec![alice.clone()]);
        assert!(registry.contains(&alice));
        assert!(!registry.get(&alice).unwrap().active);

        // Past evict: removed.
        let outcome = registry.sweep_at(now + Duration::from_secs(301), stale, evict);
        assert_eq!(outcome.evicted, vec![alice.clone()]);
        assert!(!registry.contains(&alice));
    }

    #[test]
    fn observe_reactivates_inactive_peer() {
        let registry = PeerRegistry::new();
        let alice = id("alice@192.168.1.10");
        registry.observe(&alice, addr(50999));
        registry.mark_inactive(&alice);
        assert!(!registry.get(&alice).unwrap().active);

        registry.observe(&alice, addr(50999));
        assert!(registry.get(&alice).unwrap().active);
    }
}
