//! Messaging state — per-peer conversations, the post timeline, likes,
//! and the follow list.
//!
//! Outbound entries move `pending → acked | failed` as the transport's
//! delivery future resolves; the UI mirrors the transition via
//! `dm_delivery_changed`.

use std::collections::HashSet;
use std::sync::Mutex;

use dashmap::DashMap;

use lsnp_core::UserId;

/// Delivery lifecycle of an outbound reliable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Acked,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// One line of a DM conversation.
#[derive(Debug, Clone)]
pub struct ConversationEntry {
    pub message_id: String,
    pub direction: Direction,
    pub timestamp: u64,
    pub text: String,
    /// Meaningful for outbound entries only; inbound are born `Acked`.
    pub delivery: DeliveryState,
}

/// A broadcast post as seen on the timeline.
#[derive(Debug, Clone)]
pub struct Post {
    pub post_id: String,
    pub author: UserId,
    pub timestamp: u64,
    pub text: String,
    pub likes: HashSet<UserId>,
}

#[derive(Default)]
pub struct MessagingStore {
    conversations: DashMap<UserId, Vec<ConversationEntry>>,
    // Ordered feed; scan-by-id is fine at timeline sizes.
    posts: Mutex<Vec<Post>>,
    following: Mutex<HashSet<UserId>>,
}

impl MessagingStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Conversations ─────────────────────────────────────────────────────────

    pub fn record_outbound(&self, peer: &UserId, message_id: &str, timestamp: u64, text: &str) {
        self.conversations
            .entry(peer.clone())
            .or_default()
            .push(ConversationEntry {
                message_id: message_id.to_string(),
                direction: Direction::Outbound,
                timestamp,
                text: text.to_string(),
                delivery: DeliveryState::Pending,
            });
    }

    pub fn record_inbound(&self, peer: &UserId, message_id: &str, timestamp: u64, text: &str) {
        self.conversations
            .entry(peer.clone())
            .or_default()
            .push(ConversationEntry {
                message_id: message_id.to_string(),
                direction: Direction::Inbound,
                timestamp,
                text: text.to_string(),
                delivery: DeliveryState::Acked,
            });
    }

    /// Resolve an outbound entry's delivery state. Returns false when the
    /// message id is not in the conversation (already evicted, or never ours).
    pub fn set_delivery(&self, peer: &UserId, message_id: &str, state: DeliveryState) -> bool {
        match self.conversations.get_mut(peer) {
            Some(mut entries) => {
                for entry in entries.iter_mut().rev() {
                    if entry.message_id == message_id
                        && entry.direction == Direction::Outbound
                    {
                        entry.delivery = state;
                        return true;
                    }
                }
                false
            }
            None => false,
        }
    }

    pub fn conversation(&self, peer: &UserId) -> Vec<ConversationEntry> {
        self.conversations
            .get(peer)
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    // ── Posts & likes ─────────────────────────────────────────────────────────

    /// Append a post if its id is unseen. Returns true when appended.
    pub fn add_post(&self, post: Post) -> bool {
        let mut posts = self.posts.lock().expect("post feed lock poisoned");
        if posts.iter().any(|p| p.post_id == post.post_id) {
            return false;
        }
        posts.push(post);
        true
    }

    /// Apply a like or unlike. Returns false when the post is unknown —
    /// the caller drops the frame silently in that case.
    pub fn apply_like(&self, post_id: &str, from: &UserId, liked: bool) -> bool {
        let mut posts = self.posts.lock().expect("post feed lock poisoned");
        match posts.iter_mut().find(|p| p.post_id == post_id) {
            Some(post) => {
                if liked {
                    post.likes.insert(from.clone());
                } else {
                    post.likes.remove(from);
                }
                true
            }
            None => false,
        }
    }

    pub fn posts(&self) -> Vec<Post> {
        self.posts.lock().expect("post feed lock poisoned").clone()
    }

    /// Timeline restricted to followed authors (own posts always shown).
    pub fn followed_posts(&self, me: &UserId) -> Vec<Post> {
        let following = self.following.lock().expect("follow lock poisoned");
        self.posts
            .lock()
            .expect("post feed lock poisoned")
            .iter()
            .filter(|p| p.author == *me || following.contains(&p.author))
            .cloned()
            .collect()
    }

    // ── Following ─────────────────────────────────────────────────────────────

    pub fn follow(&self, peer: UserId) -> bool {
        self.following
            .lock()
            .expect("follow lock poisoned")
            .insert(peer)
    }

    pub fn unfollow(&self, peer: &UserId) -> bool {
        self.following
            .lock()
            .expect("follow lock poisoned")
            .remove(peer)
    }

    pub fn is_following(&self, peer: &UserId) -> bool {
        self.following
            .lock()
            .expect("follow lock poisoned")
            .contains(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> UserId {
        "alice@192.168.1.10".parse().unwrap()
    }

    fn bob() -> UserId {
        "bob@192.168.1.11".parse().unwrap()
    }

    #[test]
    fn outbound_delivery_transitions() {
        let store = MessagingStore::new();
        store.record_outbound(&bob(), "m1", 100, "hello");
        assert!(store.set_delivery(&bob(), "m1", DeliveryState::Acked));

        let convo = store.conversation(&bob());
        assert_eq!(convo.len(), 1);
        assert_eq!(convo[0].delivery, DeliveryState::Acked);

        // Unknown id resolves nothing.
        assert!(!store.set_delivery(&bob(), "zz", DeliveryState::Failed));
    }

    #[test]
    fn inbound_does_not_match_delivery_updates() {
        let store = MessagingStore::new();
        store.record_inbound(&bob(), "m1", 100, "hi");
        assert!(!store.set_delivery(&bob(), "m1", DeliveryState::Failed));
    }

    #[test]
    fn posts_dedup_by_id() {
        let store = MessagingStore::new();
        let post = Post {
            post_id: "p1".into(),
            author: alice(),
            timestamp: 100,
            text: "first".into(),
            likes: HashSet::new(),
        };
        assert!(store.add_post(post.clone()));
        assert!(!store.add_post(post));
        assert_eq!(store.posts().len(), 1);
    }

    #[test]
    fn likes_are_a_set() {
        let store = MessagingStore::new();
        store.add_post(Post {
            post_id: "p1".into(),
            author: alice(),
            timestamp: 100,
            text: "first".into(),
            likes: HashSet::new(),
        });

        assert!(store.apply_like("p1", &bob(), true));
        assert!(store.apply_like("p1", &bob(), true));
        assert_eq!(store.posts()[0].likes.len(), 1);

        assert!(store.apply_like("p1", &bob(), false));
        assert!(store.posts()[0].likes.is_empty());

        // Like for a post we never saw: rejected, caller drops silently.
        assert!(!store.apply_like("p9", &bob(), true));
    }

    #[test]
    fn followed_timeline_filters() {
        let store = MessagingStore::new();
        let me = bob();
        store.add_post(Post {
            post_id: "p1".into(),
            author: alice(),
            timestamp: 100,
            text: "from alice".into(),
            likes: HashSet::new(),
        });
        store.add_post(Post {
            post_id: "p2".into(),
            author: "carol@192.168.1.12".parse().unwrap(),
            timestamp: 101,
            text: "from carol".into(),
            likes: HashSet::new(),
        });

        assert!(store.followed_posts(&me).is_empty());
        store.follow(alice());
        let filtered = store.followed_posts(&me);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].post_id, "p1");
    }
}
