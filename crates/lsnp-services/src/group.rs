//! Group state — creator-authoritative membership, mirrored elsewhere.
//!
//! Only the creator mutates a group's member set; everyone else replaces
//! their mirror when a GROUP_UPDATE arrives, last-writer-wins by the
//! creator's timestamp. Group ids embed the creator's UserId so two peers
//! can never mint the same id, and so any snapshot claiming a creator the
//! id does not name is refused even on first sight.

use std::collections::HashSet;

use dashmap::DashMap;

use lsnp_core::UserId;

#[derive(Debug, Clone)]
pub struct GroupMessage {
    pub from: UserId,
    pub timestamp: u64,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct Group {
    pub group_id: String,
    pub name: String,
    pub creator: UserId,
    pub members: HashSet<UserId>,
    /// Creator timestamp of the membership snapshot we hold.
    pub updated_at: u64,
    pub messages: Vec<GroupMessage>,
}

/// Why a GROUP_UPDATE was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    /// Snapshot older than what we hold — kept ours.
    Stale,
    /// Same group id claimed by a different creator — dropped.
    CreatorMismatch,
}

#[derive(Default)]
pub struct GroupTable {
    groups: DashMap<String, Group>,
}

impl GroupTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a group id that embeds the creator, collision-free by
    /// construction: `<suffix>.<creator user id>`.
    pub fn make_group_id(creator: &UserId, suffix: &str) -> String {
        format!("{suffix}.{creator}")
    }

    /// The creator a group id names. The suffix never contains a dot, so
    /// everything past the first one is the creator's UserId; an id that
    /// does not parse this way names nobody.
    pub fn embedded_creator(group_id: &str) -> Option<UserId> {
        let (_, creator) = group_id.split_once('.')?;
        creator.parse().ok()
    }

    /// Create a group we own. The creator is always a member.
    pub fn create(
        &self,
        group_id: String,
        name: String,
        creator: UserId,
        mut members: HashSet<UserId>,
        timestamp: u64,
    ) -> Group {
        members.insert(creator.clone());
        let group = Group {
            group_id: group_id.clone(),
            name,
            creator,
            members,
            updated_at: timestamp,
            messages: Vec::new(),
        };
        self.groups.insert(group_id, group.clone());
        group
    }

    /// Mirror a creator's membership snapshot.
    pub fn apply_update(
        &self,
        group_id: &str,
        name: &str,
        creator: &UserId,
        members: HashSet<UserId>,
        timestamp: u64,
    ) -> UpdateOutcome {
        match self.groups.get_mut(group_id) {
            Some(mut group) => {
                if group.creator != *creator {
                    return UpdateOutcome::CreatorMismatch;
                }
                if timestamp < group.updated_at {
                    return UpdateOutcome::Stale;
                }
                group.name = name.to_string();
                group.members = members;
                group.updated_at = timestamp;
                UpdateOutcome::Applied
            }
            None => {
                // First sight of this id: the id itself names the only
                // creator allowed to introduce it. Anyone else racing the
                // real creator's broadcast is refused here, not mirrored.
                if Self::embedded_creator(group_id).as_ref() != Some(creator) {
                    return UpdateOutcome::CreatorMismatch;
                }
                self.groups.insert(
                    group_id.to_string(),
                    Group {
                        group_id: group_id.to_string(),
                        name: name.to_string(),
                        creator: creator.clone(),
                        members,
                        updated_at: timestamp,
                        messages: Vec::new(),
                    },
                );
                UpdateOutcome::Applied
            }
        }
    }

    pub fn record_message(&self, group_id: &str, from: UserId, timestamp: u64, text: &str) -> bool {
        match self.groups.get_mut(group_id) {
            Some(mut group) => {
                group.messages.push(GroupMessage {
                    from,
                    timestamp,
                    text: text.to_string(),
                });
                true
            }
            None => false,
        }
    }

    pub fn get(&self, group_id: &str) -> Option<Group> {
        self.groups.get(group_id).map(|g| g.clone())
    }

    /// Member set snapshot for fan-out, minus the caller.
    pub fn fanout_members(&self, group_id: &str, exclude: &UserId) -> Vec<UserId> {
        self.groups
            .get(group_id)
            .map(|g| {
                g.members
                    .iter()
                    .filter(|m| *m != exclude)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_member(&self, group_id: &str, user: &UserId) -> bool {
        self.groups
            .get(group_id)
            .map(|g| g.members.contains(user))
            .unwrap_or(false)
    }

    pub fn groups_of(&self, user: &UserId) -> Vec<Group> {
        self.groups
            .iter()
            .filter(|e| e.value().members.contains(user))
            .map(|e| e.value().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> UserId {
        s.parse().unwrap()
    }

    fn members(ids: &[&str]) -> HashSet<UserId> {
        ids.iter().map(|s| id(s)).collect()
    }

    #[test]
    fn group_id_embeds_creator() {
        let creator = id("alice@192.168.1.10");
        let gid = GroupTable::make_group_id(&creator, "ab12cd34");
        assert_eq!(gid, "ab12cd34.alice@192.168.1.10");
    }

    #[test]
    fn creator_is_always_a_member() {
        let table = GroupTable::new();
        let creator = id("alice@192.168.1.10");
        let group = table.create(
            "g.alice@192.168.1.10".into(),
            "lan party".into(),
            creator.clone(),
            members(&["bob@192.168.1.11"]),
            100,
        );
        assert!(group.members.contains(&creator));
        assert_eq!(group.members.len(), 2);
    }

    #[test]
    fn update_last_writer_wins_by_creator_timestamp() {
        let table = GroupTable::new();
        let creator = id("alice@192.168.1.10");
        let gid = "g.alice@192.168.1.10";

        assert_eq!(
            table.apply_update(gid, "party", &creator, members(&["bob@192.168.1.11"]), 100),
            UpdateOutcome::Applied
        );
        // Older snapshot arriving late is ignored.
        assert_eq!(
            table.apply_update(gid, "party", &creator, members(&[]), 50),
            UpdateOutcome::Stale
        );
        assert_eq!(table.get(gid).unwrap().members.len(), 1);

        // Newer snapshot replaces wholesale.
        assert_eq!(
            table.apply_update(
                gid,
                "party",
                &creator,
                members(&["carol@192.168.1.12"]),
                200
            ),
            UpdateOutcome::Applied
        );
        let group = table.get(gid).unwrap();
        assert!(group.members.contains(&id("carol@192.168.1.12")));
        assert!(!group.members.contains(&id("bob@192.168.1.11")));
    }

    #[test]
    fn embedded_creator_reads_back_from_the_id() {
        let alice = id("alice@192.168.1.10");
        let gid = GroupTable::make_group_id(&alice, "ab12cd34");
        assert_eq!(GroupTable::embedded_creator(&gid), Some(alice));
        assert_eq!(GroupTable::embedded_creator("no-creator-here"), None);
        assert_eq!(GroupTable::embedded_creator("x.not-a-user-id"), None);
    }

    #[test]
    fn first_sight_refuses_a_creator_the_id_does_not_name() {
        let table = GroupTable::new();
        let alice = id("alice@192.168.1.10");
        let mallory = id("mallory@10.0.0.9");
        let gid = GroupTable::make_group_id(&alice, "ab12cd34");

        // Mallory races Alice's broadcast, claiming Alice's group id.
        assert_eq!(
            table.apply_update(&gid, "party", &mallory, members(&[]), 1),
            UpdateOutcome::CreatorMismatch
        );
        assert!(table.get(&gid).is_none());

        // The true creator's snapshot still lands afterwards.
        assert_eq!(
            table.apply_update(&gid, "party", &alice, members(&["bob@192.168.1.11"]), 2),
            UpdateOutcome::Applied
        );
        assert_eq!(table.get(&gid).unwrap().creator, alice);
    }

    #[test]
    fn foreign_creator_cannot_hijack() {
        let table = GroupTable::new();
        let alice = id("alice@192.168.1.10");
        let mallory = id("mallory@192.168.1.66");
        let gid = "g.alice@192.168.1.10";

        table.apply_update(gid, "party", &alice, members(&["bob@192.168.1.11"]), 100);
        assert_eq!(
            table.apply_update(gid, "party", &mallory, members(&[]), 999),
            UpdateOutcome::CreatorMismatch
        );
        assert_eq!(table.get(gid).unwrap().creator, alice);
    }

    #[test]
    fn fanout_excludes_self() {
        let table = GroupTable::new();
        let alice = id("alice@192.168.1.10");
        table.create(
            "g.alice@192.168.1.10".into(),
            "party".into(),
            alice.clone(),
            members(&["bob@192.168.1.11", "carol@192.168.1.12"]),
            100,
        );
        let fanout = table.fanout_members("g.alice@192.168.1.10", &alice);
        assert_eq!(fanout.len(), 2);
        assert!(!fanout.contains(&alice));
    }
}
