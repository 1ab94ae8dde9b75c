// Channel presence set, including the post-attach sync protocol.
use std::collections::HashMap;

use beacon_wire::{PresenceAction, PresenceMessage};

/// Members currently present on a channel, keyed by member key.
///
/// After an attach with the presence flag set, the broker streams the
/// accumulated presence set in Sync frames; until the sync completes the
/// incoming set builds up beside the live one and replaces it at the end.
#[derive(Default)]
pub(crate) struct PresenceMap {
    members: HashMap<String, PresenceMessage>,
    syncing: Option<HashMap<String, PresenceMessage>>,
}

impl PresenceMap {
    pub fn start_sync(&mut self) {
        self.syncing = Some(HashMap::new());
    }

    pub fn in_sync(&self) -> bool {
        self.syncing.is_none()
    }

    pub fn end_sync(&mut self) {
        if let Some(synced) = self.syncing.take() {
            self.members = synced;
        }
    }

    /// Apply one presence message to the set.
    pub fn apply(&mut self, message: &PresenceMessage) {
        let key = message.member_key();
        match message.action {
            PresenceAction::Present => {
                // Present entries are the sync backlog when a sync is
                // running, live membership otherwise.
                match &mut self.syncing {
                    Some(synced) => {
                        synced.insert(key, message.clone());
                    }
                    None => {
                        self.members.insert(key, message.clone());
                    }
                }
            }
            PresenceAction::Enter | PresenceAction::Update => {
                if let Some(synced) = &mut self.syncing {
                    synced.insert(key.clone(), message.clone());
                }
                self.members.insert(key, message.clone());
            }
            PresenceAction::Leave | PresenceAction::Absent => {
                if let Some(synced) = &mut self.syncing {
                    synced.remove(&key);
                }
                self.members.remove(&key);
            }
        }
    }

    pub fn members(&self) -> Vec<PresenceMessage> {
        let mut members: Vec<_> = self.members.values().cloned().collect();
        members.sort_by(|a, b| a.member_key().cmp(&b.member_key()));
        members
    }

    pub fn clear(&mut self) {
        self.members.clear();
        self.syncing = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(action: PresenceAction, client: &str, connection: &str) -> PresenceMessage {
        let mut message = PresenceMessage::new(action, beacon_wire::Data::None);
        message.client_id = Some(client.into());
        message.connection_id = Some(connection.into());
        message
    }

    #[test]
    fn enter_and_leave_track_membership() {
        let mut map = PresenceMap::default();
        map.apply(&member(PresenceAction::Enter, "alice", "c1"));
        map.apply(&member(PresenceAction::Enter, "bob", "c2"));
        assert_eq!(map.members().len(), 2);

        map.apply(&member(PresenceAction::Leave, "alice", "c1"));
        let members = map.members();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].client_id.as_deref(), Some("bob"));
    }

    #[test]
    fn update_replaces_the_existing_entry() {
        let mut map = PresenceMap::default();
        map.apply(&member(PresenceAction::Enter, "alice", "c1"));
        let mut update = member(PresenceAction::Update, "alice", "c1");
        update.data = beacon_wire::Data::from("busy");
        map.apply(&update);
        let members = map.members();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].data.as_str(), Some("busy"));
    }

    #[test]
    fn sync_replaces_membership_when_it_completes() {
        let mut map = PresenceMap::default();
        map.apply(&member(PresenceAction::Enter, "stale", "c0"));

        map.start_sync();
        assert!(!map.in_sync());
        map.apply(&member(PresenceAction::Present, "alice", "c1"));
        map.apply(&member(PresenceAction::Present, "bob", "c2"));
        // Live joins during the sync land in both sets.
        map.apply(&member(PresenceAction::Enter, "carol", "c3"));
        map.end_sync();

        assert!(map.in_sync());
        let keys: Vec<_> = map
            .members()
            .into_iter()
            .map(|m| m.client_id.expect("client id"))
            .collect();
        assert_eq!(keys, vec!["alice", "bob", "carol"]);
    }

    #[test]
    fn leave_during_sync_removes_from_both_sets() {
        let mut map = PresenceMap::default();
        map.start_sync();
        map.apply(&member(PresenceAction::Present, "alice", "c1"));
        map.apply(&member(PresenceAction::Leave, "alice", "c1"));
        map.end_sync();
        assert!(map.members().is_empty());
    }
}
