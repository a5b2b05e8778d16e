use std::{collections::HashMap, sync::Arc};

use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::{
    db::{Member, Room, RoomSummary},
    events::ServerEvent,
    session::{ConnectionId, Roster},
};

/// Who an outbound event is meant for. Resolved to concrete connections at
/// publish time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    All,
    Room(String),
    Identity(String),
    Connection(Uuid),
}

#[derive(Debug, Clone)]
pub struct Envelope {
    pub audience: Audience,
    /// The connections the audience covered when the event was published.
    pub recipients: Arc<[ConnectionId]>,
    pub event: ServerEvent,
}

impl Envelope {
    pub fn is_for(&self, connection_id: ConnectionId) -> bool {
        self.recipients.contains(&connection_id)
    }
}

pub struct PresenceNotifier {
    tx: broadcast::Sender<Envelope>,
    roster: Arc<Roster>,
}

impl PresenceNotifier {
    pub fn new(capacity: usize) -> Self {
        Self { tx: broadcast::channel(capacity.max(1)).0, roster: Arc::default() }
    }

    pub fn roster(&self) -> Arc<Roster> {
        self.roster.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    pub fn publish(&self, audience: Audience, event: ServerEvent) {
        let recipients: Arc<[ConnectionId]> = self.roster.resolve(&audience).into();
        let targeted = recipients.len();
        // no subscribers just means nobody is connected
        let receivers = self.tx.send(Envelope { audience, recipients, event }).unwrap_or(0);
        debug!(targeted, receivers, "envelope published");
    }

    /// One entry per identity, last write winning, ordered by join time.
    pub fn membership_view(room: &Room) -> Vec<Member> {
        let mut latest: HashMap<&str, &Member> = HashMap::new();
        for member in &room.members {
            latest.insert(member.identity.as_str(), member);
        }

        let mut view: Vec<Member> = latest.into_values().cloned().collect();
        view.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then_with(|| a.identity.cmp(&b.identity)));
        view
    }

    pub fn publish_members(&self, room: &str, users: Vec<Member>) {
        self.publish(
            Audience::Room(room.to_owned()),
            ServerEvent::RoomUsers { room: room.to_owned(), users },
        );
    }

    fn system(&self, audience: Audience, room: Option<&str>, text: String) {
        self.publish(audience, ServerEvent::SystemMessage { room: room.map(str::to_owned), text });
    }

    pub fn announce_join(&self, room: &str, identity: &str) {
        self.system(Audience::Room(room.to_owned()), Some(room), format!("{identity} has joined the room"));
    }

    pub fn announce_leave(&self, room: &str, identity: &str) {
        self.system(Audience::Room(room.to_owned()), Some(room), format!("{identity} has left the room"));
    }

    pub fn announce_disconnect(&self, room: &str, identity: &str) {
        self.system(Audience::Room(room.to_owned()), Some(room), format!("{identity} disconnected"));
    }

    pub fn announce_rename(&self, old: &str, new: &str) {
        self.system(Audience::All, None, format!("{old} is now known as {new}"));
    }

    pub fn announce_room_deleted(&self, room: &str) {
        self.system(Audience::Room(room.to_owned()), Some(room), format!("room {room} was deleted"));
    }

    pub fn broadcast_room_list(&self, rooms: Vec<RoomSummary>) {
        self.publish(Audience::All, ServerEvent::AvailableRooms { rooms });
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::{
        db::{now, SqliteStore},
        rooms::RoomRegistry,
        session::SessionManager,
    };

    fn member(identity: &str, joined_at: chrono::DateTime<chrono::Utc>) -> Member {
        Member { identity: identity.to_owned(), joined_at }
    }

    #[test]
    fn duplicate_members_collapse_to_the_last_entry() {
        let t0 = now();
        let room = Room {
            name: "lobby".into(),
            creator: "alice".into(),
            created_at: t0,
            members: vec![
                member("alice", t0),
                member("bob", t0 + Duration::seconds(1)),
                member("bob", t0 + Duration::seconds(3)),
                member("carol", t0 + Duration::seconds(2)),
            ],
        };

        let view = PresenceNotifier::membership_view(&room);
        let names: Vec<&str> = view.iter().map(|m| m.identity.as_str()).collect();
        assert_eq!(names, ["alice", "carol", "bob"]);
        assert_eq!(view[2].joined_at, t0 + Duration::seconds(3));
    }

    #[tokio::test]
    async fn announcements_are_scoped() {
        let notifier = PresenceNotifier::new(16);
        let mut rx = notifier.subscribe();

        notifier.announce_join("lobby", "bob");
        notifier.announce_rename("bob", "bobby");

        let join = rx.recv().await.unwrap();
        assert_eq!(join.audience, Audience::Room("lobby".into()));
        assert_eq!(
            join.event,
            ServerEvent::SystemMessage { room: Some("lobby".into()), text: "bob has joined the room".into() }
        );

        let rename = rx.recv().await.unwrap();
        assert_eq!(rename.audience, Audience::All);
    }

    #[tokio::test]
    async fn recipients_are_fixed_at_publish_time() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let notifier = Arc::new(PresenceNotifier::new(16));
        let sessions = SessionManager::new(Arc::new(RoomRegistry::new(store)), notifier.clone());
        let mut rx = notifier.subscribe();
        let bob = Uuid::now_v7();
        sessions.open(bob, "bob").unwrap();
        sessions.bind_room(bob, "lobby");

        notifier.announce_room_deleted("lobby");
        sessions.unbind_room_everywhere("lobby");
        notifier.announce_leave("lobby", "ghost");

        assert!(rx.recv().await.unwrap().is_for(bob));
        assert!(!rx.recv().await.unwrap().is_for(bob));
    }

    #[test]
    fn publishing_without_listeners_is_fine() {
        PresenceNotifier::new(4).announce_leave("lobby", "bob");
    }
}
