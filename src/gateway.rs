//! Entry point for inbound client events. Each event resolves the calling
//! session, mutates rooms or routes content, and publishes the resulting
//! notifications.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{error, warn};

use crate::{
    db::{DirectMessage, Member, RoomMessage, RoomSummary, Store},
    error::ErrorBody,
    events::{ClientEvent, ClientRequest, ServerEvent},
    rooms::{normalize_room_name, Audience, DirectSent, JoinPolicy, MessageRouter, PresenceNotifier, RoomRegistry},
    session::{ConnectionId, Renamed, Session, SessionManager},
    ChatError, ChatResult,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JoinReply {
    pub room: RoomSummary,
    pub messages: Vec<RoomMessage>,
    pub users: Vec<Member>,
}

pub struct Gateway {
    pub registry: Arc<RoomRegistry>,
    pub sessions: Arc<SessionManager>,
    pub router: Arc<MessageRouter>,
    pub presence: Arc<PresenceNotifier>,
    join_policy: JoinPolicy,
}

impl Gateway {
    pub fn new(store: Arc<dyn Store>, join_policy: JoinPolicy, broadcast_capacity: usize) -> Self {
        let registry = Arc::new(RoomRegistry::new(store.clone()));
        let presence = Arc::new(PresenceNotifier::new(broadcast_capacity));
        let sessions = Arc::new(SessionManager::new(registry.clone(), presence.clone()));
        let router = Arc::new(MessageRouter::new(store, registry.clone(), sessions.clone(), presence.clone()));

        Self { registry, sessions, router, presence, join_policy }
    }

    /// Opens the session and hands the caller the current room list.
    pub async fn connect(&self, connection_id: ConnectionId, identity: &str) -> ChatResult<Session> {
        let session = self.sessions.open(connection_id, identity)?;

        match self.registry.list_rooms().await {
            Ok(rooms) => self.presence.publish(Audience::Connection(connection_id), ServerEvent::AvailableRooms { rooms }),
            Err(err) => warn!(%connection_id, error = %err, "could not send room list on connect"),
        }
        Ok(session)
    }

    pub fn disconnect(&self, connection_id: ConnectionId) -> Option<Session> {
        self.sessions.close(connection_id)
    }

    /// Runs one request and builds the reply for the caller. Failures stay
    /// with the caller; only successful effects are broadcast.
    pub async fn handle(&self, connection_id: ConnectionId, request: ClientRequest) -> ServerEvent {
        let id = request.id;
        match request.event {
            ClientEvent::CreateRoom { room } => reply(id, self.create_room(connection_id, &room).await),
            ClientEvent::JoinRoom { room } => reply(id, self.join_room(connection_id, &room).await),
            ClientEvent::QuitRoom { room } => reply(id, self.quit_room(connection_id, &room).await),
            ClientEvent::DeleteRoom { room } => reply(id, self.delete_room(connection_id, &room).await),
            ClientEvent::RoomMessage { room, content, timestamp } => {
                reply(id, self.room_message(connection_id, &room, &content, timestamp).await)
            }
            ClientEvent::PrivateMessage { to, content } => reply(id, self.private_message(connection_id, &to, &content).await),
            ClientEvent::GetRoomMessages { room } => match self.router.room_history(&room).await {
                // a missing room still reads as an empty log
                Err(err @ ChatError::NotFound(_)) => ServerEvent::Reply {
                    id,
                    ok: false,
                    data: Some(Value::Array(Vec::new())),
                    error: Some(err.body()),
                },
                result => reply(id, result),
            },
            ClientEvent::ChatMessage { content } => reply(id, self.router.send_global_message(connection_id, &content).await),
            ClientEvent::GetChatMessages => reply(id, self.router.global_history().await),
            ClientEvent::GetPrivateMessages { with } => reply(id, self.private_messages(connection_id, &with).await),
            ClientEvent::ListConversations => reply(id, self.conversations(connection_id).await),
            ClientEvent::GetRoomUsers { room } => reply(id, self.room_users(&room).await),
            ClientEvent::ListRooms => reply(id, self.registry.list_rooms().await),
            ClientEvent::ChangeUsername { username } => reply(id, self.change_username(connection_id, &username).await),
        }
    }

    pub async fn create_room(&self, connection_id: ConnectionId, name: &str) -> ChatResult<RoomSummary> {
        let session = self.sessions.require(connection_id)?;
        let room = self.registry.create_room(name, &session.identity).await?;
        self.broadcast_room_list().await;
        Ok(room.summary())
    }

    /// Joins (or, per policy, creates) a room and binds the connection to it.
    /// Joining the room the connection is already bound to is not announced again.
    pub async fn join_room(&self, connection_id: ConnectionId, name: &str) -> ChatResult<JoinReply> {
        let session = self.sessions.require(connection_id)?;
        let name = normalize_room_name(name)?;

        let joined = self.registry.join_room(&name, &session.identity, self.join_policy).await?;

        let first_bind = session.active_room.as_deref() != Some(name.as_str());
        if first_bind {
            self.sessions.bind_room(connection_id, &name);
        }

        let messages = self.router.room_history(&name).await?;
        let users = PresenceNotifier::membership_view(&joined.room);

        self.presence.publish_members(&name, users.clone());
        if first_bind {
            self.presence.announce_join(&name, &session.identity);
        }
        if joined.created {
            self.broadcast_room_list().await;
        }

        Ok(JoinReply { room: joined.room.summary(), messages, users })
    }

    pub async fn quit_room(&self, connection_id: ConnectionId, name: &str) -> ChatResult<String> {
        let session = self.sessions.require(connection_id)?;
        let name = normalize_room_name(name)?;

        let left = self.registry.leave_room(&name, &session.identity).await?;

        if left {
            // announced before unbinding so the leaver sees it too
            self.presence.announce_leave(&name, &session.identity);
        }
        self.sessions.unbind_room(connection_id, &name);

        if left {
            match self.registry.find_room(&name).await {
                Ok(room) => self.presence.publish_members(&name, PresenceNotifier::membership_view(&room)),
                Err(err) => warn!(room = %name, error = %err, "no member refresh after quit"),
            }
        }
        Ok(name)
    }

    pub async fn delete_room(&self, connection_id: ConnectionId, name: &str) -> ChatResult<String> {
        let session = self.sessions.require(connection_id)?;
        let name = normalize_room_name(name)?;

        self.registry.delete_room(&name, &session.identity).await?;

        self.presence.announce_room_deleted(&name);
        self.sessions.unbind_room_everywhere(&name);
        self.broadcast_room_list().await;
        Ok(name)
    }

    pub async fn room_message(
        &self,
        connection_id: ConnectionId,
        room: &str,
        content: &str,
        timestamp: Option<DateTime<Utc>>,
    ) -> ChatResult<RoomMessage> {
        self.router.send_room_message(connection_id, room, content, timestamp).await
    }

    pub async fn private_message(&self, connection_id: ConnectionId, to: &str, content: &str) -> ChatResult<DirectSent> {
        self.router.send_direct_message(connection_id, to, content).await
    }

    pub async fn private_messages(&self, connection_id: ConnectionId, with: &str) -> ChatResult<Vec<DirectMessage>> {
        let session = self.sessions.require(connection_id)?;
        self.router.direct_history(&session.identity, with.trim()).await
    }

    pub async fn conversations(&self, connection_id: ConnectionId) -> ChatResult<Vec<String>> {
        let session = self.sessions.require(connection_id)?;
        self.router.conversations_for(&session.identity).await
    }

    pub async fn room_users(&self, name: &str) -> ChatResult<Vec<Member>> {
        let room = self.registry.find_room(name).await?;
        Ok(PresenceNotifier::membership_view(&room))
    }

    pub async fn change_username(&self, connection_id: ConnectionId, username: &str) -> ChatResult<Renamed> {
        self.sessions.rename(connection_id, username).await
    }

    /// The triggering operation already succeeded, so a failed listing is only logged.
    async fn broadcast_room_list(&self) {
        match self.registry.list_rooms().await {
            Ok(rooms) => self.presence.broadcast_room_list(rooms),
            Err(err) => error!(error = %err, "could not broadcast room list"),
        }
    }
}

fn reply<T: Serialize>(id: Option<u64>, result: ChatResult<T>) -> ServerEvent {
    let err = match result.map(serde_json::to_value) {
        Ok(Ok(data)) => return ServerEvent::Reply { id, ok: true, data: Some(data), error: None },
        Ok(Err(err)) => {
            error!(error = %err, "could not encode reply");
            ErrorBody { kind: "internal", message: err.to_string(), retryable: false }
        }
        Err(err) => err.body(),
    };
    ServerEvent::Reply { id, ok: false, data: None, error: Some(err) }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use tokio::sync::broadcast;
    use uuid::Uuid;

    use super::*;
    use crate::{
        db::{GlobalMessage, Room, SqliteStore},
        rooms::Envelope,
    };

    /// Delegates to an in-memory store until told to fail message appends.
    struct FlakyStore {
        inner: SqliteStore,
        fail_appends: AtomicBool,
    }

    #[async_trait]
    impl Store for FlakyStore {
        async fn insert_room(&self, room: &Room) -> ChatResult<()> {
            self.inner.insert_room(room).await
        }
        async fn find_room_by_name(&self, name: &str) -> ChatResult<Option<Room>> {
            self.inner.find_room_by_name(name).await
        }
        async fn update_room_members(&self, name: &str, members: &[Member]) -> ChatResult<()> {
            self.inner.update_room_members(name, members).await
        }
        async fn append_room_message(&self, room: &str, message: &RoomMessage) -> ChatResult<()> {
            if self.fail_appends.load(Ordering::SeqCst) {
                return Err(ChatError::StoreUnavailable("append_room_message timed out".into()));
            }
            self.inner.append_room_message(room, message).await
        }
        async fn room_messages(&self, room: &str) -> ChatResult<Vec<RoomMessage>> {
            self.inner.room_messages(room).await
        }
        async fn delete_room(&self, name: &str) -> ChatResult<bool> {
            self.inner.delete_room(name).await
        }
        async fn list_rooms(&self) -> ChatResult<Vec<RoomSummary>> {
            self.inner.list_rooms().await
        }
        async fn rooms_with_identity(&self, identity: &str) -> ChatResult<Vec<String>> {
            self.inner.rooms_with_identity(identity).await
        }
        async fn rename_identity_in_room(&self, room: &str, old: &str, new: &str) -> ChatResult<()> {
            self.inner.rename_identity_in_room(room, old, new).await
        }
        async fn insert_direct_message(&self, message: &DirectMessage) -> ChatResult<()> {
            self.inner.insert_direct_message(message).await
        }
        async fn find_direct_messages(&self, a: &str, b: &str) -> ChatResult<Vec<DirectMessage>> {
            self.inner.find_direct_messages(a, b).await
        }
        async fn distinct_counterparts(&self, identity: &str) -> ChatResult<Vec<String>> {
            self.inner.distinct_counterparts(identity).await
        }
        async fn append_global_message(&self, message: &GlobalMessage) -> ChatResult<()> {
            self.inner.append_global_message(message).await
        }
        async fn global_messages(&self) -> ChatResult<Vec<GlobalMessage>> {
            self.inner.global_messages().await
        }
    }

    async fn gateway() -> Gateway {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        Gateway::new(store, JoinPolicy::CreateIfMissing, 256)
    }

    async fn connect(gateway: &Gateway, identity: &str) -> ConnectionId {
        let id = Uuid::now_v7();
        gateway.connect(id, identity).await.unwrap();
        id
    }

    fn drain(rx: &mut broadcast::Receiver<Envelope>) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            out.push(envelope);
        }
        out
    }

    fn joins(envelopes: &[Envelope]) -> usize {
        envelopes
            .iter()
            .filter(|e| matches!(&e.event, ServerEvent::SystemMessage { text, .. } if text.ends_with("has joined the room")))
            .count()
    }

    #[tokio::test]
    async fn rejoining_the_bound_room_is_not_announced() {
        let gateway = gateway().await;
        let alice = connect(&gateway, "alice").await;
        let mut rx = gateway.presence.subscribe();

        gateway.join_room(alice, "lobby").await.unwrap();
        gateway.join_room(alice, "Lobby").await.unwrap();

        assert_eq!(joins(&drain(&mut rx)), 1);
    }

    #[tokio::test]
    async fn joining_elsewhere_keeps_the_old_membership() {
        let gateway = gateway().await;
        let alice = connect(&gateway, "alice").await;

        gateway.join_room(alice, "lobby").await.unwrap();
        gateway.join_room(alice, "games").await.unwrap();

        assert!(gateway.sessions.is_bound(alice, "games"));
        assert!(gateway.registry.find_room("lobby").await.unwrap().has_member("alice"));

        let err = gateway.room_message(alice, "lobby", "hi", None).await.unwrap_err();
        assert_eq!(err, ChatError::NotInRoom("lobby".into()));
    }

    #[tokio::test]
    async fn join_reply_carries_history_and_users() {
        let gateway = gateway().await;
        let alice = connect(&gateway, "alice").await;
        let bob = connect(&gateway, "bob").await;

        gateway.join_room(alice, "lobby").await.unwrap();
        gateway.room_message(alice, "lobby", "hi", None).await.unwrap();

        let joined = gateway.join_room(bob, "lobby").await.unwrap();
        assert_eq!(joined.room.creator, "alice");
        assert_eq!(joined.messages.len(), 1);
        let users: Vec<&str> = joined.users.iter().map(|u| u.identity.as_str()).collect();
        assert_eq!(users, ["alice", "bob"]);
    }

    #[tokio::test]
    async fn quit_unbinds_and_announces() {
        let gateway = gateway().await;
        let bob = connect(&gateway, "bob").await;
        gateway.join_room(bob, "lobby").await.unwrap();
        let mut rx = gateway.presence.subscribe();

        gateway.quit_room(bob, "lobby").await.unwrap();

        assert!(!gateway.sessions.is_bound(bob, "lobby"));
        assert!(gateway.room_users("lobby").await.unwrap().is_empty());
        let envelopes = drain(&mut rx);
        assert_eq!(
            envelopes[0].event,
            ServerEvent::SystemMessage { room: Some("lobby".into()), text: "bob has left the room".into() }
        );
    }

    #[tokio::test]
    async fn failed_append_is_not_a_success() {
        let store = Arc::new(FlakyStore {
            inner: SqliteStore::in_memory().await.unwrap(),
            fail_appends: AtomicBool::new(false),
        });
        let gateway = Gateway::new(store.clone(), JoinPolicy::CreateIfMissing, 64);
        let alice = connect(&gateway, "alice").await;
        gateway.join_room(alice, "lobby").await.unwrap();
        let mut rx = gateway.presence.subscribe();

        store.fail_appends.store(true, Ordering::SeqCst);
        let request = ClientRequest {
            id: Some(3),
            event: ClientEvent::RoomMessage { room: "lobby".into(), content: "hi".into(), timestamp: None },
        };
        let ServerEvent::Reply { id, ok, error, .. } = gateway.handle(alice, request).await else {
            panic!("expected a reply");
        };
        assert_eq!(id, Some(3));
        assert!(!ok);
        let error = error.unwrap();
        assert_eq!(error.kind, "store_unavailable");
        assert!(error.retryable);

        assert!(drain(&mut rx).is_empty());
        assert!(gateway.router.room_history("lobby").await.unwrap().is_empty());

        store.fail_appends.store(false, Ordering::SeqCst);
        gateway.room_message(alice, "lobby", "hi", None).await.unwrap();
        assert_eq!(gateway.router.room_history("lobby").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn validation_errors_are_not_broadcast() {
        let gateway = gateway().await;
        let alice = connect(&gateway, "alice").await;
        let mut rx = gateway.presence.subscribe();

        let request = ClientRequest { id: None, event: ClientEvent::ChangeUsername { username: "alice".into() } };
        let ServerEvent::Reply { ok, error, .. } = gateway.handle(alice, request).await else {
            panic!("expected a reply");
        };
        assert!(!ok);
        assert_eq!(error.unwrap().kind, "invalid_identity");
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn strict_policy_needs_an_existing_room() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let gateway = Gateway::new(store, JoinPolicy::RequireExisting, 64);
        let alice = connect(&gateway, "alice").await;

        let err = gateway.join_room(alice, "lobby").await.unwrap_err();
        assert_eq!(err, ChatError::room_not_found("lobby"));
        assert_eq!(gateway.sessions.get(alice).unwrap().active_room, None);

        gateway.create_room(alice, "lobby").await.unwrap();
        gateway.join_room(alice, "lobby").await.unwrap();
    }

    #[tokio::test]
    async fn deleting_unbinds_everyone() {
        let gateway = gateway().await;
        let alice = connect(&gateway, "alice").await;
        let bob = connect(&gateway, "bob").await;
        gateway.join_room(alice, "lobby").await.unwrap();
        gateway.join_room(bob, "lobby").await.unwrap();

        gateway.delete_room(alice, "lobby").await.unwrap();

        assert!(!gateway.sessions.is_bound(bob, "lobby"));
        let err = gateway.room_message(bob, "lobby", "anyone?", None).await.unwrap_err();
        assert_eq!(err, ChatError::NotInRoom("lobby".into()));
    }

    fn system_texts(envelopes: &[Envelope]) -> Vec<(Option<String>, String)> {
        envelopes
            .iter()
            .filter_map(|e| match &e.event {
                ServerEvent::SystemMessage { room, text } => Some((room.clone(), text.clone())),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn quitting_without_membership_is_silent() {
        let gateway = gateway().await;
        let alice = connect(&gateway, "alice").await;
        let carol = connect(&gateway, "carol").await;
        gateway.join_room(alice, "lobby").await.unwrap();
        let mut rx = gateway.presence.subscribe();

        assert_eq!(gateway.quit_room(carol, "lobby").await.unwrap(), "lobby");
        assert_eq!(gateway.quit_room(carol, "nowhere").await.unwrap(), "nowhere");

        assert!(drain(&mut rx).is_empty());
        assert!(gateway.registry.find_room("lobby").await.unwrap().has_member("alice"));
    }

    #[tokio::test]
    async fn scoped_notices_reach_those_bound_at_publish() {
        let gateway = gateway().await;
        let alice = connect(&gateway, "alice").await;
        let bob = connect(&gateway, "bob").await;
        gateway.join_room(alice, "lobby").await.unwrap();
        gateway.join_room(bob, "lobby").await.unwrap();
        let mut rx = gateway.presence.subscribe();

        gateway.quit_room(bob, "lobby").await.unwrap();
        let left = drain(&mut rx);
        assert_eq!(system_texts(&left), [(Some("lobby".into()), "bob has left the room".into())]);
        assert!(left[0].is_for(bob) && left[0].is_for(alice));

        gateway.delete_room(alice, "lobby").await.unwrap();
        let deleted = drain(&mut rx);
        let notice = deleted
            .iter()
            .find(|e| matches!(&e.event, ServerEvent::SystemMessage { text, .. } if text == "room lobby was deleted"))
            .unwrap();
        assert!(notice.is_for(alice));
        assert!(!notice.is_for(bob));
    }

    #[tokio::test]
    async fn room_messages_follow_the_binding_at_acceptance() {
        let gateway = gateway().await;
        let alice = connect(&gateway, "alice").await;
        let bob = connect(&gateway, "bob").await;
        gateway.join_room(alice, "lobby").await.unwrap();
        gateway.join_room(bob, "lobby").await.unwrap();
        let mut rx = gateway.presence.subscribe();

        gateway.room_message(alice, "lobby", "before", None).await.unwrap();
        gateway.join_room(bob, "games").await.unwrap();
        gateway.room_message(alice, "lobby", "after", None).await.unwrap();

        let seen_by_bob: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter(|e| e.is_for(bob))
            .filter_map(|e| match e.event {
                ServerEvent::RoomMessage { message, .. } => Some(message.content),
                _ => None,
            })
            .collect();
        assert_eq!(seen_by_bob, ["before"]);
    }

    #[tokio::test]
    async fn missing_room_history_is_empty_and_not_found() {
        let gateway = gateway().await;
        let alice = connect(&gateway, "alice").await;

        let request = ClientRequest { id: Some(4), event: ClientEvent::GetRoomMessages { room: "void".into() } };
        let ServerEvent::Reply { ok, data, error, .. } = gateway.handle(alice, request).await else {
            panic!("expected a reply");
        };
        assert!(!ok);
        assert_eq!(data, Some(Value::Array(Vec::new())));
        assert_eq!(error.unwrap().kind, "not_found");
    }

    #[tokio::test]
    async fn chat_messages_are_stored_and_replayed() {
        let gateway = gateway().await;
        let alice = connect(&gateway, "alice").await;

        let request = ClientRequest { id: Some(1), event: ClientEvent::ChatMessage { content: "hello all".into() } };
        let ServerEvent::Reply { ok: true, .. } = gateway.handle(alice, request).await else {
            panic!("chat message refused");
        };

        let request = ClientRequest { id: Some(2), event: ClientEvent::GetChatMessages };
        let ServerEvent::Reply { data: Some(data), .. } = gateway.handle(alice, request).await else {
            panic!("no history");
        };
        assert_eq!(data[0]["author"], "alice");
        assert_eq!(data[0]["content"], "hello all");
    }
}
