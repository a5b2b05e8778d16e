use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::{
    db::{self, DirectMessage, GlobalMessage, RoomMessage, Store},
    events::ServerEvent,
    session::{ConnectionId, SessionManager},
    ChatError, ChatResult,
};

use super::{normalize_room_name, Audience, PresenceNotifier, RoomRegistry};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectSent {
    pub message: DirectMessage,
    /// False when the recipient was offline and will see it on their next query.
    pub delivered: bool,
}

/// Persists room and direct messages and fans them out to live connections.
pub struct MessageRouter {
    store: Arc<dyn Store>,
    registry: Arc<RoomRegistry>,
    sessions: Arc<SessionManager>,
    presence: Arc<PresenceNotifier>,
}

impl MessageRouter {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<RoomRegistry>,
        sessions: Arc<SessionManager>,
        presence: Arc<PresenceNotifier>,
    ) -> Self {
        Self { store, registry, sessions, presence }
    }

    /// Appends a message to the room log and fans it out to the room. The room
    /// lock is held across both so fan-out order is acceptance order.
    pub async fn send_room_message(
        &self,
        connection_id: ConnectionId,
        room: &str,
        content: &str,
        client_timestamp: Option<DateTime<Utc>>,
    ) -> ChatResult<RoomMessage> {
        let room = normalize_room_name(room)?;
        if content.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        if !self.sessions.is_bound(connection_id, &room) {
            return Err(ChatError::NotInRoom(room));
        }

        let _guard = self.registry.lock(&room).await;

        let author = self.sessions.require(connection_id)?.identity;
        let current = self
            .store
            .find_room_by_name(&room)
            .await?
            .ok_or_else(|| ChatError::room_not_found(&room))?;
        if !current.has_member(&author) {
            return Err(ChatError::NotInRoom(room));
        }

        let message = RoomMessage {
            author,
            content: content.to_owned(),
            timestamp: client_timestamp.map_or_else(db::now, |ts| db::from_millis(ts.timestamp_millis())),
        };
        self.store.append_room_message(&room, &message).await?;

        debug!(room = %room, author = %message.author, "room message accepted");
        self.presence.publish(
            Audience::Room(room.clone()),
            ServerEvent::RoomMessage { room, message: message.clone() },
        );
        Ok(message)
    }

    pub async fn send_direct_message(&self, connection_id: ConnectionId, to: &str, content: &str) -> ChatResult<DirectSent> {
        let from = self.sessions.require(connection_id)?.identity;
        let to = to.trim();
        if to.is_empty() {
            return Err(ChatError::InvalidIdentity("recipient cannot be blank".to_owned()));
        }
        if content.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let message = DirectMessage {
            from,
            to: to.to_owned(),
            content: content.to_owned(),
            timestamp: db::now(),
        };
        self.store.insert_direct_message(&message).await?;

        let delivered = self.sessions.is_online(to);
        if delivered {
            self.presence.publish(
                Audience::Identity(to.to_owned()),
                ServerEvent::PrivateMessage { message: message.clone() },
            );
        }

        info!(from = %message.from, to, delivered, "direct message stored");
        Ok(DirectSent { message, delivered })
    }

    /// Stores a lobby-wide message and sends it to every connection.
    pub async fn send_global_message(&self, connection_id: ConnectionId, content: &str) -> ChatResult<GlobalMessage> {
        let author = self.sessions.require(connection_id)?.identity;
        if content.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let message = GlobalMessage { author, content: content.to_owned(), timestamp: db::now() };
        self.store.append_global_message(&message).await?;

        debug!(author = %message.author, "chat message accepted");
        self.presence.publish(Audience::All, ServerEvent::ChatMessage { message: message.clone() });
        Ok(message)
    }

    pub async fn global_history(&self) -> ChatResult<Vec<GlobalMessage>> {
        self.store.global_messages().await
    }

    pub async fn room_history(&self, room: &str) -> ChatResult<Vec<RoomMessage>> {
        let room = self.registry.find_room(room).await?;
        self.store.room_messages(&room.name).await
    }

    /// The same conversation whichever side asks.
    pub async fn direct_history(&self, a: &str, b: &str) -> ChatResult<Vec<DirectMessage>> {
        self.store.find_direct_messages(a, b).await
    }

    pub async fn conversations_for(&self, identity: &str) -> ChatResult<Vec<String>> {
        self.store.distinct_counterparts(identity).await
    }
}
