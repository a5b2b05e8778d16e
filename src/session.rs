//! Live sessions: one per connection, holding the claimed identity and the
//! room the connection is currently bound to.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    rooms::{Audience, PresenceNotifier, RoomRegistry},
    ChatError, ChatResult,
};

pub type ConnectionId = Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub connection_id: ConnectionId,
    pub identity: String,
    pub active_room: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Renamed {
    pub old: String,
    pub new: String,
    pub rooms: Vec<String>,
}

/// The live sessions, keyed by connection. Shared with the notifier so an
/// audience is resolved against the bindings in force when an event is published.
#[derive(Debug, Default)]
pub struct Roster {
    sessions: DashMap<ConnectionId, Session>,
}

impl Roster {
    /// Connections an event addressed to `audience` goes to, as of now.
    pub fn resolve(&self, audience: &Audience) -> Vec<ConnectionId> {
        if let Audience::Connection(id) = audience {
            return vec![*id];
        }
        self.sessions
            .iter()
            .filter(|s| match audience {
                Audience::All => true,
                Audience::Room(room) => s.active_room.as_deref() == Some(room.as_str()),
                Audience::Identity(identity) => &s.identity == identity,
                Audience::Connection(_) => false,
            })
            .map(|s| *s.key())
            .collect()
    }
}

pub struct SessionManager {
    roster: Arc<Roster>,
    registry: Arc<RoomRegistry>,
    presence: Arc<PresenceNotifier>,
}

impl SessionManager {
    pub fn new(registry: Arc<RoomRegistry>, presence: Arc<PresenceNotifier>) -> Self {
        Self { roster: presence.roster(), registry, presence }
    }

    pub fn open(&self, connection_id: ConnectionId, identity: &str) -> ChatResult<Session> {
        let identity = identity.trim();
        if identity.is_empty() {
            warn!(%connection_id, "session refused without identity");
            return Err(ChatError::MissingIdentity);
        }

        let session = Session { connection_id, identity: identity.to_owned(), active_room: None };
        self.roster.sessions.insert(connection_id, session.clone());

        info!(%connection_id, identity, "session opened");
        Ok(session)
    }

    pub fn get(&self, connection_id: ConnectionId) -> Option<Session> {
        self.roster.sessions.get(&connection_id).map(|s| s.clone())
    }

    /// Same as `get`, for callers that need a live session to continue.
    pub fn require(&self, connection_id: ConnectionId) -> ChatResult<Session> {
        self.get(connection_id).ok_or(ChatError::MissingIdentity)
    }

    /// Binds the connection to `room`, returning the room it was bound to before.
    pub fn bind_room(&self, connection_id: ConnectionId, room: &str) -> Option<String> {
        let mut session = self.roster.sessions.get_mut(&connection_id)?;
        session.active_room.replace(room.to_owned())
    }

    pub fn unbind_room(&self, connection_id: ConnectionId, room: &str) {
        if let Some(mut session) = self.roster.sessions.get_mut(&connection_id) {
            if session.active_room.as_deref() == Some(room) {
                session.active_room = None;
            }
        }
    }

    /// Clears every binding to a room that no longer exists.
    pub fn unbind_room_everywhere(&self, room: &str) {
        for mut session in self.roster.sessions.iter_mut() {
            if session.active_room.as_deref() == Some(room) {
                session.active_room = None;
            }
        }
    }

    pub fn is_bound(&self, connection_id: ConnectionId, room: &str) -> bool {
        self.roster
            .sessions
            .get(&connection_id)
            .is_some_and(|s| s.active_room.as_deref() == Some(room))
    }

    pub fn is_online(&self, identity: &str) -> bool {
        self.roster.sessions.iter().any(|s| s.identity == identity)
    }

    pub fn online_count(&self) -> usize {
        self.roster.sessions.len()
    }

    /// Renames the session's identity everywhere. Rooms are rewritten first;
    /// the session only takes the new name once every room has been, so a
    /// failed cascade can simply be retried.
    pub async fn rename(&self, connection_id: ConnectionId, new: &str) -> ChatResult<Renamed> {
        let session = self.require(connection_id)?;
        let new = new.trim();
        if new.is_empty() {
            return Err(ChatError::InvalidIdentity("identity cannot be blank".to_owned()));
        }
        if new == session.identity {
            return Err(ChatError::InvalidIdentity("identity is unchanged".to_owned()));
        }

        let old = session.identity;
        let rooms = self.registry.rename_identity_everywhere(&old, new).await?;

        if let Some(mut session) = self.roster.sessions.get_mut(&connection_id) {
            session.identity = new.to_owned();
        }

        self.presence.announce_rename(&old, new);
        for name in &rooms {
            match self.registry.find_room(name).await {
                Ok(room) => self.presence.publish_members(&room.name, PresenceNotifier::membership_view(&room)),
                Err(err) => warn!(room = %name, error = %err, "could not refresh members after rename"),
            }
        }

        info!(%connection_id, old = %old, new, "identity changed");
        Ok(Renamed { old, new: new.to_owned(), rooms })
    }

    /// Forgets the live session. Durable membership is left alone so the
    /// identity is still a member when it reconnects.
    pub fn close(&self, connection_id: ConnectionId) -> Option<Session> {
        let (_, session) = self.roster.sessions.remove(&connection_id)?;

        if let Some(room) = &session.active_room {
            self.presence.announce_disconnect(room, &session.identity);
        }

        info!(%connection_id, identity = %session.identity, "session closed");
        Some(session)
    }
}
