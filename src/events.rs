//! JSON frames exchanged over the room socket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    db::{DirectMessage, GlobalMessage, Member, RoomMessage, RoomSummary},
    error::ErrorBody,
};

#[derive(Debug, Clone, Deserialize)]
pub struct ClientRequest {
    /// Echoed back on the reply so clients can match callbacks.
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(flatten)]
    pub event: ClientEvent,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientEvent {
    CreateRoom { room: String },
    JoinRoom { room: String },
    QuitRoom { room: String },
    DeleteRoom { room: String },
    RoomMessage {
        room: String,
        content: String,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },
    PrivateMessage { to: String, content: String },
    GetRoomMessages { room: String },
    GetPrivateMessages { with: String },
    ListConversations,
    GetRoomUsers { room: String },
    ListRooms,
    ChangeUsername { username: String },
    /// Lobby-wide message, outside any room.
    ChatMessage { content: String },
    GetChatMessages,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    Reply {
        id: Option<u64>,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },
    Error {
        #[serde(flatten)]
        error: ErrorBody,
    },
    RoomMessage {
        room: String,
        #[serde(flatten)]
        message: RoomMessage,
    },
    PrivateMessage {
        #[serde(flatten)]
        message: DirectMessage,
    },
    ChatMessage {
        #[serde(flatten)]
        message: GlobalMessage,
    },
    SystemMessage {
        #[serde(skip_serializing_if = "Option::is_none")]
        room: Option<String>,
        text: String,
    },
    RoomUsers { room: String, users: Vec<Member> },
    AvailableRooms { rooms: Vec<RoomSummary> },
}
