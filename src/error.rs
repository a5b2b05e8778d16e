//! Error kinds surfaced by the room coordinator.

use serde::Serialize;

pub type ChatResult<T> = Result<T, ChatError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChatError {
    #[error("an identity is required to connect")]
    MissingIdentity,

    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("invalid room name")]
    InvalidRoomName,

    #[error("message content is empty")]
    EmptyMessage,

    #[error("you are not part of room {0}")]
    NotInRoom(String),

    #[error("room {0} already exists")]
    AlreadyExists(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("only the creator can delete room {0}")]
    NotAuthorized(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl ChatError {
    /// Stable identifier used on the wire.
    pub fn kind(&self) -> &'static str {
        use ChatError::*;
        match self {
            MissingIdentity => "missing_identity",
            InvalidIdentity(_) => "invalid_identity",
            InvalidRoomName => "invalid_room_name",
            EmptyMessage => "empty_message",
            NotInRoom(_) => "not_in_room",
            AlreadyExists(_) => "already_exists",
            NotFound(_) => "not_found",
            NotAuthorized(_) => "not_authorized",
            StoreUnavailable(_) => "store_unavailable",
        }
    }

    /// Only store failures are worth retrying; everything else is a verdict.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChatError::StoreUnavailable(_))
    }

    pub fn room_not_found(room: &str) -> Self {
        ChatError::NotFound(format!("room {room}"))
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind(),
            message: self.to_string(),
            retryable: self.is_retryable(),
        }
    }
}

impl From<sqlx::Error> for ChatError {
    fn from(err: sqlx::Error) -> Self {
        ChatError::StoreUnavailable(err.to_string())
    }
}

/// Structured failure sent back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub kind: &'static str,
    pub message: String,
    pub retryable: bool,
}
