//! Durable store: rooms, their members and logs, and direct messages.

use std::{future::Future, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tracing::{error, info};

use crate::{ChatError, ChatResult};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS rooms (
    name TEXT PRIMARY KEY NOT NULL,
    creator TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS room_members (
    room TEXT NOT NULL,
    identity TEXT NOT NULL,
    joined_at INTEGER NOT NULL,
    PRIMARY KEY (room, identity)
);
CREATE TABLE IF NOT EXISTS room_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    room TEXT NOT NULL,
    author TEXT NOT NULL,
    content TEXT NOT NULL,
    timestamp INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS room_messages_by_room ON room_messages (room, timestamp, id);
CREATE TABLE IF NOT EXISTS direct_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sender TEXT NOT NULL,
    recipient TEXT NOT NULL,
    content TEXT NOT NULL,
    timestamp INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS direct_messages_by_pair ON direct_messages (sender, recipient);
CREATE TABLE IF NOT EXISTS global_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    author TEXT NOT NULL,
    content TEXT NOT NULL,
    timestamp INTEGER NOT NULL
);
"#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub identity: String,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub name: String,
    pub creator: String,
    pub created_at: DateTime<Utc>,
    pub members: Vec<Member>,
}

impl Room {
    pub fn has_member(&self, identity: &str) -> bool {
        self.members.iter().any(|m| m.identity == identity)
    }

    pub fn summary(&self) -> RoomSummary {
        RoomSummary {
            name: self.name.clone(),
            creator: self.creator.clone(),
            created_at: self.created_at,
        }
    }
}

/// Listing view of a room; never carries members or messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub name: String,
    pub creator: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomMessage {
    pub author: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// A message on the lobby-wide channel, outside any room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GlobalMessage {
    pub author: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectMessage {
    pub from: String,
    pub to: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Millisecond precision is what the store keeps, so values are truncated
/// on the way in and compare equal on the way out.
pub fn now() -> DateTime<Utc> {
    from_millis(Utc::now().timestamp_millis())
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Fails with `AlreadyExists` when the name is taken.
    async fn insert_room(&self, room: &Room) -> ChatResult<()>;
    async fn find_room_by_name(&self, name: &str) -> ChatResult<Option<Room>>;
    /// Replaces the member set of a room.
    async fn update_room_members(&self, name: &str, members: &[Member]) -> ChatResult<()>;
    async fn append_room_message(&self, room: &str, message: &RoomMessage) -> ChatResult<()>;
    /// Ascending by timestamp, then insertion.
    async fn room_messages(&self, room: &str) -> ChatResult<Vec<RoomMessage>>;
    /// Removes the room, its members and its log. Returns false if it was not there.
    async fn delete_room(&self, name: &str) -> ChatResult<bool>;
    async fn list_rooms(&self) -> ChatResult<Vec<RoomSummary>>;
    /// Rooms where `identity` is a member or has authored a message.
    async fn rooms_with_identity(&self, identity: &str) -> ChatResult<Vec<String>>;
    /// Rewrites membership and authorship of one room in a single transaction.
    async fn rename_identity_in_room(&self, room: &str, old: &str, new: &str) -> ChatResult<()>;
    async fn insert_direct_message(&self, message: &DirectMessage) -> ChatResult<()>;
    async fn find_direct_messages(&self, a: &str, b: &str) -> ChatResult<Vec<DirectMessage>>;
    async fn distinct_counterparts(&self, identity: &str) -> ChatResult<Vec<String>>;
    async fn append_global_message(&self, message: &GlobalMessage) -> ChatResult<()>;
    /// Ascending by timestamp, then insertion.
    async fn global_messages(&self) -> ChatResult<Vec<GlobalMessage>>;
}

pub struct SqliteStore {
    pool: SqlitePool,
    timeout: Duration,
}

impl SqliteStore {
    pub async fn connect(url: &str, max_connections: u32, timeout: Duration) -> ChatResult<SqliteStore> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        let store = SqliteStore { pool, timeout };
        store.migrate().await?;
        info!(url, "store ready");
        Ok(store)
    }

    /// A private in-memory database. The pool is pinned to one connection that
    /// never expires, since every sqlite memory connection is its own database.
    pub async fn in_memory() -> ChatResult<SqliteStore> {
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let store = SqliteStore { pool, timeout: Duration::from_secs(5) };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> ChatResult<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    async fn guard<T, F>(&self, op: &'static str, fut: F) -> ChatResult<T>
    where
        F: Future<Output = ChatResult<T>> + Send,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Err(err @ ChatError::StoreUnavailable(_))) => {
                error!(op, error = %err, "store call failed");
                Err(err)
            }
            Ok(result) => result,
            Err(_) => {
                error!(op, timeout_ms = self.timeout.as_millis() as u64, "store call timed out");
                Err(ChatError::StoreUnavailable(format!("{op} timed out")))
            }
        }
    }

    async fn members_of(&self, name: &str) -> ChatResult<Vec<Member>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT identity,joined_at FROM room_members WHERE room=? ORDER BY joined_at,rowid")
                .bind(name)
                .fetch_all(&self.pool)
                .await?;

        Ok(rows
            .into_iter()
            .map(|(identity, joined_at)| Member { identity, joined_at: from_millis(joined_at) })
            .collect())
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error().is_some_and(|e| e.is_unique_violation())
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_room(&self, room: &Room) -> ChatResult<()> {
        self.guard("insert_room", async {
            let mut tx = self.pool.begin().await?;

            let inserted = sqlx::query("INSERT INTO rooms (name,creator,created_at) VALUES (?,?,?)")
                .bind(&room.name)
                .bind(&room.creator)
                .bind(room.created_at.timestamp_millis())
                .execute(&mut *tx)
                .await;
            if let Err(err) = &inserted {
                if is_unique_violation(err) {
                    return Err(ChatError::AlreadyExists(room.name.clone()));
                }
            }
            inserted?;

            for member in &room.members {
                sqlx::query("INSERT OR IGNORE INTO room_members (room,identity,joined_at) VALUES (?,?,?)")
                    .bind(&room.name)
                    .bind(&member.identity)
                    .bind(member.joined_at.timestamp_millis())
                    .execute(&mut *tx)
                    .await?;
            }

            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn find_room_by_name(&self, name: &str) -> ChatResult<Option<Room>> {
        self.guard("find_room_by_name", async {
            let Some((name, creator, created_at)): Option<(String, String, i64)> =
                sqlx::query_as("SELECT name,creator,created_at FROM rooms WHERE name=?")
                    .bind(name)
                    .fetch_optional(&self.pool)
                    .await?
            else {
                return Ok(None);
            };

            let members = self.members_of(&name).await?;
            Ok(Some(Room { name, creator, created_at: from_millis(created_at), members }))
        })
        .await
    }

    async fn update_room_members(&self, name: &str, members: &[Member]) -> ChatResult<()> {
        self.guard("update_room_members", async {
            let mut tx = self.pool.begin().await?;

            sqlx::query("DELETE FROM room_members WHERE room=?")
                .bind(name)
                .execute(&mut *tx)
                .await?;
            for member in members {
                sqlx::query("INSERT OR REPLACE INTO room_members (room,identity,joined_at) VALUES (?,?,?)")
                    .bind(name)
                    .bind(&member.identity)
                    .bind(member.joined_at.timestamp_millis())
                    .execute(&mut *tx)
                    .await?;
            }

            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn append_room_message(&self, room: &str, message: &RoomMessage) -> ChatResult<()> {
        self.guard("append_room_message", async {
            sqlx::query("INSERT INTO room_messages (room,author,content,timestamp) VALUES (?,?,?,?)")
                .bind(room)
                .bind(&message.author)
                .bind(&message.content)
                .bind(message.timestamp.timestamp_millis())
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    async fn room_messages(&self, room: &str) -> ChatResult<Vec<RoomMessage>> {
        self.guard("room_messages", async {
            let rows: Vec<(String, String, i64)> =
                sqlx::query_as("SELECT author,content,timestamp FROM room_messages WHERE room=? ORDER BY timestamp,id")
                    .bind(room)
                    .fetch_all(&self.pool)
                    .await?;

            Ok(rows
                .into_iter()
                .map(|(author, content, timestamp)| RoomMessage { author, content, timestamp: from_millis(timestamp) })
                .collect())
        })
        .await
    }

    async fn delete_room(&self, name: &str) -> ChatResult<bool> {
        self.guard("delete_room", async {
            let mut tx = self.pool.begin().await?;

            sqlx::query("DELETE FROM room_messages WHERE room=?")
                .bind(name)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM room_members WHERE room=?")
                .bind(name)
                .execute(&mut *tx)
                .await?;
            let deleted = sqlx::query("DELETE FROM rooms WHERE name=?")
                .bind(name)
                .execute(&mut *tx)
                .await?
                .rows_affected();

            tx.commit().await?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn list_rooms(&self) -> ChatResult<Vec<RoomSummary>> {
        self.guard("list_rooms", async {
            let rows: Vec<(String, String, i64)> =
                sqlx::query_as("SELECT name,creator,created_at FROM rooms ORDER BY created_at,name")
                    .fetch_all(&self.pool)
                    .await?;

            Ok(rows
                .into_iter()
                .map(|(name, creator, created_at)| RoomSummary { name, creator, created_at: from_millis(created_at) })
                .collect())
        })
        .await
    }

    async fn rooms_with_identity(&self, identity: &str) -> ChatResult<Vec<String>> {
        self.guard("rooms_with_identity", async {
            let rows: Vec<(String,)> = sqlx::query_as(
                "SELECT room FROM room_members WHERE identity=?1 \
                 UNION SELECT room FROM room_messages WHERE author=?1 \
                 ORDER BY 1",
            )
            .bind(identity)
            .fetch_all(&self.pool)
            .await?;

            Ok(rows.into_iter().map(|(room,)| room).collect())
        })
        .await
    }

    async fn rename_identity_in_room(&self, room: &str, old: &str, new: &str) -> ChatResult<()> {
        self.guard("rename_identity_in_room", async {
            let mut tx = self.pool.begin().await?;

            let taken: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM room_members WHERE room=? AND identity=?")
                .bind(room)
                .bind(new)
                .fetch_optional(&mut *tx)
                .await?;

            // an identity appears once per room, so an existing entry for `new` wins
            if taken.is_some() {
                sqlx::query("DELETE FROM room_members WHERE room=? AND identity=?")
                    .bind(room)
                    .bind(old)
                    .execute(&mut *tx)
                    .await?;
            } else {
                sqlx::query("UPDATE room_members SET identity=? WHERE room=? AND identity=?")
                    .bind(new)
                    .bind(room)
                    .bind(old)
                    .execute(&mut *tx)
                    .await?;
            }

            sqlx::query("UPDATE room_messages SET author=? WHERE room=? AND author=?")
                .bind(new)
                .bind(room)
                .bind(old)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn insert_direct_message(&self, message: &DirectMessage) -> ChatResult<()> {
        self.guard("insert_direct_message", async {
            sqlx::query("INSERT INTO direct_messages (sender,recipient,content,timestamp) VALUES (?,?,?,?)")
                .bind(&message.from)
                .bind(&message.to)
                .bind(&message.content)
                .bind(message.timestamp.timestamp_millis())
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    async fn find_direct_messages(&self, a: &str, b: &str) -> ChatResult<Vec<DirectMessage>> {
        self.guard("find_direct_messages", async {
            let rows: Vec<(String, String, String, i64)> = sqlx::query_as(
                "SELECT sender,recipient,content,timestamp FROM direct_messages \
                 WHERE (sender=?1 AND recipient=?2) OR (sender=?2 AND recipient=?1) \
                 ORDER BY timestamp,id",
            )
            .bind(a)
            .bind(b)
            .fetch_all(&self.pool)
            .await?;

            Ok(rows
                .into_iter()
                .map(|(from, to, content, timestamp)| DirectMessage { from, to, content, timestamp: from_millis(timestamp) })
                .collect())
        })
        .await
    }

    async fn distinct_counterparts(&self, identity: &str) -> ChatResult<Vec<String>> {
        self.guard("distinct_counterparts", async {
            let rows: Vec<(String,)> = sqlx::query_as(
                "SELECT recipient FROM direct_messages WHERE sender=?1 \
                 UNION SELECT sender FROM direct_messages WHERE recipient=?1 \
                 ORDER BY 1",
            )
            .bind(identity)
            .fetch_all(&self.pool)
            .await?;

            Ok(rows.into_iter().map(|(who,)| who).collect())
        })
        .await
    }

    async fn append_global_message(&self, message: &GlobalMessage) -> ChatResult<()> {
        self.guard("append_global_message", async {
            sqlx::query("INSERT INTO global_messages (author,content,timestamp) VALUES (?,?,?)")
                .bind(&message.author)
                .bind(&message.content)
                .bind(message.timestamp.timestamp_millis())
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    async fn global_messages(&self) -> ChatResult<Vec<GlobalMessage>> {
        self.guard("global_messages", async {
            let rows: Vec<(String, String, i64)> =
                sqlx::query_as("SELECT author,content,timestamp FROM global_messages ORDER BY timestamp,id")
                    .fetch_all(&self.pool)
                    .await?;

            Ok(rows
                .into_iter()
                .map(|(author, content, timestamp)| GlobalMessage { author, content, timestamp: from_millis(timestamp) })
                .collect())
        })
        .await
    }
}
