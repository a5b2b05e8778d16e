use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};

use crate::{
    db::{self, Member, Room, RoomSummary, Store},
    ChatError, ChatResult,
};

const RENAME_PASSES: usize = 3;

/// What `join_room` does when the room does not exist yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinPolicy {
    /// Create it, with the joiner as creator.
    CreateIfMissing,
    RequireExisting,
}

#[derive(Debug, Clone)]
pub struct Joined {
    pub room: Room,
    pub created: bool,
}

/// Room names are compared trimmed and lower-cased.
pub fn normalize_room_name(name: &str) -> ChatResult<String> {
    let name = name.trim().to_lowercase();
    if name.is_empty() {
        return Err(ChatError::InvalidRoomName);
    }
    Ok(name)
}

/// Owns every mutation of room records. Each room has its own async lock so
/// traffic in one room never waits on another.
pub struct RoomRegistry {
    store: Arc<dyn Store>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl RoomRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store, locks: DashMap::new() }
    }

    pub(crate) async fn lock(&self, room: &str) -> OwnedMutexGuard<()> {
        let lock = self.locks.entry(room.to_owned()).or_default().clone();
        lock.lock_owned().await
    }

    /// Drops the lock entry of a room once nobody holds or waits on it.
    fn prune(&self, room: &str, guard: OwnedMutexGuard<()>) {
        drop(guard);
        self.locks.remove_if(room, |_, lock| Arc::strong_count(lock) == 1);
    }

    fn founded(name: &str, creator: &str) -> Room {
        let created_at = db::now();
        Room {
            name: name.to_owned(),
            creator: creator.to_owned(),
            created_at,
            members: vec![Member { identity: creator.to_owned(), joined_at: created_at }],
        }
    }

    pub async fn create_room(&self, name: &str, creator: &str) -> ChatResult<Room> {
        let name = normalize_room_name(name)?;
        let _guard = self.lock(&name).await;

        let room = Self::founded(&name, creator);
        self.store.insert_room(&room).await?;

        info!(room = %room.name, creator, "room created");
        Ok(room)
    }

    pub async fn join_room(&self, name: &str, identity: &str, policy: JoinPolicy) -> ChatResult<Joined> {
        let name = normalize_room_name(name)?;
        let guard = self.lock(&name).await;

        let mut room = match self.store.find_room_by_name(&name).await? {
            Some(room) => room,
            None if policy == JoinPolicy::RequireExisting => {
                self.prune(&name, guard);
                return Err(ChatError::room_not_found(&name));
            }
            None => {
                let room = Self::founded(&name, identity);
                match self.store.insert_room(&room).await {
                    Ok(()) => {
                        info!(room = %name, creator = identity, "room created by join");
                        return Ok(Joined { room, created: true });
                    }
                    // someone outside this process won the insert; join theirs
                    Err(ChatError::AlreadyExists(_)) => {
                        warn!(room = %name, "room appeared while joining");
                        self.store
                            .find_room_by_name(&name)
                            .await?
                            .ok_or_else(|| ChatError::room_not_found(&name))?
                    }
                    Err(err) => return Err(err),
                }
            }
        };

        if !room.has_member(identity) {
            room.members.push(Member { identity: identity.to_owned(), joined_at: db::now() });
            self.store.update_room_members(&room.name, &room.members).await?;
            info!(room = %room.name, identity, "member joined");
        }

        Ok(Joined { room, created: false })
    }

    /// Returns whether a membership was actually removed.
    pub async fn leave_room(&self, name: &str, identity: &str) -> ChatResult<bool> {
        let name = normalize_room_name(name)?;
        let guard = self.lock(&name).await;

        let Some(mut room) = self.store.find_room_by_name(&name).await? else {
            self.prune(&name, guard);
            return Ok(false);
        };
        if !room.has_member(identity) {
            return Ok(false);
        }

        room.members.retain(|m| m.identity != identity);
        self.store.update_room_members(&room.name, &room.members).await?;

        info!(room = %room.name, identity, "member left");
        Ok(true)
    }

    pub async fn delete_room(&self, name: &str, requester: &str) -> ChatResult<()> {
        let name = normalize_room_name(name)?;
        let guard = self.lock(&name).await;

        let Some(room) = self.store.find_room_by_name(&name).await? else {
            self.prune(&name, guard);
            return Err(ChatError::room_not_found(&name));
        };
        if room.creator != requester {
            warn!(room = %name, requester, "delete refused");
            return Err(ChatError::NotAuthorized(name));
        }

        if !self.store.delete_room(&name).await? {
            return Err(ChatError::room_not_found(&name));
        }
        self.prune(&name, guard);

        info!(room = %name, requester, "room deleted");
        Ok(())
    }

    pub async fn find_room(&self, name: &str) -> ChatResult<Room> {
        let name = normalize_room_name(name)?;
        self.store
            .find_room_by_name(&name)
            .await?
            .ok_or_else(|| ChatError::room_not_found(&name))
    }

    pub async fn list_rooms(&self) -> ChatResult<Vec<RoomSummary>> {
        self.store.list_rooms().await
    }

    /// Rewrites `old` to `new` in every room's membership and log. Each room is
    /// rewritten under its own lock in one transaction; no lock spans rooms.
    /// Returns the rooms that were touched.
    pub async fn rename_identity_everywhere(&self, old: &str, new: &str) -> ChatResult<Vec<String>> {
        let mut renamed: Vec<String> = Vec::new();

        // rooms picked up by another connection of `old` mid-cascade show up on the next pass
        for _ in 0..RENAME_PASSES {
            let pending = self.store.rooms_with_identity(old).await?;
            if pending.is_empty() {
                break;
            }
            for room in pending {
                let _guard = self.lock(&room).await;
                self.store.rename_identity_in_room(&room, old, new).await?;
                if !renamed.contains(&room) {
                    renamed.push(room);
                }
            }
        }
        renamed.sort();

        info!(old, new, rooms = renamed.len(), "identity renamed in rooms");
        Ok(renamed)
    }
}
