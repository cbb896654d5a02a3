//! The authoritative store of live rooms.
//!
//! The map itself sits behind one `RwLock` that is only held long enough
//! to look up, insert or remove an entry. Every room has its own `Mutex`,
//! so mutations of one room are serialized while different rooms proceed
//! independently. Lock order is always room, then map; nothing waits on a
//! room lock while holding the map lock.
//!
//! A deleted room is flagged closed under its own lock before it leaves
//! the map, so a caller that fetched the entry just before deletion sees
//! `RoomNotFound` instead of mutating an orphan.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use rand::Rng;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::error::RoomError;
use crate::files::BlobStore;
use crate::room::{
    now_millis, FileRecord, Member, Removal, Requester, Room, RoomSettings, RoomSummary, RoomView,
    SettingsOverrides, TextRecord,
};

const ROOM_ID_ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const RANDOM_ID_LEN: usize = 4;
const MAX_CUSTOM_ID_LEN: usize = 10;

/// Outcome of a departure from a room that exists.
#[derive(Debug)]
pub enum Departure {
    /// A member left and the room lives on.
    Remained(RoomView),
    /// A ghost left; nothing visible changed.
    Ghost,
    /// The last member left and the room was deleted.
    Closed,
    /// The connection was not in the room.
    NotPresent,
}

/// A successful join through the reconnection path.
#[derive(Debug)]
pub struct Rejoin {
    pub room: RoomView,
    /// Connection id the member held before, when it was rebound.
    pub previous: Option<String>,
}

#[derive(Debug)]
pub struct Ousted {
    pub member: Member,
    pub room: RoomView,
}

#[derive(Debug)]
pub struct Banishment {
    pub member: Option<Member>,
    pub ip: IpAddr,
    pub room: RoomView,
}

pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<Mutex<Room>>>>,
    blobs: Arc<dyn BlobStore>,
    defaults: RoomSettings,
    max_file_size: u64,
}

impl RoomRegistry {
    /// `defaults` seeds new rooms; `max_file_size` caps any per-room
    /// override.
    pub fn new(blobs: Arc<dyn BlobStore>, defaults: RoomSettings, max_file_size: u64) -> Self {
        RoomRegistry {
            rooms: RwLock::new(HashMap::new()),
            blobs,
            defaults: RoomSettings {
                max_file_size: defaults.max_file_size.min(max_file_size),
            },
            max_file_size,
        }
    }

    pub async fn create_room(
        &self,
        host_id: &str,
        password: Option<&str>,
        overrides: SettingsOverrides,
        custom_id: Option<&str>,
    ) -> Result<RoomView, RoomError> {
        let settings = RoomSettings {
            max_file_size: overrides
                .max_file_size
                .filter(|&size| size > 0)
                .map_or(self.defaults.max_file_size, |size| size.min(self.max_file_size)),
        };

        let mut rooms = self.rooms.write().await;
        let id = match custom_id.filter(|raw| !raw.is_empty()) {
            Some(raw) => {
                let id = raw.trim().to_uppercase();
                if !is_valid_room_id(&id) {
                    return Err(RoomError::InvalidName);
                }
                if rooms.contains_key(&id) {
                    return Err(RoomError::NameTaken);
                }
                id
            }
            None => loop {
                let id = random_room_id();
                if !rooms.contains_key(&id) {
                    break id;
                }
            },
        };

        let room = Room::new(id.clone(), host_id, password, settings);
        let view = room.view();
        rooms.insert(id.clone(), Arc::new(Mutex::new(room)));
        info!("Room {} created by {} ({} live)", id, host_id, rooms.len());
        Ok(view)
    }

    pub async fn get_room(&self, room_id: &str) -> Option<RoomView> {
        self.lock(room_id).await.ok().map(|room| room.view())
    }

    /// Summaries of every live room, oldest first.
    pub async fn all_rooms(&self) -> Vec<RoomSummary> {
        let entries: Vec<_> = self.rooms.read().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(entries.len());
        for entry in entries {
            let room = entry.lock().await;
            if !room.is_closed() {
                summaries.push(room.summary());
            }
        }
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        summaries
    }

    /// The subset of `room_ids` that are live, in request order.
    pub async fn rooms_exist(&self, room_ids: &[String]) -> Vec<String> {
        let rooms = self.rooms.read().await;
        room_ids
            .iter()
            .map(|id| normalize_room_id(id))
            .filter(|id| rooms.contains_key(id))
            .collect()
    }

    pub async fn contains_room(&self, room_id: &str) -> bool {
        self.rooms.read().await.contains_key(&normalize_room_id(room_id))
    }

    pub async fn join_room(
        &self,
        room_id: &str,
        member: Member,
        password: Option<&str>,
    ) -> Result<RoomView, RoomError> {
        let mut room = self.lock(room_id).await?;
        room.admit(member.ip, password)?;
        room.add_member(member);
        Ok(room.view())
    }

    /// Ghosts skip the ban and password gates; callers check privilege.
    pub async fn join_as_ghost(&self, room_id: &str, observer: Member) -> Result<RoomView, RoomError> {
        let mut room = self.lock(room_id).await?;
        room.add_ghost(observer);
        Ok(room.view())
    }

    pub async fn transfer_host(&self, room_id: &str) -> bool {
        match self.lock(room_id).await {
            Ok(mut room) => room.promote_first(),
            Err(_) => false,
        }
    }

    /// Rebinds the member named `nickname` onto `connection_id`.
    pub async fn update_member_connection(
        &self,
        room_id: &str,
        connection_id: &str,
        nickname: &str,
    ) -> Result<Rejoin, RoomError> {
        let mut room = self.lock(room_id).await?;
        let previous = room.rebind(nickname, connection_id)?;
        Ok(Rejoin {
            room: room.view(),
            previous: Some(previous),
        })
    }

    /// Reconnection path: the usual admission checks, then either rebind
    /// the existing member with this nickname or join as a new member, all
    /// under one lock.
    pub async fn rejoin_room(
        &self,
        room_id: &str,
        member: Member,
        password: Option<&str>,
    ) -> Result<Rejoin, RoomError> {
        let mut room = self.lock(room_id).await?;
        room.admit(member.ip, password)?;

        let known = room.users().iter().any(|m| m.nickname == member.nickname);
        let previous = if known {
            Some(room.rebind(&member.nickname, &member.connection_id)?)
        } else {
            room.add_member(member);
            None
        };
        Ok(Rejoin {
            room: room.view(),
            previous,
        })
    }

    /// Takes `connection_id` out of the room. When the last member leaves,
    /// `keep_alive` decides between a host-less room awaiting its next
    /// joiner and deletion.
    pub async fn leave_room(
        &self,
        room_id: &str,
        connection_id: &str,
        keep_alive: bool,
    ) -> Result<Departure, RoomError> {
        let mut room = self.lock(room_id).await?;
        match room.remove_participant(connection_id) {
            Removal::Absent => Ok(Departure::NotPresent),
            Removal::Ghost => Ok(Departure::Ghost),
            Removal::Member(_) if room.users().is_empty() && !keep_alive => {
                self.discard(room).await;
                Ok(Departure::Closed)
            }
            Removal::Member(_) => Ok(Departure::Remained(room.view())),
        }
    }

    pub async fn kick_member(
        &self,
        room_id: &str,
        target_id: &str,
        requester: Requester<'_>,
    ) -> Result<Ousted, RoomError> {
        let mut room = self.lock(room_id).await?;
        room.authorize(requester)?;
        let member = room.take_member(target_id).ok_or(RoomError::NotFound)?;
        Ok(Ousted {
            member,
            room: room.view(),
        })
    }

    pub async fn ban_ip(&self, room_id: &str, ip: IpAddr) -> Result<RoomView, RoomError> {
        let mut room = self.lock(room_id).await?;
        if room.ban(ip) {
            info!("Banned {} from room {}", ip, room.id());
        }
        Ok(room.view())
    }

    /// Kick and ban in one step. The member's recorded address wins over
    /// `fallback_ip`, which only applies when the target is no longer in
    /// the room.
    pub async fn ban_member(
        &self,
        room_id: &str,
        target_id: &str,
        fallback_ip: Option<IpAddr>,
        requester: Requester<'_>,
    ) -> Result<Banishment, RoomError> {
        let mut room = self.lock(room_id).await?;
        room.authorize(requester)?;
        let member = room.take_member(target_id);
        let ip = member
            .as_ref()
            .map(|m| m.ip)
            .or(fallback_ip)
            .ok_or(RoomError::NotFound)?;
        if room.ban(ip) {
            info!("Banned {} from room {}", ip, room.id());
        }
        Ok(Banishment {
            member,
            ip,
            room: room.view(),
        })
    }

    pub async fn delete_room(&self, room_id: &str) -> bool {
        match self.lock(room_id).await {
            Ok(room) => {
                self.discard(room).await;
                true
            }
            Err(_) => false,
        }
    }

    pub async fn add_file(&self, room_id: &str, file: FileRecord) -> Result<RoomView, RoomError> {
        let mut room = self.lock(room_id).await?;
        room.push_file(file);
        Ok(room.view())
    }

    pub async fn find_file(&self, room_id: &str, file_id: &str) -> Option<FileRecord> {
        let room = self.lock(room_id).await.ok()?;
        room.file(file_id).cloned()
    }

    pub async fn remove_file(
        &self,
        room_id: &str,
        file_id: &str,
        requester: Requester<'_>,
    ) -> Result<RoomView, RoomError> {
        let mut room = self.lock(room_id).await?;
        room.authorize(requester)?;
        let file = room.remove_file(file_id).ok_or(RoomError::NotFound)?;
        let view = room.view();
        drop(room);

        self.release_blobs(vec![file]).await;
        Ok(view)
    }

    /// Appends a text sent by one of the room's members. Ghosts cannot
    /// send. A blank sender name falls back to the member's nickname.
    pub async fn add_text(&self, room_id: &str, mut text: TextRecord) -> Result<(TextRecord, RoomView), RoomError> {
        let mut room = self.lock(room_id).await?;
        let sender = room.member(&text.sender_id).ok_or(RoomError::Unauthorized)?;
        if text.sender_name.trim().is_empty() {
            text.sender_name = sender.nickname.clone();
        }
        room.push_text(text.clone());
        Ok((text, room.view()))
    }

    pub async fn remove_text(
        &self,
        room_id: &str,
        text_id: &str,
        requester: Requester<'_>,
    ) -> Result<RoomView, RoomError> {
        let mut room = self.lock(room_id).await?;
        room.authorize(requester)?;
        room.remove_text(text_id).ok_or(RoomError::NotFound)?;
        Ok(room.view())
    }

    /// Deletes rooms that have had neither members nor ghosts for longer
    /// than `ttl`. Returns the ids it removed.
    pub async fn sweep_idle(&self, ttl: Duration) -> Vec<String> {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let now = now_millis();
        let entries: Vec<_> = self.rooms.read().await.values().cloned().collect();

        let mut swept = Vec::new();
        for entry in entries {
            let room = entry.lock_owned().await;
            let expired = room
                .idle_since()
                .is_some_and(|since| now.saturating_sub(since) > ttl_ms);
            if expired && !room.is_closed() {
                swept.push(room.id().to_owned());
                self.discard(room).await;
            }
        }
        swept
    }

    async fn lock(&self, room_id: &str) -> Result<OwnedMutexGuard<Room>, RoomError> {
        let entry = self
            .rooms
            .read()
            .await
            .get(&normalize_room_id(room_id))
            .cloned()
            .ok_or(RoomError::RoomNotFound)?;
        let room = entry.lock_owned().await;
        if room.is_closed() {
            return Err(RoomError::RoomNotFound);
        }
        Ok(room)
    }

    /// Closes and unmaps a room, then drops its blobs once the room lock
    /// is released.
    async fn discard(&self, mut room: OwnedMutexGuard<Room>) {
        let files = room.close();
        let id = room.id().to_owned();
        let remaining = {
            let mut rooms = self.rooms.write().await;
            rooms.remove(&id);
            rooms.len()
        };
        drop(room);

        info!("Room {} deleted ({} live)", id, remaining);
        self.release_blobs(files).await;
    }

    async fn release_blobs(&self, files: Vec<FileRecord>) {
        for file in files {
            if let Err(e) = self.blobs.delete(&file.storage).await {
                error!("Failed to delete blob {} of file {}: {}", file.storage, file.id, e);
            }
        }
    }
}

fn normalize_room_id(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

fn is_valid_room_id(id: &str) -> bool {
    (1..=MAX_CUSTOM_ID_LEN).contains(&id.len())
        && id.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
}

fn random_room_id() -> String {
    let mut rng = rand::thread_rng();
    (0..RANDOM_ID_LEN)
        .map(|_| char::from(ROOM_ID_ALPHABET[rng.gen_range(0..ROOM_ID_ALPHABET.len())]))
        .collect()
}
