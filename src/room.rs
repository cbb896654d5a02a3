use std::collections::BTreeSet;
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::crypto::RoomSecret;
use crate::error::RoomError;
use crate::identity::DeviceInfo;

pub const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSettings {
    pub max_file_size: u64,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

/// Caller-supplied settings merged over the registry defaults at creation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SettingsOverrides {
    pub max_file_size: Option<u64>,
}

/// A connection's participation in a room.
///
/// `nickname` is the durable identity used to find the member again after
/// a reconnect; `connection_id` is the volatile transport id used to
/// address messages and is rewritten when the member reconnects.
#[derive(Debug, Clone, Serialize)]
pub struct Member {
    #[serde(rename = "id")]
    pub connection_id: String,
    pub nickname: String,
    pub ip: IpAddr,
    pub user_agent: String,
    #[serde(flatten)]
    pub device: DeviceInfo,
    pub joined_at: u64,
    pub is_ghost: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileRecord {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub sender_id: String,
    pub sender_name: String,
    /// BlobStore handle; internal to the server.
    #[serde(skip)]
    pub storage: String,
    pub created_at: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextRecord {
    pub id: String,
    pub content: String,
    pub sender_id: String,
    pub sender_name: String,
    pub created_at: u64,
}

/// Who is asking for a privileged room mutation.
#[derive(Debug, Clone, Copy)]
pub enum Requester<'a> {
    /// A connection that must currently hold host-ship.
    Host(&'a str),
    /// The server itself (admin surface, upload handler, housekeeping).
    Server,
}

/// Result of taking a connection out of a room.
#[derive(Debug)]
pub enum Removal {
    Ghost,
    Member(Member),
    Absent,
}

/// Snapshot broadcast in `room_updated`: no ghosts, no password.
#[derive(Debug, Clone, Serialize)]
pub struct RoomView {
    pub id: String,
    pub has_password: bool,
    pub host_id: String,
    pub users: Vec<Member>,
    pub files: Vec<FileRecord>,
    pub texts: Vec<TextRecord>,
    pub settings: RoomSettings,
    pub banned_ips: Vec<IpAddr>,
    pub created_at: u64,
    pub revision: u64,
}

/// Admin panel projection: counts only, no member details.
#[derive(Debug, Clone, Serialize)]
pub struct RoomSummary {
    pub id: String,
    pub has_password: bool,
    pub user_count: usize,
    pub file_count: usize,
    pub text_count: usize,
    pub created_at: u64,
}

#[derive(Debug)]
pub struct Room {
    id: String,
    secret: Option<RoomSecret>,
    host_id: String,
    users: Vec<Member>,
    ghosts: Vec<Member>,
    files: Vec<FileRecord>,
    texts: Vec<TextRecord>,
    settings: RoomSettings,
    banned_ips: BTreeSet<IpAddr>,
    created_at: u64,
    revision: u64,
    emptied_at: Option<u64>,
    closed: bool,
}

impl Room {
    pub fn new(id: String, host_id: &str, password: Option<&str>, settings: RoomSettings) -> Self {
        let secret = password
            .filter(|password| !password.trim().is_empty())
            .map(|password| RoomSecret::derive(&id, password));
        let created_at = now_millis();

        Room {
            id,
            secret,
            host_id: host_id.to_owned(),
            users: Vec::new(),
            ghosts: Vec::new(),
            files: Vec::new(),
            texts: Vec::new(),
            settings,
            banned_ips: BTreeSet::new(),
            created_at,
            revision: 0,
            emptied_at: Some(created_at),
            closed: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn users(&self) -> &[Member] {
        &self.users
    }

    pub fn ghosts(&self) -> &[Member] {
        &self.ghosts
    }

    pub fn settings(&self) -> RoomSettings {
        self.settings
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Ban check first, then the password gate.
    pub fn admit(&self, ip: IpAddr, password: Option<&str>) -> Result<(), RoomError> {
        if self.banned_ips.contains(&ip) {
            return Err(RoomError::Banned);
        }
        match &self.secret {
            Some(secret) if !secret.matches(&self.id, password) => Err(RoomError::WrongPassword),
            _ => Ok(()),
        }
    }

    /// Confirms `requester` may perform a host-only mutation.
    pub fn authorize(&self, requester: Requester<'_>) -> Result<(), RoomError> {
        match requester {
            Requester::Server => Ok(()),
            Requester::Host(id) if !self.host_id.is_empty() && self.host_id == id => Ok(()),
            Requester::Host(_) => Err(RoomError::Unauthorized),
        }
    }

    /// Visible member currently holding `connection_id`. Ghosts are not
    /// members.
    pub fn member(&self, connection_id: &str) -> Option<&Member> {
        self.users.iter().find(|member| member.connection_id == connection_id)
    }

    /// Appends `member` unless its connection is already in the room. A
    /// host-less room hands host-ship to whoever joins. A ghost on the same
    /// connection stops being one.
    pub fn add_member(&mut self, mut member: Member) {
        let connection_id = member.connection_id.clone();
        if self.member(&connection_id).is_none() {
            member.is_ghost = false;
            self.users.push(member);
        }
        self.drop_ghost(&connection_id);
        if self.host_id.is_empty() {
            self.host_id = connection_id;
        }
        self.emptied_at = None;
        self.touch();
    }

    /// No-op for a connection that is already a ghost or a member.
    pub fn add_ghost(&mut self, mut ghost: Member) {
        if self.member(&ghost.connection_id).is_some()
            || self.ghosts.iter().any(|g| g.connection_id == ghost.connection_id)
        {
            return;
        }
        ghost.is_ghost = true;
        self.ghosts.push(ghost);
        self.emptied_at = None;
    }

    /// Hands host-ship to the earliest remaining member.
    pub fn promote_first(&mut self) -> bool {
        match self.users.first() {
            Some(first) => {
                self.host_id = first.connection_id.clone();
                true
            }
            None => false,
        }
    }

    /// Moves the first member named `nickname` onto `connection_id`,
    /// carrying host-ship along. Returns the connection id it replaced.
    ///
    /// A connection that is already a member keeps its own membership and
    /// nothing is rebound, so one connection never holds two entries.
    pub fn rebind(&mut self, nickname: &str, connection_id: &str) -> Result<String, RoomError> {
        if self.users.iter().any(|m| m.connection_id == connection_id) {
            return Ok(connection_id.to_owned());
        }
        let member = self
            .users
            .iter_mut()
            .find(|m| m.nickname == nickname)
            .ok_or(RoomError::MemberNotFound)?;
        let previous = std::mem::replace(&mut member.connection_id, connection_id.to_owned());
        if self.host_id == previous {
            self.host_id = connection_id.to_owned();
        }
        self.drop_ghost(connection_id);
        self.touch();
        Ok(previous)
    }

    pub fn remove_participant(&mut self, connection_id: &str) -> Removal {
        if let Some(pos) = self.ghosts.iter().position(|g| g.connection_id == connection_id) {
            self.ghosts.remove(pos);
            self.mark_if_idle();
            return Removal::Ghost;
        }
        match self.take_member(connection_id) {
            Some(member) => Removal::Member(member),
            None => Removal::Absent,
        }
    }

    /// Removes a visible member. Host-ship passes to the earliest remaining
    /// member; the last one out leaves the room host-less.
    pub fn take_member(&mut self, connection_id: &str) -> Option<Member> {
        let pos = self.users.iter().position(|m| m.connection_id == connection_id)?;
        let member = self.users.remove(pos);

        if self.users.is_empty() {
            self.host_id.clear();
        } else if self.host_id == member.connection_id {
            self.promote_first();
        }
        self.mark_if_idle();
        self.touch();
        Some(member)
    }

    pub fn ban(&mut self, ip: IpAddr) -> bool {
        let inserted = self.banned_ips.insert(ip);
        if inserted {
            self.touch();
        }
        inserted
    }

    pub fn push_file(&mut self, file: FileRecord) {
        self.files.push(file);
        self.touch();
    }

    pub fn file(&self, file_id: &str) -> Option<&FileRecord> {
        self.files.iter().find(|f| f.id == file_id)
    }

    pub fn remove_file(&mut self, file_id: &str) -> Option<FileRecord> {
        let pos = self.files.iter().position(|f| f.id == file_id)?;
        self.touch();
        Some(self.files.remove(pos))
    }

    pub fn push_text(&mut self, text: TextRecord) {
        self.texts.push(text);
        self.touch();
    }

    pub fn remove_text(&mut self, text_id: &str) -> Option<TextRecord> {
        let pos = self.texts.iter().position(|t| t.id == text_id)?;
        self.touch();
        Some(self.texts.remove(pos))
    }

    /// Marks the room dead and hands back its files for blob cleanup.
    pub fn close(&mut self) -> Vec<FileRecord> {
        self.closed = true;
        std::mem::take(&mut self.files)
    }

    /// When the room became empty of members and ghosts, if it is.
    pub fn idle_since(&self) -> Option<u64> {
        if self.users.is_empty() && self.ghosts.is_empty() {
            self.emptied_at
        } else {
            None
        }
    }

    pub fn view(&self) -> RoomView {
        RoomView {
            id: self.id.clone(),
            has_password: self.secret.is_some(),
            host_id: self.host_id.clone(),
            users: self.users.clone(),
            files: self.files.clone(),
            texts: self.texts.clone(),
            settings: self.settings,
            banned_ips: self.banned_ips.iter().copied().collect(),
            created_at: self.created_at,
            revision: self.revision,
        }
    }

    pub fn summary(&self) -> RoomSummary {
        RoomSummary {
            id: self.id.clone(),
            has_password: self.secret.is_some(),
            user_count: self.users.len(),
            file_count: self.files.len(),
            text_count: self.texts.len(),
            created_at: self.created_at,
        }
    }

    fn drop_ghost(&mut self, connection_id: &str) {
        self.ghosts.retain(|g| g.connection_id != connection_id);
    }

    fn mark_if_idle(&mut self) {
        if self.users.is_empty() && self.ghosts.is_empty() && self.emptied_at.is_none() {
            self.emptied_at = Some(now_millis());
        }
    }

    fn touch(&mut self) {
        self.revision += 1;
    }
}
