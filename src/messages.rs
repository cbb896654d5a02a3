use serde::{Deserialize, Serialize};

use crate::error::RoomError;
use crate::room::{FileRecord, RoomSummary, RoomView, TextRecord};

/// One inbound frame: an event plus the id its reply should echo.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub request_id: Option<u64>,
    #[serde(flatten)]
    pub message: ClientMessage,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    CreateRoom {
        nickname: String,
        password: Option<String>,
        max_file_size: Option<u64>,
        custom_id: Option<String>,
    },
    JoinRoom {
        room_id: String,
        nickname: String,
        password: Option<String>,
    },
    JoinRoomGhost {
        room_id: String,
    },
    ReconnectToRoom {
        room_id: String,
        nickname: String,
        password: Option<String>,
    },
    LeaveRoom {
        room_id: String,
    },
    KickUser {
        room_id: String,
        target_id: String,
    },
    BanUser {
        room_id: String,
        target_id: String,
        target_ip: Option<String>,
    },
    AdminCloseRoom {
        room_id: String,
    },
    DeleteFile {
        room_id: String,
        file_id: String,
    },
    DeleteText {
        room_id: String,
        text_id: String,
    },
    SendText {
        room_id: String,
        content: String,
        sender_name: Option<String>,
    },
    GetAllRooms,
    CheckRooms {
        room_ids: Vec<String>,
    },
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::CreateRoom { .. } => "create_room",
            ClientMessage::JoinRoom { .. } => "join_room",
            ClientMessage::JoinRoomGhost { .. } => "join_room_ghost",
            ClientMessage::ReconnectToRoom { .. } => "reconnect_to_room",
            ClientMessage::LeaveRoom { .. } => "leave_room",
            ClientMessage::KickUser { .. } => "kick_user",
            ClientMessage::BanUser { .. } => "ban_user",
            ClientMessage::AdminCloseRoom { .. } => "admin_close_room",
            ClientMessage::DeleteFile { .. } => "delete_file",
            ClientMessage::DeleteText { .. } => "delete_text",
            ClientMessage::SendText { .. } => "send_text",
            ClientMessage::GetAllRooms => "get_all_rooms",
            ClientMessage::CheckRooms { .. } => "check_rooms",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ReplyPayload {
    Created { room_id: String, room: RoomView },
    Room { room: RoomView },
    Text { text: TextRecord },
    Rooms { rooms: Vec<RoomSummary> },
    Existing { room_ids: Vec<String> },
}

/// The single answer every request gets.
#[derive(Debug, Clone, Serialize)]
pub struct Reply {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RoomError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<ReplyPayload>,
}

impl From<Result<Option<ReplyPayload>, RoomError>> for Reply {
    fn from(outcome: Result<Option<ReplyPayload>, RoomError>) -> Self {
        match outcome {
            Ok(payload) => Reply {
                success: true,
                error: None,
                message: None,
                payload,
            },
            Err(e) => Reply {
                success: false,
                error: Some(e),
                message: Some(e.to_string()),
                payload: None,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        connection_id: String,
    },
    AdminStatus {
        is_admin: bool,
    },
    Reply {
        request_id: Option<u64>,
        #[serde(flatten)]
        reply: Reply,
    },
    RoomUpdated {
        room: RoomView,
    },
    RoomClosed {
        room_id: String,
    },
    NewText {
        room_id: String,
        text: TextRecord,
    },
    FileUploaded {
        room_id: String,
        file: FileRecord,
    },
    YouWereKicked {
        room_id: String,
    },
    YouWereBanned {
        room_id: String,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Connected { .. } => "connected",
            ServerMessage::AdminStatus { .. } => "admin_status",
            ServerMessage::Reply { .. } => "reply",
            ServerMessage::RoomUpdated { .. } => "room_updated",
            ServerMessage::RoomClosed { .. } => "room_closed",
            ServerMessage::NewText { .. } => "new_text",
            ServerMessage::FileUploaded { .. } => "file_uploaded",
            ServerMessage::YouWereKicked { .. } => "you_were_kicked",
            ServerMessage::YouWereBanned { .. } => "you_were_banned",
            ServerMessage::Error { .. } => "error",
        }
    }
}
