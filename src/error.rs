use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Expected failures of a room operation. They travel back to the client
/// inside the reply to its request and never end the connection.
///
/// Serialized as the bare variant name (`"RoomNotFound"`), which is the
/// machine-readable code clients switch on.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RoomError {
    #[error("Room not found")]
    RoomNotFound,
    #[error("Wrong password")]
    WrongPassword,
    #[error("You have been banned from this room")]
    Banned,
    #[error("Not authorized")]
    Unauthorized,
    #[error("Item not found")]
    NotFound,
    #[error("Room name must be 1 to 10 letters or digits")]
    InvalidName,
    #[error("Room name is already in use")]
    NameTaken,
    #[error("No member with that nickname in this room")]
    MemberNotFound,
    #[error("Malformed request")]
    InvalidRequest,
}

/// Fatal conditions before the server starts accepting connections.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("cannot prepare upload directory {path}: {source}")]
    UploadDir { path: PathBuf, source: io::Error },
    #[error("cannot listen on {addr}: {source}")]
    Bind { addr: SocketAddr, source: warp::Error },
}
