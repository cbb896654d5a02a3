//! Ephemeral rooms for sharing files and short texts over a LAN.
//!
//! Rooms live in memory only. A [`registry::RoomRegistry`] owns them, the
//! [`server::Server`] speaks the WebSocket protocol on top of it and the
//! [`hub::Hub`] fans snapshots out to each room's connections. File bytes
//! go through the HTTP handlers in [`routes`] into a [`files::DiskBlobStore`].

pub mod config;
pub mod crypto;
pub mod error;
pub mod files;
pub mod hub;
pub mod identity;
pub mod messages;
pub mod registry;
pub mod room;
pub mod routes;
pub mod server;
pub mod tls;
