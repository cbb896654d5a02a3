//! Group-addressed fan-out over live connections.
//!
//! Each connection owns an unbounded outbox drained by its socket writer.
//! A publish clones one committed message into the outbox of every
//! connection subscribed to the group at that moment, so a subscriber sees
//! a snapshot whole or not at all. Lock order is groups, then connections.

use std::collections::{HashMap, HashSet};

use log::debug;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::RwLock;

use crate::messages::ServerMessage;

#[derive(Default)]
pub struct Hub {
    connections: RwLock<HashMap<String, UnboundedSender<ServerMessage>>>,
    groups: RwLock<HashMap<String, HashSet<String>>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, connection_id: &str) -> UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections
            .write()
            .await
            .insert(connection_id.to_owned(), tx);
        rx
    }

    /// Drops the connection's outbox and every subscription it held.
    pub async fn unregister(&self, connection_id: &str) {
        self.connections.write().await.remove(connection_id);
        let mut groups = self.groups.write().await;
        groups.retain(|_, members| {
            members.remove(connection_id);
            !members.is_empty()
        });
    }

    pub async fn subscribe(&self, connection_id: &str, room_id: &str) {
        self.groups
            .write()
            .await
            .entry(room_id.to_owned())
            .or_default()
            .insert(connection_id.to_owned());
    }

    pub async fn unsubscribe(&self, connection_id: &str, room_id: &str) {
        let mut groups = self.groups.write().await;
        if let Some(members) = groups.get_mut(room_id) {
            members.remove(connection_id);
            if members.is_empty() {
                groups.remove(room_id);
            }
        }
    }

    /// Removes the whole group and returns who was in it.
    pub async fn disband(&self, room_id: &str) -> Vec<String> {
        self.groups
            .write()
            .await
            .remove(room_id)
            .map(|members| members.into_iter().collect())
            .unwrap_or_default()
    }

    pub async fn subscribers(&self, room_id: &str) -> Vec<String> {
        self.groups
            .read()
            .await
            .get(room_id)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the subscribers the message was addressed to.
    pub async fn publish(&self, room_id: &str, message: ServerMessage) -> Vec<String> {
        let groups = self.groups.read().await;
        let Some(members) = groups.get(room_id) else {
            return Vec::new();
        };
        let connections = self.connections.read().await;
        for connection_id in members {
            if let Some(outbox) = connections.get(connection_id) {
                let _ = outbox.send(message.clone());
            }
        }
        debug!("Published {} to {} subscriber(s) of {}", message.kind(), members.len(), room_id);
        members.iter().cloned().collect()
    }

    pub async fn send_direct(&self, connection_id: &str, message: ServerMessage) {
        if let Some(outbox) = self.connections.read().await.get(connection_id) {
            let _ = outbox.send(message);
        }
    }
}
