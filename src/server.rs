use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::RwLock;
use uuid::Uuid;
use warp::ws::{Message, WebSocket};

use crate::error::RoomError;
use crate::hub::Hub;
use crate::identity::{canonical_ip, resolve_device, AuthorizationPolicy, DeviceInfo, UNKNOWN_ORIGIN};
use crate::messages::{ClientMessage, Reply, ReplyPayload, Request, ServerMessage};
use crate::registry::{Departure, RoomRegistry};
use crate::room::{now_millis, Member, Requester, SettingsOverrides, TextRecord};

const GHOST_NICKNAME: &str = "Admin";
const SWEEP_INTERVAL_CAP: Duration = Duration::from_secs(60);

type Outcome = Result<Option<ReplyPayload>, RoomError>;

/// Everything known about a connection from its handshake.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: String,
    pub ip: IpAddr,
    pub user_agent: String,
    pub device: DeviceInfo,
    pub is_admin: bool,
}

impl Connection {
    fn member(&self, nickname: &str) -> Member {
        Member {
            connection_id: self.id.clone(),
            nickname: nickname.to_owned(),
            ip: self.ip,
            user_agent: self.user_agent.clone(),
            device: self.device,
            joined_at: now_millis(),
            is_ghost: false,
        }
    }

    fn ghost(&self) -> Member {
        Member {
            is_ghost: true,
            ..self.member(GHOST_NICKNAME)
        }
    }
}

/// Protocol layer over the registry: authorizes each event, applies it,
/// and decides who hears about the result.
pub struct Server {
    registry: Arc<RoomRegistry>,
    hub: Arc<Hub>,
    policy: Arc<dyn AuthorizationPolicy>,
    /// connection id -> rooms it is subscribed to, for disconnect cleanup
    memberships: RwLock<HashMap<String, HashSet<String>>>,
}

impl Server {
    pub fn new(registry: Arc<RoomRegistry>, hub: Arc<Hub>, policy: Arc<dyn AuthorizationPolicy>) -> Self {
        Server {
            registry,
            hub,
            policy,
            memberships: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Deletes long-idle rooms in the background, when a TTL is set.
    pub fn spawn_idle_sweeper(self: &Arc<Self>, ttl: Duration) {
        let server = Arc::clone(self);
        let period = ttl.min(SWEEP_INTERVAL_CAP).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                for room_id in server.registry.sweep_idle(ttl).await {
                    info!("Room {} expired after {:?} idle", room_id, ttl);
                    server.disband(&room_id).await;
                }
            }
        });
    }

    pub async fn handle_connection(
        self: Arc<Self>,
        ws: WebSocket,
        remote: Option<SocketAddr>,
        user_agent: Option<String>,
    ) {
        let (conn, mut rx) = self.connect(remote, user_agent).await;
        let (mut ws_tx, mut ws_rx) = ws.split();

        let writer_id = conn.id.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        error!("Failed to encode {} for {}: {}", message.kind(), writer_id, e);
                        continue;
                    }
                };
                if let Err(e) = ws_tx.send(Message::text(text)).await {
                    debug!("Failed to send WebSocket message to {}: {}", writer_id, e);
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        while let Some(result) = ws_rx.next().await {
            let msg = match result {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("WebSocket error on {}: {}", conn.id, e);
                    break;
                }
            };
            if msg.is_close() {
                break;
            }
            let Ok(text) = msg.to_str() else {
                continue;
            };
            match serde_json::from_str::<Request>(text) {
                Ok(request) => {
                    let reply = self.handle_message(&conn, request.message).await;
                    self.hub
                        .send_direct(
                            &conn.id,
                            ServerMessage::Reply {
                                request_id: request.request_id,
                                reply,
                            },
                        )
                        .await;
                }
                Err(e) => {
                    warn!("Unparseable message from {}: {}", conn.id, e);
                    self.hub
                        .send_direct(
                            &conn.id,
                            ServerMessage::Error {
                                message: format!("Invalid message: {e}"),
                            },
                        )
                        .await;
                }
            }
        }

        self.disconnect(&conn).await;
    }

    /// Registers a new connection and greets it with its id and admin
    /// status.
    pub async fn connect(
        &self,
        remote: Option<SocketAddr>,
        user_agent: Option<String>,
    ) -> (Connection, UnboundedReceiver<ServerMessage>) {
        let ip = remote.map_or(UNKNOWN_ORIGIN, |addr| canonical_ip(addr.ip()));
        let user_agent = user_agent.unwrap_or_default();
        let conn = Connection {
            id: Uuid::new_v4().to_string(),
            ip,
            device: resolve_device(&user_agent),
            user_agent,
            is_admin: self.policy.is_admin(ip),
        };

        let rx = self.hub.register(&conn.id).await;
        self.hub
            .send_direct(
                &conn.id,
                ServerMessage::Connected {
                    connection_id: conn.id.clone(),
                },
            )
            .await;
        self.hub
            .send_direct(
                &conn.id,
                ServerMessage::AdminStatus {
                    is_admin: conn.is_admin,
                },
            )
            .await;

        info!(
            "Connection {} from {} ({:?}/{:?}{})",
            conn.id,
            conn.ip,
            conn.device.os,
            conn.device.browser,
            if conn.is_admin { ", admin" } else { "" }
        );
        (conn, rx)
    }

    pub async fn handle_message(&self, conn: &Connection, message: ClientMessage) -> Reply {
        let kind = message.kind();
        let outcome = match message {
            ClientMessage::CreateRoom {
                nickname,
                password,
                max_file_size,
                custom_id,
            } => {
                self.create_room(conn, &nickname, password.as_deref(), max_file_size, custom_id.as_deref())
                    .await
            }
            ClientMessage::JoinRoom {
                room_id,
                nickname,
                password,
            } => self.join_room(conn, &room_id, &nickname, password.as_deref()).await,
            ClientMessage::JoinRoomGhost { room_id } => self.join_room_ghost(conn, &room_id).await,
            ClientMessage::ReconnectToRoom {
                room_id,
                nickname,
                password,
            } => {
                self.reconnect_to_room(conn, &room_id, &nickname, password.as_deref())
                    .await
            }
            ClientMessage::LeaveRoom { room_id } => self.leave_room(conn, &room_id).await,
            ClientMessage::KickUser { room_id, target_id } => {
                self.kick_user(conn, &room_id, &target_id).await
            }
            ClientMessage::BanUser {
                room_id,
                target_id,
                target_ip,
            } => {
                self.ban_user(conn, &room_id, &target_id, target_ip.as_deref())
                    .await
            }
            ClientMessage::AdminCloseRoom { room_id } => self.admin_close_room(conn, &room_id).await,
            ClientMessage::DeleteFile { room_id, file_id } => {
                self.delete_file(conn, &room_id, &file_id).await
            }
            ClientMessage::DeleteText { room_id, text_id } => {
                self.delete_text(conn, &room_id, &text_id).await
            }
            ClientMessage::SendText {
                room_id,
                content,
                sender_name,
            } => self.send_text(conn, &room_id, content, sender_name).await,
            ClientMessage::GetAllRooms => self.get_all_rooms(conn).await,
            ClientMessage::CheckRooms { room_ids } => Ok(Some(ReplyPayload::Existing {
                room_ids: self.registry.rooms_exist(&room_ids).await,
            })),
        };

        if let Err(e) = &outcome {
            debug!("{} from {} refused: {:?}", kind, conn.id, e);
        }
        outcome.into()
    }

    /// Ungraceful departure: the transport is gone. Rooms this connection
    /// leaves empty are deleted rather than kept alive.
    pub async fn disconnect(&self, conn: &Connection) {
        self.hub.unregister(&conn.id).await;
        let rooms = self
            .memberships
            .write()
            .await
            .remove(&conn.id)
            .unwrap_or_default();

        for room_id in rooms {
            match self.registry.leave_room(&room_id, &conn.id, false).await {
                Ok(departure) => self.announce(&room_id, departure).await,
                Err(RoomError::RoomNotFound) => {}
                Err(e) => warn!("Disconnect of {} from {} failed: {}", conn.id, room_id, e),
            }
        }
        info!("Connection {} closed", conn.id);
    }

    async fn create_room(
        &self,
        conn: &Connection,
        nickname: &str,
        password: Option<&str>,
        max_file_size: Option<u64>,
        custom_id: Option<&str>,
    ) -> Outcome {
        let nickname = required(nickname)?;
        let overrides = SettingsOverrides { max_file_size };
        let created = self
            .registry
            .create_room(&conn.id, password, overrides, custom_id)
            .await?;
        let room = self
            .registry
            .join_room(&created.id, conn.member(nickname), password)
            .await?;

        self.enter_live(&conn.id, &room.id).await?;
        self.hub
            .publish(&room.id, ServerMessage::RoomUpdated { room: room.clone() })
            .await;
        Ok(Some(ReplyPayload::Created {
            room_id: room.id.clone(),
            room,
        }))
    }

    async fn join_room(
        &self,
        conn: &Connection,
        room_id: &str,
        nickname: &str,
        password: Option<&str>,
    ) -> Outcome {
        let nickname = required(nickname)?;
        let room = self
            .registry
            .join_room(room_id, conn.member(nickname), password)
            .await?;

        self.enter_live(&conn.id, &room.id).await?;
        self.hub
            .publish(&room.id, ServerMessage::RoomUpdated { room: room.clone() })
            .await;
        Ok(Some(ReplyPayload::Room { room }))
    }

    /// Invisible observer: subscribed to the room but never announced.
    async fn join_room_ghost(&self, conn: &Connection, room_id: &str) -> Outcome {
        if !conn.is_admin {
            return Err(RoomError::Unauthorized);
        }
        let room = self.registry.join_as_ghost(room_id, conn.ghost()).await?;
        self.enter_live(&conn.id, &room.id).await?;
        info!("Admin {} observing room {}", conn.id, room.id);
        Ok(Some(ReplyPayload::Room { room }))
    }

    /// Same nickname in the same room means the same person on a new
    /// connection: the member keeps its place (and host-ship) and only
    /// its connection id changes.
    async fn reconnect_to_room(
        &self,
        conn: &Connection,
        room_id: &str,
        nickname: &str,
        password: Option<&str>,
    ) -> Outcome {
        let nickname = required(nickname)?;
        let rejoin = self
            .registry
            .rejoin_room(room_id, conn.member(nickname), password)
            .await?;
        let room = rejoin.room;

        if let Some(previous) = rejoin.previous.filter(|previous| *previous != conn.id) {
            info!("{} reconnected to room {} ({} -> {})", nickname, room.id, previous, conn.id);
            self.exit(&previous, &room.id).await;
        }
        self.enter_live(&conn.id, &room.id).await?;
        self.hub
            .publish(&room.id, ServerMessage::RoomUpdated { room: room.clone() })
            .await;
        Ok(Some(ReplyPayload::Room { room }))
    }

    async fn leave_room(&self, conn: &Connection, room_id: &str) -> Outcome {
        let departure = self.registry.leave_room(room_id, &conn.id, true).await;
        let canonical = room_id.trim().to_ascii_uppercase();
        self.exit(&conn.id, &canonical).await;
        self.announce(&canonical, departure?).await;
        Ok(None)
    }

    async fn kick_user(&self, conn: &Connection, room_id: &str, target_id: &str) -> Outcome {
        let ousted = self
            .registry
            .kick_member(room_id, target_id, Requester::Host(&conn.id))
            .await?;
        let room_id = ousted.room.id.clone();
        info!("{} kicked {} from room {}", conn.id, ousted.member.nickname, room_id);

        self.hub
            .send_direct(
                target_id,
                ServerMessage::YouWereKicked {
                    room_id: room_id.clone(),
                },
            )
            .await;
        self.exit(target_id, &room_id).await;
        self.hub
            .publish(&room_id, ServerMessage::RoomUpdated { room: ousted.room })
            .await;
        Ok(None)
    }

    async fn ban_user(
        &self,
        conn: &Connection,
        room_id: &str,
        target_id: &str,
        target_ip: Option<&str>,
    ) -> Outcome {
        let fallback_ip = target_ip
            .filter(|raw| !raw.trim().is_empty())
            .map(|raw| raw.trim().parse::<IpAddr>().map(canonical_ip))
            .transpose()
            .map_err(|_| RoomError::InvalidRequest)?;
        let banishment = self
            .registry
            .ban_member(room_id, target_id, fallback_ip, Requester::Host(&conn.id))
            .await?;
        let room_id = banishment.room.id.clone();

        if banishment.member.is_some() {
            self.hub
                .send_direct(
                    target_id,
                    ServerMessage::YouWereBanned {
                        room_id: room_id.clone(),
                    },
                )
                .await;
            self.exit(target_id, &room_id).await;
        }
        self.hub
            .publish(&room_id, ServerMessage::RoomUpdated { room: banishment.room })
            .await;
        Ok(None)
    }

    /// Everyone in the room hears `room_closed` before the room goes away.
    async fn admin_close_room(&self, conn: &Connection, room_id: &str) -> Outcome {
        if !conn.is_admin {
            return Err(RoomError::Unauthorized);
        }
        let room = self
            .registry
            .get_room(room_id)
            .await
            .ok_or(RoomError::RoomNotFound)?;

        let closed = ServerMessage::RoomClosed {
            room_id: room.id.clone(),
        };
        let notified = self.hub.publish(&room.id, closed.clone()).await;
        self.registry.delete_room(&room.id).await;
        for late in self.disband(&room.id).await {
            if !notified.contains(&late) {
                self.hub.send_direct(&late, closed.clone()).await;
            }
        }
        info!("Admin {} closed room {}", conn.id, room.id);
        Ok(None)
    }

    async fn delete_file(&self, conn: &Connection, room_id: &str, file_id: &str) -> Outcome {
        let room = self
            .registry
            .remove_file(room_id, file_id, Requester::Host(&conn.id))
            .await?;
        self.hub
            .publish(&room.id.clone(), ServerMessage::RoomUpdated { room })
            .await;
        Ok(None)
    }

    async fn delete_text(&self, conn: &Connection, room_id: &str, text_id: &str) -> Outcome {
        let room = self
            .registry
            .remove_text(room_id, text_id, Requester::Host(&conn.id))
            .await?;
        self.hub
            .publish(&room.id.clone(), ServerMessage::RoomUpdated { room })
            .await;
        Ok(None)
    }

    /// Sends `new_text` for immediate display, then the full snapshot.
    async fn send_text(
        &self,
        conn: &Connection,
        room_id: &str,
        content: String,
        sender_name: Option<String>,
    ) -> Outcome {
        if content.trim().is_empty() {
            return Err(RoomError::InvalidRequest);
        }
        let draft = TextRecord {
            id: Uuid::new_v4().to_string(),
            content,
            sender_id: conn.id.clone(),
            sender_name: sender_name.unwrap_or_default(),
            created_at: now_millis(),
        };
        let (text, room) = self.registry.add_text(room_id, draft).await?;
        let room_id = room.id.clone();

        self.hub
            .publish(
                &room_id,
                ServerMessage::NewText {
                    room_id: room_id.clone(),
                    text: text.clone(),
                },
            )
            .await;
        self.hub
            .publish(&room_id, ServerMessage::RoomUpdated { room })
            .await;
        Ok(Some(ReplyPayload::Text { text }))
    }

    async fn get_all_rooms(&self, conn: &Connection) -> Outcome {
        if !conn.is_admin {
            return Err(RoomError::Unauthorized);
        }
        Ok(Some(ReplyPayload::Rooms {
            rooms: self.registry.all_rooms().await,
        }))
    }

    /// Tells a room's subscribers what a departure changed.
    async fn announce(&self, room_id: &str, departure: Departure) {
        match departure {
            Departure::Remained(room) => {
                self.hub
                    .publish(room_id, ServerMessage::RoomUpdated { room })
                    .await;
            }
            Departure::Closed => {
                self.hub
                    .publish(
                        room_id,
                        ServerMessage::RoomClosed {
                            room_id: room_id.to_owned(),
                        },
                    )
                    .await;
                self.disband(room_id).await;
            }
            Departure::Ghost | Departure::NotPresent => {}
        }
    }

    async fn enter(&self, connection_id: &str, room_id: &str) {
        self.hub.subscribe(connection_id, room_id).await;
        self.memberships
            .write()
            .await
            .entry(connection_id.to_owned())
            .or_default()
            .insert(room_id.to_owned());
    }

    /// `enter` for a join that has already been committed. A room deleted
    /// in between has been disbanded, so the subscription is undone.
    async fn enter_live(&self, connection_id: &str, room_id: &str) -> Result<(), RoomError> {
        self.enter(connection_id, room_id).await;
        if !self.registry.contains_room(room_id).await {
            self.exit(connection_id, room_id).await;
            return Err(RoomError::RoomNotFound);
        }
        Ok(())
    }

    async fn exit(&self, connection_id: &str, room_id: &str) {
        self.hub.unsubscribe(connection_id, room_id).await;
        let mut memberships = self.memberships.write().await;
        if let Some(rooms) = memberships.get_mut(connection_id) {
            rooms.remove(room_id);
            if rooms.is_empty() {
                memberships.remove(connection_id);
            }
        }
    }

    /// Drops every subscription to a room that no longer exists and returns
    /// the connections that held one.
    async fn disband(&self, room_id: &str) -> Vec<String> {
        let subscribers = self.hub.disband(room_id).await;
        let mut memberships = self.memberships.write().await;
        for connection_id in &subscribers {
            if let Some(rooms) = memberships.get_mut(connection_id) {
                rooms.remove(room_id);
                if rooms.is_empty() {
                    memberships.remove(connection_id);
                }
            }
        }
        subscribers
    }
}

fn required(value: &str) -> Result<&str, RoomError> {
    let value = value.trim();
    if value.is_empty() {
        Err(RoomError::InvalidRequest)
    } else {
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::tests::RecordingBlobStore;
    use crate::identity::LoopbackPolicy;
    use crate::room::{FileRecord, RoomSettings, RoomView};

    const AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) Gecko/20100101 Firefox/121.0";

    struct Client {
        conn: Connection,
        rx: UnboundedReceiver<ServerMessage>,
    }

    impl Client {
        fn drain(&mut self) -> Vec<ServerMessage> {
            let mut out = Vec::new();
            while let Ok(message) = self.rx.try_recv() {
                out.push(message);
            }
            out
        }

        fn kinds(&mut self) -> Vec<&'static str> {
            self.drain().iter().map(ServerMessage::kind).collect()
        }
    }

    fn setup() -> (Server, Arc<RecordingBlobStore>) {
        let blobs = Arc::new(RecordingBlobStore::default());
        let registry = Arc::new(RoomRegistry::new(blobs.clone(), RoomSettings::default(), u64::MAX));
        let server = Server::new(registry, Arc::new(Hub::new()), Arc::new(LoopbackPolicy));
        (server, blobs)
    }

    async fn client(server: &Server, ip: &str) -> Client {
        let addr = SocketAddr::new(ip.parse().unwrap(), 50_000);
        let (conn, rx) = server.connect(Some(addr), Some(AGENT.into())).await;
        let mut client = Client { conn, rx };
        client.drain();
        client
    }

    fn create(nickname: &str, password: Option<&str>, custom_id: Option<&str>) -> ClientMessage {
        ClientMessage::CreateRoom {
            nickname: nickname.into(),
            password: password.map(Into::into),
            max_file_size: None,
            custom_id: custom_id.map(Into::into),
        }
    }

    fn join(room_id: &str, nickname: &str, password: Option<&str>) -> ClientMessage {
        ClientMessage::JoinRoom {
            room_id: room_id.into(),
            nickname: nickname.into(),
            password: password.map(Into::into),
        }
    }

    fn reconnect(room_id: &str, nickname: &str, password: Option<&str>) -> ClientMessage {
        ClientMessage::ReconnectToRoom {
            room_id: room_id.into(),
            nickname: nickname.into(),
            password: password.map(Into::into),
        }
    }

    fn error_of(reply: &Reply) -> Option<RoomError> {
        assert_eq!(reply.success, reply.error.is_none());
        reply.error
    }

    fn room_of(reply: Reply) -> RoomView {
        match reply.payload {
            Some(ReplyPayload::Created { room, .. } | ReplyPayload::Room { room }) => room,
            other => panic!("expected a room payload, got {other:?}"),
        }
    }

    fn updated_rooms(messages: &[ServerMessage]) -> Vec<&RoomView> {
        messages
            .iter()
            .filter_map(|m| match m {
                ServerMessage::RoomUpdated { room } => Some(room),
                _ => None,
            })
            .collect()
    }

    async fn hosted_room(server: &Server, host: &mut Client, custom_id: Option<&str>) -> String {
        let reply = server.handle_message(&host.conn, create("Alice", None, custom_id)).await;
        let room = room_of(reply);
        host.drain();
        room.id
    }

    #[tokio::test]
    async fn greets_with_id_and_admin_status() {
        let (server, _) = setup();
        let (conn, mut rx) = server
            .connect(Some("127.0.0.1:4000".parse().unwrap()), None)
            .await;
        assert!(conn.is_admin);
        assert!(matches!(rx.try_recv(), Ok(ServerMessage::Connected { connection_id }) if connection_id == conn.id));
        assert!(matches!(rx.try_recv(), Ok(ServerMessage::AdminStatus { is_admin: true })));

        let remote = client(&server, "192.168.1.5").await;
        assert!(!remote.conn.is_admin);
        let mapped = client(&server, "::ffff:127.0.0.1").await;
        assert!(mapped.conn.is_admin);
        assert_eq!(mapped.conn.ip, "127.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn create_and_join_broadcast_snapshots() {
        let (server, _) = setup();
        let mut alice = client(&server, "10.0.0.1").await;
        let mut bob = client(&server, "10.0.0.2").await;

        let reply = server.handle_message(&alice.conn, create("Alice", None, Some("myroom1"))).await;
        let Some(ReplyPayload::Created { room_id, room }) = reply.payload else {
            panic!("expected created payload");
        };
        assert_eq!(room_id, "MYROOM1");
        assert_eq!(room.host_id, alice.conn.id);
        assert_eq!(alice.kinds(), ["room_updated"]);

        let reply = server.handle_message(&bob.conn, join("myroom1", "Bob", None)).await;
        assert_eq!(room_of(reply).users.len(), 2);
        for client in [&mut alice, &mut bob] {
            let messages = client.drain();
            let rooms = updated_rooms(&messages);
            assert_eq!(rooms.len(), 1);
            assert_eq!(rooms[0].users.len(), 2);
        }

        // Joining again on the same connection changes nothing.
        let reply = server.handle_message(&bob.conn, join("MYROOM1", "Bob", None)).await;
        assert_eq!(room_of(reply).users.len(), 2);

        let dupe = server.handle_message(&bob.conn, create("Bob", None, Some("MYROOM1"))).await;
        assert_eq!(error_of(&dupe), Some(RoomError::NameTaken));
        let bad = server.handle_message(&bob.conn, create("Bob", None, Some("bad room!"))).await;
        assert_eq!(error_of(&bad), Some(RoomError::InvalidName));
    }

    #[tokio::test]
    async fn join_failures_do_not_broadcast() {
        let (server, _) = setup();
        let mut alice = client(&server, "10.0.0.1").await;
        let bob = client(&server, "10.0.0.2").await;
        let reply = server.handle_message(&alice.conn, create("Alice", Some("pw"), None)).await;
        let room_id = room_of(reply).id;
        alice.drain();

        let wrong = server.handle_message(&bob.conn, join(&room_id, "Bob", Some("nope"))).await;
        assert_eq!(error_of(&wrong), Some(RoomError::WrongPassword));
        let missing = server.handle_message(&bob.conn, join("ZZZZ", "Bob", None)).await;
        assert_eq!(error_of(&missing), Some(RoomError::RoomNotFound));
        let blank = server.handle_message(&bob.conn, join(&room_id, "  ", Some("pw"))).await;
        assert_eq!(error_of(&blank), Some(RoomError::InvalidRequest));
        assert!(alice.drain().is_empty());
    }

    #[tokio::test]
    async fn ghosts_are_invisible() {
        let (server, _) = setup();
        let mut alice = client(&server, "10.0.0.1").await;
        let mut admin = client(&server, "127.0.0.1").await;
        let outsider = client(&server, "10.0.0.9").await;
        let room_id = hosted_room(&server, &mut alice, None).await;

        let denied = server
            .handle_message(&outsider.conn, ClientMessage::JoinRoomGhost { room_id: room_id.clone() })
            .await;
        assert_eq!(error_of(&denied), Some(RoomError::Unauthorized));

        let reply = server
            .handle_message(&admin.conn, ClientMessage::JoinRoomGhost { room_id: room_id.clone() })
            .await;
        assert_eq!(room_of(reply).users.len(), 1);
        assert!(alice.drain().is_empty());

        let mut bob = client(&server, "10.0.0.2").await;
        server.handle_message(&bob.conn, join(&room_id, "Bob", None)).await;
        let seen = admin.drain();
        let rooms = updated_rooms(&seen);
        assert_eq!(rooms.len(), 1);
        assert!(rooms[0].users.iter().all(|m| m.connection_id != admin.conn.id));
        alice.drain();
        bob.drain();

        server.disconnect(&admin.conn).await;
        assert!(alice.drain().is_empty());
        assert!(bob.drain().is_empty());
        assert_eq!(server.registry().get_room(&room_id).await.unwrap().users.len(), 2);
    }

    #[tokio::test]
    async fn host_succession_follows_join_order() {
        let (server, _) = setup();
        let mut a = client(&server, "10.0.0.1").await;
        let b = client(&server, "10.0.0.2").await;
        let mut c = client(&server, "10.0.0.3").await;
        let room_id = hosted_room(&server, &mut a, None).await;
        server.handle_message(&b.conn, join(&room_id, "B", None)).await;
        server.handle_message(&c.conn, join(&room_id, "C", None)).await;
        a.drain();
        c.drain();

        let reply = server
            .handle_message(&a.conn, ClientMessage::LeaveRoom { room_id: room_id.clone() })
            .await;
        assert!(reply.success);
        let messages = c.drain();
        let rooms = updated_rooms(&messages);
        assert_eq!(rooms[0].host_id, b.conn.id);
        assert!(a.drain().is_empty());
    }

    #[tokio::test]
    async fn voluntary_leave_keeps_room_for_next_joiner() {
        let (server, _) = setup();
        let mut alice = client(&server, "10.0.0.1").await;
        let room_id = hosted_room(&server, &mut alice, None).await;

        server
            .handle_message(&alice.conn, ClientMessage::LeaveRoom { room_id: room_id.clone() })
            .await;
        let room = server.registry().get_room(&room_id).await.unwrap();
        assert!(room.users.is_empty());
        assert_eq!(room.host_id, "");

        let bob = client(&server, "10.0.0.2").await;
        let reply = server.handle_message(&bob.conn, join(&room_id, "Bob", None)).await;
        assert_eq!(room_of(reply).host_id, bob.conn.id);
    }

    #[tokio::test]
    async fn member_cannot_also_be_a_ghost() {
        let (server, _) = setup();
        let mut admin = client(&server, "127.0.0.1").await;
        let room_id = hosted_room(&server, &mut admin, None).await;

        let reply = server
            .handle_message(&admin.conn, ClientMessage::JoinRoomGhost { room_id: room_id.clone() })
            .await;
        assert!(reply.success);
        server.disconnect(&admin.conn).await;
        assert!(server.registry().get_room(&room_id).await.is_none());

        // A ghost that joins for real stops being a ghost.
        let mut alice = client(&server, "10.0.0.1").await;
        let mut observer = client(&server, "127.0.0.1").await;
        let room_id = hosted_room(&server, &mut alice, None).await;
        server
            .handle_message(&observer.conn, ClientMessage::JoinRoomGhost { room_id: room_id.clone() })
            .await;
        server.handle_message(&observer.conn, join(&room_id, "Olive", None)).await;
        server.disconnect(&alice.conn).await;
        let room = server.registry().get_room(&room_id).await.unwrap();
        assert_eq!(room.host_id, observer.conn.id);
        observer.drain();

        let mut bob = client(&server, "10.0.0.2").await;
        server.handle_message(&bob.conn, join(&room_id, "Bob", None)).await;
        server.disconnect(&observer.conn).await;
        let room = server.registry().get_room(&room_id).await.unwrap();
        assert_eq!(room.host_id, bob.conn.id);
        assert_eq!(room.users.len(), 1);
        bob.drain();
    }

    #[tokio::test]
    async fn subscription_to_a_room_closed_mid_join_is_undone() {
        let (server, _) = setup();
        let mut alice = client(&server, "10.0.0.1").await;
        let bob = client(&server, "10.0.0.2").await;
        let room_id = hosted_room(&server, &mut alice, None).await;
        server
            .registry()
            .join_room(&room_id, bob.conn.member("Bob"), None)
            .await
            .unwrap();

        // Closed after the join committed but before bob subscribed.
        server.registry().delete_room(&room_id).await;
        server.disband(&room_id).await;
        assert_eq!(server.enter_live(&bob.conn.id, &room_id).await, Err(RoomError::RoomNotFound));
        assert!(server.hub().subscribers(&room_id).await.is_empty());
        assert!(!server.memberships.read().await.contains_key(&bob.conn.id));

        let room_id = hosted_room(&server, &mut alice, None).await;
        assert_eq!(server.enter_live(&bob.conn.id, &room_id).await, Ok(()));
        assert!(server.memberships.read().await[&bob.conn.id].contains(&room_id));
    }

    #[tokio::test]
    async fn ungraceful_disconnect_deletes_room_and_tells_ghosts() {
        let (server, blobs) = setup();
        let mut alice = client(&server, "10.0.0.1").await;
        let mut admin = client(&server, "127.0.0.1").await;
        let room_id = hosted_room(&server, &mut alice, None).await;
        server
            .handle_message(&admin.conn, ClientMessage::JoinRoomGhost { room_id: room_id.clone() })
            .await;
        let file = FileRecord {
            id: "f1".into(),
            name: "notes.txt".into(),
            size: 5,
            mime_type: "text/plain".into(),
            sender_id: alice.conn.id.clone(),
            sender_name: "Alice".into(),
            storage: "f1.txt".into(),
            created_at: now_millis(),
        };
        server.registry().add_file(&room_id, file).await.unwrap();

        server.disconnect(&alice.conn).await;

        assert!(server.registry().get_room(&room_id).await.is_none());
        assert_eq!(blobs.deleted(), ["f1.txt"]);
        assert_eq!(admin.kinds(), ["room_closed"]);
        assert!(server.hub().subscribers(&room_id).await.is_empty());
    }

    #[tokio::test]
    async fn reconnect_rebinds_member_and_host() {
        let (server, _) = setup();
        let mut s1 = client(&server, "10.0.0.1").await;
        let reply = server.handle_message(&s1.conn, create("Alice", Some("pw"), None)).await;
        let room_id = room_of(reply).id;
        s1.drain();

        let mut s2 = client(&server, "10.0.0.1").await;
        let reply = server.handle_message(&s2.conn, reconnect(&room_id, "Alice", Some("pw"))).await;
        let room = room_of(reply);
        let alices: Vec<_> = room.users.iter().filter(|m| m.nickname == "Alice").collect();
        assert_eq!(alices.len(), 1);
        assert_eq!(alices[0].connection_id, s2.conn.id);
        assert_eq!(room.host_id, s2.conn.id);
        assert_eq!(s2.kinds(), ["room_updated"]);

        let subscribers = server.hub().subscribers(&room_id).await;
        assert_eq!(subscribers, [s2.conn.id.clone()]);

        // The stale connection finally drops: nothing changes.
        server.disconnect(&s1.conn).await;
        let room = server.registry().get_room(&room_id).await.unwrap();
        assert_eq!(room.host_id, s2.conn.id);
        assert!(s2.drain().is_empty());

        let s3 = client(&server, "10.0.0.1").await;
        let wrong = server.handle_message(&s3.conn, reconnect(&room_id, "Alice", None)).await;
        assert_eq!(error_of(&wrong), Some(RoomError::WrongPassword));
        let gone = server.handle_message(&s3.conn, reconnect("ZZZZ", "Alice", None)).await;
        assert_eq!(error_of(&gone), Some(RoomError::RoomNotFound));

        let fresh = server.handle_message(&s3.conn, reconnect(&room_id, "Carol", Some("pw"))).await;
        assert_eq!(room_of(fresh).users.len(), 2);
    }

    #[tokio::test]
    async fn ban_is_room_scoped_and_sticks_to_the_address() {
        let (server, _) = setup();
        let mut alice = client(&server, "10.0.0.1").await;
        let mut bob = client(&server, "1.2.3.4").await;
        let room_id = hosted_room(&server, &mut alice, None).await;
        server.handle_message(&bob.conn, join(&room_id, "Bob", None)).await;
        alice.drain();
        bob.drain();

        let denied = server
            .handle_message(
                &bob.conn,
                ClientMessage::BanUser {
                    room_id: room_id.clone(),
                    target_id: alice.conn.id.clone(),
                    target_ip: None,
                },
            )
            .await;
        assert_eq!(error_of(&denied), Some(RoomError::Unauthorized));

        let reply = server
            .handle_message(
                &alice.conn,
                ClientMessage::BanUser {
                    room_id: room_id.clone(),
                    target_id: bob.conn.id.clone(),
                    target_ip: Some("1.2.3.4".into()),
                },
            )
            .await;
        assert!(reply.success);
        assert_eq!(bob.kinds(), ["you_were_banned"]);
        assert!(!server.hub().subscribers(&room_id).await.contains(&bob.conn.id));
        let messages = alice.drain();
        assert_eq!(updated_rooms(&messages)[0].users.len(), 1);

        let again = client(&server, "1.2.3.4").await;
        let join_reply = server.handle_message(&again.conn, join(&room_id, "Bob", None)).await;
        assert_eq!(error_of(&join_reply), Some(RoomError::Banned));
        let rejoin = server.handle_message(&again.conn, reconnect(&room_id, "Bob", None)).await;
        assert_eq!(error_of(&rejoin), Some(RoomError::Banned));

        let elsewhere = client(&server, "5.6.7.8").await;
        let admitted = server.handle_message(&elsewhere.conn, join(&room_id, "Bob", None)).await;
        assert!(admitted.success);

        let other_room = hosted_room(&server, &mut client(&server, "10.0.0.7").await, None).await;
        let other = server.handle_message(&again.conn, join(&other_room, "Bob", None)).await;
        assert!(other.success);
    }

    #[tokio::test]
    async fn kick_requires_host_and_notifies_target() {
        let (server, _) = setup();
        let mut alice = client(&server, "10.0.0.1").await;
        let mut bob = client(&server, "10.0.0.2").await;
        let room_id = hosted_room(&server, &mut alice, None).await;
        server.handle_message(&bob.conn, join(&room_id, "Bob", None)).await;
        alice.drain();
        bob.drain();

        let kick = |target: &str| ClientMessage::KickUser {
            room_id: room_id.clone(),
            target_id: target.to_owned(),
        };
        let denied = server.handle_message(&bob.conn, kick(&alice.conn.id)).await;
        assert_eq!(error_of(&denied), Some(RoomError::Unauthorized));

        let reply = server.handle_message(&alice.conn, kick(&bob.conn.id)).await;
        assert!(reply.success);
        assert_eq!(bob.kinds(), ["you_were_kicked"]);
        assert_eq!(alice.kinds(), ["room_updated"]);

        let missing = server.handle_message(&alice.conn, kick(&bob.conn.id)).await;
        assert_eq!(error_of(&missing), Some(RoomError::NotFound));

        // Kicked connections are no longer tracked for the room.
        server.disconnect(&bob.conn).await;
        assert!(alice.drain().is_empty());
    }

    #[tokio::test]
    async fn texts_broadcast_twice_and_need_membership() {
        let (server, _) = setup();
        let mut alice = client(&server, "10.0.0.1").await;
        let bob = client(&server, "10.0.0.2").await;
        let room_id = hosted_room(&server, &mut alice, None).await;

        let send = |content: &str| ClientMessage::SendText {
            room_id: room_id.clone(),
            content: content.to_owned(),
            sender_name: None,
        };
        let reply = server.handle_message(&alice.conn, send("hello")).await;
        let Some(ReplyPayload::Text { text }) = reply.payload else {
            panic!("expected text payload");
        };
        assert_eq!(text.sender_name, "Alice");
        assert_eq!(alice.kinds(), ["new_text", "room_updated"]);

        let outsider = server.handle_message(&bob.conn, send("hi")).await;
        assert_eq!(error_of(&outsider), Some(RoomError::Unauthorized));
        let admin = client(&server, "127.0.0.1").await;
        server
            .handle_message(&admin.conn, ClientMessage::JoinRoomGhost { room_id: room_id.clone() })
            .await;
        let ghost = server.handle_message(&admin.conn, send("boo")).await;
        assert_eq!(error_of(&ghost), Some(RoomError::Unauthorized));
        assert!(alice.drain().is_empty());
        let empty = server.handle_message(&alice.conn, send("   ")).await;
        assert_eq!(error_of(&empty), Some(RoomError::InvalidRequest));

        server.handle_message(&bob.conn, join(&room_id, "Bob", None)).await;
        let delete = ClientMessage::DeleteText {
            room_id: room_id.clone(),
            text_id: text.id.clone(),
        };
        let denied = server.handle_message(&bob.conn, delete.clone()).await;
        assert_eq!(error_of(&denied), Some(RoomError::Unauthorized));
        assert!(server.handle_message(&alice.conn, delete.clone()).await.success);
        let missing = server.handle_message(&alice.conn, delete).await;
        assert_eq!(error_of(&missing), Some(RoomError::NotFound));

        let no_file = server
            .handle_message(
                &alice.conn,
                ClientMessage::DeleteFile {
                    room_id: room_id.clone(),
                    file_id: "nope".into(),
                },
            )
            .await;
        assert_eq!(error_of(&no_file), Some(RoomError::NotFound));
    }

    #[tokio::test]
    async fn admin_close_notifies_before_deleting() {
        let (server, _) = setup();
        let mut alice = client(&server, "10.0.0.1").await;
        let admin = client(&server, "127.0.0.1").await;
        let room_id = hosted_room(&server, &mut alice, None).await;

        let close = ClientMessage::AdminCloseRoom {
            room_id: room_id.clone(),
        };
        let denied = server.handle_message(&alice.conn, close.clone()).await;
        assert_eq!(error_of(&denied), Some(RoomError::Unauthorized));

        assert!(server.handle_message(&admin.conn, close.clone()).await.success);
        assert_eq!(alice.kinds(), ["room_closed"]);
        assert!(server.registry().get_room(&room_id).await.is_none());

        let again = server.handle_message(&admin.conn, close).await;
        assert_eq!(error_of(&again), Some(RoomError::RoomNotFound));

        // Alice's tracked membership went with the room.
        server.disconnect(&alice.conn).await;
    }

    #[tokio::test]
    async fn admin_listing_and_room_checks() {
        let (server, _) = setup();
        let mut alice = client(&server, "10.0.0.1").await;
        let admin = client(&server, "127.0.0.1").await;
        let room_id = hosted_room(&server, &mut alice, None).await;

        let denied = server.handle_message(&alice.conn, ClientMessage::GetAllRooms).await;
        assert_eq!(error_of(&denied), Some(RoomError::Unauthorized));

        let reply = server.handle_message(&admin.conn, ClientMessage::GetAllRooms).await;
        let Some(ReplyPayload::Rooms { rooms }) = reply.payload else {
            panic!("expected rooms payload");
        };
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].user_count, 1);

        let reply = server
            .handle_message(
                &alice.conn,
                ClientMessage::CheckRooms {
                    room_ids: vec![room_id.clone(), "GONE".into()],
                },
            )
            .await;
        let Some(ReplyPayload::Existing { room_ids }) = reply.payload else {
            panic!("expected existing payload");
        };
        assert_eq!(room_ids, [room_id]);
    }
}
