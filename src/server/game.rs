//! Game server: characters and play sessions for authenticated clients
//!
//! Session replies share one body layout:
//! `[status:u8][session_id:u32][difficulty:u8][mode:u8]`, status 0 on success.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::auth::Authenticator;
use crate::metrics::Metrics;
use crate::net::framing::{FrameBuilder, FrameReader};
use crate::net::protocol::{game_method, service, BodyError, Packet};
use crate::net::Connection;
use crate::server::{PacketHandler, ServiceGate};
use crate::session::{Difficulty, GameMode, SessionError, SessionId, SessionManager, SessionSummary};
use crate::store::{CharacterRecord, StoreError};

/// Longest chat text relayed, in bytes
pub const MAX_CHAT_LEN: usize = 512;

const STATUS_OK: u8 = 0;

pub struct GameHandler {
    gate: ServiceGate,
    sessions: Arc<SessionManager>,
    metrics: Arc<Metrics>,
}

impl GameHandler {
    pub fn new(auth: Authenticator, sessions: Arc<SessionManager>, metrics: Arc<Metrics>) -> Self {
        Self {
            gate: ServiceGate::new(auth),
            sessions,
            metrics,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    async fn character_list(&self, conn: &Arc<Connection>, packet: &Packet) {
        let Some(login) = conn.login() else {
            return;
        };

        let store = Arc::clone(self.gate.authenticator().store());
        let lookup = login.clone();
        let result = tokio::task::spawn_blocking(move || store.characters(&lookup))
            .await
            .unwrap_or_else(|e| Err(StoreError::Unavailable(format!("lookup task failed: {}", e))));

        let characters = match result {
            Ok(characters) => characters,
            Err(e) => {
                error!(conn = %conn.id(), login = %login, "Character lookup failed: {}", e);
                Vec::new()
            }
        };

        if !conn.is_connected() {
            return;
        }
        debug!(conn = %conn.id(), login = %login, count = characters.len(), "Character list");
        self.reply(conn, packet.reply(game_method::CHARACTER_LIST_RESPONSE, character_list_body(&characters)));
    }

    fn create_session(&self, conn: &Arc<Connection>, packet: &Packet) {
        let options = if packet.body.is_empty() {
            Ok((Difficulty::default(), GameMode::default()))
        } else {
            match read_options(&packet.body) {
                Ok(raw) => decode_options(raw),
                Err(e) => return self.malformed(conn, packet, e),
            }
        };

        let result = options.and_then(|(difficulty, mode)| self.sessions.create_and_join(conn, difficulty, mode));
        self.joined(conn, packet, result);
    }

    fn join_session(&self, conn: &Arc<Connection>, packet: &Packet) {
        let mut reader = FrameReader::new(&packet.body);
        let Some(raw_id) = reader.read_u32() else {
            let e = BodyError::Truncated {
                needed: 4,
                available: packet.body.len(),
            };
            return self.malformed(conn, packet, e);
        };

        let result = match raw_id {
            0 => self.sessions.find_or_create_and_join(conn),
            id => self.sessions.join(SessionId(id), conn),
        };
        self.joined(conn, packet, result);
    }

    fn joined(&self, conn: &Arc<Connection>, packet: &Packet, result: Result<SessionSummary, SessionError>) {
        match result {
            Ok(summary) => {
                let login = conn.login().unwrap_or_default();
                info!(conn = %conn.id(), login = %login, session = %summary.id, members = summary.members.len(), "Joined session");
                self.respond(conn, packet, SessionReply::from_summary(&summary));
                self.notify(summary.id, game_method::PLAYER_JOINED, login_body(&login), Some(conn));
                self.audit(conn, "Joined game session", AuditOutcome::Success, summary.id.to_string());
            }
            Err(e) => {
                debug!(conn = %conn.id(), "Session join refused: {}", e);
                self.respond(conn, packet, SessionReply::error(&e, conn.session()));
            }
        }
    }

    fn leave_session(&self, conn: &Arc<Connection>, packet: &Packet) {
        match self.sessions.leave(conn) {
            Ok(departure) => {
                info!(conn = %conn.id(), session = %departure.session, remaining = departure.remaining, "Left session");
                self.respond(conn, packet, SessionReply::left(departure.session));
                self.notify(departure.session, game_method::PLAYER_LEFT, login_body(&departure.login), None);
                self.audit(conn, "Left game session", AuditOutcome::Success, departure.session.to_string());
            }
            Err(e) => self.respond(conn, packet, SessionReply::error(&e, None)),
        }
    }

    fn chat(&self, conn: &Arc<Connection>, packet: &Packet) {
        let Some(session) = conn.session() else {
            return self.respond(conn, packet, SessionReply::error(&SessionError::NotMember, None));
        };
        let text = match std::str::from_utf8(&packet.body) {
            Ok(text) => truncate_utf8(text, MAX_CHAT_LEN),
            Err(_) => return self.malformed(conn, packet, BodyError::InvalidText("chat text")),
        };

        let login = conn.login().unwrap_or_default();
        let body = FrameBuilder::with_capacity(1 + login.len() + text.len())
            .write_str8(&login)
            .write(text.as_bytes())
            .build();
        let message = Packet::new(service::GAME_UTILITIES, game_method::CHAT_MESSAGE, 0, body);

        match self.sessions.broadcast(session, &message, Some(conn.id())) {
            Ok(report) => debug!(session = %session, delivered = report.delivered, failed = report.failed, "Chat relayed"),
            Err(e) => self.respond(conn, packet, SessionReply::error(&e, None)),
        }
    }

    fn set_options(&self, conn: &Arc<Connection>, packet: &Packet) {
        let raw = match read_options(&packet.body) {
            Ok(raw) => raw,
            Err(e) => return self.malformed(conn, packet, e),
        };

        let result = decode_options(raw)
            .and_then(|(difficulty, mode)| self.sessions.set_options(conn, difficulty, mode));
        match result {
            Ok(summary) => {
                let reply = SessionReply::from_summary(&summary);
                self.respond(conn, packet, reply);
                let update = Packet::new(service::GAME_UTILITIES, game_method::SESSION_RESPONSE, 0, reply.encode());
                if let Err(e) = self.sessions.broadcast(summary.id, &update, Some(conn.id())) {
                    debug!(session = %summary.id, "Options update not broadcast: {}", e);
                }
                self.audit(
                    conn,
                    "Changed session options",
                    AuditOutcome::Success,
                    format!("{} {:?} {:?}", summary.id, summary.difficulty, summary.mode),
                );
            }
            Err(e) => self.respond(conn, packet, SessionReply::error(&e, conn.session())),
        }
    }

    fn respond(&self, conn: &Arc<Connection>, request: &Packet, reply: SessionReply) {
        self.reply(conn, request.reply(game_method::SESSION_RESPONSE, reply.encode()));
    }

    fn reply(&self, conn: &Arc<Connection>, packet: Packet) {
        if let Err(e) = conn.send(&packet) {
            debug!(conn = %conn.id(), "Reply not sent: {}", e);
        }
    }

    /// Notify the members of `session`, skipping `excluding`
    fn notify(&self, session: SessionId, method: u16, body: Vec<u8>, excluding: Option<&Arc<Connection>>) {
        let packet = Packet::new(service::GAME_UTILITIES, method, 0, body);
        if let Err(e) = self.sessions.broadcast(session, &packet, excluding.map(|c| c.id())) {
            debug!(session = %session, "Notification dropped: {}", e);
        }
    }

    fn malformed(&self, conn: &Arc<Connection>, packet: &Packet, e: BodyError) {
        warn!(conn = %conn.id(), method = packet.method_id, "Malformed game request: {}", e);
    }

    fn audit(&self, conn: &Connection, description: &str, outcome: AuditOutcome, details: String) {
        let actor = conn.login().unwrap_or_else(|| AuditRecord::UNKNOWN_ACTOR.to_string());
        self.gate.authenticator().audit().record(
            AuditRecord::new(actor, conn.remote_addr().to_string(), AuditCategory::GameSession, description, outcome)
                .with_details(details),
        );
    }
}

impl PacketHandler for GameHandler {
    fn name(&self) -> &'static str {
        "game"
    }

    async fn handle(&self, conn: Arc<Connection>, packet: Packet) {
        let Some(packet) = self.gate.route(&conn, packet).await else {
            return;
        };
        if packet.service_id != service::GAME_UTILITIES {
            debug!(conn = %conn.id(), service = packet.service_id, "Service not served by the game server");
            return;
        }

        match packet.method_id {
            game_method::CHARACTER_LIST_REQUEST => self.character_list(&conn, &packet).await,
            game_method::CREATE_SESSION => self.create_session(&conn, &packet),
            game_method::JOIN_SESSION => self.join_session(&conn, &packet),
            game_method::LEAVE_SESSION => self.leave_session(&conn, &packet),
            game_method::SESSION_CHAT => self.chat(&conn, &packet),
            game_method::SET_SESSION_OPTIONS => self.set_options(&conn, &packet),
            other => debug!(conn = %conn.id(), method = other, "Unknown game method"),
        }
    }

    fn on_disconnect(&self, conn: &Arc<Connection>) {
        if conn.session().is_none() {
            return;
        }
        match self.sessions.leave(conn) {
            Ok(departure) => {
                info!(conn = %conn.id(), session = %departure.session, "Disconnected player removed from session");
                self.notify(departure.session, game_method::PLAYER_LEFT, login_body(&departure.login), None);
                self.audit(conn, "Left game session", AuditOutcome::Warning, format!("{} (disconnected)", departure.session));
            }
            Err(e) => debug!(conn = %conn.id(), "Nothing to leave on disconnect: {}", e),
        }
    }

    fn tick(&self, delta: Duration) {
        for departure in self.sessions.tick_all(delta) {
            debug!(session = %departure.session, login = %departure.login, "Pruned disconnected member");
            self.notify(departure.session, game_method::PLAYER_LEFT, login_body(&departure.login), None);
        }
    }

    fn sweep(&self) {
        self.sessions.sweep_empty();
        self.metrics
            .set_sessions(self.sessions.count(), self.sessions.player_count());
    }
}

/// Body of a `SESSION_RESPONSE`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionReply {
    pub status: u8,
    pub session: u32,
    pub difficulty: u8,
    pub mode: u8,
}

impl SessionReply {
    pub fn from_summary(summary: &SessionSummary) -> Self {
        Self {
            status: STATUS_OK,
            session: summary.id.0,
            difficulty: summary.difficulty as u8,
            mode: summary.mode as u8,
        }
    }

    pub fn left(session: SessionId) -> Self {
        Self {
            status: STATUS_OK,
            session: session.0,
            difficulty: 0,
            mode: 0,
        }
    }

    pub fn error(e: &SessionError, current: Option<SessionId>) -> Self {
        Self {
            status: e.status_code(),
            session: current.map_or(0, |id| id.0),
            difficulty: 0,
            mode: 0,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        FrameBuilder::with_capacity(7)
            .write_u8(self.status)
            .write_u32(self.session)
            .write_u8(self.difficulty)
            .write_u8(self.mode)
            .build()
    }

    pub fn decode(body: &[u8]) -> Result<Self, BodyError> {
        let mut reader = FrameReader::new(body);
        let truncated = BodyError::Truncated {
            needed: 7,
            available: body.len(),
        };
        Ok(Self {
            status: reader.read_u8().ok_or(truncated.clone())?,
            session: reader.read_u32().ok_or(truncated.clone())?,
            difficulty: reader.read_u8().ok_or(truncated.clone())?,
            mode: reader.read_u8().ok_or(truncated)?,
        })
    }
}

/// `[count:u8]{[id:u64][nameLen:u8][name][class:u8][level:u8]}`, at most 255 entries
pub fn character_list_body(characters: &[CharacterRecord]) -> Vec<u8> {
    let count = characters.len().min(u8::MAX as usize);
    characters
        .iter()
        .take(count)
        .fold(FrameBuilder::new().write_u8(count as u8), |builder, c| {
            builder
                .write_u64(c.id)
                .write_str8(&c.name)
                .write_u8(c.class_id)
                .write_u8(c.level)
        })
        .build()
}

fn login_body(login: &str) -> Vec<u8> {
    FrameBuilder::with_capacity(1 + login.len()).write_str8(login).build()
}

fn read_options(body: &[u8]) -> Result<(u8, u8), BodyError> {
    let mut reader = FrameReader::new(body);
    match (reader.read_u8(), reader.read_u8()) {
        (Some(difficulty), Some(mode)) => Ok((difficulty, mode)),
        _ => Err(BodyError::Truncated {
            needed: 2,
            available: body.len(),
        }),
    }
}

fn decode_options((difficulty, mode): (u8, u8)) -> Result<(Difficulty, GameMode), SessionError> {
    Ok((Difficulty::try_from(difficulty)?, GameMode::try_from(mode)?))
}

fn truncate_utf8(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::net::framing;
    use crate::net::protocol::{connection_method, message_type, read_short_string};
    use crate::net::ConnectionId;
    use crate::store::MemoryAccountStore;
    use bytes::Bytes;
    use std::net::SocketAddr;
    use std::num::NonZeroU32;
    use tokio::io::DuplexStream;

    struct Fixture {
        handler: GameHandler,
        store: Arc<MemoryAccountStore>,
        audit: Arc<AuditLog>,
        metrics: Arc<Metrics>,
    }

    fn fixture(max_players: usize) -> Fixture {
        let store = Arc::new(MemoryAccountStore::with_iterations(NonZeroU32::new(100).unwrap()));
        for login in ["alice", "bob", "carol"] {
            store.create_account(login, "", "secret").unwrap();
        }
        let audit = Arc::new(AuditLog::in_memory(64));
        let metrics = Arc::new(Metrics::new());
        let auth = Authenticator::new(store.clone(), audit.clone(), metrics.clone());
        let sessions = Arc::new(SessionManager::new(max_players, 16));
        Fixture {
            handler: GameHandler::new(auth, sessions, metrics.clone()),
            store,
            audit,
            metrics,
        }
    }

    fn player(id: u64, login: &str) -> (Arc<Connection>, DuplexStream) {
        let (client, server) = tokio::io::duplex(8192);
        let addr: SocketAddr = "192.168.1.20:5000".parse().unwrap();
        let conn = Connection::new(ConnectionId(id), addr, server, Arc::new(Metrics::new()));
        conn.begin_auth();
        conn.complete_auth(login.to_string());
        (conn, client)
    }

    fn request(method: u16, correlation: u32, body: Vec<u8>) -> Packet {
        Packet::new(service::GAME_UTILITIES, method, correlation, body)
    }

    async fn next(client: &mut DuplexStream) -> Packet {
        framing::read_packet(client).await.unwrap()
    }

    async fn session_reply(client: &mut DuplexStream) -> SessionReply {
        let packet = next(client).await;
        assert_eq!(packet.method_id, game_method::SESSION_RESPONSE);
        SessionReply::decode(&packet.body).unwrap()
    }

    #[tokio::test]
    async fn test_character_list() {
        let f = fixture(4);
        f.store.add_character("alice", "Valla", 3, 70).unwrap();
        f.store.add_character("alice", "Li-Ming", 6, 12).unwrap();
        let (conn, mut client) = player(1, "alice");

        f.handler.handle(conn, request(game_method::CHARACTER_LIST_REQUEST, 9, Vec::new())).await;

        let reply = next(&mut client).await;
        assert_eq!(reply.method_id, game_method::CHARACTER_LIST_RESPONSE);
        assert_eq!(reply.correlation_id, 9);

        let mut reader = FrameReader::new(&reply.body);
        assert_eq!(reader.read_u8(), Some(2));
        reader.read_u64().unwrap();
        assert_eq!(read_short_string(&mut reader, "name").unwrap(), "Valla");
        assert_eq!(reader.read_u8(), Some(3));
        assert_eq!(reader.read_u8(), Some(70));
        reader.read_u64().unwrap();
        assert_eq!(read_short_string(&mut reader, "name").unwrap(), "Li-Ming");
    }

    #[tokio::test]
    async fn test_character_list_store_outage_returns_empty() {
        let f = fixture(4);
        f.store.set_available(false);
        let (conn, mut client) = player(1, "alice");

        f.handler.handle(conn.clone(), request(game_method::CHARACTER_LIST_REQUEST, 1, Vec::new())).await;

        assert_eq!(&next(&mut client).await.body[..], &[0]);
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn test_create_session_with_options() {
        let f = fixture(4);
        let (conn, mut client) = player(1, "alice");

        f.handler.handle(conn.clone(), request(game_method::CREATE_SESSION, 4, vec![6, 2])).await;

        let reply = session_reply(&mut client).await;
        assert_eq!(reply.status, 0);
        assert_eq!(reply.difficulty, Difficulty::Torment3 as u8);
        assert_eq!(reply.mode, GameMode::Rift as u8);
        assert_eq!(conn.session(), Some(SessionId(reply.session)));
        assert_eq!(f.audit.recent(1)[0].category, AuditCategory::GameSession);
    }

    #[tokio::test]
    async fn test_create_session_rejects_bad_difficulty() {
        let f = fixture(4);
        let (conn, mut client) = player(1, "alice");

        f.handler.handle(conn.clone(), request(game_method::CREATE_SESSION, 4, vec![42, 0])).await;

        assert_eq!(session_reply(&mut client).await.status, 7);
        assert!(conn.session().is_none());
        assert_eq!(f.handler.sessions().count(), 0);
    }

    #[tokio::test]
    async fn test_join_notifies_existing_members() {
        let f = fixture(4);
        let (alice, mut alice_client) = player(1, "alice");
        let (bob, mut bob_client) = player(2, "bob");

        f.handler.handle(alice, request(game_method::CREATE_SESSION, 1, Vec::new())).await;
        let created = session_reply(&mut alice_client).await;

        f.handler
            .handle(bob.clone(), request(game_method::JOIN_SESSION, 2, created.session.to_be_bytes().to_vec()))
            .await;
        let joined = session_reply(&mut bob_client).await;
        assert_eq!(joined.status, 0);
        assert_eq!(joined.session, created.session);

        let notice = next(&mut alice_client).await;
        assert_eq!(notice.method_id, game_method::PLAYER_JOINED);
        let mut reader = FrameReader::new(&notice.body);
        assert_eq!(read_short_string(&mut reader, "login").unwrap(), "bob");
    }

    #[tokio::test]
    async fn test_join_zero_finds_open_session() {
        let f = fixture(4);
        let (alice, mut alice_client) = player(1, "alice");
        let (bob, mut bob_client) = player(2, "bob");

        f.handler.handle(alice, request(game_method::JOIN_SESSION, 1, vec![0, 0, 0, 0])).await;
        f.handler.handle(bob, request(game_method::JOIN_SESSION, 1, vec![0, 0, 0, 0])).await;

        let first = session_reply(&mut alice_client).await;
        let second = session_reply(&mut bob_client).await;
        assert_eq!(first.session, second.session);
        assert_eq!(f.handler.sessions().count(), 1);
    }

    #[tokio::test]
    async fn test_full_session_refuses_join() {
        let f = fixture(1);
        let (alice, mut alice_client) = player(1, "alice");
        let (bob, mut bob_client) = player(2, "bob");

        f.handler.handle(alice, request(game_method::CREATE_SESSION, 1, Vec::new())).await;
        let created = session_reply(&mut alice_client).await;

        f.handler
            .handle(bob.clone(), request(game_method::JOIN_SESSION, 2, created.session.to_be_bytes().to_vec()))
            .await;

        assert_eq!(session_reply(&mut bob_client).await.status, SessionError::Full { max: 1 }.status_code());
        assert!(bob.session().is_none());
        let handle = f.handler.sessions().get(SessionId(created.session)).unwrap();
        assert_eq!(handle.lock().member_count(), 1);
    }

    #[tokio::test]
    async fn test_chat_reaches_others_only() {
        let f = fixture(4);
        let (alice, mut alice_client) = player(1, "alice");
        let (bob, mut bob_client) = player(2, "bob");

        f.handler.handle(alice.clone(), request(game_method::CREATE_SESSION, 1, Vec::new())).await;
        let created = session_reply(&mut alice_client).await;
        f.handler
            .handle(bob, request(game_method::JOIN_SESSION, 2, created.session.to_be_bytes().to_vec()))
            .await;
        session_reply(&mut bob_client).await;
        next(&mut alice_client).await; // PLAYER_JOINED

        f.handler
            .handle(alice.clone(), request(game_method::SESSION_CHAT, 3, b"hello".to_vec()))
            .await;

        let chat = next(&mut bob_client).await;
        assert_eq!(chat.method_id, game_method::CHAT_MESSAGE);
        let mut reader = FrameReader::new(&chat.body);
        assert_eq!(read_short_string(&mut reader, "login").unwrap(), "alice");
        assert_eq!(reader.remaining(), b"hello");

        // Sender gets nothing back: its next packet is the pong
        let ping = Packet::new(service::CONNECTION, connection_method::PING, 50, vec![message_type::PING]);
        f.handler.handle(alice, ping).await;
        assert_eq!(next(&mut alice_client).await.correlation_id, 50);
    }

    #[tokio::test]
    async fn test_only_host_sets_options() {
        let f = fixture(4);
        let (alice, mut alice_client) = player(1, "alice");
        let (bob, mut bob_client) = player(2, "bob");

        f.handler.handle(alice.clone(), request(game_method::CREATE_SESSION, 1, Vec::new())).await;
        let created = session_reply(&mut alice_client).await;
        f.handler
            .handle(bob.clone(), request(game_method::JOIN_SESSION, 2, created.session.to_be_bytes().to_vec()))
            .await;
        session_reply(&mut bob_client).await;
        next(&mut alice_client).await; // PLAYER_JOINED

        f.handler.handle(bob, request(game_method::SET_SESSION_OPTIONS, 3, vec![9, 3])).await;
        assert_eq!(session_reply(&mut bob_client).await.status, SessionError::NotHost.status_code());

        f.handler.handle(alice, request(game_method::SET_SESSION_OPTIONS, 4, vec![9, 3])).await;
        let updated = session_reply(&mut alice_client).await;
        assert_eq!(updated.status, 0);
        assert_eq!(updated.difficulty, 9);

        let broadcast = session_reply(&mut bob_client).await;
        assert_eq!(broadcast.mode, GameMode::GreaterRift as u8);
    }

    #[tokio::test]
    async fn test_leave_then_sweep_reclaims_session() {
        let f = fixture(4);
        let (alice, mut alice_client) = player(1, "alice");

        f.handler.handle(alice.clone(), request(game_method::CREATE_SESSION, 1, Vec::new())).await;
        let created = session_reply(&mut alice_client).await;

        f.handler.handle(alice.clone(), request(game_method::LEAVE_SESSION, 2, Vec::new())).await;
        let left = session_reply(&mut alice_client).await;
        assert_eq!(left.status, 0);
        assert_eq!(left.session, created.session);
        assert!(alice.session().is_none());

        f.handler.sweep();
        assert_eq!(f.handler.sessions().count(), 0);
        assert_eq!(f.metrics.sessions_active.load(std::sync::atomic::Ordering::Relaxed), 0);

        f.handler.handle(alice, request(game_method::LEAVE_SESSION, 3, Vec::new())).await;
        assert_eq!(session_reply(&mut alice_client).await.status, SessionError::NotMember.status_code());
    }

    #[tokio::test]
    async fn test_disconnect_notifies_remaining_members() {
        let f = fixture(4);
        let (alice, mut alice_client) = player(1, "alice");
        let (bob, mut bob_client) = player(2, "bob");

        f.handler.handle(alice.clone(), request(game_method::CREATE_SESSION, 1, Vec::new())).await;
        let created = session_reply(&mut alice_client).await;
        f.handler
            .handle(bob.clone(), request(game_method::JOIN_SESSION, 2, created.session.to_be_bytes().to_vec()))
            .await;
        session_reply(&mut bob_client).await;
        next(&mut alice_client).await; // PLAYER_JOINED

        bob.close();
        f.handler.on_disconnect(&bob);

        let notice = next(&mut alice_client).await;
        assert_eq!(notice.method_id, game_method::PLAYER_LEFT);
        let mut reader = FrameReader::new(&notice.body);
        assert_eq!(read_short_string(&mut reader, "login").unwrap(), "bob");
        assert!(bob.session().is_none());
    }

    #[tokio::test]
    async fn test_malformed_join_is_dropped() {
        let f = fixture(4);
        let (alice, mut alice_client) = player(1, "alice");

        f.handler.handle(alice.clone(), request(game_method::JOIN_SESSION, 1, vec![0, 1])).await;
        assert!(alice.is_connected());
        assert!(alice.session().is_none());

        let ping = Packet::new(service::CONNECTION, connection_method::PING, 2, Bytes::from_static(&[0x03]));
        f.handler.handle(alice, ping).await;
        assert_eq!(next(&mut alice_client).await.correlation_id, 2);
    }

    #[test]
    fn test_truncate_utf8_respects_char_boundaries() {
        assert_eq!(truncate_utf8("hello", 10), "hello");
        assert_eq!(truncate_utf8("héllo", 2), "h");
        assert_eq!(truncate_utf8("héllo", 3), "hé");
    }

    #[test]
    fn test_character_list_caps_count() {
        let record = CharacterRecord {
            id: 1,
            account_id: 1,
            name: "x".to_string(),
            class_id: 0,
            level: 1,
            hardcore: false,
            created_at: chrono::Utc::now(),
        };
        let body = character_list_body(&vec![record; 300]);
        assert_eq!(body[0], 255);
        assert_eq!(body.len(), 1 + 255 * (8 + 2 + 1 + 1));
    }
}
