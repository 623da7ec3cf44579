//! A single play session: members, options, broadcast and tick bookkeeping

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use serde::Serialize;
use tracing::{debug, trace};

use crate::net::protocol::Packet;
use crate::net::{Connection, ConnectionId};
use crate::session::{Difficulty, GameMode, SessionError, SessionId};

struct Member {
    conn: Arc<Connection>,
    login: String,
    joined_at: Instant,
}

/// Outcome of a broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Serializable view of a session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub difficulty: Difficulty,
    pub mode: GameMode,
    pub members: Vec<String>,
    pub max_players: usize,
    pub host: Option<String>,
    pub created_at: DateTime<Utc>,
    pub tick_count: u64,
    pub elapsed_secs: f64,
}

pub struct GameSession {
    id: SessionId,
    pub difficulty: Difficulty,
    pub mode: GameMode,
    max_players: usize,
    created_at: DateTime<Utc>,
    members: HashMap<ConnectionId, Member>,
    host: Option<ConnectionId>,
    elapsed: Duration,
    tick_count: u64,
    closed: bool,
}

impl GameSession {
    pub fn new(id: SessionId, max_players: usize) -> Self {
        Self::with_options(id, max_players, Difficulty::default(), GameMode::default())
    }

    pub fn with_options(id: SessionId, max_players: usize, difficulty: Difficulty, mode: GameMode) -> Self {
        Self {
            id,
            difficulty,
            mode,
            max_players,
            created_at: Utc::now(),
            members: HashMap::new(),
            host: None,
            elapsed: Duration::ZERO,
            tick_count: 0,
            closed: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn max_players(&self) -> usize {
        self.max_players
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.members.len() >= self.max_players
    }

    pub fn is_member(&self, id: ConnectionId) -> bool {
        self.members.contains_key(&id)
    }

    pub fn host(&self) -> Option<ConnectionId> {
        self.host
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub(crate) fn mark_closed(&mut self) {
        self.closed = true;
    }

    pub fn member_ids(&self) -> Vec<ConnectionId> {
        self.members.keys().copied().collect()
    }

    pub fn member_logins(&self) -> Vec<String> {
        let mut members: Vec<&Member> = self.members.values().collect();
        members.sort_by_key(|m| m.joined_at);
        members.into_iter().map(|m| m.login.clone()).collect()
    }

    /// Add `conn` as a member and point its session association here
    ///
    /// Fails without side effects when the session is full or closed, or
    /// when the connection already belongs to a session.
    pub fn join(&mut self, conn: &Arc<Connection>) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::NotFound(self.id));
        }
        if self.members.contains_key(&conn.id()) {
            return Err(SessionError::AlreadyMember);
        }
        if self.is_full() {
            return Err(SessionError::Full {
                max: self.max_players,
            });
        }
        if !conn.claim_session(self.id) {
            return Err(match conn.session() {
                Some(other) => SessionError::InAnotherSession(other),
                None => SessionError::AlreadyMember,
            });
        }

        let login = conn.login().unwrap_or_else(|| conn.id().to_string());
        debug!(session = %self.id, conn = %conn.id(), login = %login, "Member joined");
        self.members.insert(
            conn.id(),
            Member {
                conn: Arc::clone(conn),
                login,
                joined_at: Instant::now(),
            },
        );
        if self.host.is_none() {
            self.host = Some(conn.id());
        }
        Ok(())
    }

    /// Remove a member and clear its association; returns its login
    pub fn leave(&mut self, id: ConnectionId) -> Option<String> {
        let member = self.members.remove(&id)?;
        member.conn.release_session(self.id);
        if self.host == Some(id) {
            self.host = self
                .members
                .iter()
                .min_by_key(|(_, m)| m.joined_at)
                .map(|(id, _)| *id);
        }
        debug!(session = %self.id, conn = %id, remaining = self.members.len(), "Member left");
        Some(member.login)
    }

    /// Change difficulty and mode; only the host may do this
    pub fn set_options(&mut self, by: ConnectionId, difficulty: Difficulty, mode: GameMode) -> Result<(), SessionError> {
        if !self.members.contains_key(&by) {
            return Err(SessionError::NotMember);
        }
        if self.host != Some(by) {
            return Err(SessionError::NotHost);
        }
        self.difficulty = difficulty;
        self.mode = mode;
        Ok(())
    }

    /// Queue `packet` on every member except `excluding`
    ///
    /// A failed send to one member never stops delivery to the others.
    pub fn broadcast(&self, packet: &Packet, excluding: Option<ConnectionId>) -> BroadcastReport {
        let payload = packet.encode();
        let mut report = BroadcastReport::default();

        for (id, member) in &self.members {
            if Some(*id) == excluding {
                continue;
            }
            match member.conn.send_bytes(payload.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    debug!(session = %self.id, conn = %id, "Broadcast send failed: {}", e);
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Advance session time and drop members whose connection is gone
    ///
    /// Performs no I/O. Returns the logins of pruned members.
    pub fn tick(&mut self, delta: Duration) -> Vec<String> {
        self.elapsed += delta;
        self.tick_count += 1;

        let dead: Vec<ConnectionId> = self
            .members
            .iter()
            .filter(|(_, m)| !m.conn.is_connected())
            .map(|(id, _)| *id)
            .collect();

        let pruned: Vec<String> = dead.into_iter().filter_map(|id| self.leave(id)).collect();
        if !pruned.is_empty() {
            trace!(session = %self.id, count = pruned.len(), "Pruned disconnected members");
        }
        pruned
    }

    /// Remove every member, clearing their associations
    pub fn clear(&mut self) -> usize {
        let ids = self.member_ids();
        ids.into_iter().filter_map(|id| self.leave(id)).count()
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id,
            difficulty: self.difficulty,
            mode: self.mode,
            members: self.member_logins(),
            max_players: self.max_players,
            host: self
                .host
                .and_then(|id| self.members.get(&id))
                .map(|m| m.login.clone()),
            created_at: self.created_at,
            tick_count: self.tick_count,
            elapsed_secs: self.elapsed.as_secs_f64(),
        }
    }
}
