//! Session registry owned by the game server
//!
//! Lock order is registry map, then session. Callers that only need one
//! session clone its handle and release the map lock first.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::net::protocol::Packet;
use crate::net::{Connection, ConnectionId};
use crate::session::{
    BroadcastReport, Difficulty, GameMode, GameSession, SessionError, SessionId, SessionSummary,
};

pub type SessionHandle = Arc<Mutex<GameSession>>;

/// Result of a successful leave
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub session: SessionId,
    pub login: String,
    pub remaining: usize,
}

pub struct SessionManager {
    sessions: Mutex<HashMap<SessionId, SessionHandle>>,
    next_id: AtomicU32,
    max_players: usize,
    max_sessions: usize,
}

impl SessionManager {
    pub fn new(max_players: usize, max_sessions: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            max_players,
            max_sessions,
        }
    }

    pub fn max_players(&self) -> usize {
        self.max_players
    }

    /// Allocate a new empty session
    pub fn create(&self, difficulty: Difficulty, mode: GameMode) -> Result<SessionId, SessionError> {
        let mut sessions = self.sessions.lock();
        let session = self.allocate(&sessions, difficulty, mode)?;
        let id = session.id();
        sessions.insert(id, Arc::new(Mutex::new(session)));

        info!(session = %id, ?difficulty, ?mode, "Session created");
        Ok(id)
    }

    fn allocate(
        &self,
        sessions: &HashMap<SessionId, SessionHandle>,
        difficulty: Difficulty,
        mode: GameMode,
    ) -> Result<GameSession, SessionError> {
        if sessions.len() >= self.max_sessions {
            return Err(SessionError::TooManySessions {
                max: self.max_sessions,
            });
        }
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        Ok(GameSession::with_options(id, self.max_players, difficulty, mode))
    }

    pub fn get(&self, id: SessionId) -> Option<SessionHandle> {
        self.sessions.lock().get(&id).cloned()
    }

    /// Join `conn` to an existing session
    pub fn join(&self, id: SessionId, conn: &Arc<Connection>) -> Result<SessionSummary, SessionError> {
        let handle = self.get(id).ok_or(SessionError::NotFound(id))?;
        let mut session = handle.lock();
        session.join(conn)?;
        Ok(session.summary())
    }

    /// Create a session and make `conn` its first member (and host)
    pub fn create_and_join(
        &self,
        conn: &Arc<Connection>,
        difficulty: Difficulty,
        mode: GameMode,
    ) -> Result<SessionSummary, SessionError> {
        if let Some(current) = conn.session() {
            return Err(SessionError::InAnotherSession(current));
        }
        // Joined before it is published so a concurrent sweep never sees it empty
        let mut sessions = self.sessions.lock();
        let mut session = self.allocate(&sessions, difficulty, mode)?;
        session.join(conn)?;
        let summary = session.summary();
        sessions.insert(summary.id, Arc::new(Mutex::new(session)));

        info!(session = %summary.id, ?difficulty, ?mode, "Session created");
        Ok(summary)
    }

    /// Join the first open session, creating one when none has room
    pub fn find_or_create_and_join(&self, conn: &Arc<Connection>) -> Result<SessionSummary, SessionError> {
        if let Some(current) = conn.session() {
            return Err(SessionError::InAnotherSession(current));
        }

        let mut candidates: Vec<(SessionId, SessionHandle)> = self
            .sessions
            .lock()
            .iter()
            .map(|(id, handle)| (*id, Arc::clone(handle)))
            .collect();
        candidates.sort_by_key(|(id, _)| *id);

        for (_, handle) in candidates {
            let mut session = handle.lock();
            match session.join(conn) {
                Ok(()) => return Ok(session.summary()),
                Err(SessionError::Full { .. }) | Err(SessionError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        self.create_and_join(conn, Difficulty::default(), GameMode::default())
    }

    /// Remove `conn` from whatever session it belongs to
    pub fn leave(&self, conn: &Connection) -> Result<Departure, SessionError> {
        let id = conn.session().ok_or(SessionError::NotMember)?;
        let Some(handle) = self.get(id) else {
            conn.release_session(id);
            return Err(SessionError::NotFound(id));
        };

        let mut session = handle.lock();
        let login = session.leave(conn.id()).ok_or(SessionError::NotMember)?;
        Ok(Departure {
            session: id,
            login,
            remaining: session.member_count(),
        })
    }

    pub fn set_options(
        &self,
        conn: &Connection,
        difficulty: Difficulty,
        mode: GameMode,
    ) -> Result<SessionSummary, SessionError> {
        let id = conn.session().ok_or(SessionError::NotMember)?;
        let handle = self.get(id).ok_or(SessionError::NotFound(id))?;
        let mut session = handle.lock();
        session.set_options(conn.id(), difficulty, mode)?;
        Ok(session.summary())
    }

    pub fn broadcast(
        &self,
        id: SessionId,
        packet: &Packet,
        excluding: Option<ConnectionId>,
    ) -> Result<BroadcastReport, SessionError> {
        let handle = self.get(id).ok_or(SessionError::NotFound(id))?;
        let session = handle.lock();
        Ok(session.broadcast(packet, excluding))
    }

    /// Tick every live session; returns members pruned for having disconnected
    ///
    /// Each session is locked on its own, so a busy session never holds up
    /// the registry or its neighbours.
    pub fn tick_all(&self, delta: Duration) -> Vec<Departure> {
        let handles: Vec<SessionHandle> = self.sessions.lock().values().cloned().collect();
        let mut departures = Vec::new();
        for handle in &handles {
            let mut session = handle.lock();
            if session.is_empty() {
                continue;
            }
            let pruned = session.tick(delta);
            let remaining = session.member_count();
            departures.extend(pruned.into_iter().map(|login| Departure {
                session: session.id(),
                login,
                remaining,
            }));
        }
        departures
    }

    /// Reclaim sessions with no members
    pub fn sweep_empty(&self) -> Vec<SessionId> {
        let mut sessions = self.sessions.lock();
        let mut removed = Vec::new();
        sessions.retain(|id, handle| {
            let mut session = handle.lock();
            if session.is_empty() {
                session.mark_closed();
                removed.push(*id);
                false
            } else {
                true
            }
        });
        if !removed.is_empty() {
            debug!(count = removed.len(), "Reclaimed empty sessions");
        }
        removed
    }

    pub fn count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Members across all sessions
    pub fn player_count(&self) -> usize {
        let handles: Vec<SessionHandle> = self.sessions.lock().values().cloned().collect();
        handles.iter().map(|h| h.lock().member_count()).sum()
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        let handles: Vec<SessionHandle> = self.sessions.lock().values().cloned().collect();
        let mut summaries: Vec<SessionSummary> = handles.iter().map(|h| h.lock().summary()).collect();
        summaries.sort_by_key(|s| s.id);
        summaries
    }

    /// Empty and remove every session; returns how many were removed
    pub fn shutdown_all(&self) -> usize {
        let drained: Vec<SessionHandle> = {
            let mut sessions = self.sessions.lock();
            sessions.drain().map(|(_, handle)| handle).collect()
        };
        for handle in &drained {
            let mut session = handle.lock();
            session.clear();
            session.mark_closed();
        }
        info!("Closed {} session(s)", drained.len());
        drained.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use std::net::SocketAddr;

    fn player(id: u64) -> Arc<Connection> {
        let addr: SocketAddr = "10.1.0.1:9000".parse().unwrap();
        let conn = Connection::new(ConnectionId(id), addr, tokio::io::sink(), Arc::new(Metrics::new()));
        conn.begin_auth();
        conn.complete_auth(format!("player{}", id));
        conn
    }

    #[test]
    fn test_ids_are_monotonic_and_not_reused() {
        let manager = SessionManager::new(4, 10);
        let first = manager.create(Difficulty::Normal, GameMode::Campaign).unwrap();
        assert_eq!(first, SessionId(1));
        assert_eq!(manager.sweep_empty(), vec![first]);

        let second = manager.create(Difficulty::Normal, GameMode::Campaign).unwrap();
        assert_eq!(second, SessionId(2));
    }

    #[test]
    fn test_max_sessions() {
        let manager = SessionManager::new(4, 2);
        manager.create(Difficulty::Normal, GameMode::Campaign).unwrap();
        manager.create(Difficulty::Normal, GameMode::Campaign).unwrap();
        assert_eq!(
            manager.create(Difficulty::Normal, GameMode::Campaign),
            Err(SessionError::TooManySessions { max: 2 })
        );
    }

    #[test]
    fn test_join_and_leave() {
        let manager = SessionManager::new(4, 10);
        let a = player(1);
        let summary = manager.create_and_join(&a, Difficulty::Hard, GameMode::Rift).unwrap();
        assert_eq!(summary.members, vec!["player1".to_string()]);
        assert_eq!(a.session(), Some(summary.id));

        let departure = manager.leave(&a).unwrap();
        assert_eq!(departure.session, summary.id);
        assert_eq!(departure.remaining, 0);
        assert!(a.session().is_none());
        assert_eq!(manager.leave(&a), Err(SessionError::NotMember));
    }

    #[test]
    fn test_join_unknown_session() {
        let manager = SessionManager::new(4, 10);
        let a = player(1);
        assert_eq!(manager.join(SessionId(42), &a), Err(SessionError::NotFound(SessionId(42))));
    }

    #[test]
    fn test_connection_in_at_most_one_session() {
        let manager = SessionManager::new(4, 10);
        let a = player(1);
        let first = manager.create_and_join(&a, Difficulty::Normal, GameMode::Campaign).unwrap();
        let other = manager.create(Difficulty::Normal, GameMode::Campaign).unwrap();

        assert_eq!(manager.join(other, &a), Err(SessionError::InAnotherSession(first.id)));
        assert_eq!(
            manager.create_and_join(&a, Difficulty::Normal, GameMode::Campaign),
            Err(SessionError::InAnotherSession(first.id))
        );
        assert_eq!(manager.player_count(), 1);
    }

    #[test]
    fn test_find_or_create_fills_before_creating() {
        let manager = SessionManager::new(2, 10);
        let players: Vec<_> = (1..=3).map(player).collect();

        let s1 = manager.find_or_create_and_join(&players[0]).unwrap().id;
        let s2 = manager.find_or_create_and_join(&players[1]).unwrap().id;
        let s3 = manager.find_or_create_and_join(&players[2]).unwrap().id;

        assert_eq!(s1, s2);
        assert_ne!(s1, s3);
        assert_eq!(manager.count(), 2);
    }

    #[test]
    fn test_sweep_only_removes_empty() {
        let manager = SessionManager::new(4, 10);
        let a = player(1);
        let occupied = manager.create_and_join(&a, Difficulty::Normal, GameMode::Campaign).unwrap().id;
        let empty = manager.create(Difficulty::Normal, GameMode::Campaign).unwrap();

        assert_eq!(manager.sweep_empty(), vec![empty]);
        assert!(manager.get(occupied).is_some());
        assert!(manager.sweep_empty().is_empty());

        manager.leave(&a).unwrap();
        assert_eq!(manager.sweep_empty(), vec![occupied]);
        assert_eq!(manager.count(), 0);
    }

    #[test]
    fn test_swept_session_handle_rejects_join() {
        let manager = SessionManager::new(4, 10);
        let id = manager.create(Difficulty::Normal, GameMode::Campaign).unwrap();
        let handle = manager.get(id).unwrap();
        manager.sweep_empty();

        let a = player(1);
        assert_eq!(handle.lock().join(&a), Err(SessionError::NotFound(id)));
    }

    #[test]
    fn test_capacity_under_concurrent_joins() {
        let manager = Arc::new(SessionManager::new(4, 10));
        let id = manager.create(Difficulty::Normal, GameMode::Campaign).unwrap();

        let handles: Vec<_> = (1..=16)
            .map(|i| {
                let manager = Arc::clone(&manager);
                std::thread::spawn(move || {
                    let conn = player(i);
                    manager.join(id, &conn).is_ok()
                })
            })
            .collect();

        let joined = handles
            .into_iter()
            .filter_map(|h| h.join().ok())
            .filter(|ok| *ok)
            .count();
        assert_eq!(joined, 4);
        assert_eq!(manager.get(id).unwrap().lock().member_count(), 4);
    }

    #[test]
    fn test_create_and_join_survives_concurrent_sweeps() {
        let manager = Arc::new(SessionManager::new(4, 10_000));
        let running = Arc::new(std::sync::atomic::AtomicBool::new(true));

        let sweeper = {
            let manager = Arc::clone(&manager);
            let running = Arc::clone(&running);
            std::thread::spawn(move || {
                while running.load(Ordering::Relaxed) {
                    manager.sweep_empty();
                }
            })
        };

        let mut failures = 0;
        for i in 1..=2000u64 {
            let conn = player(i);
            match manager.create_and_join(&conn, Difficulty::Normal, GameMode::Campaign) {
                Ok(summary) => {
                    assert_eq!(conn.session(), Some(summary.id));
                    assert!(manager.leave(&conn).is_ok());
                }
                Err(_) => failures += 1,
            }
        }

        running.store(false, Ordering::Relaxed);
        sweeper.join().unwrap();
        assert_eq!(failures, 0);
    }

    #[test]
    fn test_create_and_join_leaves_no_session_on_failure() {
        let manager = SessionManager::new(4, 1);
        let a = player(1);
        let b = player(2);
        manager.create_and_join(&a, Difficulty::Normal, GameMode::Campaign).unwrap();

        let err = manager
            .create_and_join(&b, Difficulty::Normal, GameMode::Campaign)
            .unwrap_err();
        assert_eq!(err, SessionError::TooManySessions { max: 1 });
        assert_eq!(manager.count(), 1);
        assert!(b.session().is_none());
    }

    #[test]
    fn test_tick_all_skips_empty_sessions() {
        let manager = SessionManager::new(4, 10);
        let a = player(1);
        let busy = manager.create_and_join(&a, Difficulty::Normal, GameMode::Campaign).unwrap().id;
        let idle = manager.create(Difficulty::Normal, GameMode::Campaign).unwrap();

        assert!(manager.tick_all(Duration::from_millis(50)).is_empty());
        assert_eq!(manager.get(busy).unwrap().lock().tick_count(), 1);
        assert_eq!(manager.get(idle).unwrap().lock().tick_count(), 0);
    }

    #[tokio::test]
    async fn test_tick_all_reports_pruned_members() {
        let manager = SessionManager::new(4, 10);
        let a = player(1);
        let b = player(2);
        let id = manager.create_and_join(&a, Difficulty::Normal, GameMode::Campaign).unwrap().id;
        manager.join(id, &b).unwrap();

        b.close();
        let departures = manager.tick_all(Duration::from_millis(16));

        assert_eq!(
            departures,
            vec![Departure {
                session: id,
                login: "player2".to_string(),
                remaining: 1,
            }]
        );
        assert!(b.session().is_none());
        assert!(manager.tick_all(Duration::from_millis(16)).is_empty());
    }

    #[test]
    fn test_set_options_via_manager() {
        let manager = SessionManager::new(4, 10);
        let a = player(1);
        manager.create_and_join(&a, Difficulty::Normal, GameMode::Campaign).unwrap();

        let summary = manager.set_options(&a, Difficulty::Torment6, GameMode::GreaterRift).unwrap();
        assert_eq!(summary.difficulty, Difficulty::Torment6);
        assert_eq!(summary.mode, GameMode::GreaterRift);
    }

    #[test]
    fn test_shutdown_all_clears_associations() {
        let manager = SessionManager::new(4, 10);
        let a = player(1);
        let b = player(2);
        manager.create_and_join(&a, Difficulty::Normal, GameMode::Campaign).unwrap();
        manager.create_and_join(&b, Difficulty::Normal, GameMode::Campaign).unwrap();

        assert_eq!(manager.shutdown_all(), 2);
        assert_eq!(manager.count(), 0);
        assert!(a.session().is_none());
        assert!(b.session().is_none());
    }
}
