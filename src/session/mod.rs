//! Session engine: play groups of authenticated connections
//!
//! Handles membership, broadcast fan-out and the per-session tick.

pub mod game_session;
pub mod manager;

use std::fmt;

use serde::Serialize;

pub use game_session::{BroadcastReport, GameSession, SessionSummary};
pub use manager::SessionManager;

/// Session identity, assigned monotonically and never reused while the server runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Difficulty, ordered from easiest to hardest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[repr(u8)]
pub enum Difficulty {
    #[default]
    Normal = 0,
    Hard = 1,
    Expert = 2,
    Master = 3,
    Torment1 = 4,
    Torment2 = 5,
    Torment3 = 6,
    Torment4 = 7,
    Torment5 = 8,
    Torment6 = 9,
}

impl TryFrom<u8> for Difficulty {
    type Error = SessionError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Difficulty::Normal,
            1 => Difficulty::Hard,
            2 => Difficulty::Expert,
            3 => Difficulty::Master,
            4 => Difficulty::Torment1,
            5 => Difficulty::Torment2,
            6 => Difficulty::Torment3,
            7 => Difficulty::Torment4,
            8 => Difficulty::Torment5,
            9 => Difficulty::Torment6,
            other => return Err(SessionError::InvalidDifficulty(other)),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum GameMode {
    #[default]
    Campaign = 0,
    Adventure = 1,
    Rift = 2,
    GreaterRift = 3,
}

impl TryFrom<u8> for GameMode {
    type Error = SessionError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => GameMode::Campaign,
            1 => GameMode::Adventure,
            2 => GameMode::Rift,
            3 => GameMode::GreaterRift,
            other => return Err(SessionError::InvalidMode(other)),
        })
    }
}

/// Session errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Session is full ({max} players)")]
    Full { max: usize },
    #[error("Already a member of this session")]
    AlreadyMember,
    #[error("Already in {0}")]
    InAnotherSession(SessionId),
    #[error("{0} not found")]
    NotFound(SessionId),
    #[error("Not in a session")]
    NotMember,
    #[error("Only the session host may do that")]
    NotHost,
    #[error("Too many sessions (max {max})")]
    TooManySessions { max: usize },
    #[error("Invalid difficulty {0}")]
    InvalidDifficulty(u8),
    #[error("Invalid game mode {0}")]
    InvalidMode(u8),
}

impl SessionError {
    /// Status byte carried in session replies; 0 means success
    pub fn status_code(&self) -> u8 {
        match self {
            SessionError::Full { .. } => 1,
            SessionError::NotFound(_) => 2,
            SessionError::AlreadyMember | SessionError::InAnotherSession(_) => 3,
            SessionError::TooManySessions { .. } => 4,
            SessionError::NotMember => 5,
            SessionError::NotHost => 6,
            SessionError::InvalidDifficulty(_) | SessionError::InvalidMode(_) => 7,
        }
    }
}
