//! Account store collaborator
//!
//! The connection engine only needs a handful of lookups, each of which may
//! block and may fail with the store unavailable. Implementations are called
//! from `spawn_blocking`, never directly on an I/O worker.

pub mod memory;

use std::num::NonZeroU32;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use rand::RngCore;
use ring::pbkdf2;
use serde::Serialize;

pub use memory::MemoryAccountStore;

const CREDENTIAL_LEN: usize = 32;
const SALT_LEN: usize = 16;
const CREDENTIAL_SCHEME: &str = "pbkdf2-sha256";

/// Default PBKDF2 work factor
pub const DEFAULT_ITERATIONS: u32 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("account store unavailable: {0}")]
    Unavailable(String),
    #[error("account '{0}' already exists")]
    AccountExists(String),
    #[error("account '{0}' not found")]
    NotFound(String),
    #[error("invalid login: {0}")]
    InvalidLogin(&'static str),
    #[error("malformed credential")]
    MalformedCredential,
}

/// Lookups the connection engine performs against persistent accounts
pub trait AccountStore: Send + Sync {
    fn exists(&self, login: &str) -> Result<bool, StoreError>;

    /// Check a plaintext password against the stored credential
    fn verify(&self, login: &str, password: &str) -> Result<bool, StoreError>;

    fn is_banned(&self, login: &str) -> Result<bool, StoreError>;

    /// Record a successful login; false if the account vanished meanwhile
    fn touch_last_login(&self, login: &str) -> Result<bool, StoreError>;

    fn characters(&self, login: &str) -> Result<Vec<CharacterRecord>, StoreError>;
}

/// A character owned by an account
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CharacterRecord {
    pub id: u64,
    pub account_id: u32,
    pub name: String,
    pub class_id: u8,
    pub level: u8,
    pub hardcore: bool,
    pub created_at: DateTime<Utc>,
}

/// Account as held by a store
#[derive(Debug, Clone)]
pub struct AccountRecord {
    pub id: u32,
    pub login: String,
    pub email: String,
    pub credential: Credential,
    pub banned: bool,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

/// Salted PBKDF2-HMAC-SHA256 password credential
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    iterations: NonZeroU32,
    salt: [u8; SALT_LEN],
    hash: [u8; CREDENTIAL_LEN],
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("iterations", &self.iterations)
            .finish_non_exhaustive()
    }
}

impl Credential {
    /// Derive a credential from a plaintext password with a fresh random salt
    pub fn derive(password: &str, iterations: NonZeroU32) -> Self {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);

        let mut hash = [0u8; CREDENTIAL_LEN];
        pbkdf2::derive(pbkdf2::PBKDF2_HMAC_SHA256, iterations, &salt, password.as_bytes(), &mut hash);

        Self {
            iterations,
            salt,
            hash,
        }
    }

    /// Constant-time comparison against a candidate password
    pub fn verify(&self, password: &str) -> bool {
        pbkdf2::verify(
            pbkdf2::PBKDF2_HMAC_SHA256,
            self.iterations,
            &self.salt,
            password.as_bytes(),
            &self.hash,
        )
        .is_ok()
    }

    /// `pbkdf2-sha256$<iterations>$<salt b64>$<hash b64>`
    pub fn encode(&self) -> String {
        format!(
            "{}${}${}${}",
            CREDENTIAL_SCHEME,
            self.iterations,
            STANDARD.encode(self.salt),
            STANDARD.encode(self.hash)
        )
    }

    pub fn decode(encoded: &str) -> Result<Self, StoreError> {
        let mut parts = encoded.split('$');
        let (Some(scheme), Some(iterations), Some(salt), Some(hash), None) =
            (parts.next(), parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(StoreError::MalformedCredential);
        };
        if scheme != CREDENTIAL_SCHEME {
            return Err(StoreError::MalformedCredential);
        }

        let iterations = iterations
            .parse::<u32>()
            .ok()
            .and_then(NonZeroU32::new)
            .ok_or(StoreError::MalformedCredential)?;
        let salt: [u8; SALT_LEN] = STANDARD
            .decode(salt)
            .ok()
            .and_then(|v| v.try_into().ok())
            .ok_or(StoreError::MalformedCredential)?;
        let hash: [u8; CREDENTIAL_LEN] = STANDARD
            .decode(hash)
            .ok()
            .and_then(|v| v.try_into().ok())
            .ok_or(StoreError::MalformedCredential)?;

        Ok(Self {
            iterations,
            salt,
            hash,
        })
    }
}

/// Logins are 1..=32 ASCII alphanumerics, `_`, `-` or `.`
pub fn validate_login(login: &str) -> Result<(), StoreError> {
    if login.is_empty() {
        return Err(StoreError::InvalidLogin("empty"));
    }
    if login.len() > 32 {
        return Err(StoreError::InvalidLogin("longer than 32 characters"));
    }
    if !login
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(StoreError::InvalidLogin("unsupported characters"));
    }
    Ok(())
}
