//! In-memory account store
//!
//! Backs the gateway and game server when no external store is wired in.
//! Accounts can be seeded from configuration at startup.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use chrono::Utc;
use hashbrown::HashMap;
use parking_lot::RwLock;
use tracing::{debug, info};

use super::{
    validate_login, AccountRecord, AccountStore, CharacterRecord, Credential, StoreError,
    DEFAULT_ITERATIONS,
};

pub struct MemoryAccountStore {
    accounts: RwLock<HashMap<String, AccountRecord>>,
    characters: RwLock<HashMap<u32, Vec<CharacterRecord>>>,
    next_account_id: AtomicU32,
    next_character_id: AtomicU64,
    iterations: NonZeroU32,
    available: AtomicBool,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::with_iterations(NonZeroU32::new(DEFAULT_ITERATIONS).unwrap_or(NonZeroU32::MIN))
    }

    pub fn with_iterations(iterations: NonZeroU32) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            characters: RwLock::new(HashMap::new()),
            next_account_id: AtomicU32::new(1),
            next_character_id: AtomicU64::new(1),
            iterations,
            available: AtomicBool::new(true),
        }
    }

    /// Build a store holding `login:password` seed accounts
    pub fn seeded<'a>(accounts: impl IntoIterator<Item = (&'a str, &'a str)>) -> Result<Self, StoreError> {
        let store = Self::new();
        for (login, password) in accounts {
            store.create_account(login, "", password)?;
        }
        info!("Seeded {} account(s)", store.account_count());
        Ok(store)
    }

    pub fn create_account(&self, login: &str, email: &str, password: &str) -> Result<u32, StoreError> {
        validate_login(login)?;
        self.check_available()?;

        // Derive before taking the write lock
        let credential = Credential::derive(password, self.iterations);

        let mut accounts = self.accounts.write();
        if accounts.contains_key(login) {
            return Err(StoreError::AccountExists(login.to_string()));
        }
        let id = self.next_account_id.fetch_add(1, Ordering::Relaxed);
        accounts.insert(
            login.to_string(),
            AccountRecord {
                id,
                login: login.to_string(),
                email: email.to_string(),
                credential,
                banned: false,
                created_at: Utc::now(),
                last_login: None,
            },
        );
        debug!(login, id, "Account created");
        Ok(id)
    }

    pub fn set_banned(&self, login: &str, banned: bool) -> Result<(), StoreError> {
        let mut accounts = self.accounts.write();
        let account = accounts
            .get_mut(login)
            .ok_or_else(|| StoreError::NotFound(login.to_string()))?;
        account.banned = banned;
        Ok(())
    }

    pub fn add_character(&self, login: &str, name: &str, class_id: u8, level: u8) -> Result<u64, StoreError> {
        let account_id = self
            .accounts
            .read()
            .get(login)
            .map(|a| a.id)
            .ok_or_else(|| StoreError::NotFound(login.to_string()))?;

        let id = self.next_character_id.fetch_add(1, Ordering::Relaxed);
        self.characters
            .write()
            .entry(account_id)
            .or_default()
            .push(CharacterRecord {
                id,
                account_id,
                name: name.to_string(),
                class_id,
                level,
                hardcore: false,
                created_at: Utc::now(),
            });
        Ok(id)
    }

    pub fn account(&self, login: &str) -> Option<AccountRecord> {
        self.accounts.read().get(login).cloned()
    }

    pub fn account_count(&self) -> usize {
        self.accounts.read().len()
    }

    /// Simulate an outage: every lookup fails with `Unavailable`
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store offline".to_string()))
        }
    }
}

impl Default for MemoryAccountStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AccountStore for MemoryAccountStore {
    fn exists(&self, login: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self.accounts.read().contains_key(login))
    }

    fn verify(&self, login: &str, password: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let credential = match self.accounts.read().get(login) {
            Some(account) => account.credential.clone(),
            None => return Ok(false),
        };
        Ok(credential.verify(password))
    }

    fn is_banned(&self, login: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self.accounts.read().get(login).is_some_and(|a| a.banned))
    }

    fn touch_last_login(&self, login: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        match self.accounts.write().get_mut(login) {
            Some(account) => {
                account.last_login = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn characters(&self, login: &str) -> Result<Vec<CharacterRecord>, StoreError> {
        self.check_available()?;
        let Some(account_id) = self.accounts.read().get(login).map(|a| a.id) else {
            return Ok(Vec::new());
        };
        Ok(self
            .characters
            .read()
            .get(&account_id)
            .cloned()
            .unwrap_or_default())
    }
}
