//! Security audit trail
//!
//! `record` never blocks on I/O: records go into a bounded in-memory ring
//! (for the admin endpoint) and through a bounded channel to a background
//! thread that appends JSON lines to the audit file. A full channel drops
//! the file write and logs a warning.

use std::collections::VecDeque;
use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

/// Records kept in memory for inspection
pub const DEFAULT_RECENT_CAPACITY: usize = 1000;

/// Records that may wait for the file writer before new ones are dropped
const WRITER_QUEUE_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditCategory {
    Authentication,
    AccountManagement,
    CharacterManagement,
    GameSession,
    Configuration,
    Admin,
    Security,
    Network,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditOutcome {
    Success,
    Failure,
    Warning,
    Unauthorized,
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuditOutcome::Success => "SUCCESS",
            AuditOutcome::Failure => "FAILURE",
            AuditOutcome::Warning => "WARNING",
            AuditOutcome::Unauthorized => "UNAUTHORIZED",
        };
        f.write_str(s)
    }
}

/// One audited action
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    /// Login of the acting account, or `UNKNOWN`
    pub actor: String,
    /// Remote address the action came from
    pub source: String,
    pub category: AuditCategory,
    pub description: String,
    pub outcome: AuditOutcome,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub details: String,
}

impl AuditRecord {
    pub const UNKNOWN_ACTOR: &'static str = "UNKNOWN";

    pub fn new(
        actor: impl Into<String>,
        source: impl Into<String>,
        category: AuditCategory,
        description: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            actor: actor.into(),
            source: source.into(),
            category,
            description: description.into(),
            outcome,
            details: String::new(),
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }
}

/// Destination for audit records; injected into every component that audits
pub trait AuditSink: Send + Sync {
    /// Fire-and-forget; must not block on I/O
    fn record(&self, record: AuditRecord);
}

/// Default audit sink: in-memory ring plus optional JSON-lines file
pub struct AuditLog {
    recent: Mutex<VecDeque<AuditRecord>>,
    capacity: usize,
    sender: Mutex<Option<Sender<AuditRecord>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    recorded: AtomicU64,
    dropped: AtomicU64,
}

impl AuditLog {
    /// Audit log without a backing file
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            recent: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_RECENT_CAPACITY))),
            capacity: capacity.max(1),
            sender: Mutex::new(None),
            writer: Mutex::new(None),
            recorded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Audit log appending JSON lines to `path`
    pub fn with_file(path: impl AsRef<Path>, capacity: usize) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let (tx, rx) = bounded::<AuditRecord>(WRITER_QUEUE_CAPACITY);
        let display_path = path.display().to_string();

        let handle = std::thread::Builder::new()
            .name("audit-writer".to_string())
            .spawn(move || {
                let mut out = BufWriter::new(file);
                for record in rx.iter() {
                    let result = serde_json::to_writer(&mut out, &record)
                        .map_err(io::Error::from)
                        .and_then(|_| out.write_all(b"\n"))
                        .and_then(|_| out.flush());
                    if let Err(e) = result {
                        error!("Failed to write audit record to {}: {}", display_path, e);
                    }
                }
                debug!("Audit writer stopped");
            })?;

        info!("Audit log writing to {}", path.display());

        let log = Self::in_memory(capacity);
        *log.sender.lock() = Some(tx);
        *log.writer.lock() = Some(handle);
        Ok(log)
    }

    /// Most recent records, oldest first
    pub fn recent(&self, count: usize) -> Vec<AuditRecord> {
        let recent = self.recent.lock();
        let skip = recent.len().saturating_sub(count);
        recent.iter().skip(skip).cloned().collect()
    }

    pub fn recorded(&self) -> u64 {
        self.recorded.load(Ordering::Relaxed)
    }

    /// Records that never reached the audit file
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop the file writer after it has drained queued records
    pub fn shutdown(&self) {
        // Dropping the sender ends the writer's receive loop
        self.sender.lock().take();
        if let Some(handle) = self.writer.lock().take() {
            if handle.join().is_err() {
                error!("Audit writer thread panicked");
            }
        }
    }
}

impl AuditSink for AuditLog {
    fn record(&self, record: AuditRecord) {
        debug!(
            category = ?record.category,
            outcome = %record.outcome,
            actor = %record.actor,
            source = %record.source,
            "audit: {}",
            record.description
        );
        self.recorded.fetch_add(1, Ordering::Relaxed);

        if let Some(sender) = self.sender.lock().as_ref() {
            match sender.try_send(record.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!("Audit writer queue full, record not persisted");
                }
                Err(TrySendError::Disconnected(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        let mut recent = self.recent.lock();
        if recent.len() >= self.capacity {
            recent.pop_front();
        }
        recent.push_back(record);
    }
}

impl Drop for AuditLog {
    fn drop(&mut self) {
        self.shutdown();
    }
}
