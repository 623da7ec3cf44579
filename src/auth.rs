//! Authentication state machine
//!
//! ```text
//! NotAuthenticated --request--> InProgress --ok--> Authenticated
//!                                   |
//!                                   +--fail--> AuthFailed --retry--> InProgress
//! ```
//!
//! Store lookups run on the blocking pool. A store failure fails closed.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditCategory, AuditOutcome, AuditRecord, AuditSink};
use crate::metrics::Metrics;
use crate::net::protocol::{auth_method, auth_response_body, AuthRequest, Packet};
use crate::net::Connection;
use crate::store::{AccountStore, StoreError};

/// Per-connection authentication state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AuthState {
    NotAuthenticated,
    InProgress,
    Authenticated,
    AuthFailed,
}

/// Why a credential check was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    UnknownAccount,
    Banned,
    BadPassword,
    StoreUnavailable,
}

impl AuthFailure {
    fn reason(self) -> &'static str {
        match self {
            AuthFailure::UnknownAccount => "unknown account",
            AuthFailure::Banned => "account banned",
            AuthFailure::BadPassword => "invalid password",
            AuthFailure::StoreUnavailable => "account store unavailable",
        }
    }

    fn audit_outcome(self) -> AuditOutcome {
        match self {
            AuthFailure::Banned => AuditOutcome::Unauthorized,
            _ => AuditOutcome::Failure,
        }
    }
}

/// Result of handling one auth request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Authenticated(String),
    Rejected(AuthFailure),
    /// Body could not be parsed; state unchanged
    Malformed,
    /// A check is already outstanding or the connection is already authenticated
    Ignored,
    /// The connection went away while the check ran
    Disconnected,
}

/// Drives [`AuthState`] transitions against the account store
#[derive(Clone)]
pub struct Authenticator {
    store: Arc<dyn AccountStore>,
    audit: Arc<dyn AuditSink>,
    metrics: Arc<Metrics>,
}

impl Authenticator {
    pub fn new(store: Arc<dyn AccountStore>, audit: Arc<dyn AuditSink>, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            audit,
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<dyn AccountStore> {
        &self.store
    }

    pub fn audit(&self) -> &Arc<dyn AuditSink> {
        &self.audit
    }

    /// Handle an auth request packet and reply on `conn`
    pub async fn authenticate(&self, conn: &Arc<Connection>, packet: &Packet) -> AuthOutcome {
        let source = conn.remote_addr().to_string();

        let request = match AuthRequest::parse(&packet.body) {
            Ok(request) => request,
            Err(e) => {
                warn!(conn = %conn.id(), addr = %source, "Malformed auth request: {}", e);
                self.audit.record(
                    AuditRecord::new(
                        AuditRecord::UNKNOWN_ACTOR,
                        source,
                        AuditCategory::Authentication,
                        "Malformed authentication request",
                        AuditOutcome::Warning,
                    )
                    .with_details(e.to_string()),
                );
                return AuthOutcome::Malformed;
            }
        };

        if !conn.begin_auth() {
            debug!(conn = %conn.id(), state = ?conn.auth_state(), "Auth request ignored");
            return AuthOutcome::Ignored;
        }

        self.audit.record(AuditRecord::new(
            request.login.clone(),
            source.clone(),
            AuditCategory::Authentication,
            "Authentication attempt",
            AuditOutcome::Success,
        ));

        let AuthRequest { login, password } = request;
        let store = Arc::clone(&self.store);
        let lookup_login = login.clone();
        let verdict = tokio::task::spawn_blocking(move || check_credentials(store.as_ref(), &lookup_login, &password))
            .await
            .unwrap_or_else(|e| Err(StoreError::Unavailable(format!("lookup task failed: {}", e))));

        let result = match verdict {
            Ok(result) => result,
            Err(e) => {
                error!(conn = %conn.id(), login = %login, "Account store error: {}", e);
                Err(AuthFailure::StoreUnavailable)
            }
        };

        if !conn.is_connected() {
            debug!(conn = %conn.id(), "Connection closed during auth check");
            conn.fail_auth();
            let verdict = match &result {
                Ok(()) => "credentials accepted",
                Err(failure) => failure.reason(),
            };
            self.audit.record(
                AuditRecord::new(
                    login.clone(),
                    source,
                    AuditCategory::Authentication,
                    "Connection closed during authentication",
                    AuditOutcome::Warning,
                )
                .with_details(verdict),
            );
            return AuthOutcome::Disconnected;
        }

        match result {
            Ok(()) => {
                conn.complete_auth(login.clone());
                self.metrics.record_auth(true);
                info!(conn = %conn.id(), login = %login, addr = %source, "Client authenticated");
                self.audit.record(AuditRecord::new(
                    login.clone(),
                    source,
                    AuditCategory::Authentication,
                    "Login succeeded",
                    AuditOutcome::Success,
                ));
                self.reply(conn, packet, true);
                AuthOutcome::Authenticated(login)
            }
            Err(failure) => {
                conn.fail_auth();
                self.metrics.record_auth(false);
                info!(conn = %conn.id(), login = %login, reason = failure.reason(), "Authentication failed");
                let actor = if failure == AuthFailure::UnknownAccount {
                    AuditRecord::UNKNOWN_ACTOR.to_string()
                } else {
                    login.clone()
                };
                let category = if failure == AuthFailure::Banned {
                    AuditCategory::Security
                } else {
                    AuditCategory::Authentication
                };
                self.audit.record(
                    AuditRecord::new(actor, source, category, "Login failed", failure.audit_outcome())
                        .with_details(format!("{} (login '{}')", failure.reason(), login)),
                );
                self.reply(conn, packet, false);
                AuthOutcome::Rejected(failure)
            }
        }
    }

    fn reply(&self, conn: &Arc<Connection>, request: &Packet, success: bool) {
        let reply = request.reply(auth_method::SESSION_RESPONSE, auth_response_body(success));
        if let Err(e) = conn.send(&reply) {
            debug!(conn = %conn.id(), "Auth reply not sent: {}", e);
        }
    }

    /// Audit and close a connection that sent an authenticated-only packet too early
    pub fn reject_unauthenticated(&self, conn: &Connection, packet: &Packet) {
        warn!(
            conn = %conn.id(),
            addr = %conn.remote_addr(),
            service = packet.service_id,
            method = packet.method_id,
            state = ?conn.auth_state(),
            "Unauthenticated request, disconnecting"
        );
        self.audit.record(
            AuditRecord::new(
                AuditRecord::UNKNOWN_ACTOR,
                conn.remote_addr().to_string(),
                AuditCategory::Security,
                "Request before authentication",
                AuditOutcome::Unauthorized,
            )
            .with_details(format!("service 0x{:04x} method 0x{:04x}", packet.service_id, packet.method_id)),
        );
        conn.close();
    }
}

/// Ordered checks: existence, ban, password, then last-login bookkeeping
fn check_credentials(
    store: &dyn AccountStore,
    login: &str,
    password: &str,
) -> Result<Result<(), AuthFailure>, StoreError> {
    if !store.exists(login)? {
        return Ok(Err(AuthFailure::UnknownAccount));
    }
    if store.is_banned(login)? {
        return Ok(Err(AuthFailure::Banned));
    }
    if !store.verify(login, password)? {
        return Ok(Err(AuthFailure::BadPassword));
    }
    if !store.touch_last_login(login)? {
        return Ok(Err(AuthFailure::UnknownAccount));
    }
    Ok(Ok(()))
}
