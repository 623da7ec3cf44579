//! Top-level server: gateway, game server and admin endpoint
//!
//! Services start in order (gateway, game, admin) and stop in reverse.
//! Every listener is bound before any service starts running, so a port
//! conflict leaves nothing half-started.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{error, info};

#[cfg(feature = "admin_api")]
use crate::admin::{AdminServer, AdminState};
use crate::audit::{AuditCategory, AuditLog, AuditOutcome, AuditRecord, AuditSink, DEFAULT_RECENT_CAPACITY};
use crate::auth::Authenticator;
use crate::config::ServerConfig;
use crate::metrics::Metrics;
use crate::server::{FrontEnd, FrontEndSettings, GameHandler, GatewayHandler, ServerError};
use crate::session::SessionManager;
use crate::store::{AccountStore, MemoryAccountStore};

const SYSTEM_ACTOR: &str = "SYSTEM";

pub struct Server {
    config: ServerConfig,
    metrics: Arc<Metrics>,
    audit: Arc<AuditLog>,
    sessions: Arc<SessionManager>,
    gateway: FrontEnd<GatewayHandler>,
    game: FrontEnd<GameHandler>,
    #[cfg(feature = "admin_api")]
    admin: AdminServer,
    started: bool,
    stopped: bool,
}

impl Server {
    /// Build a server backed by an in-memory store seeded from `config`
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate().map_err(ServerError::Config)?;
        let seeds = config
            .seed_accounts
            .iter()
            .map(|(login, password)| (login.as_str(), password.as_str()));
        let store = Arc::new(MemoryAccountStore::seeded(seeds)?);
        Self::with_store(config, store)
    }

    pub fn with_store(config: ServerConfig, store: Arc<dyn AccountStore>) -> Result<Self, ServerError> {
        config.validate().map_err(ServerError::Config)?;

        let audit = Arc::new(match &config.audit_log_path {
            Some(path) => AuditLog::with_file(path, DEFAULT_RECENT_CAPACITY).map_err(ServerError::Audit)?,
            None => AuditLog::in_memory(DEFAULT_RECENT_CAPACITY),
        });
        let sink: Arc<dyn AuditSink> = audit.clone();
        let metrics = Arc::new(Metrics::new());
        let sessions = Arc::new(SessionManager::new(config.max_session_players, config.max_sessions));
        let auth = Authenticator::new(store, Arc::clone(&sink), Arc::clone(&metrics));

        let settings = FrontEndSettings {
            max_connections_per_ip: config.max_connections_per_ip,
            tick_interval: config.tick_interval(),
            idle_timeout: config.idle_timeout,
        };
        let gateway = FrontEnd::new(
            Arc::new(GatewayHandler::new(auth.clone())),
            settings,
            Arc::clone(&metrics),
            Arc::clone(&sink),
        );
        let game = FrontEnd::new(
            Arc::new(GameHandler::new(auth, Arc::clone(&sessions), Arc::clone(&metrics))),
            settings,
            Arc::clone(&metrics),
            sink,
        );

        #[cfg(feature = "admin_api")]
        let admin = AdminServer::new(AdminState {
            metrics: Arc::clone(&metrics),
            audit: Arc::clone(&audit),
            sessions: Arc::clone(&sessions),
            gateway: gateway.registry(),
            game: game.registry(),
        });

        Ok(Self {
            config,
            metrics,
            audit,
            sessions,
            gateway,
            game,
            #[cfg(feature = "admin_api")]
            admin,
            started: false,
            stopped: false,
        })
    }

    /// Bind every service, then start them in order. Must run inside a
    /// tokio runtime.
    pub fn start(&mut self) -> Result<(), ServerError> {
        if self.started {
            return Err(ServerError::AlreadyRunning("server"));
        }

        self.gateway.init(self.config.gateway_addr())?;
        self.game.init(self.config.game_addr())?;
        #[cfg(feature = "admin_api")]
        self.admin.init(self.config.admin_addr())?;

        self.gateway.run()?;
        self.game.run()?;
        #[cfg(feature = "admin_api")]
        self.admin.run()?;

        self.started = true;
        self.audit.record(AuditRecord::new(
            SYSTEM_ACTOR,
            self.config.bind_address.to_string(),
            AuditCategory::Admin,
            "Server started",
            AuditOutcome::Success,
        ));
        info!(
            "Server running: gateway={:?} game={:?}",
            self.gateway.local_addr(),
            self.game.local_addr()
        );
        Ok(())
    }

    /// Stop services in reverse start order, empty every session and flush
    /// the audit log. Idempotent.
    pub async fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        #[cfg(feature = "admin_api")]
        self.admin.shutdown().await;
        self.game.shutdown().await;
        self.gateway.shutdown().await;
        self.sessions.shutdown_all();
        self.metrics.set_sessions(0, 0);

        self.audit.record(AuditRecord::new(
            SYSTEM_ACTOR,
            self.config.bind_address.to_string(),
            AuditCategory::Admin,
            "Server stopped",
            AuditOutcome::Success,
        ));
        let audit = Arc::clone(&self.audit);
        if let Err(e) = tokio::task::spawn_blocking(move || audit.shutdown()).await {
            error!("Audit log shutdown failed: {}", e);
        }
    }

    pub fn gateway_addr(&self) -> Option<SocketAddr> {
        self.gateway.local_addr()
    }

    pub fn game_addr(&self) -> Option<SocketAddr> {
        self.game.local_addr()
    }

    #[cfg(feature = "admin_api")]
    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.admin.local_addr()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }
}
