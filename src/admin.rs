//! Admin HTTP endpoint
//!
//! Read-only observability over plain HTTP/1.1, one request per connection:
//!
//! - `GET /health`
//! - `GET /metrics` (Prometheus text)
//! - `GET /metrics/json`
//! - `GET /api/status`
//! - `GET /api/sessions`
//! - `GET /api/audit[?limit=N]`

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::audit::AuditLog;
use crate::metrics::Metrics;
use crate::net::ConnectionRegistry;
use crate::server::{bind_listener, stopped, ServerError};
use crate::session::SessionManager;

const SERVICE: &str = "admin";
const REQUEST_LIMIT: usize = 4096;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_AUDIT_LIMIT: usize = 100;

/// Everything the admin endpoint reports on
#[derive(Clone)]
pub struct AdminState {
    pub metrics: Arc<Metrics>,
    pub audit: Arc<AuditLog>,
    pub sessions: Arc<SessionManager>,
    pub gateway: Arc<ConnectionRegistry>,
    pub game: Arc<ConnectionRegistry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl Response {
    fn ok(content_type: &'static str, body: String) -> Self {
        Self {
            status: 200,
            content_type,
            body,
        }
    }

    fn json(value: &impl serde::Serialize) -> Self {
        match serde_json::to_string_pretty(value) {
            Ok(body) => Self::ok("application/json", body),
            Err(e) => {
                error!("Failed to serialize admin response: {}", e);
                Self::error(500)
            }
        }
    }

    fn error(status: u16) -> Self {
        Self {
            status,
            content_type: "text/plain",
            body: reason(status).to_string(),
        }
    }

    fn to_http(&self) -> String {
        format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            self.status,
            reason(self.status),
            self.content_type,
            self.body.len(),
            self.body
        )
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        _ => "Internal Server Error",
    }
}

impl AdminState {
    /// Answer one request line
    pub fn route(&self, method: &str, target: &str) -> Response {
        if method != "GET" {
            return Response::error(405);
        }
        let (path, query) = target.split_once('?').unwrap_or((target, ""));

        match path {
            "/health" | "/" => Response::ok("text/plain", "OK".to_string()),
            "/metrics" => Response::ok("text/plain; version=0.0.4", self.metrics.to_prometheus()),
            "/metrics/json" => Response::json(&self.metrics.to_json()),
            "/api/status" => Response::json(&self.status()),
            "/api/sessions" => Response::json(&self.sessions.list()),
            "/api/audit" => match audit_limit(query) {
                Some(limit) => Response::json(&self.audit.recent(limit)),
                None => Response::error(400),
            },
            _ => Response::error(404),
        }
    }

    fn status(&self) -> serde_json::Value {
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_seconds": self.metrics.uptime_seconds(),
            "gateway": { "connections": self.gateway.count() },
            "game": { "connections": self.game.count() },
            "sessions": {
                "active": self.sessions.count(),
                "players": self.sessions.player_count(),
                "max_players": self.sessions.max_players(),
            },
            "audit": {
                "recorded": self.audit.recorded(),
                "dropped": self.audit.dropped(),
            },
        })
    }
}

fn audit_limit(query: &str) -> Option<usize> {
    let mut limit = DEFAULT_AUDIT_LIMIT;
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        if let Some(value) = pair.strip_prefix("limit=") {
            limit = value.parse().ok()?;
        }
    }
    Some(limit)
}

pub struct AdminServer {
    state: AdminState,
    listener: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
    shutdown_tx: watch::Sender<bool>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl AdminServer {
    pub fn new(state: AdminState) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            state,
            listener: None,
            local_addr: None,
            shutdown_tx,
            task: None,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn init(&mut self, addr: SocketAddr) -> Result<SocketAddr, ServerError> {
        let listener = bind_listener(SERVICE, addr)?;
        let local = listener.local_addr().map_err(|source| ServerError::Bind {
            service: SERVICE,
            addr,
            source,
        })?;
        info!("Admin endpoint listening on http://{}", local);
        self.listener = Some(listener);
        self.local_addr = Some(local);
        Ok(local)
    }

    pub fn run(&mut self) -> Result<(), ServerError> {
        if self.task.is_some() {
            return Err(ServerError::AlreadyRunning(SERVICE));
        }
        let listener = self.listener.take().ok_or(ServerError::NotInitialized(SERVICE))?;
        let state = self.state.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        self.task = Some(tokio::spawn(serve(state, listener, shutdown_rx)));
        Ok(())
    }

    /// Stop accepting and wait for in-flight requests. Idempotent.
    pub async fn shutdown(&mut self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        self.listener = None;
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Admin task failed: {}", e);
            }
        }
        info!("Admin endpoint stopped");
    }
}

async fn serve(state: AdminState, listener: TcpListener, mut shutdown_rx: watch::Receiver<bool>) {
    let mut requests = JoinSet::new();

    loop {
        tokio::select! {
            _ = stopped(&mut shutdown_rx) => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    let state = state.clone();
                    requests.spawn(async move {
                        if tokio::time::timeout(REQUEST_TIMEOUT, handle_request(&state, socket, peer))
                            .await
                            .is_err()
                        {
                            debug!("Admin request from {} timed out", peer);
                        }
                    });
                }
                Err(e) => warn!("Admin accept failed: {}", e),
            },
            Some(_) = requests.join_next(), if !requests.is_empty() => {}
        }
    }

    while requests.join_next().await.is_some() {}
}

async fn handle_request(state: &AdminState, mut socket: TcpStream, peer: SocketAddr) {
    let mut buffer = vec![0u8; REQUEST_LIMIT];
    let n = match socket.read(&mut buffer).await {
        Ok(0) => return,
        Ok(n) => n,
        Err(e) => {
            debug!("Failed to read admin request from {}: {}", peer, e);
            return;
        }
    };

    let request = String::from_utf8_lossy(&buffer[..n]);
    let mut parts = request.lines().next().unwrap_or_default().split_whitespace();
    let response = match (parts.next(), parts.next()) {
        (Some(method), Some(target)) => {
            debug!("Admin {} {} from {}", method, target, peer);
            state.route(method, target)
        }
        _ => Response::error(400),
    };

    if let Err(e) = socket.write_all(response.to_http().as_bytes()).await {
        debug!("Failed to write admin response to {}: {}", peer, e);
    }
    let _ = socket.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditCategory, AuditOutcome, AuditRecord, AuditSink};
    use crate::net::{Connection, ConnectionId};
    use crate::session::{Difficulty, GameMode};

    fn state() -> AdminState {
        AdminState {
            metrics: Arc::new(Metrics::new()),
            audit: Arc::new(AuditLog::in_memory(50)),
            sessions: Arc::new(SessionManager::new(4, 10)),
            gateway: Arc::new(ConnectionRegistry::new(10)),
            game: Arc::new(ConnectionRegistry::new(10)),
        }
    }

    #[test]
    fn test_health_and_unknown_paths() {
        let state = state();
        assert_eq!(state.route("GET", "/health").body, "OK");
        assert_eq!(state.route("GET", "/nope").status, 404);
        assert_eq!(state.route("POST", "/health").status, 405);
    }

    #[test]
    fn test_metrics_routes() {
        let state = state();
        state.metrics.record_auth(true);

        let text = state.route("GET", "/metrics");
        assert!(text.body.contains("d3_server_auth_success_total 1"));

        let json: serde_json::Value = serde_json::from_str(&state.route("GET", "/metrics/json").body).unwrap();
        assert_eq!(json["auth"]["success"], 1);
    }

    #[test]
    fn test_status_counts_connections_and_sessions() {
        let state = state();
        let addr: SocketAddr = "10.0.0.5:4000".parse().unwrap();
        let conn = Connection::new(ConnectionId(1), addr, tokio::io::sink(), state.metrics.clone());
        state.game.register(conn).unwrap();
        state.sessions.create(Difficulty::Hard, GameMode::Adventure).unwrap();

        let json: serde_json::Value = serde_json::from_str(&state.route("GET", "/api/status").body).unwrap();
        assert_eq!(json["game"]["connections"], 1);
        assert_eq!(json["gateway"]["connections"], 0);
        assert_eq!(json["sessions"]["active"], 1);

        let sessions: serde_json::Value = serde_json::from_str(&state.route("GET", "/api/sessions").body).unwrap();
        assert_eq!(sessions[0]["difficulty"], "Hard");
        assert_eq!(sessions[0]["mode"], "Adventure");
    }

    #[test]
    fn test_audit_route_honours_limit() {
        let state = state();
        for i in 0..5 {
            state.audit.record(AuditRecord::new(
                format!("user{}", i),
                "127.0.0.1:1",
                AuditCategory::Authentication,
                "Login succeeded",
                AuditOutcome::Success,
            ));
        }

        let records: serde_json::Value = serde_json::from_str(&state.route("GET", "/api/audit?limit=2").body).unwrap();
        assert_eq!(records.as_array().unwrap().len(), 2);
        assert_eq!(records[1]["actor"], "user4");
        assert_eq!(records[0]["category"], "AUTHENTICATION");
        assert_eq!(state.route("GET", "/api/audit?limit=lots").status, 400);
    }

    #[tokio::test]
    async fn test_http_round_trip() {
        let mut server = AdminServer::new(state());
        let addr = server.init("127.0.0.1:0".parse().unwrap()).unwrap();
        server.run().unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n").await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("\r\n\r\nOK"));

        server.shutdown().await;
        server.shutdown().await;
    }
}
