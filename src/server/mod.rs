//! Front-end services and the top-level server
//!
//! Each front-end (gateway, game server) owns a listener, a connection
//! registry and a scheduler. What it does with packets is decided by its
//! [`PacketHandler`].

pub mod frontend;
pub mod game;
pub mod gateway;
pub mod supervisor;

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::auth::Authenticator;
use crate::net::protocol::{auth_method, connection_method, message_type, pong_body, service, Packet};
use crate::net::Connection;
use crate::store::StoreError;

pub use frontend::{FrontEnd, FrontEndSettings};
pub use game::GameHandler;
pub use gateway::GatewayHandler;
pub use supervisor::Server;

const LISTEN_BACKLOG: u32 = 1024;

/// Service-specific packet handling plugged into a [`FrontEnd`]
pub trait PacketHandler: Send + Sync + 'static {
    /// Service name used in logs
    fn name(&self) -> &'static str;

    /// Handle one inbound packet. Packets from one connection are handled
    /// strictly one after another.
    fn handle(&self, conn: Arc<Connection>, packet: Packet) -> impl Future<Output = ()> + Send;

    /// Called once after the connection's read loop has ended
    fn on_disconnect(&self, _conn: &Arc<Connection>) {}

    /// Advance time-based state; runs on the scheduler and must not block
    fn tick(&self, _delta: Duration) {}

    /// Reclaim idle resources; runs after the connection registry sweep
    fn sweep(&self) {}
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("{service}: failed to bind {addr}: {source}")]
    Bind {
        service: &'static str,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("{0} has not been initialized")]
    NotInitialized(&'static str),
    #[error("{0} is already running")]
    AlreadyRunning(&'static str),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to open audit log: {0}")]
    Audit(#[source] io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Resolves once the shutdown flag is set
///
/// The `watch::Ref` from `wait_for` is dropped here, so callers can hold this
/// inside `select!` next to arms that await.
pub(crate) async fn stopped(shutdown_rx: &mut watch::Receiver<bool>) {
    let _ = shutdown_rx.wait_for(|stop| *stop).await;
}

/// Bind a listening socket, failing fast if the address is unavailable
pub(crate) fn bind_listener(service: &'static str, addr: SocketAddr) -> Result<TcpListener, ServerError> {
    let bind_err = |source: io::Error| ServerError::Bind { service, addr, source };

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(bind_err)?;
    socket.set_reuseaddr(true).map_err(bind_err)?;
    socket.bind(addr).map_err(bind_err)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_err)
}

/// Routes shared by every front-end: authentication, keepalive and the
/// authenticated-only gate
#[derive(Clone)]
pub struct ServiceGate {
    auth: Authenticator,
}

impl ServiceGate {
    pub fn new(auth: Authenticator) -> Self {
        Self { auth }
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.auth
    }

    /// Handle the packet if it belongs to a shared route.
    ///
    /// Returns the packet back when the front-end should handle it itself.
    /// Packets for authenticated-only services from a connection that has
    /// not authenticated close the connection.
    pub async fn route(&self, conn: &Arc<Connection>, packet: Packet) -> Option<Packet> {
        match packet.service_id {
            service::AUTHENTICATION => {
                self.authentication(conn, &packet).await;
                None
            }
            service::CONNECTION => {
                self.keepalive(conn, &packet);
                None
            }
            id if service::requires_auth(id) && !conn.is_authenticated() => {
                self.auth.reject_unauthenticated(conn, &packet);
                None
            }
            _ => Some(packet),
        }
    }

    async fn authentication(&self, conn: &Arc<Connection>, packet: &Packet) {
        match packet.method_id {
            auth_method::CHALLENGE_REQUEST => {
                trace!(conn = %conn.id(), "Auth challenge");
                let reply = packet.reply(auth_method::CHALLENGE_RESPONSE, Bytes::new());
                if let Err(e) = conn.send(&reply) {
                    debug!(conn = %conn.id(), "Challenge reply not sent: {}", e);
                }
            }
            auth_method::SESSION_REQUEST => {
                self.auth.authenticate(conn, packet).await;
            }
            other => debug!(conn = %conn.id(), method = other, "Unknown authentication method"),
        }
    }

    fn keepalive(&self, conn: &Arc<Connection>, packet: &Packet) {
        let is_ping = packet.method_id == connection_method::PING
            && packet.body.first().map_or(true, |kind| *kind == message_type::PING);
        if !is_ping {
            debug!(conn = %conn.id(), method = packet.method_id, "Unknown connection method");
            return;
        }
        if let Err(e) = conn.send(&packet.reply(connection_method::PONG, pong_body())) {
            debug!(conn = %conn.id(), "Pong not sent: {}", e);
        }
    }
}
