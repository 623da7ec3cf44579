//! Authentication gateway: challenge, credential check and keepalive only

use std::sync::Arc;

use tracing::debug;

use crate::auth::Authenticator;
use crate::net::protocol::Packet;
use crate::net::Connection;
use crate::server::{PacketHandler, ServiceGate};

pub struct GatewayHandler {
    gate: ServiceGate,
}

impl GatewayHandler {
    pub fn new(auth: Authenticator) -> Self {
        Self {
            gate: ServiceGate::new(auth),
        }
    }
}

impl PacketHandler for GatewayHandler {
    fn name(&self) -> &'static str {
        "gateway"
    }

    async fn handle(&self, conn: Arc<Connection>, packet: Packet) {
        if let Some(packet) = self.gate.route(&conn, packet).await {
            debug!(
                conn = %conn.id(),
                service = packet.service_id,
                method = packet.method_id,
                "Request not served by the gateway"
            );
        }
    }

    fn on_disconnect(&self, conn: &Arc<Connection>) {
        if let Some(login) = conn.login() {
            debug!(conn = %conn.id(), login = %login, "Gateway client left");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::metrics::Metrics;
    use crate::net::framing;
    use crate::net::protocol::{auth_method, game_method, service, AuthRequest};
    use crate::server::{FrontEnd, FrontEndSettings};
    use crate::store::MemoryAccountStore;
    use bytes::Bytes;
    use std::num::NonZeroU32;
    use std::time::Duration;
    use tokio::net::TcpStream;

    async fn gateway() -> (FrontEnd<GatewayHandler>, std::net::SocketAddr) {
        let store = Arc::new(MemoryAccountStore::with_iterations(NonZeroU32::new(100).unwrap()));
        store.create_account("alice", "alice@example.com", "secret").unwrap();
        let audit = Arc::new(AuditLog::in_memory(64));
        let metrics = Arc::new(Metrics::new());
        let auth = Authenticator::new(store, audit.clone(), metrics.clone());

        let settings = FrontEndSettings {
            max_connections_per_ip: 4,
            tick_interval: Duration::from_millis(20),
            idle_timeout: Duration::from_secs(60),
        };
        let mut fe = FrontEnd::new(Arc::new(GatewayHandler::new(auth)), settings, metrics, audit);
        let addr = fe.init("127.0.0.1:0".parse().unwrap()).unwrap();
        fe.run().unwrap();
        (fe, addr)
    }

    fn login(password: &str, correlation: u32) -> Packet {
        let body = AuthRequest {
            login: "alice".to_string(),
            password: password.to_string(),
        }
        .encode();
        Packet::new(service::AUTHENTICATION, auth_method::SESSION_REQUEST, correlation, body)
    }

    #[tokio::test]
    async fn test_login_over_tcp() {
        let (mut fe, addr) = gateway().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        framing::write_packet(&mut client, &login("wrong", 1)).await.unwrap();
        let denied = framing::read_packet(&mut client).await.unwrap();
        assert_eq!(&denied.body[..], &[0x02, 0x00]);

        framing::write_packet(&mut client, &login("secret", 2)).await.unwrap();
        let accepted = framing::read_packet(&mut client).await.unwrap();
        assert_eq!(accepted.correlation_id, 2);
        assert_eq!(&accepted.body[..], &[0x02, 0x01]);

        let conn = fe.registry().snapshot().remove(0);
        assert_eq!(conn.login().as_deref(), Some("alice"));
        fe.shutdown().await;
    }

    #[tokio::test]
    async fn test_unauthenticated_character_list_closes_connection() {
        let (mut fe, addr) = gateway().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        let request = Packet::new(service::GAME_UTILITIES, game_method::CHARACTER_LIST_REQUEST, 1, Bytes::new());
        framing::write_packet(&mut client, &request).await.unwrap();

        let err = framing::read_packet(&mut client).await.unwrap_err();
        assert!(err.is_disconnect());
        fe.shutdown().await;
    }
}
