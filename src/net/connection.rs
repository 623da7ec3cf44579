//! Framed connection: one socket, its auth/session state, a FIFO outbound
//! queue and the header/body read loop.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::auth::AuthState;
use crate::metrics::Metrics;
use crate::net::framing::{self, FramingError};
use crate::net::protocol::{Packet, HEADER_SIZE, MAX_BODY_SIZE};
use crate::session::SessionId;

/// How long a graceful transport shutdown may take before the writer is dropped
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Server-assigned connection identity, unique for the lifetime of a front-end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Errors from [`Connection::send`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("connection closed")]
    Closed,
    #[error("outbound body too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
    #[error("no runtime available to drive the write")]
    NoRuntime,
}

/// Why a read loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    /// Closed locally (explicit close, shutdown, idle sweep, auth rejection)
    Closed,
    /// Peer closed or reset the stream
    PeerClosed,
    /// Peer violated framing limits
    ProtocolFault,
    /// Any other transport error
    Error,
}

/// Per-connection traffic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
}

#[derive(Debug)]
struct ConnectionInfo {
    auth_state: AuthState,
    login: Option<String>,
    session: Option<SessionId>,
    last_activity: Instant,
    stats: ConnectionStats,
}

#[derive(Default)]
struct Outbound {
    queue: VecDeque<Bytes>,
    writing: bool,
}

/// One client connection
pub struct Connection {
    id: ConnectionId,
    remote_addr: SocketAddr,
    connected_at: Instant,
    connected: AtomicBool,
    info: Mutex<ConnectionInfo>,
    outbound: Mutex<Outbound>,
    writer: Arc<tokio::sync::Mutex<Option<BoxedWriter>>>,
    close_tx: watch::Sender<bool>,
    /// Runtime that drives writes, so `send` works from any thread
    runtime: Option<Handle>,
    metrics: Arc<Metrics>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("connected", &self.is_connected())
            .field("auth_state", &self.auth_state())
            .finish()
    }
}

impl Connection {
    pub fn new<W>(id: ConnectionId, remote_addr: SocketAddr, writer: W, metrics: Arc<Metrics>) -> Arc<Self>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let now = Instant::now();
        let (close_tx, _) = watch::channel(false);
        Arc::new(Self {
            id,
            remote_addr,
            connected_at: now,
            connected: AtomicBool::new(true),
            info: Mutex::new(ConnectionInfo {
                auth_state: AuthState::NotAuthenticated,
                login: None,
                session: None,
                last_activity: now,
                stats: ConnectionStats::default(),
            }),
            outbound: Mutex::new(Outbound::default()),
            writer: Arc::new(tokio::sync::Mutex::new(Some(Box::new(writer)))),
            close_tx,
            runtime: Handle::try_current().ok(),
            metrics,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    // --- auth state ---

    pub fn auth_state(&self) -> AuthState {
        self.info.lock().auth_state
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth_state() == AuthState::Authenticated
    }

    /// Login of the authenticated account, if any
    pub fn login(&self) -> Option<String> {
        self.info.lock().login.clone()
    }

    /// Move to `InProgress` unless a check is already outstanding or the
    /// connection is already authenticated
    pub fn begin_auth(&self) -> bool {
        let mut info = self.info.lock();
        match info.auth_state {
            AuthState::NotAuthenticated | AuthState::AuthFailed => {
                info.auth_state = AuthState::InProgress;
                true
            }
            AuthState::InProgress | AuthState::Authenticated => false,
        }
    }

    pub fn complete_auth(&self, login: String) {
        let mut info = self.info.lock();
        info.auth_state = AuthState::Authenticated;
        info.login = Some(login);
    }

    pub fn fail_auth(&self) {
        let mut info = self.info.lock();
        info.auth_state = AuthState::AuthFailed;
        info.login = None;
    }

    // --- session association ---

    pub fn session(&self) -> Option<SessionId> {
        self.info.lock().session
    }

    /// Claim membership in `session`; fails if already in a session
    pub fn claim_session(&self, session: SessionId) -> bool {
        let mut info = self.info.lock();
        if info.session.is_some() {
            return false;
        }
        info.session = Some(session);
        true
    }

    /// Clear the association if it still points at `session`
    pub fn release_session(&self, session: SessionId) -> bool {
        let mut info = self.info.lock();
        if info.session == Some(session) {
            info.session = None;
            true
        } else {
            false
        }
    }

    // --- activity ---

    pub fn touch(&self) {
        self.info.lock().last_activity = Instant::now();
    }

    pub fn idle_time(&self) -> Duration {
        self.info.lock().last_activity.elapsed()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.info.lock().stats
    }

    fn record_sent(&self, bytes: usize) {
        {
            let mut info = self.info.lock();
            info.stats.bytes_sent += bytes as u64;
            info.stats.packets_sent += 1;
            info.last_activity = Instant::now();
        }
        self.metrics.record_packet_sent(bytes);
    }

    fn record_received(&self, bytes: usize) {
        {
            let mut info = self.info.lock();
            info.stats.bytes_received += bytes as u64;
            info.stats.packets_received += 1;
            info.last_activity = Instant::now();
        }
        self.metrics.record_packet_received(bytes);
    }

    // --- outbound ---

    /// Queue a packet for delivery
    ///
    /// May be called from any task. Packets are written strictly in the
    /// order `send` was called.
    pub fn send(self: &Arc<Self>, packet: &Packet) -> Result<(), SendError> {
        if packet.body.len() > MAX_BODY_SIZE {
            return Err(SendError::TooLarge {
                size: packet.body.len(),
                max: MAX_BODY_SIZE,
            });
        }
        self.send_bytes(packet.encode())
    }

    /// Queue an already-encoded packet
    pub fn send_bytes(self: &Arc<Self>, payload: Bytes) -> Result<(), SendError> {
        if !self.is_connected() {
            return Err(SendError::Closed);
        }

        let start_writer = {
            let mut out = self.outbound.lock();
            out.queue.push_back(payload);
            if out.writing {
                false
            } else {
                out.writing = true;
                true
            }
        };

        if start_writer {
            let Some(runtime) = self.runtime() else {
                self.abandon_queue();
                return Err(SendError::NoRuntime);
            };
            runtime.spawn(Arc::clone(self).drain());
        }
        Ok(())
    }

    async fn drain(self: Arc<Self>) {
        let mut close_rx = self.close_tx.subscribe();
        let mut writer = self.writer.lock().await;

        loop {
            let next = {
                let mut out = self.outbound.lock();
                match out.queue.pop_front() {
                    Some(payload) if self.is_connected() => payload,
                    _ => {
                        out.queue.clear();
                        out.writing = false;
                        return;
                    }
                }
            };

            let Some(stream) = writer.as_mut() else {
                self.abandon_queue();
                return;
            };

            let result = tokio::select! {
                r = async {
                    stream.write_all(&next).await?;
                    stream.flush().await
                } => r,
                _ = close_rx.wait_for(|closed| *closed) => {
                    Err(io::Error::from(io::ErrorKind::NotConnected))
                }
            };

            match result {
                Ok(()) => {
                    trace!(conn = %self.id, bytes = next.len(), "Packet written");
                    self.record_sent(next.len());
                }
                Err(e) => {
                    if framing::is_disconnect(&e) {
                        debug!(conn = %self.id, "Write aborted: {}", e);
                    } else {
                        error!(conn = %self.id, addr = %self.remote_addr, "Write failed: {}", e);
                    }
                    drop(writer);
                    self.abandon_queue();
                    self.close();
                    return;
                }
            }
        }
    }

    fn runtime(&self) -> Option<Handle> {
        self.runtime.clone().or_else(|| Handle::try_current().ok())
    }

    fn abandon_queue(&self) {
        let mut out = self.outbound.lock();
        out.queue.clear();
        out.writing = false;
    }

    /// Close the connection. Idempotent; returns true on the first call.
    ///
    /// Wakes the read loop and any in-flight write, then shuts the transport
    /// down gracefully in the background.
    pub fn close(&self) -> bool {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.close_tx.send_replace(true);
        self.outbound.lock().queue.clear();

        let writer = Arc::clone(&self.writer);
        match self.runtime() {
            Some(handle) => {
                handle.spawn(async move {
                    let mut guard = writer.lock().await;
                    if let Some(mut stream) = guard.take() {
                        let _ = tokio::time::timeout(SHUTDOWN_GRACE, stream.shutdown()).await;
                    }
                });
            }
            None => {
                if let Ok(mut guard) = writer.try_lock() {
                    guard.take();
                }
            }
        }
        true
    }

    // --- inbound ---

    /// Run the read loop until the connection ends
    ///
    /// Reads one header, then exactly its body, dispatches, and only then
    /// reads the next header. Every exit path closes the connection.
    pub async fn read_loop<R, F, Fut>(&self, mut reader: R, mut dispatch: F) -> Disconnect
    where
        R: AsyncRead + Unpin,
        F: FnMut(Packet) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut close_rx = self.close_tx.subscribe();

        let reason = loop {
            if !self.is_connected() {
                break Disconnect::Closed;
            }

            let result = tokio::select! {
                r = framing::read_packet(&mut reader) => Some(r),
                _ = close_rx.wait_for(|closed| *closed) => None,
            };

            let packet = match result {
                None => break Disconnect::Closed,
                Some(Ok(packet)) => packet,
                Some(Err(FramingError::BodyTooLarge { size, max })) => {
                    warn!(
                        conn = %self.id,
                        addr = %self.remote_addr,
                        size,
                        max,
                        "Declared body length exceeds limit, closing"
                    );
                    self.metrics.record_protocol_fault();
                    break Disconnect::ProtocolFault;
                }
                Some(Err(e)) if e.is_disconnect() => {
                    info!(conn = %self.id, addr = %self.remote_addr, "Client disconnected");
                    break Disconnect::PeerClosed;
                }
                Some(Err(e)) => {
                    error!(conn = %self.id, addr = %self.remote_addr, "Read error: {}", e);
                    break Disconnect::Error;
                }
            };

            self.record_received(HEADER_SIZE + packet.body.len());
            trace!(
                conn = %self.id,
                service = packet.service_id,
                method = packet.method_id,
                len = packet.body.len(),
                "Packet received"
            );
            dispatch(packet).await;
        };

        self.close();
        reason
    }
}
