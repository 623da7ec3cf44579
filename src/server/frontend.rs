//! One front-end service: listener, accept loop, connection registry and
//! fixed-rate scheduler.
//!
//! `init` binds, `run` spawns the accept loop and the scheduler and returns
//! immediately, `shutdown` stops both and waits for every connection task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::audit::{AuditCategory, AuditOutcome, AuditRecord, AuditSink};
use crate::metrics::Metrics;
use crate::net::{Connection, ConnectionRegistry, IdGenerator};
use crate::server::{bind_listener, stopped, PacketHandler, ServerError};

/// Pause after a failed accept (e.g. out of file descriptors)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// How long shutdown waits for connection tasks before aborting them
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct FrontEndSettings {
    pub max_connections_per_ip: usize,
    pub tick_interval: Duration,
    pub idle_timeout: Duration,
}

/// State shared between the accept loop, the scheduler and connection tasks
struct Shared<H> {
    name: &'static str,
    handler: Arc<H>,
    registry: Arc<ConnectionRegistry>,
    ids: IdGenerator,
    metrics: Arc<Metrics>,
    audit: Arc<dyn AuditSink>,
    settings: FrontEndSettings,
}

pub struct FrontEnd<H: PacketHandler> {
    shared: Arc<Shared<H>>,
    listener: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
    shutdown_tx: watch::Sender<bool>,
    tasks: JoinSet<()>,
    running: bool,
}

impl<H: PacketHandler> FrontEnd<H> {
    pub fn new(
        handler: Arc<H>,
        settings: FrontEndSettings,
        metrics: Arc<Metrics>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                name: handler.name(),
                registry: Arc::new(ConnectionRegistry::new(settings.max_connections_per_ip)),
                handler,
                ids: IdGenerator::new(),
                metrics,
                audit,
                settings,
            }),
            listener: None,
            local_addr: None,
            shutdown_tx,
            tasks: JoinSet::new(),
            running: false,
        }
    }

    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.shared.handler
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.shared.registry)
    }

    /// Bound address, once initialized
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Bind the listening socket. Must run inside a tokio runtime.
    pub fn init(&mut self, addr: SocketAddr) -> Result<SocketAddr, ServerError> {
        if self.running {
            return Err(ServerError::AlreadyRunning(self.shared.name));
        }
        let listener = bind_listener(self.shared.name, addr)?;
        let local = listener.local_addr().map_err(|source| ServerError::Bind {
            service: self.shared.name,
            addr,
            source,
        })?;
        info!("{} listening on {}", self.shared.name, local);
        self.listener = Some(listener);
        self.local_addr = Some(local);
        Ok(local)
    }

    /// Start the accept loop and the scheduler; returns without blocking
    pub fn run(&mut self) -> Result<(), ServerError> {
        if self.running {
            return Err(ServerError::AlreadyRunning(self.shared.name));
        }
        let listener = self
            .listener
            .take()
            .ok_or(ServerError::NotInitialized(self.shared.name))?;

        self.tasks.spawn(accept_loop(
            Arc::clone(&self.shared),
            listener,
            self.shutdown_tx.subscribe(),
        ));
        self.tasks
            .spawn(scheduler(Arc::clone(&self.shared), self.shutdown_tx.subscribe()));
        self.running = true;
        Ok(())
    }

    /// Stop accepting, close every connection, stop the scheduler and wait
    /// for all tasks. Idempotent.
    pub async fn shutdown(&mut self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        self.listener = None;

        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                error!("{} task failed during shutdown: {}", self.shared.name, e);
            }
        }
        self.running = false;
        info!("{} stopped", self.shared.name);
    }
}

async fn accept_loop<H: PacketHandler>(
    shared: Arc<Shared<H>>,
    listener: TcpListener,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();

    loop {
        let accepted = tokio::select! {
            _ = stopped(&mut shutdown_rx) => break,
            accepted = listener.accept() => accepted,
            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = finished {
                    error!("{} connection task failed: {}", shared.name, e);
                }
                continue;
            }
        };

        match accepted {
            Ok((stream, addr)) => shared.admit(stream, addr, &mut connections),
            Err(e) => {
                warn!("{} accept failed: {}", shared.name, e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }

    drop(listener);
    let closed = shared.registry.close_all();
    info!("{} closing {} connection(s)", shared.name, closed);

    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while let Some(finished) = connections.join_next().await {
            if let Err(e) = finished {
                error!("{} connection task failed: {}", shared.name, e);
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!("{} aborting {} connection task(s)", shared.name, connections.len());
        connections.shutdown().await;
    }
}

async fn scheduler<H: PacketHandler>(shared: Arc<Shared<H>>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = interval(shared.settings.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(
        "{} scheduler started at {:.0} Hz",
        shared.name,
        1.0 / shared.settings.tick_interval.as_secs_f64()
    );

    let mut last = Instant::now();
    loop {
        tokio::select! {
            _ = stopped(&mut shutdown_rx) => break,
            _ = ticker.tick() => {}
        }

        let started = Instant::now();
        let delta = started.duration_since(last);
        last = started;

        shared.handler.tick(delta);

        let idle = shared.registry.close_idle(shared.settings.idle_timeout);
        if !idle.is_empty() {
            info!("{} closed {} idle connection(s)", shared.name, idle.len());
        }
        let swept = shared.registry.sweep();
        if !swept.is_empty() {
            debug!("{} swept {} connection(s)", shared.name, swept.len());
        }
        shared.handler.sweep();

        shared.metrics.record_tick_time(started.elapsed());
    }
    debug!("{} scheduler stopped", shared.name);
}

impl<H: PacketHandler> Shared<H> {
    fn admit(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr, tasks: &mut JoinSet<()>) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("{}: set_nodelay failed for {}: {}", self.name, addr, e);
        }

        let id = self.ids.next_id();
        let (reader, writer) = stream.into_split();
        let conn = Connection::new(id, addr, writer, Arc::clone(&self.metrics));

        if let Err(e) = self.registry.register(Arc::clone(&conn)) {
            warn!(service = self.name, addr = %addr, "Connection refused: {}", e);
            self.metrics.connection_rejected();
            self.audit.record(
                AuditRecord::new(
                    AuditRecord::UNKNOWN_ACTOR,
                    addr.to_string(),
                    AuditCategory::Network,
                    "Connection refused",
                    AuditOutcome::Unauthorized,
                )
                .with_details(format!("{}: {}", self.name, e)),
            );
            conn.close();
            return;
        }

        self.metrics.connection_opened();
        info!(service = self.name, conn = %id, addr = %addr, "Client connected");
        tasks.spawn(Arc::clone(self).serve(conn, reader));
    }

    async fn serve(self: Arc<Self>, conn: Arc<Connection>, reader: OwnedReadHalf) {
        let handler = Arc::clone(&self.handler);
        let reason = conn
            .read_loop(reader, |packet| {
                let handler = Arc::clone(&handler);
                let conn = Arc::clone(&conn);
                async move { handler.handle(conn, packet).await }
            })
            .await;

        self.handler.on_disconnect(&conn);
        self.registry.remove(conn.id());
        self.metrics.connection_closed();

        let stats = conn.stats();
        debug!(
            service = self.name,
            conn = %conn.id(),
            ?reason,
            connected_for = ?conn.connected_at().elapsed(),
            packets_in = stats.packets_received,
            packets_out = stats.packets_sent,
            "Connection finished"
        );
    }
}
