//! Prometheus-compatible server metrics
//!
//! Counters are plain atomics updated from connection tasks and the
//! scheduler; rendering happens on demand for the admin endpoint.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

/// Tick samples kept for percentile calculation
const TICK_HISTORY: usize = 1000;

/// Metrics registry shared by every front-end
#[derive(Debug)]
pub struct Metrics {
    // Connections
    pub connections_active: AtomicU64,
    pub connections_total: AtomicU64,
    pub connections_rejected: AtomicU64,

    // Authentication
    pub auth_success: AtomicU64,
    pub auth_failure: AtomicU64,

    // Sessions
    pub sessions_active: AtomicU64,
    pub session_players: AtomicU64,

    // Traffic
    pub packets_sent: AtomicU64,
    pub packets_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub protocol_faults: AtomicU64,

    // Tick timing (microseconds)
    pub tick_time_us: AtomicU64,
    pub tick_time_p95_us: AtomicU64,
    pub tick_time_p99_us: AtomicU64,
    pub tick_time_max_us: AtomicU64,
    pub tick_count: AtomicU64,

    start_time: Instant,

    // Rolling tick times for percentile calculation
    tick_history: RwLock<VecDeque<u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connections_active: AtomicU64::new(0),
            connections_total: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
            auth_success: AtomicU64::new(0),
            auth_failure: AtomicU64::new(0),
            sessions_active: AtomicU64::new(0),
            session_players: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            protocol_faults: AtomicU64::new(0),
            tick_time_us: AtomicU64::new(0),
            tick_time_p95_us: AtomicU64::new(0),
            tick_time_p99_us: AtomicU64::new(0),
            tick_time_max_us: AtomicU64::new(0),
            tick_count: AtomicU64::new(0),
            start_time: Instant::now(),
            tick_history: RwLock::new(VecDeque::with_capacity(TICK_HISTORY)),
        }
    }

    /// Record a scheduler tick duration and update percentiles
    pub fn record_tick_time(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.tick_time_us.store(us, Ordering::Relaxed);
        self.tick_count.fetch_add(1, Ordering::Relaxed);

        let mut history = self.tick_history.write();
        history.push_back(us);
        while history.len() > TICK_HISTORY {
            history.pop_front();
        }

        if history.len() >= 10 {
            let mut sorted: Vec<u64> = history.iter().copied().collect();
            sorted.sort_unstable();

            let p95_idx = (sorted.len() as f32 * 0.95) as usize;
            let p99_idx = (sorted.len() as f32 * 0.99) as usize;

            self.tick_time_p95_us.store(sorted[p95_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_p99_us.store(sorted[p99_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_max_us.store(sorted.last().copied().unwrap_or(0), Ordering::Relaxed);
        }
    }

    pub fn record_packet_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_packet_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_protocol_fault(&self) {
        self.protocol_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auth(&self, success: bool) {
        if success {
            self.auth_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.auth_failure.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn connection_opened(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        // Saturating: never wrap below zero if a close is double-counted
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    pub fn connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_sessions(&self, sessions: usize, players: usize) {
        self.sessions_active.store(sessions as u64, Ordering::Relaxed);
        self.session_players.store(players as u64, Ordering::Relaxed);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Prometheus text exposition format
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(4096);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        metric!("d3_server_connections_active", "Open client connections", "gauge",
            self.connections_active.load(Ordering::Relaxed));
        metric!("d3_server_connections_total", "Accepted client connections", "counter",
            self.connections_total.load(Ordering::Relaxed));
        metric!("d3_server_connections_rejected_total", "Connections refused by the per-address cap", "counter",
            self.connections_rejected.load(Ordering::Relaxed));

        metric!("d3_server_auth_success_total", "Successful logins", "counter",
            self.auth_success.load(Ordering::Relaxed));
        metric!("d3_server_auth_failure_total", "Failed logins", "counter",
            self.auth_failure.load(Ordering::Relaxed));

        metric!("d3_server_sessions_active", "Live game sessions", "gauge",
            self.sessions_active.load(Ordering::Relaxed));
        metric!("d3_server_session_players", "Players across all sessions", "gauge",
            self.session_players.load(Ordering::Relaxed));

        metric!("d3_server_packets_sent_total", "Packets written", "counter",
            self.packets_sent.load(Ordering::Relaxed));
        metric!("d3_server_packets_received_total", "Packets read", "counter",
            self.packets_received.load(Ordering::Relaxed));
        metric!("d3_server_bytes_sent_total", "Bytes written", "counter",
            self.bytes_sent.load(Ordering::Relaxed));
        metric!("d3_server_bytes_received_total", "Bytes read", "counter",
            self.bytes_received.load(Ordering::Relaxed));
        metric!("d3_server_protocol_faults_total", "Connections closed for framing violations", "counter",
            self.protocol_faults.load(Ordering::Relaxed));

        metric!("d3_server_tick_time_microseconds", "Last scheduler tick time", "gauge",
            self.tick_time_us.load(Ordering::Relaxed));
        metric!("d3_server_tick_time_p95_microseconds", "95th percentile tick time", "gauge",
            self.tick_time_p95_us.load(Ordering::Relaxed));
        metric!("d3_server_tick_time_p99_microseconds", "99th percentile tick time", "gauge",
            self.tick_time_p99_us.load(Ordering::Relaxed));
        metric!("d3_server_tick_time_max_microseconds", "Maximum tick time", "gauge",
            self.tick_time_max_us.load(Ordering::Relaxed));
        metric!("d3_server_tick_count", "Scheduler ticks processed", "counter",
            self.tick_count.load(Ordering::Relaxed));

        metric!("d3_server_uptime_seconds", "Server uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "connections": {
                "active": self.connections_active.load(Ordering::Relaxed),
                "total": self.connections_total.load(Ordering::Relaxed),
                "rejected": self.connections_rejected.load(Ordering::Relaxed),
            },
            "auth": {
                "success": self.auth_success.load(Ordering::Relaxed),
                "failure": self.auth_failure.load(Ordering::Relaxed),
            },
            "sessions": {
                "active": self.sessions_active.load(Ordering::Relaxed),
                "players": self.session_players.load(Ordering::Relaxed),
            },
            "network": {
                "packets_sent": self.packets_sent.load(Ordering::Relaxed),
                "packets_received": self.packets_received.load(Ordering::Relaxed),
                "bytes_sent": self.bytes_sent.load(Ordering::Relaxed),
                "bytes_received": self.bytes_received.load(Ordering::Relaxed),
                "protocol_faults": self.protocol_faults.load(Ordering::Relaxed),
            },
            "performance": {
                "tick_time_us": self.tick_time_us.load(Ordering::Relaxed),
                "tick_time_p95_us": self.tick_time_p95_us.load(Ordering::Relaxed),
                "tick_time_p99_us": self.tick_time_p99_us.load(Ordering::Relaxed),
                "tick_time_max_us": self.tick_time_max_us.load(Ordering::Relaxed),
                "tick_count": self.tick_count.load(Ordering::Relaxed),
            },
            "uptime_seconds": self.uptime_seconds(),
        })
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
