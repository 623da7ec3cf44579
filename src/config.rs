use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration, read once at startup and immutable afterwards
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address every service binds to
    pub bind_address: IpAddr,
    /// Authentication gateway port
    pub gateway_port: u16,
    /// Game/session server port
    pub game_port: u16,
    /// Admin HTTP port
    pub admin_port: u16,
    /// Maximum simultaneous connections from one source address, per service
    pub max_connections_per_ip: usize,
    /// Maximum players per session
    pub max_session_players: usize,
    /// Maximum live sessions on the game server
    pub max_sessions: usize,
    /// Scheduler frequency in Hz
    pub tick_rate: u32,
    /// Connections idle longer than this are closed by the scheduler
    pub idle_timeout: Duration,
    /// JSON-lines audit file; `None` keeps audit records in memory only
    pub audit_log_path: Option<PathBuf>,
    /// `(login, password)` accounts loaded into the in-memory store
    pub seed_accounts: Vec<(String, String)>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            gateway_port: 1119,
            game_port: 1120,
            admin_port: 8080,
            max_connections_per_ip: 10,
            max_session_players: 4,
            max_sessions: 1000,
            tick_rate: 60,
            idle_timeout: Duration::from_secs(300),
            audit_log_path: None,
            seed_accounts: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        Self::load_from(|key| std::env::var(key).ok())
    }

    /// Load config through an arbitrary variable lookup
    pub fn load_from(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("BIND_ADDRESS") {
            if let Ok(parsed) = addr.parse() {
                config.bind_address = parsed;
            } else {
                tracing::warn!("Invalid BIND_ADDRESS '{}', using default", addr);
            }
        }

        parse_var(&lookup, "GATEWAY_PORT", &mut config.gateway_port, |p| *p > 0, "must be > 0");
        parse_var(&lookup, "GAME_PORT", &mut config.game_port, |p| *p > 0, "must be > 0");
        parse_var(&lookup, "ADMIN_PORT", &mut config.admin_port, |p| *p > 0, "must be > 0");
        parse_var(
            &lookup,
            "MAX_CONNECTIONS_PER_IP",
            &mut config.max_connections_per_ip,
            |n| (1..=10_000).contains(n),
            "must be 1-10000",
        );
        parse_var(
            &lookup,
            "MAX_SESSION_PLAYERS",
            &mut config.max_session_players,
            |n| (1..=64).contains(n),
            "must be 1-64",
        );
        parse_var(
            &lookup,
            "MAX_SESSIONS",
            &mut config.max_sessions,
            |n| (1..=100_000).contains(n),
            "must be 1-100000",
        );
        parse_var(
            &lookup,
            "TICK_RATE",
            &mut config.tick_rate,
            |n| (1..=240).contains(n),
            "must be 1-240",
        );

        let mut idle_secs = config.idle_timeout.as_secs();
        parse_var(&lookup, "IDLE_TIMEOUT_SECS", &mut idle_secs, |n| *n > 0, "must be > 0");
        config.idle_timeout = Duration::from_secs(idle_secs);

        if let Some(path) = lookup("AUDIT_LOG_PATH") {
            if !path.trim().is_empty() {
                config.audit_log_path = Some(PathBuf::from(path));
            }
        }

        if let Some(seeds) = lookup("SEED_ACCOUNTS") {
            config.seed_accounts = parse_seed_accounts(&seeds);
        }

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        if self.gateway_port == 0 || self.game_port == 0 || self.admin_port == 0 {
            return Err("Ports cannot be 0".to_string());
        }
        if self.gateway_port == self.game_port
            || self.gateway_port == self.admin_port
            || self.game_port == self.admin_port
        {
            return Err("Gateway, game and admin ports must differ".to_string());
        }
        if self.max_connections_per_ip == 0 {
            return Err("max_connections_per_ip must be at least 1".to_string());
        }
        if self.max_session_players == 0 {
            return Err("max_session_players must be at least 1".to_string());
        }
        if self.max_sessions == 0 {
            return Err("max_sessions must be at least 1".to_string());
        }
        if !(1..=240).contains(&self.tick_rate) {
            return Err("tick_rate must be 1-240".to_string());
        }
        if self.idle_timeout.is_zero() {
            return Err("idle_timeout must be positive".to_string());
        }
        Ok(())
    }

    pub fn gateway_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.gateway_port)
    }

    pub fn game_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.game_port)
    }

    pub fn admin_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.admin_port)
    }

    /// Scheduler period derived from `tick_rate`
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_rate.max(1)))
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
    valid: impl Fn(&T) -> bool,
    rule: &str,
) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(parsed) if valid(&parsed) => *target = parsed,
        Ok(_) => tracing::warn!("{} {}, using default", key, rule),
        Err(_) => tracing::warn!("Invalid {} '{}', using default", key, raw),
    }
}

/// Parse `login:password[,login:password...]`, skipping malformed entries
fn parse_seed_accounts(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match entry.split_once(':') {
            Some((login, password)) if !login.is_empty() && !password.is_empty() => {
                Some((login.to_string(), password.to_string()))
            }
            _ => {
                tracing::warn!("Ignoring malformed SEED_ACCOUNTS entry");
                None
            }
        })
        .collect()
}
