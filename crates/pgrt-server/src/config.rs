//! Server configuration.

use clap::Parser;
use std::time::Duration;

/// Default address for the HTTP/WebSocket listener.
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:2222";

/// Default notify channel the trigger publishes on.
pub const DEFAULT_CHANNEL: &str = "events";

/// Default name of the trigger function.
pub const DEFAULT_TRIGGER_FUNCTION: &str = "listener";

/// Default time a client has to answer a ping, in seconds.
pub const DEFAULT_PONG_WAIT_SECS: u64 = 30;

/// Default write timeout in seconds.
pub const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 10;

/// Default maximum inbound message size in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024;

/// Default per-session outbound queue capacity.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Default idle interval before the listener probes its connection, in seconds.
pub const DEFAULT_LISTENER_IDLE_SECS: u64 = 60;

/// Default capacity of the listener to router channel.
pub const DEFAULT_CHANGE_BUFFER: usize = 1024;

/// WebSocket keepalive settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// How long the reader waits for a pong before giving up on the peer.
    pub pong_wait: Duration,
    /// Interval between pings. Always shorter than `pong_wait`.
    pub ping_period: Duration,
    /// Upper bound on a single write or flush.
    pub write_timeout: Duration,
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
}

impl KeepaliveConfig {
    /// Derive the ping period from the pong wait at a 9:10 ratio.
    pub fn new(pong_wait: Duration) -> Self {
        Self {
            pong_wait,
            ping_period: pong_wait * 9 / 10,
            write_timeout: Duration::from_secs(DEFAULT_WRITE_TIMEOUT_SECS),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// Set the write timeout.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the maximum inbound message size.
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_PONG_WAIT_SECS))
    }
}

/// Reconnection policy for the change listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for the doubling backoff.
    pub max_backoff: Duration,
    /// Consecutive failed attempts before giving up. 0 retries forever.
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Backoff to wait after `attempt` consecutive failures (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }

    /// Whether another attempt is allowed after `attempts` failures.
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_attempts == 0 || attempts < self.max_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            max_attempts: 10,
        }
    }
}

/// pgrt server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the HTTP/WebSocket listener to.
    pub listen_addr: String,

    /// Postgres connection string.
    pub database_url: String,

    /// Notify channel to LISTEN on.
    pub channel: String,

    /// Name of the trigger function to provision.
    pub trigger_function: String,

    /// Tables to attach the notify trigger to at startup.
    pub tables: Vec<String>,

    /// Origins allowed to open a socket. Empty allows every origin.
    pub allowed_origins: Vec<String>,

    /// WebSocket keepalive settings.
    pub keepalive: KeepaliveConfig,

    /// Per-session outbound queue capacity.
    pub outbound_capacity: usize,

    /// Idle interval before the listener probes its connection.
    pub listener_idle: Duration,

    /// Capacity of the channel between the listener and the router.
    pub change_buffer: usize,

    /// Listener reconnection policy.
    pub reconnect: ReconnectPolicy,
}

impl ServerConfig {
    /// Create a configuration for the given database.
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDRESS.to_string(),
            database_url: database_url.into(),
            channel: DEFAULT_CHANNEL.to_string(),
            trigger_function: DEFAULT_TRIGGER_FUNCTION.to_string(),
            tables: Vec::new(),
            allowed_origins: Vec::new(),
            keepalive: KeepaliveConfig::default(),
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            listener_idle: Duration::from_secs(DEFAULT_LISTENER_IDLE_SECS),
            change_buffer: DEFAULT_CHANGE_BUFFER,
            reconnect: ReconnectPolicy::default(),
        }
    }

    /// Set the listen address.
    pub fn with_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = addr.into();
        self
    }

    /// Set the notify channel.
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    /// Add a table to provision the trigger on.
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.tables.push(table.into());
        self
    }

    /// Restrict which origins may connect.
    pub fn with_allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.allowed_origins = origins;
        self
    }

    /// Set the keepalive settings.
    pub fn with_keepalive(mut self, keepalive: KeepaliveConfig) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// Set the outbound queue capacity.
    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity.max(1);
        self
    }

    /// Set the listener reconnection policy.
    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Check whether an origin may open a socket.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        if self.allowed_origins.is_empty() {
            return true;
        }
        match origin {
            Some(origin) => self.allowed_origins.iter().any(|allowed| allowed == origin),
            None => false,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new("postgres://localhost/postgres")
    }
}

/// Command-line arguments for the server.
#[derive(Parser, Debug)]
#[command(name = "pgrt-server")]
#[command(version, about = "Postgres change notifications over WebSockets", long_about = None)]
pub struct Args {
    /// Postgres connection string.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Address to listen on.
    #[arg(short, long, default_value = DEFAULT_LISTEN_ADDRESS)]
    pub listen: String,

    /// Notify channel the trigger publishes on.
    #[arg(long, default_value = DEFAULT_CHANNEL)]
    pub channel: String,

    /// Name of the trigger function.
    #[arg(long, default_value = DEFAULT_TRIGGER_FUNCTION)]
    pub trigger_function: String,

    /// Table to attach the notify trigger to (repeatable).
    #[arg(long = "table")]
    pub tables: Vec<String>,

    /// Origin allowed to connect (repeatable). Omit to allow all.
    #[arg(long = "allow-origin")]
    pub allowed_origins: Vec<String>,

    /// Seconds a client has to answer a ping.
    #[arg(long, default_value_t = DEFAULT_PONG_WAIT_SECS)]
    pub pong_wait: u64,

    /// Write timeout in seconds.
    #[arg(long, default_value_t = DEFAULT_WRITE_TIMEOUT_SECS)]
    pub write_timeout: u64,

    /// Maximum inbound message size in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_MESSAGE_SIZE)]
    pub max_message_size: usize,

    /// Per-session outbound queue capacity.
    #[arg(long, default_value_t = DEFAULT_OUTBOUND_CAPACITY)]
    pub outbound_capacity: usize,

    /// Seconds without notifications before the listener pings Postgres.
    #[arg(long, default_value_t = DEFAULT_LISTENER_IDLE_SECS)]
    pub listener_idle: u64,

    /// Listener reconnect attempts before giving up (0 = forever).
    #[arg(long, default_value_t = 10)]
    pub reconnect_attempts: u32,

    /// Maximum listener reconnect backoff in seconds.
    #[arg(long, default_value_t = 60)]
    pub reconnect_max_backoff: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Args {
    /// Convert command-line arguments to server configuration.
    pub fn into_config(self) -> ServerConfig {
        let keepalive = KeepaliveConfig::new(Duration::from_secs(self.pong_wait.max(1)))
            .with_write_timeout(Duration::from_secs(self.write_timeout))
            .with_max_message_size(self.max_message_size);

        let reconnect = ReconnectPolicy {
            max_attempts: self.reconnect_attempts,
            max_backoff: Duration::from_secs(self.reconnect_max_backoff.max(1)),
            ..ReconnectPolicy::default()
        };

        ServerConfig {
            listen_addr: self.listen,
            database_url: self.database_url,
            channel: self.channel,
            trigger_function: self.trigger_function,
            tables: self.tables,
            allowed_origins: self.allowed_origins,
            keepalive,
            outbound_capacity: self.outbound_capacity.max(1),
            listener_idle: Duration::from_secs(self.listener_idle.max(1)),
            change_buffer: DEFAULT_CHANGE_BUFFER,
            reconnect,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.listen_addr, DEFAULT_LISTEN_ADDRESS);
        assert_eq!(config.channel, "events");
        assert_eq!(config.trigger_function, "listener");
        assert!(config.tables.is_empty());
        assert_eq!(config.outbound_capacity, DEFAULT_OUTBOUND_CAPACITY);
    }

    #[test]
    fn test_ping_period_shorter_than_pong_wait() {
        let keepalive = KeepaliveConfig::default();
        assert_eq!(keepalive.pong_wait, Duration::from_secs(30));
        assert_eq!(keepalive.ping_period, Duration::from_secs(27));
        assert!(keepalive.ping_period < keepalive.pong_wait);
    }

    #[test]
    fn test_origin_allow_list() {
        let open = ServerConfig::default();
        assert!(open.origin_allowed(None));
        assert!(open.origin_allowed(Some("https://anything.example")));

        let closed = ServerConfig::default()
            .with_allowed_origins(vec!["https://app.example".to_string()]);
        assert!(closed.origin_allowed(Some("https://app.example")));
        assert!(!closed.origin_allowed(Some("https://evil.example")));
        assert!(!closed.origin_allowed(None));
    }

    #[test]
    fn test_reconnect_backoff() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(4), Duration::from_secs(8));
        assert_eq!(policy.backoff(10), Duration::from_secs(60));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(60));

        assert!(policy.allows(9));
        assert!(!policy.allows(10));

        let forever = ReconnectPolicy {
            max_attempts: 0,
            ..policy
        };
        assert!(forever.allows(u32::MAX));
    }

    #[test]
    fn test_args_into_config() {
        let args = Args::parse_from([
            "pgrt-server",
            "--database-url",
            "postgres://db/app",
            "--table",
            "users",
            "--table",
            "posts",
            "--allow-origin",
            "https://app.example",
            "--pong-wait",
            "20",
        ]);
        let config = args.into_config();

        assert_eq!(config.database_url, "postgres://db/app");
        assert_eq!(config.tables, vec!["users", "posts"]);
        assert_eq!(config.allowed_origins, vec!["https://app.example"]);
        assert_eq!(config.keepalive.pong_wait, Duration::from_secs(20));
        assert_eq!(config.keepalive.ping_period, Duration::from_secs(18));
    }
}
