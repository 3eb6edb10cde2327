use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::DEFAULT_MAX_FRAME_LEN;
use crate::protocol::constants::{CONTROL_PORT, DEFAULT_DELAY_SECONDS, GREETING};

/// Default UDP port of the clock service
pub const CLOCK_PORT: u16 = 123;

/// What the server does with a handle whose sends keep failing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    /// Keep failed handles and retry them on the next pass
    #[default]
    Never,
    /// Evict a handle after this many consecutive failed sends
    AfterConsecutiveFailures(u32),
}

impl EvictionPolicy {
    /// Whether a handle with `consecutive_failures` should be evicted
    #[must_use]
    pub fn should_evict(self, consecutive_failures: u32) -> bool {
        match self {
            Self::Never => false,
            Self::AfterConsecutiveFailures(limit) => consecutive_failures >= limit.max(1),
        }
    }
}

/// Configuration for the fan-out server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on (default: `0.0.0.0:22222`)
    pub bind_addr: String,

    /// First frame every client must send
    pub greeting: Vec<u8>,

    /// How long a new connection has to send its greeting (default: 5 seconds)
    pub handshake_timeout: Duration,

    /// How long to wait for a `Have`/`Missing` answer (default: 30 seconds)
    pub reply_timeout: Duration,

    /// Maximum accepted frame payload
    pub max_frame_len: usize,

    /// Delay used by the convenience signal methods (default: 5 seconds)
    pub default_delay_seconds: u32,

    /// Eviction policy for handles that fail to receive
    pub eviction: EvictionPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{CONTROL_PORT}"),
            greeting: GREETING.to_vec(),
            handshake_timeout: Duration::from_secs(5),
            reply_timeout: Duration::from_secs(30),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            default_delay_seconds: DEFAULT_DELAY_SECONDS,
            eviction: EvictionPolicy::Never,
        }
    }
}

impl ServerConfig {
    /// Create a new config builder
    #[must_use]
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }
}

/// Builder for `ServerConfig`
#[derive(Debug, Clone, Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    /// Set listen address
    #[must_use]
    pub fn bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.bind_addr = addr.into();
        self
    }

    /// Set handshake timeout
    #[must_use]
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Set who-has reply timeout
    #[must_use]
    pub fn reply_timeout(mut self, timeout: Duration) -> Self {
        self.config.reply_timeout = timeout;
        self
    }

    /// Set maximum frame payload
    #[must_use]
    pub fn max_frame_len(mut self, len: usize) -> Self {
        self.config.max_frame_len = len;
        self
    }

    /// Set delay used by the convenience signal methods
    #[must_use]
    pub fn default_delay_seconds(mut self, seconds: u32) -> Self {
        self.config.default_delay_seconds = seconds;
        self
    }

    /// Set eviction policy
    #[must_use]
    pub fn eviction(mut self, policy: EvictionPolicy) -> Self {
        self.config.eviction = policy;
        self
    }

    /// Build the configuration
    #[must_use]
    pub fn build(self) -> ServerConfig {
        self.config
    }
}

/// Configuration for the clock service listener
#[derive(Debug, Clone)]
pub struct ClockServiceConfig {
    /// Address to listen on (default: `0.0.0.0:123`)
    pub bind_addr: String,

    /// How long the responder waits on the queue before re-checking for stop
    pub queue_poll_timeout: Duration,

    /// Shift applied to every emitted timestamp, in milliseconds
    pub clock_offset_millis: i64,

    /// Receive buffer size for inbound datagrams
    pub recv_buf_size: usize,
}

impl Default for ClockServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{CLOCK_PORT}"),
            queue_poll_timeout: Duration::from_millis(500),
            clock_offset_millis: 0,
            recv_buf_size: 1024,
        }
    }
}

/// Configuration for querying a clock service
#[derive(Debug, Clone)]
pub struct ClockClientConfig {
    /// `host:port` of the clock service
    pub server: String,

    /// How long to wait for one reply (default: 2 seconds)
    pub query_timeout: Duration,

    /// Query attempts before a timeout is reported (default: 3)
    pub attempts: u32,

    /// Longest single sleep inside `wait_until` before the clock is
    /// re-queried (default: 1 hour, effectively one query per wait)
    pub max_sleep_slice: Duration,
}

impl Default for ClockClientConfig {
    fn default() -> Self {
        Self {
            server: format!("127.0.0.1:{CLOCK_PORT}"),
            query_timeout: Duration::from_secs(2),
            attempts: 3,
            max_sleep_slice: Duration::from_secs(3600),
        }
    }
}

/// Configuration for a playback client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Local directory holding replicated media files
    pub repository_dir: PathBuf,

    /// Greeting sent after connecting
    pub greeting: Vec<u8>,

    /// Maximum accepted frame payload
    pub max_frame_len: usize,

    /// Clock service settings
    pub clock: ClockClientConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            repository_dir: PathBuf::from("songs_folder"),
            greeting: GREETING.to_vec(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            clock: ClockClientConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Create a new config builder
    #[must_use]
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }
}

/// Builder for `ClientConfig`
#[derive(Debug, Clone, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Set repository directory
    #[must_use]
    pub fn repository_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.repository_dir = dir.into();
        self
    }

    /// Set clock service address
    #[must_use]
    pub fn clock_server(mut self, server: impl Into<String>) -> Self {
        self.config.clock.server = server.into();
        self
    }

    /// Set clock query timeout
    #[must_use]
    pub fn clock_query_timeout(mut self, timeout: Duration) -> Self {
        self.config.clock.query_timeout = timeout;
        self
    }

    /// Set clock query attempts
    #[must_use]
    pub fn clock_attempts(mut self, attempts: u32) -> Self {
        self.config.clock.attempts = attempts;
        self
    }

    /// Set maximum frame payload
    #[must_use]
    pub fn max_frame_len(mut self, len: usize) -> Self {
        self.config.max_frame_len = len;
        self
    }

    /// Build the configuration
    #[must_use]
    pub fn build(self) -> ClientConfig {
        self.config
    }
}
