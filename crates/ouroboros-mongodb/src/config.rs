//! Driver, pool and connection settings

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::address::{AddressResolver, DnsResolver, ServerAddress};
use crate::auth::{Authenticators, Credential};
use crate::error::{DriverError, Result};
use crate::selector::ReadPreference;

/// Size used for documents when the server does not report one
pub const DEFAULT_MAX_DOCUMENT_SIZE: usize = 4 * 1024 * 1024;

/// Size used for whole messages when the server does not report one
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 16 * 1024 * 1024;

/// Socket-level settings for each connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Dial timeout (default: 30s)
    pub connect_timeout: Duration,
    /// Read/write deadline per operation; `None` waits forever
    pub socket_timeout: Option<Duration>,
    /// SO_SNDBUF in bytes (default: 64 KiB)
    pub send_buffer_size: u32,
    /// SO_RCVBUF in bytes (default: 64 KiB)
    pub receive_buffer_size: u32,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            socket_timeout: None,
            send_buffer_size: 64 * 1024,
            receive_buffer_size: 64 * 1024,
        }
    }
}

impl ConnectionSettings {
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// A zero duration means no deadline
    pub fn socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = if timeout.is_zero() { None } else { Some(timeout) };
        self
    }

    pub fn send_buffer_size(mut self, bytes: u32) -> Self {
        self.send_buffer_size = bytes;
        self
    }

    pub fn receive_buffer_size(mut self, bytes: u32) -> Self {
        self.receive_buffer_size = bytes;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout.is_zero() {
            return Err(DriverError::InvalidConfiguration(
                "connect_timeout must be positive".into(),
            ));
        }
        if self.send_buffer_size == 0 || self.receive_buffer_size == 0 {
            return Err(DriverError::InvalidConfiguration(
                "socket buffer sizes must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Per-server connection pool settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Maximum connections handed out or idle at once (default: 100)
    pub max_pool_size: usize,
    /// How long `acquire` waits for a free slot (default: 120s)
    pub wait_queue_timeout: Duration,
    /// Idle connections older than this are closed (default: 10 minutes)
    pub max_idle_time: Duration,
    /// Connections older than this are closed on release (default: 30 minutes)
    pub max_life_time: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_pool_size: 100,
            wait_queue_timeout: Duration::from_secs(120),
            max_idle_time: Duration::from_secs(10 * 60),
            max_life_time: Duration::from_secs(30 * 60),
        }
    }
}

impl PoolSettings {
    pub fn max_pool_size(mut self, size: usize) -> Self {
        self.max_pool_size = size;
        self
    }

    pub fn wait_queue_timeout(mut self, timeout: Duration) -> Self {
        self.wait_queue_timeout = timeout;
        self
    }

    pub fn max_idle_time(mut self, idle: Duration) -> Self {
        self.max_idle_time = idle;
        self
    }

    pub fn max_life_time(mut self, life: Duration) -> Self {
        self.max_life_time = life;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_pool_size == 0 {
            return Err(DriverError::InvalidConfiguration(
                "max_pool_size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// How the seed list is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    /// Replica set when a set name is given, direct for one seed, sharded otherwise
    #[default]
    Automatic,
    /// Talk to exactly one server
    Direct,
    /// Discover members from the primary's host list
    ReplicaSet,
    /// A fixed list of routers
    Sharded,
}

/// Top-level driver settings
#[derive(Clone)]
pub struct DriverSettings {
    pub seeds: Vec<ServerAddress>,
    pub replica_set_name: Option<String>,
    pub connection_mode: ConnectionMode,
    pub credential: Option<Credential>,
    pub read_preference: ReadPreference,
    pub connection: ConnectionSettings,
    pub pool: PoolSettings,
    /// Interval between health checks (default: 10s)
    pub heartbeat_interval: Duration,
    /// Latency window for secondary reads; `None` accepts any latency (default: 15ms)
    pub secondary_acceptable_latency: Option<Duration>,
    /// How long `select_server` keeps retrying (default: 30s)
    pub server_selection_timeout: Duration,
    pub resolver: Arc<dyn AddressResolver>,
    pub authenticators: Authenticators,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            replica_set_name: None,
            connection_mode: ConnectionMode::Automatic,
            credential: None,
            read_preference: ReadPreference::Primary,
            connection: ConnectionSettings::default(),
            pool: PoolSettings::default(),
            heartbeat_interval: Duration::from_secs(10),
            secondary_acceptable_latency: Some(Duration::from_millis(15)),
            server_selection_timeout: Duration::from_secs(30),
            resolver: Arc::new(DnsResolver),
            authenticators: Authenticators::default(),
        }
    }
}

impl fmt::Debug for DriverSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverSettings")
            .field("seeds", &self.seeds)
            .field("replica_set_name", &self.replica_set_name)
            .field("connection_mode", &self.connection_mode)
            .field("credential", &self.credential)
            .field("read_preference", &self.read_preference)
            .field("connection", &self.connection)
            .field("pool", &self.pool)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("secondary_acceptable_latency", &self.secondary_acceptable_latency)
            .field("server_selection_timeout", &self.server_selection_timeout)
            .finish_non_exhaustive()
    }
}

impl DriverSettings {
    pub fn new(seeds: impl IntoIterator<Item = ServerAddress>) -> Self {
        Self {
            seeds: seeds.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn replica_set_name(mut self, name: impl Into<String>) -> Self {
        self.replica_set_name = Some(name.into());
        self
    }

    pub fn connection_mode(mut self, mode: ConnectionMode) -> Self {
        self.connection_mode = mode;
        self
    }

    pub fn credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn read_preference(mut self, preference: ReadPreference) -> Self {
        self.read_preference = preference;
        self
    }

    pub fn connection_settings(mut self, settings: ConnectionSettings) -> Self {
        self.connection = settings;
        self
    }

    pub fn pool_settings(mut self, settings: PoolSettings) -> Self {
        self.pool = settings;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// `None` disables the latency window
    pub fn secondary_acceptable_latency(mut self, latency: Option<Duration>) -> Self {
        self.secondary_acceptable_latency = latency;
        self
    }

    pub fn server_selection_timeout(mut self, timeout: Duration) -> Self {
        self.server_selection_timeout = timeout;
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn AddressResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn authenticators(mut self, authenticators: Authenticators) -> Self {
        self.authenticators = authenticators;
        self
    }

    /// The mode actually used once `Automatic` is resolved
    pub fn effective_mode(&self) -> ConnectionMode {
        match self.connection_mode {
            ConnectionMode::Automatic if self.replica_set_name.is_some() => ConnectionMode::ReplicaSet,
            ConnectionMode::Automatic if self.seeds.len() == 1 => ConnectionMode::Direct,
            ConnectionMode::Automatic => ConnectionMode::Sharded,
            mode => mode,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.seeds.is_empty() {
            return Err(DriverError::InvalidConfiguration(
                "at least one seed address is required".into(),
            ));
        }
        if self.effective_mode() == ConnectionMode::Direct && self.seeds.len() != 1 {
            return Err(DriverError::InvalidConfiguration(format!(
                "direct mode needs exactly one seed, got {}",
                self.seeds.len()
            )));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(DriverError::InvalidConfiguration(
                "heartbeat_interval must be positive".into(),
            ));
        }
        if let Some(credential) = &self.credential {
            if self.authenticators.get(credential.mechanism()).is_none() {
                return Err(DriverError::InvalidConfiguration(format!(
                    "no authenticator registered for mechanism {}",
                    credential.mechanism()
                )));
            }
        }
        self.connection.validate()?;
        self.pool.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = DriverSettings::default();
        assert_eq!(settings.connection.connect_timeout, Duration::from_secs(30));
        assert_eq!(settings.connection.socket_timeout, None);
        assert_eq!(settings.connection.send_buffer_size, 64 * 1024);
        assert_eq!(settings.pool.max_pool_size, 100);
        assert_eq!(settings.pool.wait_queue_timeout, Duration::from_secs(120));
        assert_eq!(settings.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(settings.secondary_acceptable_latency, Some(Duration::from_millis(15)));
        assert_eq!(settings.server_selection_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_builder_chain() {
        let settings = DriverSettings::new([ServerAddress::new("a", 27017)])
            .pool_settings(PoolSettings::default().max_pool_size(5))
            .connection_settings(ConnectionSettings::default().socket_timeout(Duration::ZERO))
            .heartbeat_interval(Duration::from_millis(500));
        assert_eq!(settings.pool.max_pool_size, 5);
        assert_eq!(settings.connection.socket_timeout, None);
        assert_eq!(settings.heartbeat_interval, Duration::from_millis(500));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_effective_mode() {
        let one = DriverSettings::new([ServerAddress::new("a", 1)]);
        assert_eq!(one.effective_mode(), ConnectionMode::Direct);

        let two = DriverSettings::new([ServerAddress::new("a", 1), ServerAddress::new("b", 1)]);
        assert_eq!(two.effective_mode(), ConnectionMode::Sharded);
        assert_eq!(two.replica_set_name("rs0").effective_mode(), ConnectionMode::ReplicaSet);
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        assert!(DriverSettings::default().validate().is_err());

        let direct_two = DriverSettings::new([ServerAddress::new("a", 1), ServerAddress::new("b", 1)])
            .connection_mode(ConnectionMode::Direct);
        assert!(matches!(
            direct_two.validate(),
            Err(DriverError::InvalidConfiguration(_))
        ));

        let empty_pool = DriverSettings::new([ServerAddress::new("a", 1)])
            .pool_settings(PoolSettings::default().max_pool_size(0));
        assert!(empty_pool.validate().is_err());

        let unknown_mechanism = DriverSettings::new([ServerAddress::new("a", 1)])
            .credential(Credential::new("u", "p", "db").with_mechanism("GSSAPI"));
        assert!(unknown_mechanism.validate().is_err());
    }
}
