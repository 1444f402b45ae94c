use std::time::Duration;

/// Configuration of the cluster adapter: where the redis-class pub/sub
/// bus lives and how its channels are named.
#[derive(Debug, Clone)]
pub struct RedisAdapterConfig {
    /// Bus address. Defaults to `127.0.0.1:6379`.
    pub addr: String,

    /// `tcp` or `unix`. Defaults to `tcp`.
    pub network: String,

    /// Password, empty for none.
    pub password: String,

    /// Database index.
    pub db: u32,

    /// Prefix of every channel name used by the cluster protocol.
    /// Defaults to `socket.io`.
    pub prefix: String,

    /// Bounded wait applied to cluster requests expecting responses
    /// (room enumeration, room length). Defaults to 5 seconds.
    pub request_timeout: Duration,
}

impl Default for RedisAdapterConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:6379".to_string(),
            network: "tcp".to_string(),
            password: String::new(),
            db: 0,
            prefix: "socket.io".to_string(),
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl RedisAdapterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = network.into();
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn with_db(mut self, db: u32) -> Self {
        self.db = db;
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}
