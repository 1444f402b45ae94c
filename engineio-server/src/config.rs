use std::time::Duration;

/// Engine.IO session parameters, advertised to clients in the `OPEN`
/// packet.
#[derive(Debug, Clone)]
pub struct EngineIoConfig {
    /// The interval at which the server sends a ping packet to the client.
    /// Defaults to 25 seconds.
    pub ping_interval: Duration,

    /// The amount of time the server waits for data from the client after
    /// a ping before closing the connection. Defaults to 20 seconds.
    pub ping_timeout: Duration,

    /// The maximum number of packets buffered per connection before
    /// writes start failing. Defaults to 128 packets.
    pub max_buffer_size: usize,

    /// The maximum number of bytes accepted per request. Defaults to
    /// 100kb.
    pub max_payload: u64,
}

impl Default for EngineIoConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_millis(25000),
            ping_timeout: Duration::from_millis(20000),
            max_buffer_size: 128,
            max_payload: 1e5 as u64,
        }
    }
}

impl EngineIoConfig {
    pub fn builder() -> EngineIoConfigBuilder {
        EngineIoConfigBuilder::new()
    }
}

#[derive(Default)]
pub struct EngineIoConfigBuilder {
    config: EngineIoConfig,
}

impl EngineIoConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineIoConfig::default(),
        }
    }

    /// The interval at which the server sends a ping packet to the client.
    pub fn ping_interval(mut self, ping_interval: Duration) -> Self {
        self.config.ping_interval = ping_interval;
        self
    }

    /// The amount of time the server waits for data from the client after
    /// a ping before closing the connection.
    pub fn ping_timeout(mut self, ping_timeout: Duration) -> Self {
        self.config.ping_timeout = ping_timeout;
        self
    }

    /// The maximum number of packets buffered per connection.
    pub fn max_buffer_size(mut self, max_buffer_size: usize) -> Self {
        self.config.max_buffer_size = max_buffer_size;
        self
    }

    /// The maximum number of bytes accepted per request.
    pub fn max_payload(mut self, max_payload: u64) -> Self {
        self.config.max_payload = max_payload;
        self
    }

    pub fn build(self) -> EngineIoConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = EngineIoConfig::builder()
            .ping_interval(Duration::from_millis(300))
            .ping_timeout(Duration::from_millis(200))
            .max_buffer_size(16)
            .build();
        assert_eq!(config.ping_interval, Duration::from_millis(300));
        assert_eq!(config.ping_timeout, Duration::from_millis(200));
        assert_eq!(config.max_buffer_size, 16);
        assert_eq!(config.max_payload, 100_000);
    }
}
