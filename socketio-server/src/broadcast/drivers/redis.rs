use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};

use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, FromRedisValue, RedisResult};
use tokio::sync::mpsc;
use tracing::{error, warn};

use super::{Driver, MessageStream};
use crate::config::RedisAdapterConfig;

/// An error type for the redis driver.
#[derive(Debug)]
pub struct RedisError(redis::RedisError);

impl From<redis::RedisError> for RedisError {
    fn from(e: redis::RedisError) -> Self {
        Self(e)
    }
}
impl fmt::Display for RedisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
impl std::error::Error for RedisError {}

type HandlerMap = HashMap<String, mpsc::Sender<(String, Vec<u8>)>>;

/// A [`Driver`] over the [`redis`] crate, using RESP3 push messages on a
/// multiplexed connection. Requires a redis v7+ class server.
#[derive(Clone)]
pub struct RedisDriver {
    handlers: Arc<RwLock<HandlerMap>>,
    conn: MultiplexedConnection,
}

fn read_msg(msg: redis::PushInfo) -> RedisResult<Option<(String, String, Vec<u8>)>> {
    match msg.kind {
        redis::PushKind::Message => {
            if msg.data.len() < 2 {
                return Ok(None);
            }
            let mut iter = msg.data.into_iter();
            let channel: String = FromRedisValue::from_owned_redis_value(iter.next().unwrap())?;
            let message = FromRedisValue::from_owned_redis_value(iter.next().unwrap())?;
            Ok(Some((channel.clone(), channel, message)))
        }
        redis::PushKind::PMessage => {
            if msg.data.len() < 3 {
                return Ok(None);
            }
            let mut iter = msg.data.into_iter();
            let pattern = FromRedisValue::from_owned_redis_value(iter.next().unwrap())?;
            let channel = FromRedisValue::from_owned_redis_value(iter.next().unwrap())?;
            let message = FromRedisValue::from_owned_redis_value(iter.next().unwrap())?;
            Ok(Some((pattern, channel, message)))
        }
        _ => Ok(None),
    }
}

/// Route push messages from the redis connection to the subscription
/// that registered the matching channel or pattern.
async fn watch_handler(
    mut rx: mpsc::UnboundedReceiver<redis::PushInfo>,
    handlers: Arc<RwLock<HandlerMap>>,
) {
    while let Some(info) = rx.recv().await {
        match read_msg(info) {
            Ok(Some((pattern, chan, msg))) => {
                if let Some(tx) = handlers.read().unwrap().get(&pattern) {
                    if let Err(e) = tx.try_send((chan, msg)) {
                        warn!(%pattern, "redis pubsub channel full: {e}");
                    }
                } else {
                    warn!(%pattern, %chan, "no handler for channel");
                }
            }
            Ok(None) => {}
            Err(e) => error!("error reading message from redis: {e}"),
        }
    }
}

impl RedisDriver {
    /// Create a new driver from a redis client.
    pub async fn new(client: &redis::Client) -> Result<Self, redis::RedisError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = redis::AsyncConnectionConfig::new().set_push_sender(tx);
        let conn = client
            .get_multiplexed_async_connection_with_config(&config)
            .await?;

        let handlers = Arc::new(RwLock::new(HashMap::new()));
        tokio::spawn(watch_handler(rx, handlers.clone()));
        Ok(Self { conn, handlers })
    }

    /// Dial the server described by an adapter configuration.
    pub async fn connect(config: &RedisAdapterConfig) -> Result<Self, redis::RedisError> {
        let addr = if config.network == "unix" {
            redis::ConnectionAddr::Unix(config.addr.clone().into())
        } else {
            let (host, port) = config
                .addr
                .rsplit_once(':')
                .unwrap_or((config.addr.as_str(), "6379"));
            redis::ConnectionAddr::Tcp(host.to_owned(), port.parse().unwrap_or(6379))
        };
        let info = redis::ConnectionInfo {
            addr,
            redis: redis::RedisConnectionInfo {
                db: config.db as i64,
                password: (!config.password.is_empty()).then(|| config.password.clone()),
                protocol: redis::ProtocolVersion::RESP3,
                ..Default::default()
            },
        };
        let client = redis::Client::open(info)?;
        Self::new(&client).await
    }
}

impl Driver for RedisDriver {
    type Error = RedisError;

    fn publish(
        &self,
        chan: String,
        val: Vec<u8>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        let mut conn = self.conn.clone();
        async move {
            conn.publish::<_, _, redis::Value>(chan, val).await?;
            Ok(())
        }
    }

    async fn subscribe(&self, chan: String, size: usize) -> Result<MessageStream, Self::Error> {
        self.conn.clone().subscribe(chan.as_str()).await?;
        let (tx, rx) = mpsc::channel(size);
        self.handlers.write().unwrap().insert(chan, tx);
        Ok(MessageStream::new(rx))
    }

    async fn psubscribe(&self, pat: String, size: usize) -> Result<MessageStream, Self::Error> {
        self.conn.clone().psubscribe(pat.as_str()).await?;
        let (tx, rx) = mpsc::channel(size);
        self.handlers.write().unwrap().insert(pat, tx);
        Ok(MessageStream::new(rx))
    }

    fn unsubscribe(
        &self,
        chan: String,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'static {
        self.handlers.write().unwrap().remove(&chan);
        let mut conn = self.conn.clone();
        async move {
            if chan.contains('*') {
                conn.punsubscribe(chan).await?;
            } else {
                conn.unsubscribe(chan).await?;
            }
            Ok(())
        }
    }

    async fn num_sub(&self, chan: &str) -> Result<usize, Self::Error> {
        let mut conn = self.conn.clone();
        let (_, count): (String, usize) = redis::cmd("PUBSUB")
            .arg("NUMSUB")
            .arg(chan)
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time;

    #[tokio::test]
    async fn watch_handler_routes_messages() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut handlers = HashMap::new();

        let (tx1, mut rx1) = mpsc::channel(1);
        handlers.insert("test".to_string(), tx1);
        tokio::spawn(watch_handler(rx, Arc::new(RwLock::new(handlers))));
        tx.send(redis::PushInfo {
            kind: redis::PushKind::Message,
            data: vec![
                redis::Value::BulkString("test".into()),
                redis::Value::BulkString("foo".into()),
            ],
        })
        .unwrap();
        let (chan, data) = time::timeout(Duration::from_millis(200), rx1.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chan, "test");
        assert_eq!(data, b"foo");
    }

    #[tokio::test]
    async fn watch_handler_routes_pattern_messages() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut handlers = HashMap::new();

        let (tx1, mut rx1) = mpsc::channel(1);
        handlers.insert("socket.io#/#*".to_string(), tx1);
        tokio::spawn(watch_handler(rx, Arc::new(RwLock::new(handlers))));
        tx.send(redis::PushInfo {
            kind: redis::PushKind::PMessage,
            data: vec![
                redis::Value::BulkString("socket.io#/#*".into()),
                redis::Value::BulkString("socket.io#/#node-1".into()),
                redis::Value::BulkString("foo".into()),
            ],
        })
        .unwrap();
        let (chan, data) = time::timeout(Duration::from_millis(200), rx1.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chan, "socket.io#/#node-1");
        assert_eq!(data, b"foo");
    }
}
