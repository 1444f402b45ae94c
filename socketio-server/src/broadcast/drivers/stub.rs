//! An in-memory bus used by the test-suite: every [`StubDriver`] hangs
//! off a shared [`StubHub`], publishes are routed to every matching
//! subscription and `num_sub` counts live subscribers hub-wide.

use std::convert::Infallible;
use std::future::{self, Future};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;

use super::{Driver, MessageStream};

struct Subscription {
    key: String,
    is_pattern: bool,
    tx: mpsc::Sender<(String, Vec<u8>)>,
}

impl Subscription {
    fn matches(&self, chan: &str) -> bool {
        if self.is_pattern {
            match self.key.strip_suffix('*') {
                Some(prefix) => chan.starts_with(prefix),
                None => self.key == chan,
            }
        } else {
            self.key == chan
        }
    }
}

/// The shared bus. Clone it into every [`StubDriver`] of a simulated
/// cluster.
#[derive(Clone, Default)]
pub struct StubHub {
    subs: Arc<RwLock<Vec<Subscription>>>,
}

impl StubHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn driver(&self) -> StubDriver {
        StubDriver { hub: self.clone() }
    }

    fn route(&self, chan: &str, payload: &[u8]) {
        let mut subs = self.subs.write().unwrap();
        // closed receivers fall out on delivery
        subs.retain(|sub| {
            if !sub.matches(chan) {
                return !sub.tx.is_closed();
            }
            sub.tx.try_send((chan.to_owned(), payload.to_vec())).is_ok() || !sub.tx.is_closed()
        });
    }
}

/// A [`Driver`] over a [`StubHub`].
#[derive(Clone)]
pub struct StubDriver {
    hub: StubHub,
}

impl Driver for StubDriver {
    type Error = Infallible;

    async fn publish(&self, chan: String, val: Vec<u8>) -> Result<(), Self::Error> {
        self.hub.route(&chan, &val);
        Ok(())
    }

    async fn subscribe(&self, chan: String, size: usize) -> Result<MessageStream, Self::Error> {
        let (tx, rx) = mpsc::channel(size);
        self.hub.subs.write().unwrap().push(Subscription {
            key: chan,
            is_pattern: false,
            tx,
        });
        Ok(MessageStream::new(rx))
    }

    async fn psubscribe(&self, pat: String, size: usize) -> Result<MessageStream, Self::Error> {
        let (tx, rx) = mpsc::channel(size);
        self.hub.subs.write().unwrap().push(Subscription {
            key: pat,
            is_pattern: true,
            tx,
        });
        Ok(MessageStream::new(rx))
    }

    fn unsubscribe(
        &self,
        chan: String,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'static {
        self.hub.subs.write().unwrap().retain(|sub| sub.key != chan);
        future::ready(Ok(()))
    }

    async fn num_sub(&self, chan: &str) -> Result<usize, Self::Error> {
        Ok(self
            .hub
            .subs
            .read()
            .unwrap()
            .iter()
            .filter(|sub| !sub.is_pattern && sub.key == chan && !sub.tx.is_closed())
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn exact_subscription_receives_publishes() {
        let hub = StubHub::new();
        let driver = hub.driver();
        let mut stream = driver.subscribe("chan".to_string(), 8).await.unwrap();
        driver.publish("chan".to_string(), b"x".to_vec()).await.unwrap();
        driver.publish("other".to_string(), b"y".to_vec()).await.unwrap();
        let (chan, payload) = stream.next().await.unwrap();
        assert_eq!(chan, "chan");
        assert_eq!(payload, b"x");
    }

    #[tokio::test]
    async fn pattern_subscription_matches_prefix() {
        let hub = StubHub::new();
        let driver = hub.driver();
        let mut stream = driver
            .psubscribe("socket.io#/#*".to_string(), 8)
            .await
            .unwrap();
        driver
            .publish("socket.io#/#node-1".to_string(), b"m".to_vec())
            .await
            .unwrap();
        let (chan, _) = stream.next().await.unwrap();
        assert_eq!(chan, "socket.io#/#node-1");
    }

    #[tokio::test]
    async fn num_sub_counts_exact_subscribers_only() {
        let hub = StubHub::new();
        let d1 = hub.driver();
        let d2 = hub.driver();
        let _s1 = d1.subscribe("req".to_string(), 8).await.unwrap();
        let _s2 = d2.subscribe("req".to_string(), 8).await.unwrap();
        let _p = d1.psubscribe("req*".to_string(), 8).await.unwrap();
        assert_eq!(d1.num_sub("req").await.unwrap(), 2);
    }
}
