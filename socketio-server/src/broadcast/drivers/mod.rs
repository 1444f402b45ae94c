//! Abstraction over the pub/sub bus used by the remote broadcaster.
//! The provided [`redis`] implementation talks to a redis-class server;
//! the [`stub`] implementation runs the same protocol on an in-memory
//! hub for the test-suite.

use std::future::Future;
use std::pin::Pin;
use std::task;

use futures_core::Stream;
use pin_project_lite::pin_project;
use tokio::sync::mpsc;

pub mod redis;
pub mod stub;

pin_project! {
    /// A stream of `(channel, payload)` messages delivered by a
    /// subscription. The stream ends when the subscription is dropped or
    /// the bus connection fails.
    #[derive(Debug)]
    pub struct MessageStream {
        #[pin]
        rx: mpsc::Receiver<(String, Vec<u8>)>,
    }
}

impl MessageStream {
    pub fn new(rx: mpsc::Receiver<(String, Vec<u8>)>) -> Self {
        Self { rx }
    }

    /// An already-terminated stream.
    pub fn new_empty() -> Self {
        // bounded channels require a non-zero capacity
        let (_, rx) = mpsc::channel(1);
        Self { rx }
    }
}

impl Stream for MessageStream {
    type Item = (String, Vec<u8>);

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Option<Self::Item>> {
        self.project().rx.poll_recv(cx)
    }
}

/// The driver trait can be used to support different pub/sub backends.
/// Implementations share their subscriptions between clones.
pub trait Driver: Clone + Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Publish a message to a channel.
    fn publish(
        &self,
        chan: String,
        val: Vec<u8>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Subscribe to a single channel.
    fn subscribe(
        &self,
        chan: String,
        size: usize,
    ) -> impl Future<Output = Result<MessageStream, Self::Error>> + Send;

    /// Subscribe to every channel matching a glob pattern.
    fn psubscribe(
        &self,
        pat: String,
        size: usize,
    ) -> impl Future<Output = Result<MessageStream, Self::Error>> + Send;

    /// Drop a subscription made with either subscribe flavor.
    fn unsubscribe(&self, chan: String)
        -> impl Future<Output = Result<(), Self::Error>> + Send + 'static;

    /// Number of current subscribers of a channel across the whole bus.
    fn num_sub(&self, chan: &str) -> impl Future<Output = Result<usize, Self::Error>> + Send;
}
