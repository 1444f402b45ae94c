use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use serde_json::Value;
use tracing::debug;

use crate::broadcast::drivers::redis::RedisDriver;
use crate::broadcast::{ArcConn, Broadcaster, EachFunc, LocalBroadcaster, RemoteBroadcaster};
use crate::config::RedisAdapterConfig;
use crate::conn::Conn;
use crate::errors::Error;
use crate::event::IntoEventFunc;
use crate::handler::{ConnectError, Handler, Handlers};
use crate::parser::ROOT_NAMESPACE;
use engineio_server::Engine;

/// Builds the broadcaster of newly created namespaces. The server picks
/// the local broadcaster by default, the redis-backed remote one when a
/// cluster configuration is installed, or whatever a custom factory
/// produces (the test-suite plugs an in-memory bus in this way).
#[async_trait]
pub trait BroadcasterFactory: Send + Sync + 'static {
    async fn create(&self, nsp: &str) -> Result<Arc<dyn Broadcaster>, Error>;
}

#[async_trait]
impl BroadcasterFactory for RedisAdapterConfig {
    async fn create(&self, nsp: &str) -> Result<Arc<dyn Broadcaster>, Error> {
        let driver = RedisDriver::connect(self).await.map_err(Error::adapter)?;
        let broadcaster =
            RemoteBroadcaster::new(nsp, driver, &self.prefix, self.request_timeout)
                .await
                .map_err(Error::adapter)?;
        Ok(broadcaster as Arc<dyn Broadcaster>)
    }
}

/// A socket.io server. It accepts sessions from the engine, owns the
/// namespace handler registry and the optional cluster configuration.
///
/// Namespace handlers are created lazily: the first
/// `on_connect`/`on_disconnect`/`on_error`/`on_event` registration for a
/// namespace creates its handler and broadcaster. The empty namespace is
/// an alias of `/`.
pub struct Server {
    engine: Arc<dyn Engine>,
    handlers: Arc<Handlers>,
    factory: RwLock<Option<Arc<dyn BroadcasterFactory>>>,
}

impl Server {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            handlers: Arc::new(Handlers::default()),
            factory: RwLock::new(None),
        }
    }

    /// Install the redis cluster adapter. Namespaces registered after
    /// this call share broadcasts and room queries with every node using
    /// the same prefix.
    pub fn adapter(&self, config: RedisAdapterConfig) {
        self.set_broadcaster_factory(Arc::new(config));
    }

    /// Install a custom broadcaster factory (for alternative buses).
    pub fn set_broadcaster_factory(&self, factory: Arc<dyn BroadcasterFactory>) {
        *self.factory.write().unwrap() = Some(factory);
    }

    /// Register the connect callback of a namespace.
    pub async fn on_connect<F>(&self, nsp: &str, f: F) -> Result<(), Error>
    where
        F: Fn(ArcConn, Value) -> Result<(), ConnectError> + Send + Sync + 'static,
    {
        self.handler_for(nsp).await?.on_connect(f);
        Ok(())
    }

    /// Register the disconnect callback of a namespace.
    pub async fn on_disconnect<F>(&self, nsp: &str, f: F) -> Result<(), Error>
    where
        F: Fn(ArcConn, String, Option<Value>) + Send + Sync + 'static,
    {
        self.handler_for(nsp).await?.on_disconnect(f);
        Ok(())
    }

    /// Register the error callback of a namespace.
    pub async fn on_error<F>(&self, nsp: &str, f: F) -> Result<(), Error>
    where
        F: Fn(ArcConn, Error) + Send + Sync + 'static,
    {
        self.handler_for(nsp).await?.on_error(f);
        Ok(())
    }

    /// Register an event function for a namespace and event name.
    pub async fn on_event<F, A>(&self, nsp: &str, event: &str, f: F) -> Result<(), Error>
    where
        F: IntoEventFunc<A>,
    {
        self.handler_for(nsp).await?.on_event(event, f);
        Ok(())
    }

    /// Accept engine sessions until the engine closes. Each accepted
    /// session is served on its own task and removed from the engine
    /// when it ends.
    pub async fn serve(&self) -> Result<(), Error> {
        loop {
            let session = self.engine.accept().await?;
            let handlers = self.handlers.clone();
            let engine = self.engine.clone();
            tokio::spawn(async move {
                let sid = session.id();
                debug!(%sid, "serving connection");
                Conn::new(session, handlers).serve().await;
                engine.remove(sid);
            });
        }
    }

    /// Join a connection to a room.
    pub async fn join_room(&self, nsp: &str, room: &str, conn: ArcConn) -> bool {
        match self.get_handler(nsp) {
            Some(handler) => {
                handler.join(room, conn).await;
                true
            }
            None => false,
        }
    }

    /// Remove a connection from a room.
    pub async fn leave_room(&self, nsp: &str, room: &str, conn: ArcConn) -> bool {
        match self.get_handler(nsp) {
            Some(handler) => {
                handler.leave(room, conn).await;
                true
            }
            None => false,
        }
    }

    /// Remove a connection from every room of the namespace.
    pub async fn leave_all_rooms(&self, nsp: &str, conn: ArcConn) -> bool {
        match self.get_handler(nsp) {
            Some(handler) => {
                handler.leave_all(conn).await;
                true
            }
            None => false,
        }
    }

    /// Remove a room without notifying its members.
    pub async fn clear_room(&self, nsp: &str, room: &str) -> bool {
        match self.get_handler(nsp) {
            Some(handler) => {
                handler.clear(room).await;
                true
            }
            None => false,
        }
    }

    /// Send an event to every member of a room, cluster-wide.
    pub async fn broadcast_to_room(
        &self,
        nsp: &str,
        room: &str,
        event: &str,
        args: Vec<Value>,
    ) -> bool {
        match self.get_handler(nsp) {
            Some(handler) => {
                handler.send(room, event, args).await;
                true
            }
            None => false,
        }
    }

    /// Send an event to every member of every room of the namespace,
    /// cluster-wide.
    pub async fn broadcast_to_namespace(&self, nsp: &str, event: &str, args: Vec<Value>) -> bool {
        match self.get_handler(nsp) {
            Some(handler) => {
                handler.send_all(event, args).await;
                true
            }
            None => false,
        }
    }

    /// Member count of a room, cluster-wide; -1 when the namespace is
    /// unknown or the cluster query fails.
    pub async fn room_len(&self, nsp: &str, room: &str) -> i64 {
        match self.get_handler(nsp) {
            Some(handler) => handler.len(room).await,
            None => -1,
        }
    }

    /// Names of the rooms of a namespace, cluster-wide.
    pub async fn rooms(&self, nsp: &str) -> Vec<String> {
        match self.get_handler(nsp) {
            Some(handler) => handler.rooms().await,
            None => vec![],
        }
    }

    /// Apply a callback to every local member of a room.
    pub async fn for_each(&self, nsp: &str, room: &str, f: EachFunc) -> bool {
        match self.get_handler(nsp) {
            Some(handler) => {
                handler.for_each(room, f).await;
                true
            }
            None => false,
        }
    }

    /// Number of live connections on this node.
    pub fn count(&self) -> usize {
        self.engine.count()
    }

    /// Close the engine; `serve` returns once the accept loop observes
    /// it.
    pub async fn close(&self) {
        self.engine.close().await;
    }

    /// The public HTTP surface, delegated to the engine.
    pub async fn serve_http(&self, req: Request<Bytes>) -> Response<Bytes> {
        self.engine.serve_http(req).await
    }

    fn get_handler(&self, nsp: &str) -> Option<Arc<Handler>> {
        self.handlers.get(canonical(nsp))
    }

    async fn handler_for(&self, nsp: &str) -> Result<Arc<Handler>, Error> {
        let nsp = canonical(nsp);
        if let Some(handler) = self.handlers.get(nsp) {
            return Ok(handler);
        }
        let factory = self.factory.read().unwrap().clone();
        let broadcaster: Arc<dyn Broadcaster> = match factory {
            Some(factory) => factory.create(nsp).await?,
            None => Arc::new(LocalBroadcaster::new(nsp)),
        };
        debug!(nsp, "creating namespace handler");
        let handler = Arc::new(Handler::new(broadcaster));
        Ok(self.handlers.get_or_insert(nsp, handler))
    }
}

/// The empty string aliases the root namespace.
fn canonical(nsp: &str) -> &str {
    if nsp.is_empty() {
        ROOT_NAMESPACE
    } else {
        nsp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_namespace_aliases_root() {
        assert_eq!(canonical(""), "/");
        assert_eq!(canonical("/"), "/");
        assert_eq!(canonical("/chat"), "/chat");
    }
}
