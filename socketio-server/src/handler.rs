use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tracing::debug;

use crate::broadcast::{ArcConn, Broadcaster, EachFunc};
use crate::errors::Error;
use crate::event::{EventError, EventFunc, IntoEventFunc};

/// Error type a connect callback can reject with.
pub type ConnectError = Box<dyn std::error::Error + Send + Sync>;

type ConnectCallback = dyn Fn(ArcConn, Value) -> Result<(), ConnectError> + Send + Sync;
type DisconnectCallback = dyn Fn(ArcConn, String, Option<Value>) + Send + Sync;
type ErrorCallback = dyn Fn(ArcConn, Error) + Send + Sync;

/// Per-namespace handler: owns the broadcaster, the table of event
/// functions and the lifecycle callbacks.
///
/// Dispatch traps panics raised by user callbacks and converts them into
/// errors, so a faulty handler never tears the connection down.
pub struct Handler {
    broadcast: Arc<dyn Broadcaster>,
    events: RwLock<HashMap<String, Arc<EventFunc>>>,
    on_connect: RwLock<Option<Arc<ConnectCallback>>>,
    on_disconnect: RwLock<Option<Arc<DisconnectCallback>>>,
    on_error: RwLock<Option<Arc<ErrorCallback>>>,
}

impl Handler {
    pub(crate) fn new(broadcast: Arc<dyn Broadcaster>) -> Self {
        Self {
            broadcast,
            events: RwLock::new(HashMap::new()),
            on_connect: RwLock::new(None),
            on_disconnect: RwLock::new(None),
            on_error: RwLock::new(None),
        }
    }

    pub fn on_connect<F>(&self, f: F)
    where
        F: Fn(ArcConn, Value) -> Result<(), ConnectError> + Send + Sync + 'static,
    {
        *self.on_connect.write().unwrap() = Some(Arc::new(f));
    }

    pub fn on_disconnect<F>(&self, f: F)
    where
        F: Fn(ArcConn, String, Option<Value>) + Send + Sync + 'static,
    {
        *self.on_disconnect.write().unwrap() = Some(Arc::new(f));
    }

    pub fn on_error<F>(&self, f: F)
    where
        F: Fn(ArcConn, Error) + Send + Sync + 'static,
    {
        *self.on_error.write().unwrap() = Some(Arc::new(f));
    }

    /// Register an event function. The closure's parameter types are the
    /// decode schema of the event arguments; its return value, if any,
    /// is written back as the `ACK` payload.
    pub fn on_event<F, A>(&self, event: &str, f: F)
    where
        F: IntoEventFunc<A>,
    {
        self.events
            .write()
            .unwrap()
            .insert(event.to_owned(), Arc::new(f.into_event_func()));
    }

    pub(crate) fn broadcaster(&self) -> Arc<dyn Broadcaster> {
        self.broadcast.clone()
    }

    pub(crate) fn dispatch_connect(&self, conn: ArcConn, auth: Value) -> Result<(), Error> {
        let Some(f) = self.on_connect.read().unwrap().clone() else {
            return Ok(());
        };
        match catch_unwind(AssertUnwindSafe(|| f(conn, auth))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::ConnectRejected(e)),
            Err(panic) => Err(EventError::Panicked(panic_message(&panic)).into()),
        }
    }

    /// Invoke the event function registered under `event`. Unknown
    /// events are silently ignored.
    pub(crate) fn dispatch_event(
        &self,
        conn: ArcConn,
        event: &str,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, EventError> {
        let func = self.events.read().unwrap().get(event).cloned();
        match func {
            Some(func) => func.call(conn, args),
            None => {
                debug!(event, "no event function registered");
                Ok(vec![])
            }
        }
    }

    pub(crate) fn dispatch_disconnect(&self, conn: ArcConn, reason: String, details: Option<Value>) {
        let Some(f) = self.on_disconnect.read().unwrap().clone() else {
            return;
        };
        if catch_unwind(AssertUnwindSafe(|| f(conn, reason, details))).is_err() {
            debug!("disconnect callback panicked");
        }
    }

    pub(crate) fn dispatch_error(&self, conn: ArcConn, error: Error) {
        let Some(f) = self.on_error.read().unwrap().clone() else {
            return;
        };
        if catch_unwind(AssertUnwindSafe(|| f(conn, error))).is_err() {
            debug!("error callback panicked");
        }
    }

    // Room surface, delegating to the namespace's broadcaster.

    pub async fn join(&self, room: &str, conn: ArcConn) {
        self.broadcast.join(room, conn).await;
    }

    pub async fn leave(&self, room: &str, conn: ArcConn) {
        self.broadcast.leave(room, conn).await;
    }

    pub async fn leave_all(&self, conn: ArcConn) {
        self.broadcast.leave_all(conn).await;
    }

    pub async fn clear(&self, room: &str) {
        self.broadcast.clear(room).await;
    }

    pub async fn send(&self, room: &str, event: &str, args: Vec<Value>) {
        self.broadcast.send(room, event, args).await;
    }

    pub async fn send_all(&self, event: &str, args: Vec<Value>) {
        self.broadcast.send_all(event, args).await;
    }

    pub async fn len(&self, room: &str) -> i64 {
        self.broadcast.len(room).await
    }

    pub async fn rooms(&self) -> Vec<String> {
        self.broadcast.all_rooms().await
    }

    pub async fn rooms_by_conn(&self, conn: ArcConn) -> Vec<String> {
        self.broadcast.rooms_by_conn(conn).await
    }

    pub async fn for_each(&self, room: &str, f: EachFunc) {
        self.broadcast.for_each(room, f).await;
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "opaque panic payload".to_string())
}

/// The namespace handler registry owned by the server.
#[derive(Default)]
pub(crate) struct Handlers {
    inner: RwLock<HashMap<String, Arc<Handler>>>,
}

impl Handlers {
    pub(crate) fn get(&self, nsp: &str) -> Option<Arc<Handler>> {
        self.inner.read().unwrap().get(nsp).cloned()
    }

    /// Insert unless a concurrent caller won the race; returns the
    /// handler that ended up registered.
    pub(crate) fn get_or_insert(&self, nsp: &str, handler: Arc<Handler>) -> Arc<Handler> {
        let mut inner = self.inner.write().unwrap();
        inner.entry(nsp.to_owned()).or_insert(handler).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::test_support::StubConn;
    use crate::broadcast::LocalBroadcaster;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn handler() -> Handler {
        Handler::new(Arc::new(LocalBroadcaster::new("/")))
    }

    #[tokio::test]
    async fn unknown_event_is_ignored() {
        let h = handler();
        let ret = h
            .dispatch_event(StubConn::new(), "nope", vec![json!(1)])
            .unwrap();
        assert!(ret.is_empty());
    }

    #[tokio::test]
    async fn event_return_values_flow_back() {
        let h = handler();
        h.on_event("add", |_conn: ArcConn, a: i64, b: i64| (a + b,));
        let ret = h
            .dispatch_event(StubConn::new(), "add", vec![json!(2), json!(3)])
            .unwrap();
        assert_eq!(ret, vec![json!(5)]);
    }

    #[tokio::test]
    async fn panicking_event_function_is_trapped() {
        let h = handler();
        h.on_event("boom", |_conn: ArcConn| -> () { panic!("kaboom") });
        let err = h.dispatch_event(StubConn::new(), "boom", vec![]).unwrap_err();
        assert!(matches!(err, EventError::Panicked(_)));
    }

    #[tokio::test]
    async fn connect_rejection_is_reported() {
        let h = handler();
        h.on_connect(|_conn, _auth| Err("denied".into()));
        let err = h
            .dispatch_connect(StubConn::new(), Value::Null)
            .unwrap_err();
        assert!(matches!(err, Error::ConnectRejected(_)));
    }

    #[tokio::test]
    async fn lifecycle_callbacks_fire() {
        let h = handler();
        let hits = Arc::new(AtomicU64::new(0));
        let (h1, h2) = (hits.clone(), hits.clone());
        h.on_disconnect(move |_conn, _reason, _details| {
            h1.fetch_add(1, Ordering::SeqCst);
        });
        h.on_error(move |_conn, _err| {
            h2.fetch_add(1, Ordering::SeqCst);
        });
        h.dispatch_disconnect(StubConn::new(), "bye".into(), None);
        h.dispatch_error(StubConn::new(), Error::InvalidPacketType);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
