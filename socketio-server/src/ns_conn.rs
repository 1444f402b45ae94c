use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use http::{HeaderMap, Uri};
use serde_json::{json, Value};

use crate::broadcast::{ArcConn, Broadcaster, Conn};
use crate::conn::ConnState;
use crate::event::AckFunc;
use crate::parser::{Header, PacketType, PayloadData};
use engineio_server::Sid;

/// Grace period between writing the `ERROR` packet of a refusal and
/// closing the connection, so the packet can flush.
const REFUSE_GRACE: Duration = Duration::from_secs(2);

/// The per-(connection, namespace) state: user context, the monotonic
/// packet-id counter and the pending acks keyed by packet id. Implements
/// the [`Conn`] capability set handed to user handlers; room calls pass
/// the view itself as the membership handle.
pub struct NamespaceConn {
    conn: Arc<ConnState>,
    nsp: String,
    broadcast: Arc<dyn Broadcaster>,
    pkg_id: AtomicU64,
    acks: DashMap<u64, AckFunc>,
    context: RwLock<Value>,
    me: Weak<NamespaceConn>,
}

impl NamespaceConn {
    pub(crate) fn new(
        conn: Arc<ConnState>,
        nsp: String,
        broadcast: Arc<dyn Broadcaster>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            conn,
            nsp,
            broadcast,
            pkg_id: AtomicU64::new(0),
            acks: DashMap::new(),
            context: RwLock::new(Value::Null),
            me: me.clone(),
        })
    }

    /// Self-handle stored in room entries.
    fn handle(&self) -> Option<ArcConn> {
        self.me.upgrade().map(|me| me as ArcConn)
    }

    fn next_pkg_id(&self) -> u64 {
        self.pkg_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Consume the pending ack for a packet id; at most one caller gets
    /// it.
    pub(crate) fn take_ack(&self, id: u64) -> Option<AckFunc> {
        self.acks.remove(&id).map(|(_, ack)| ack)
    }
}

#[async_trait]
impl Conn for NamespaceConn {
    fn id(&self) -> Sid {
        self.conn.session.id()
    }

    fn namespace(&self) -> &str {
        &self.nsp
    }

    fn url(&self) -> Uri {
        self.conn.session.url()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.conn.session.local_addr()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.conn.session.remote_addr()
    }

    fn remote_header(&self) -> HeaderMap {
        self.conn.session.remote_header()
    }

    fn context(&self) -> Value {
        self.context.read().unwrap().clone()
    }

    fn set_context(&self, ctx: Value) {
        *self.context.write().unwrap() = ctx;
    }

    async fn emit(&self, event: &str, args: Vec<Value>) {
        let header = Header::new(PacketType::Event, self.nsp.clone());
        self.conn
            .write(header, PayloadData::Args(event_args(event, args)))
            .await;
    }

    async fn emit_with_ack(&self, event: &str, args: Vec<Value>, ack: AckFunc) {
        let id = self.next_pkg_id();
        self.acks.insert(id, ack);
        let mut header = Header::new(PacketType::Event, self.nsp.clone());
        header.id = Some(id);
        header.need_ack = true;
        self.conn
            .write(header, PayloadData::Args(event_args(event, args)))
            .await;
    }

    async fn join(&self, room: &str) {
        if let Some(me) = self.handle() {
            self.broadcast.join(room, me).await;
        }
    }

    async fn leave(&self, room: &str) {
        if let Some(me) = self.handle() {
            self.broadcast.leave(room, me).await;
        }
    }

    async fn leave_all(&self) {
        if let Some(me) = self.handle() {
            self.broadcast.leave_all(me).await;
        }
    }

    async fn rooms(&self) -> Vec<String> {
        match self.handle() {
            Some(me) => self.broadcast.rooms_by_conn(me).await,
            None => vec![],
        }
    }

    async fn refuse(&self, message: &str) {
        let header = Header::new(PacketType::Error, self.nsp.clone());
        let body = json!({ "message": message, "data": null });
        self.conn.write(header, PayloadData::Data(body)).await;

        let conn = self.conn.clone();
        tokio::spawn(async move {
            tokio::time::sleep(REFUSE_GRACE).await;
            conn.close().await;
        });
    }

    async fn close(&self) {
        self.conn.close().await;
    }
}

/// The `[event, ...args]` argument array of an `EVENT` packet.
fn event_args(event: &str, args: Vec<Value>) -> Vec<Value> {
    let mut payload = Vec::with_capacity(args.len() + 1);
    payload.push(Value::String(event.to_owned()));
    payload.extend(args);
    payload
}
