//! Broadcast domain: the user-facing connection capability set, room
//! membership and fan-out, both in-process and across a cluster.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use http::{HeaderMap, Uri};
use serde_json::Value;

use crate::event::AckFunc;
use engineio_server::Sid;

pub mod drivers;
mod local;
mod remote;

pub use local::LocalBroadcaster;
pub use remote::RemoteBroadcaster;

/// The capability set handed to user handlers: one (connection,
/// namespace) binding. Room membership is recorded at this granularity,
/// so the same client joins rooms independently per namespace.
#[async_trait]
pub trait Conn: Send + Sync + 'static {
    /// The stable session identifier assigned by the engine.
    fn id(&self) -> Sid;

    fn namespace(&self) -> &str;

    fn url(&self) -> Uri;
    fn local_addr(&self) -> Option<SocketAddr>;
    fn remote_addr(&self) -> Option<SocketAddr>;
    fn remote_header(&self) -> HeaderMap;

    /// User context carried by this binding, shared between handlers.
    fn context(&self) -> Value;
    fn set_context(&self, ctx: Value);

    /// Send an event to the client.
    async fn emit(&self, event: &str, args: Vec<Value>);

    /// Send an event and register a callback for the client's `ACK`.
    async fn emit_with_ack(&self, event: &str, args: Vec<Value>, ack: AckFunc);

    async fn join(&self, room: &str);
    async fn leave(&self, room: &str);
    async fn leave_all(&self);
    async fn rooms(&self) -> Vec<String>;

    /// Reject the connection: sends an `ERROR` packet with the message
    /// and closes the connection after a short grace period so the
    /// packet can flush.
    async fn refuse(&self, message: &str);

    async fn close(&self);
}

pub type ArcConn = Arc<dyn Conn>;

/// Callback applied to each member of a room by `for_each`.
pub type EachFunc = Box<dyn FnMut(&ArcConn) + Send>;

/// Room bookkeeping and fan-out for one namespace. The local
/// implementation serves a single node; the remote one overlays a
/// cluster protocol on a pub/sub bus.
///
/// Membership operations are idempotent with respect to missing
/// membership and never fail. Fan-out snapshots the member set before
/// delivering, in no particular order; delivery to one member never
/// affects the others.
#[async_trait]
pub trait Broadcaster: Send + Sync + 'static {
    async fn join(&self, room: &str, conn: ArcConn);
    async fn leave(&self, room: &str, conn: ArcConn);
    async fn leave_all(&self, conn: ArcConn);

    /// Remove the room without notifying its members.
    async fn clear(&self, room: &str);

    /// Deliver an event to every member of the room.
    async fn send(&self, room: &str, event: &str, args: Vec<Value>);

    /// Deliver an event to every member of every room. A connection
    /// joined to several rooms may receive it several times.
    async fn send_all(&self, event: &str, args: Vec<Value>);

    async fn for_each(&self, room: &str, f: EachFunc);

    /// Member count of the room; 0 when absent, -1 on a cluster failure.
    async fn len(&self, room: &str) -> i64;

    async fn rooms_by_conn(&self, conn: ArcConn) -> Vec<String>;

    /// Snapshot of the current room names; may be stale by the time the
    /// caller reads it.
    async fn all_rooms(&self) -> Vec<String>;
}
