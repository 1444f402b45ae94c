//! Cluster overlay for the broadcaster.
//!
//! Three channels are used per namespace, parameterized by the
//! configured prefix `P` and the namespace `N`:
//! * `P#N#{uid}`: this node's broadcast channel, subscribed by every
//!   peer through the pattern `P#N#*`,
//! * `P-request#N`: cluster requests (room length, room enumeration,
//!   room clearing),
//! * `P-response#N`: responses, correlated by request id.
//!
//! A request is complete when one response per subscriber of the request
//! channel (observed immediately before publishing) has been collected,
//! or when the bounded wait elapses, in which case the caller gets a
//! sentinel (-1 / empty list).

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::{self, SelectAll, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use super::drivers::{Driver, MessageStream};
use super::{ArcConn, Broadcaster, EachFunc, LocalBroadcaster};

/// Request type discriminants on the wire.
const ROOM_LEN_REQ: &str = "0";
const CLEAR_ROOM_REQ: &str = "1";
const ALL_ROOM_REQ: &str = "2";

/// Buffer of each bus subscription.
const BUS_BUFFER: usize = 1024;

#[derive(Serialize)]
struct RoomLenRequest<'a> {
    #[serde(rename = "RequestType")]
    request_type: &'a str,
    #[serde(rename = "RequestID")]
    request_id: &'a str,
    #[serde(rename = "Room")]
    room: &'a str,
}

#[derive(Serialize)]
struct ClearRoomRequest<'a> {
    #[serde(rename = "RequestType")]
    request_type: &'a str,
    #[serde(rename = "RequestID")]
    request_id: &'a str,
    #[serde(rename = "Room")]
    room: &'a str,
    #[serde(rename = "UUID")]
    uuid: &'a str,
}

#[derive(Serialize)]
struct AllRoomRequest<'a> {
    #[serde(rename = "RequestType")]
    request_type: &'a str,
    #[serde(rename = "RequestID")]
    request_id: &'a str,
}

#[derive(Serialize)]
struct RoomLenResponse<'a> {
    #[serde(rename = "RequestType")]
    request_type: &'a str,
    #[serde(rename = "RequestID")]
    request_id: &'a str,
    #[serde(rename = "Connections")]
    connections: i64,
}

#[derive(Serialize)]
struct AllRoomResponse<'a> {
    #[serde(rename = "RequestType")]
    request_type: &'a str,
    #[serde(rename = "RequestID")]
    request_id: &'a str,
    #[serde(rename = "Rooms")]
    rooms: Vec<String>,
}

/// Inbound request/response envelope; fields not carried by a given
/// message type take their defaults.
#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "RequestType")]
    request_type: String,
    #[serde(rename = "RequestID")]
    request_id: String,
    #[serde(rename = "Room", default)]
    room: String,
    #[serde(rename = "UUID", default)]
    uuid: String,
    #[serde(rename = "Connections", default)]
    connections: i64,
    #[serde(rename = "Rooms", default)]
    rooms: Option<Vec<String>>,
}

/// The `{opts: [room, event], args: [..]}` broadcast schema. An empty
/// room targets the whole namespace.
#[derive(Serialize, Deserialize)]
struct BroadcastMessage {
    opts: (String, String),
    args: Vec<Value>,
}

enum PendingKind {
    RoomLen { connections: i64 },
    AllRooms { rooms: HashSet<String> },
}

struct PendingState {
    msg_count: usize,
    kind: PendingKind,
    done: Option<oneshot::Sender<()>>,
}

/// One in-flight cluster request: the subscriber count observed at
/// publish time, the responses collected so far and a single-shot done
/// signal fired when the two meet.
struct PendingRequest {
    num_sub: usize,
    state: Mutex<PendingState>,
}

/// Wraps a [`LocalBroadcaster`] and overlays the cluster protocol on a
/// pub/sub [`Driver`].
pub struct RemoteBroadcaster<D: Driver> {
    driver: D,
    local: LocalBroadcaster,
    /// This node's broadcast channel: `{prefix}#{nsp}#{uid}`.
    key: String,
    req_chan: String,
    res_chan: String,
    requests: DashMap<String, Arc<PendingRequest>>,
    request_timeout: Duration,
}

impl<D: Driver> RemoteBroadcaster<D> {
    /// Connect a namespace to the cluster: subscribes to the broadcast
    /// pattern and the request/response channels and spawns the
    /// dispatcher task.
    pub async fn new(
        nsp: &str,
        driver: D,
        prefix: &str,
        request_timeout: Duration,
    ) -> Result<Arc<Self>, D::Error> {
        let local = LocalBroadcaster::new(nsp);
        let key = format!("{prefix}#{nsp}#{}", local.uid());
        let req_chan = format!("{prefix}-request#{nsp}");
        let res_chan = format!("{prefix}-response#{nsp}");

        let bcast = driver.psubscribe(format!("{prefix}#{nsp}#*"), BUS_BUFFER).await?;
        let req = driver.subscribe(req_chan.clone(), BUS_BUFFER).await?;
        let res = driver.subscribe(res_chan.clone(), BUS_BUFFER).await?;

        let this = Arc::new(Self {
            driver,
            local,
            key,
            req_chan,
            res_chan,
            requests: DashMap::new(),
            request_timeout,
        });
        tokio::spawn(
            this.clone()
                .dispatch(stream::select_all([bcast, req, res])),
        );
        Ok(this)
    }

    /// Routes bus messages until the subscription streams end (bus error
    /// or unsubscription).
    async fn dispatch(self: Arc<Self>, mut messages: SelectAll<MessageStream>) {
        while let Some((chan, payload)) = messages.next().await {
            if chan == self.req_chan {
                self.on_request(&payload).await;
            } else if chan == self.res_chan {
                self.on_response(&payload);
            } else {
                self.on_message(&chan, &payload).await;
            }
        }
        debug!(nsp = self.local.nsp(), "cluster dispatcher terminated");
    }

    /// A peer broadcast, received on `{prefix}#{nsp}#{uid}`. Messages
    /// for another namespace or attributed to this node are dropped.
    async fn on_message(&self, chan: &str, payload: &[u8]) {
        let Some((nsp, uid)) = parse_broadcast_channel(chan) else {
            return;
        };
        if nsp != self.local.nsp() || uid == self.local.uid() {
            return;
        }
        let msg: BroadcastMessage = match serde_json::from_slice(payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(chan, "invalid broadcast message: {e}");
                return;
            }
        };
        let (room, event) = msg.opts;
        if room.is_empty() {
            self.local.send_all(&event, msg.args).await;
        } else {
            self.local.send(&room, &event, msg.args).await;
        }
    }

    async fn on_request(&self, payload: &[u8]) {
        let Ok(env) = serde_json::from_slice::<Envelope>(payload) else {
            return;
        };
        match env.request_type.as_str() {
            ROOM_LEN_REQ => {
                let res = RoomLenResponse {
                    request_type: ROOM_LEN_REQ,
                    request_id: &env.request_id,
                    connections: self.local.len(&env.room).await,
                };
                self.publish_json(&self.res_chan, &res).await;
            }
            ALL_ROOM_REQ => {
                let res = AllRoomResponse {
                    request_type: ALL_ROOM_REQ,
                    request_id: &env.request_id,
                    rooms: self.local.all_rooms().await,
                };
                self.publish_json(&self.res_chan, &res).await;
            }
            CLEAR_ROOM_REQ => {
                if env.uuid != self.local.uid() {
                    self.local.clear(&env.room).await;
                }
            }
            other => debug!(request_type = other, "ignoring unknown request type"),
        }
    }

    fn on_response(&self, payload: &[u8]) {
        let Ok(env) = serde_json::from_slice::<Envelope>(payload) else {
            return;
        };
        let Some(pending) = self.requests.get(&env.request_id).map(|e| e.value().clone()) else {
            return;
        };
        let mut guard = pending.state.lock().unwrap();
        let state = &mut *guard;
        match (&mut state.kind, env.request_type.as_str()) {
            (PendingKind::RoomLen { connections }, ROOM_LEN_REQ) => {
                *connections += env.connections;
                state.msg_count += 1;
            }
            (PendingKind::AllRooms { rooms }, ALL_ROOM_REQ) => {
                if let Some(received) = env.rooms {
                    rooms.extend(received);
                }
                state.msg_count += 1;
            }
            _ => return,
        }
        if state.msg_count >= pending.num_sub {
            if let Some(done) = state.done.take() {
                done.send(()).ok();
            }
        }
    }

    async fn publish_json<T: Serialize>(&self, chan: &str, msg: &T) {
        let payload = match serde_json::to_vec(msg) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("error encoding cluster message: {e}");
                return;
            }
        };
        if let Err(e) = self.driver.publish(chan.to_owned(), payload).await {
            warn!(chan, "cluster publish failed: {e}");
        }
    }

    async fn publish_broadcast(&self, room: &str, event: &str, args: Vec<Value>) {
        let msg = BroadcastMessage {
            opts: (room.to_owned(), event.to_owned()),
            args,
        };
        self.publish_json(&self.key, &msg).await;
    }

    /// Publish a request and wait for one response from every subscriber
    /// observed on the request channel. `None` on bus error or timeout.
    async fn send_request(
        &self,
        request_id: &str,
        kind: PendingKind,
        payload: Vec<u8>,
    ) -> Option<Arc<PendingRequest>> {
        let num_sub = match self.driver.num_sub(&self.req_chan).await {
            Ok(n) if n > 0 => n,
            Ok(_) => return None,
            Err(e) => {
                warn!("pubsub subscriber count failed: {e}");
                return None;
            }
        };

        let (done_tx, done_rx) = oneshot::channel();
        let pending = Arc::new(PendingRequest {
            num_sub,
            state: Mutex::new(PendingState {
                msg_count: 0,
                kind,
                done: Some(done_tx),
            }),
        });
        self.requests.insert(request_id.to_owned(), pending.clone());

        if let Err(e) = self.driver.publish(self.req_chan.clone(), payload).await {
            warn!("cluster request publish failed: {e}");
            self.requests.remove(request_id);
            return None;
        }

        let completed = timeout(self.request_timeout, done_rx).await.is_ok();
        self.requests.remove(request_id);
        if !completed {
            warn!(request_id, "cluster request timed out");
            return None;
        }
        Some(pending)
    }

    async fn len_room_remote(&self, room: &str) -> i64 {
        let request_id = Uuid::new_v4().to_string();
        let req = RoomLenRequest {
            request_type: ROOM_LEN_REQ,
            request_id: &request_id,
            room,
        };
        let Ok(payload) = serde_json::to_vec(&req) else {
            return -1;
        };
        let kind = PendingKind::RoomLen { connections: 0 };
        match self.send_request(&request_id, kind, payload).await {
            Some(pending) => match &pending.state.lock().unwrap().kind {
                PendingKind::RoomLen { connections } => *connections,
                PendingKind::AllRooms { .. } => -1,
            },
            None => -1,
        }
    }

    async fn all_rooms_remote(&self) -> Vec<String> {
        let request_id = Uuid::new_v4().to_string();
        let req = AllRoomRequest {
            request_type: ALL_ROOM_REQ,
            request_id: &request_id,
        };
        let Ok(payload) = serde_json::to_vec(&req) else {
            return vec![];
        };
        // seed with the local rooms; peer responses (this node included,
        // it answers its own request through the bus) merge into the set
        let kind = PendingKind::AllRooms {
            rooms: self.local.all_rooms().await.into_iter().collect(),
        };
        match self.send_request(&request_id, kind, payload).await {
            Some(pending) => match &mut pending.state.lock().unwrap().kind {
                PendingKind::AllRooms { rooms } => rooms.drain().collect(),
                PendingKind::RoomLen { .. } => vec![],
            },
            None => vec![],
        }
    }
}

/// Extract `(namespace, uid)` from a `{prefix}#{nsp}#{uid}` channel.
fn parse_broadcast_channel(chan: &str) -> Option<(&str, &str)> {
    let mut parts = chan.rsplit('#');
    let uid = parts.next()?;
    let nsp = parts.next()?;
    Some((nsp, uid))
}

#[async_trait]
impl<D: Driver> Broadcaster for RemoteBroadcaster<D> {
    async fn join(&self, room: &str, conn: ArcConn) {
        self.local.join(room, conn).await;
    }

    async fn leave(&self, room: &str, conn: ArcConn) {
        self.local.leave(room, conn).await;
    }

    async fn leave_all(&self, conn: ArcConn) {
        self.local.leave_all(conn).await;
    }

    async fn clear(&self, room: &str) {
        self.local.clear(room).await;
        let request_id = Uuid::new_v4().to_string();
        let req = ClearRoomRequest {
            request_type: CLEAR_ROOM_REQ,
            request_id: &request_id,
            room,
            uuid: self.local.uid(),
        };
        let Ok(payload) = serde_json::to_vec(&req) else {
            return;
        };
        if let Err(e) = self.driver.publish(self.req_chan.clone(), payload).await {
            warn!("clear room publish failed: {e}");
        }
    }

    async fn send(&self, room: &str, event: &str, args: Vec<Value>) {
        self.publish_broadcast(room, event, args.clone()).await;
        self.local.send(room, event, args).await;
    }

    async fn send_all(&self, event: &str, args: Vec<Value>) {
        self.publish_broadcast("", event, args.clone()).await;
        self.local.send_all(event, args).await;
    }

    async fn for_each(&self, room: &str, f: EachFunc) {
        self.local.for_each(room, f).await;
    }

    async fn len(&self, room: &str) -> i64 {
        self.len_room_remote(room).await
    }

    async fn rooms_by_conn(&self, conn: ArcConn) -> Vec<String> {
        self.local.rooms_by_conn(conn).await
    }

    async fn all_rooms(&self) -> Vec<String> {
        self.all_rooms_remote().await
    }
}
