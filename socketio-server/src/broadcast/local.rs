use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use super::{ArcConn, Broadcaster, EachFunc};
use engineio_server::Sid;

/// Room membership index for one namespace: room name to its members
/// keyed by connection id.
///
/// Mutations hold the write lock; the entry for a room is removed in the
/// same critical section that removed its last member. Fan-out copies
/// the member set out under the read lock and releases it before
/// delivering, so sends never block membership changes.
#[derive(Default)]
struct RoomMap {
    rooms: RwLock<HashMap<String, HashMap<Sid, ArcConn>>>,
}

impl RoomMap {
    fn join(&self, room: &str, conn: ArcConn) {
        let mut rooms = self.rooms.write().unwrap();
        rooms
            .entry(room.to_owned())
            .or_default()
            .insert(conn.id(), conn);
    }

    fn leave(&self, room: &str, id: Sid) {
        let mut rooms = self.rooms.write().unwrap();
        if let Some(members) = rooms.get_mut(room) {
            members.remove(&id);
            if members.is_empty() {
                rooms.remove(room);
            }
        }
    }

    fn leave_all(&self, id: Sid) {
        let mut rooms = self.rooms.write().unwrap();
        rooms.retain(|_, members| {
            members.remove(&id);
            !members.is_empty()
        });
    }

    fn clear(&self, room: &str) {
        self.rooms.write().unwrap().remove(room);
    }

    fn members(&self, room: &str) -> Vec<ArcConn> {
        self.rooms
            .read()
            .unwrap()
            .get(room)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    fn snapshot(&self) -> Vec<Vec<ArcConn>> {
        self.rooms
            .read()
            .unwrap()
            .values()
            .map(|members| members.values().cloned().collect())
            .collect()
    }

    fn len(&self, room: &str) -> usize {
        self.rooms
            .read()
            .unwrap()
            .get(room)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    fn room_names(&self) -> Vec<String> {
        self.rooms.read().unwrap().keys().cloned().collect()
    }

    fn rooms_of(&self, id: Sid) -> Vec<String> {
        self.rooms
            .read()
            .unwrap()
            .iter()
            .filter(|(_, members)| members.contains_key(&id))
            .map(|(room, _)| room.clone())
            .collect()
    }
}

/// Per-namespace broadcaster backed by the in-process room index. Owns
/// the node-unique identifier used to attribute cluster messages.
pub struct LocalBroadcaster {
    nsp: String,
    uid: String,
    rooms: RoomMap,
}

impl LocalBroadcaster {
    pub fn new(nsp: impl Into<String>) -> Self {
        Self {
            nsp: nsp.into(),
            uid: Uuid::new_v4().to_string(),
            rooms: RoomMap::default(),
        }
    }

    pub(crate) fn nsp(&self) -> &str {
        &self.nsp
    }

    /// The random v4 uuid identifying this node for this namespace.
    pub(crate) fn uid(&self) -> &str {
        &self.uid
    }

    fn deliver(conn: ArcConn, event: &str, args: Vec<Value>) {
        let event = event.to_owned();
        tokio::spawn(async move { conn.emit(&event, args).await });
    }
}

#[async_trait]
impl Broadcaster for LocalBroadcaster {
    async fn join(&self, room: &str, conn: ArcConn) {
        self.rooms.join(room, conn);
    }

    async fn leave(&self, room: &str, conn: ArcConn) {
        self.rooms.leave(room, conn.id());
    }

    async fn leave_all(&self, conn: ArcConn) {
        self.rooms.leave_all(conn.id());
    }

    async fn clear(&self, room: &str) {
        self.rooms.clear(room);
    }

    async fn send(&self, room: &str, event: &str, args: Vec<Value>) {
        let members = self.rooms.members(room);
        debug!(nsp = %self.nsp, room, event, "broadcasting to {} members", members.len());
        for conn in members {
            Self::deliver(conn, event, args.clone());
        }
    }

    async fn send_all(&self, event: &str, args: Vec<Value>) {
        for members in self.rooms.snapshot() {
            for conn in members {
                Self::deliver(conn, event, args.clone());
            }
        }
    }

    async fn for_each(&self, room: &str, mut f: EachFunc) {
        for conn in self.rooms.members(room) {
            f(&conn);
        }
    }

    async fn len(&self, room: &str) -> i64 {
        self.rooms.len(room) as i64
    }

    async fn rooms_by_conn(&self, conn: ArcConn) -> Vec<String> {
        self.rooms.rooms_of(conn.id())
    }

    async fn all_rooms(&self) -> Vec<String> {
        self.rooms.room_names()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::test_support::StubConn;
    use std::sync::Arc;
    use std::time::Duration;

    fn conn() -> Arc<StubConn> {
        StubConn::new()
    }

    #[tokio::test]
    async fn join_and_len() {
        let bc = LocalBroadcaster::new("/");
        let a = conn();
        let b = conn();
        bc.join("r1", a.clone()).await;
        bc.join("r1", b.clone()).await;
        bc.join("r2", a.clone()).await;
        assert_eq!(bc.len("r1").await, 2);
        assert_eq!(bc.len("r2").await, 1);
        assert_eq!(bc.len("absent").await, 0);
    }

    #[tokio::test]
    async fn join_is_idempotent() {
        let bc = LocalBroadcaster::new("/");
        let a = conn();
        bc.join("r1", a.clone()).await;
        bc.join("r1", a.clone()).await;
        assert_eq!(bc.len("r1").await, 1);
    }

    #[tokio::test]
    async fn room_entry_exists_iff_nonempty() {
        let bc = LocalBroadcaster::new("/");
        let a = conn();
        let b = conn();
        bc.join("r1", a.clone()).await;
        bc.join("r1", b.clone()).await;
        assert_eq!(bc.all_rooms().await, vec!["r1".to_string()]);

        bc.leave("r1", a.clone()).await;
        assert_eq!(bc.len("r1").await, 1);
        assert_eq!(bc.all_rooms().await, vec!["r1".to_string()]);

        bc.leave("r1", b.clone()).await;
        assert_eq!(bc.len("r1").await, 0);
        assert!(bc.all_rooms().await.is_empty());

        // leaving a missing room never fails
        bc.leave("r1", b).await;
        bc.leave("never-existed", a).await;
    }

    #[tokio::test]
    async fn leave_all_empties_rooms_by_conn() {
        let bc = LocalBroadcaster::new("/");
        let a = conn();
        let b = conn();
        bc.join("r1", a.clone()).await;
        bc.join("r2", a.clone()).await;
        bc.join("r2", b.clone()).await;

        let mut rooms = bc.rooms_by_conn(a.clone() as ArcConn).await;
        rooms.sort();
        assert_eq!(rooms, ["r1", "r2"]);

        bc.leave_all(a.clone() as ArcConn).await;
        assert!(bc.rooms_by_conn(a as ArcConn).await.is_empty());
        assert_eq!(bc.rooms_by_conn(b as ArcConn).await, ["r2"]);
        assert_eq!(bc.all_rooms().await, vec!["r2".to_string()]);
    }

    #[tokio::test]
    async fn clear_removes_the_room_silently() {
        let bc = LocalBroadcaster::new("/");
        let a = conn();
        bc.join("r1", a.clone()).await;
        bc.clear("r1").await;
        assert_eq!(bc.len("r1").await, 0);
        assert!(a.emitted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_reaches_every_member() {
        let bc = LocalBroadcaster::new("/");
        let a = conn();
        let b = conn();
        let outsider = conn();
        bc.join("r1", a.clone()).await;
        bc.join("r1", b.clone()).await;
        bc.join("r2", outsider.clone()).await;

        bc.send("r1", "msg", vec![serde_json::json!("hi")]).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        for member in [&a, &b] {
            let emitted = member.emitted.lock().unwrap();
            assert_eq!(emitted.len(), 1);
            assert_eq!(emitted[0].0, "msg");
        }
        assert!(outsider.emitted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_all_may_deliver_per_room() {
        let bc = LocalBroadcaster::new("/");
        let a = conn();
        bc.join("r1", a.clone()).await;
        bc.join("r2", a.clone()).await;

        bc.send_all("tick", vec![]).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // one delivery per joined room; deduplication is not promised
        assert_eq!(a.emitted.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn for_each_visits_members() {
        let bc = LocalBroadcaster::new("/");
        bc.join("r1", conn()).await;
        bc.join("r1", conn()).await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bc.for_each(
            "r1",
            Box::new(move |conn| {
                tx.send(conn.id()).unwrap();
            }),
        )
        .await;
        let mut seen = 0;
        while rx.try_recv().is_ok() {
            seen += 1;
        }
        assert_eq!(seen, 2);
    }

    #[tokio::test]
    async fn uids_are_unique_per_broadcaster() {
        assert_ne!(
            LocalBroadcaster::new("/").uid(),
            LocalBroadcaster::new("/").uid()
        );
    }
}
