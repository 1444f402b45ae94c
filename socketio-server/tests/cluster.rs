
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fixture::{start_server, TestClient, TestServer};
use serde_json::json;
use socketio_server::broadcast::drivers::stub::StubHub;
use socketio_server::{ArcConn, Broadcaster, BroadcasterFactory, Error, RemoteBroadcaster};
use tokio::sync::mpsc;

/// Plugs the in-memory bus into a server, standing in for the redis
/// driver.
struct StubBusFactory {
    hub: StubHub,
}

#[async_trait]
impl BroadcasterFactory for StubBusFactory {
    async fn create(&self, nsp: &str) -> Result<Arc<dyn Broadcaster>, Error> {
        let broadcaster = RemoteBroadcaster::new(
            nsp,
            self.hub.driver(),
            "socket.io",
            Duration::from_secs(2),
        )
        .await
        .expect("the stub bus is infallible");
        Ok(broadcaster as Arc<dyn Broadcaster>)
    }
}

/// A two-node cluster on one shared bus, each node with a root namespace
/// forwarding connected views.
async fn two_nodes() -> (
    TestServer,
    TestServer,
    mpsc::UnboundedReceiver<ArcConn>,
    mpsc::UnboundedReceiver<ArcConn>,
) {
    let hub = StubHub::new();
    let n1 = start_server();
    let n2 = start_server();
    n1.server
        .set_broadcaster_factory(Arc::new(StubBusFactory { hub: hub.clone() }));
    n2.server
        .set_broadcaster_factory(Arc::new(StubBusFactory { hub: hub.clone() }));

    let (tx1, rx1) = mpsc::unbounded_channel();
    n1.server
        .on_connect("/", move |conn: ArcConn, _auth| {
            tx1.send(conn).unwrap();
            Ok(())
        })
        .await
        .unwrap();
    let (tx2, rx2) = mpsc::unbounded_channel();
    n2.server
        .on_connect("/", move |conn: ArcConn, _auth| {
            tx2.send(conn).unwrap();
            Ok(())
        })
        .await
        .unwrap();

    (n1, n2, rx1, rx2)
}

async fn member(
    node: &TestServer,
    conns: &mut mpsc::UnboundedReceiver<ArcConn>,
    room: &str,
) -> (TestClient, ArcConn) {
    let mut client = node.client().await;
    client.connect("/").await;
    let conn = conns.recv().await.unwrap();
    conn.join(room).await;
    (client, conn)
}

#[tokio::test]
async fn cross_node_broadcast_is_delivered_exactly_once() {
    let (n1, n2, mut c1, mut c2) = two_nodes().await;
    let (mut a, _conn_a) = member(&n1, &mut c1, "r").await;
    let (mut b, _conn_b) = member(&n2, &mut c2, "r").await;

    n1.server
        .broadcast_to_room("/", "r", "m", vec![json!("x")])
        .await;

    assert_eq!(a.recv().await, "2[\"m\",\"x\"]");
    assert_eq!(b.recv().await, "2[\"m\",\"x\"]");
    // no duplicate deliveries from the bus echo
    a.assert_silent(100).await;
    b.assert_silent(100).await;
}

#[tokio::test]
async fn room_len_spans_the_cluster() {
    let (n1, n2, mut c1, mut c2) = two_nodes().await;
    let (_a, _conn_a) = member(&n1, &mut c1, "r").await;
    let (_b, _conn_b) = member(&n2, &mut c2, "r").await;

    assert_eq!(n1.server.room_len("/", "r").await, 2);
    assert_eq!(n2.server.room_len("/", "r").await, 2);
}

#[tokio::test]
async fn all_rooms_is_the_union_of_both_nodes() {
    let (n1, n2, mut c1, mut c2) = two_nodes().await;
    let (a, conn_a) = member(&n1, &mut c1, "n1-a").await;
    conn_a.join("n1-b").await;
    conn_a.join("n1-c").await;
    let (b, conn_b) = member(&n2, &mut c2, "n2-a").await;
    conn_b.join("n2-b").await;
    conn_b.join("n2-c").await;

    let mut rooms = n1.server.rooms("/").await;
    rooms.sort();
    let mut expected = vec![
        "n1-a".to_string(),
        "n1-b".to_string(),
        "n1-c".to_string(),
        "n2-a".to_string(),
        "n2-b".to_string(),
        "n2-c".to_string(),
        a.sid.to_string(),
        b.sid.to_string(),
    ];
    expected.sort();
    assert_eq!(rooms, expected);
}

#[tokio::test]
async fn clear_room_propagates_across_nodes() {
    let (n1, n2, mut c1, mut c2) = two_nodes().await;
    let (_a, _conn_a) = member(&n1, &mut c1, "r").await;
    let (_b, _conn_b) = member(&n2, &mut c2, "r").await;

    n1.server.clear_room("/", "r").await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(n1.server.room_len("/", "r").await, 0);
}

#[tokio::test]
async fn namespace_broadcast_spans_the_cluster() {
    let (n1, n2, mut c1, mut c2) = two_nodes().await;
    let (mut a, _conn_a) = member(&n1, &mut c1, "alpha").await;
    let (mut b, _conn_b) = member(&n2, &mut c2, "beta").await;

    n2.server
        .broadcast_to_namespace("/", "tick", vec![])
        .await;

    // every member of every room on both nodes gets the event at least
    // once (personal rooms make that two deliveries per client)
    assert_eq!(a.recv().await, "2[\"tick\"]");
    assert_eq!(b.recv().await, "2[\"tick\"]");
}
