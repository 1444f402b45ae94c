
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fixture::start_server;
use socketio_server::engineio::transport::Transport;
use socketio_server::{ArcConn, Error};
use tokio::sync::mpsc;

#[tokio::test]
async fn client_namespace_disconnect_fires_callback_and_leaves_rooms() {
    let ts = start_server();
    let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();
    let (disc_tx, mut disc_rx) = mpsc::unbounded_channel();
    ts.server
        .on_connect("/chat", move |conn: ArcConn, _auth| {
            conn_tx.send(conn).unwrap();
            Ok(())
        })
        .await
        .unwrap();
    ts.server
        .on_disconnect("/chat", move |conn: ArcConn, reason, _details| {
            disc_tx.send((conn.id(), reason)).unwrap();
        })
        .await
        .unwrap();

    let mut client = ts.client().await;
    client.connect("/chat").await;
    let conn = conn_rx.recv().await.unwrap();
    conn.join("r1").await;

    client.send("1/chat,").await;
    let (sid, _reason) = disc_rx.recv().await.unwrap();
    assert_eq!(sid, client.sid);
    assert_eq!(ts.server.room_len("/chat", "r1").await, 0);
    // the engine session itself survives a namespace disconnect
    assert!(!client.is_closed());
}

#[tokio::test]
async fn transport_loss_reports_client_disconnected() {
    let ts = start_server();
    let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();
    let (disc_tx, mut disc_rx) = mpsc::unbounded_channel();
    ts.server
        .on_connect("/", move |conn: ArcConn, _auth| {
            conn_tx.send(conn).unwrap();
            Ok(())
        })
        .await
        .unwrap();
    ts.server
        .on_disconnect("/", move |_conn, reason, details| {
            disc_tx.send((reason, details)).unwrap();
        })
        .await
        .unwrap();

    let mut client = ts.client().await;
    client.connect("/").await;
    let conn = conn_rx.recv().await.unwrap();
    conn.join("r1").await;

    // ungraceful shutdown: the transport dies under the session
    client.transport.close().await;

    let (reason, details) = disc_rx.recv().await.unwrap();
    assert_eq!(reason, "client disconnected");
    assert!(details.is_none());
    // close ran the room cleanup exactly once
    assert_eq!(ts.server.room_len("/", "r1").await, 0);
    assert!(disc_rx.try_recv().is_err());
}

#[tokio::test]
async fn server_side_close_fires_disconnect_once() {
    let ts = start_server();
    let hits = Arc::new(AtomicU64::new(0));
    let hits2 = hits.clone();
    let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();
    ts.server
        .on_connect("/", move |conn: ArcConn, _auth| {
            conn_tx.send(conn).unwrap();
            Ok(())
        })
        .await
        .unwrap();
    ts.server
        .on_disconnect("/", move |_conn, _reason, _details| {
            hits2.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();

    let mut client = ts.client().await;
    client.connect("/").await;
    let conn = conn_rx.recv().await.unwrap();

    // concurrent closes collapse into one close sequence
    tokio::join!(conn.close(), conn.close());
    client.wait_closed().await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn handler_panic_reaches_on_error_and_connection_survives() {
    let ts = start_server();
    let (err_tx, mut err_rx) = mpsc::unbounded_channel();
    ts.server
        .on_connect("/", |_conn, _auth| Ok(()))
        .await
        .unwrap();
    ts.server
        .on_error("/", move |_conn, error| {
            err_tx.send(error.to_string()).unwrap();
        })
        .await
        .unwrap();
    ts.server
        .on_event("/", "boom", |_conn: ArcConn| -> () { panic!("exploded") })
        .await
        .unwrap();
    ts.server
        .on_event("/", "echo", |_conn: ArcConn, v: String| (v,))
        .await
        .unwrap();

    let mut client = ts.client().await;
    client.connect("/").await;

    client.send("2[\"boom\"]").await;
    let error = err_rx.recv().await.unwrap();
    assert!(error.contains("exploded"), "unexpected error: {error}");

    // the connection keeps serving events
    client.send("27[\"echo\",\"still alive\"]").await;
    assert_eq!(client.recv().await, "37[\"still alive\"]");
}

#[tokio::test]
async fn decode_failures_are_reported_and_skipped() {
    let ts = start_server();
    let (err_tx, mut err_rx) = mpsc::unbounded_channel();
    ts.server
        .on_connect("/", |_conn, _auth| Ok(()))
        .await
        .unwrap();
    ts.server
        .on_error("/", move |_conn, error: Error| {
            err_tx.send(error.to_string()).unwrap();
        })
        .await
        .unwrap();
    ts.server
        .on_event("/", "echo", |_conn: ArcConn, v: String| (v,))
        .await
        .unwrap();

    let mut client = ts.client().await;
    client.connect("/").await;

    // malformed event payload: reported, then the reader continues
    client.send("2{\"not\":\"an array\"}").await;
    assert!(err_rx.recv().await.is_some());

    client.send("23[\"echo\",\"ok\"]").await;
    assert_eq!(client.recv().await, "33[\"ok\"]");
}

#[tokio::test]
async fn wrongly_typed_event_arguments_are_reported() {
    let ts = start_server();
    let (err_tx, mut err_rx) = mpsc::unbounded_channel();
    ts.server
        .on_connect("/", |_conn, _auth| Ok(()))
        .await
        .unwrap();
    ts.server
        .on_error("/", move |_conn, error| {
            err_tx.send(error.to_string()).unwrap();
        })
        .await
        .unwrap();
    ts.server
        .on_event("/", "add", |_conn: ArcConn, _a: i64| {})
        .await
        .unwrap();

    let mut client = ts.client().await;
    client.connect("/").await;
    client.send("2[\"add\",\"NaN\"]").await;

    let error = err_rx.recv().await.unwrap();
    assert!(error.contains("decoding"), "unexpected error: {error}");
}
