use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::broadcast::{ArcConn, Conn as _};
use crate::errors::{Error, CLIENT_DISCONNECT_MSG};
use crate::handler::Handlers;
use crate::ns_conn::NamespaceConn;
use crate::parser::{self, Body, Header, PacketType, PayloadData, ALIAS_ROOT_NAMESPACE, ROOT_NAMESPACE};
use engineio_server::{Data, Packet as EnginePacket, Session};

/// Outbound work item: a header plus its payload, serialized by the
/// writer task.
struct WriteItem {
    header: Header,
    data: PayloadData,
}

/// Queued error, routed to the `on_error` callback of its namespace.
struct ErrorItem {
    nsp: String,
    error: Error,
}

/// Shared internals of one socket.io connection: the engine session, the
/// outbound and error queues, the close latch and the namespace views.
/// The reader, writer and error-dispatcher tasks each hold one `Arc`.
pub(crate) struct ConnState {
    pub(crate) session: Arc<Session>,
    handlers: Arc<Handlers>,
    nsps: DashMap<String, Arc<NamespaceConn>>,
    write_tx: mpsc::Sender<WriteItem>,
    error_tx: mpsc::Sender<ErrorItem>,
    quit_tx: watch::Sender<bool>,
    closed: AtomicBool,
}

impl ConnState {
    /// Enqueue an outbound packet. If the close latch fires while the
    /// queue is full the packet is dropped silently.
    pub(crate) async fn write(&self, header: Header, data: PayloadData) {
        let mut quit = self.quit_tx.subscribe();
        if *quit.borrow_and_update() {
            return;
        }
        tokio::select! {
            _ = quit.changed() => {}
            res = self.write_tx.send(WriteItem { header, data }) => {
                res.ok();
            }
        }
    }

    /// Queue an error for the error dispatcher.
    async fn report_error(&self, nsp: &str, error: Error) {
        debug!(nsp, "connection error: {error}");
        let mut quit = self.quit_tx.subscribe();
        if *quit.borrow_and_update() {
            return;
        }
        tokio::select! {
            _ = quit.changed() => {}
            res = self.error_tx.send(ErrorItem { nsp: nsp.to_owned(), error }) => {
                res.ok();
            }
        }
    }

    /// The close sequence, executed at most once: leave all rooms and
    /// fire `on_disconnect` for every namespace view, close the session,
    /// release the three tasks.
    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(sid = %self.session.id(), "closing connection");
        let views: Vec<_> = self.nsps.iter().map(|entry| entry.value().clone()).collect();
        self.nsps.clear();
        for nc in views {
            nc.leave_all().await;
            if let Some(handler) = self.handlers.get(nc.namespace()) {
                handler.dispatch_disconnect(
                    nc.clone() as ArcConn,
                    CLIENT_DISCONNECT_MSG.to_owned(),
                    None,
                );
            }
        }
        self.session.close();
        self.quit_tx.send_replace(true);
    }

    async fn handle_event(&self, header: Header, name: String, args: Vec<Value>) {
        let Some(nc) = self.nsps.get(&header.nsp).map(|entry| entry.value().clone()) else {
            return;
        };
        let Some(handler) = self.handlers.get(&header.nsp) else {
            return;
        };
        match handler.dispatch_event(nc as ArcConn, &name, args) {
            Ok(ret) if !ret.is_empty() && header.id.is_some() => {
                let mut reply = Header::new(PacketType::Ack, header.nsp);
                reply.id = header.id;
                self.write(reply, PayloadData::Args(ret)).await;
            }
            Ok(_) => {}
            Err(e) => self.report_error(&header.nsp, e.into()).await,
        }
    }

    async fn handle_ack(&self, header: Header, args: Vec<Value>) {
        let Some(nc) = self.nsps.get(&header.nsp).map(|entry| entry.value().clone()) else {
            return;
        };
        let Some(id) = header.id else {
            return;
        };
        // consumed at most once; a second ACK with the same id is a no-op
        let Some(ack) = nc.take_ack(id) else {
            return;
        };
        if let Err(e) = ack.call(args) {
            self.report_error(&header.nsp, e.into()).await;
        }
    }

    async fn handle_disconnect(&self, header: Header, reason: String, details: Option<Value>) {
        let Some((_, nc)) = self.nsps.remove(&header.nsp) else {
            return;
        };
        nc.leave_all().await;
        if let Some(handler) = self.handlers.get(&header.nsp) {
            handler.dispatch_disconnect(nc as ArcConn, reason, details);
        }
    }
}

/// `CONNECT` handling: create or reuse the namespace view, join the
/// personal room, run the connect callback and acknowledge with the
/// session id. Returns `false` when the connection must be aborted
/// (unknown namespace or rejected connect).
async fn handle_connect(state: &Arc<ConnState>, header: Header, auth: Value) -> bool {
    let Some(handler) = state.handlers.get(&header.nsp) else {
        state
            .report_error(&header.nsp, Error::FailedNamespaceConnect)
            .await;
        state.close().await;
        return false;
    };

    let nc = match state.nsps.get(&header.nsp).map(|entry| entry.value().clone()) {
        Some(nc) => nc,
        None => {
            let nc = NamespaceConn::new(state.clone(), header.nsp.clone(), handler.broadcaster());
            state.nsps.insert(header.nsp.clone(), nc.clone());
            // every connection gets a personal room under its own id
            nc.join(&state.session.id().to_string()).await;
            nc
        }
    };

    if let Err(e) = handler.dispatch_connect(nc.clone() as ArcConn, auth) {
        state.report_error(&header.nsp, e).await;
        state.close().await;
        return false;
    }

    let reply = Header::new(PacketType::Connect, header.nsp);
    let body = json!({ "sid": state.session.id().to_string() });
    state.write(reply, PayloadData::Data(body)).await;
    true
}

/// A socket.io connection over one engine session.
pub(crate) struct Conn {
    state: Arc<ConnState>,
    write_rx: mpsc::Receiver<WriteItem>,
    error_rx: mpsc::Receiver<ErrorItem>,
}

impl Conn {
    pub(crate) fn new(session: Arc<Session>, handlers: Arc<Handlers>) -> Self {
        let (write_tx, write_rx) = mpsc::channel(1);
        let (error_tx, error_rx) = mpsc::channel(1);
        let (quit_tx, _) = watch::channel(false);
        Self {
            state: Arc::new(ConnState {
                session,
                handlers,
                nsps: DashMap::new(),
                write_tx,
                error_tx,
                quit_tx,
                closed: AtomicBool::new(false),
            }),
            write_rx,
            error_rx,
        }
    }

    /// Run the connection: spawn the reader, writer and error-dispatcher
    /// tasks, then wait for the session to end and run the close
    /// sequence.
    pub(crate) async fn serve(self) {
        let Conn {
            state,
            write_rx,
            error_rx,
        } = self;
        tokio::spawn(serve_write(state.clone(), write_rx));
        tokio::spawn(serve_error(state.clone(), error_rx));
        tokio::spawn(serve_read(state.clone()));

        state.session.closed().await;
        state.close().await;
    }
}

/// Reader task: frames packets out of the session and dispatches them by
/// type, in wire order.
async fn serve_read(state: Arc<ConnState>) {
    let mut quit = state.quit_tx.subscribe();
    loop {
        let data = tokio::select! {
            _ = quit.changed() => return,
            data = state.session.next_message() => data,
        };
        let raw = match data {
            Ok(Data::Text(raw)) => raw,
            Ok(Data::Binary(_)) => {
                // binary attachments are not materialized by this core
                debug!(sid = %state.session.id(), "dropping binary frame");
                continue;
            }
            // session closed or transport failed; the close sequence
            // runs from serve()
            Err(_) => return,
        };

        let packet = match parser::decode(&raw) {
            Ok(packet) => packet,
            Err(e) => {
                state.report_error(ROOT_NAMESPACE, e.into()).await;
                continue;
            }
        };
        let mut header = packet.header;
        if header.nsp == ALIAS_ROOT_NAMESPACE {
            header.nsp = ROOT_NAMESPACE.to_owned();
        }

        match packet.body {
            Body::Connect(auth) => {
                if !handle_connect(&state, header, auth).await {
                    return;
                }
            }
            Body::Event { name, args } => state.handle_event(header, name, args).await,
            Body::Ack(args) => state.handle_ack(header, args).await,
            Body::Disconnect { reason, details } => {
                state.handle_disconnect(header, reason, details).await
            }
            Body::Error(_) => {
                state
                    .report_error(&header.nsp, Error::InvalidPacketType)
                    .await
            }
        }
    }
}

/// Writer task: single consumer of the outbound queue, serializing
/// packets in submission order.
async fn serve_write(state: Arc<ConnState>, mut rx: mpsc::Receiver<WriteItem>) {
    let mut quit = state.quit_tx.subscribe();
    loop {
        let item = tokio::select! {
            _ = quit.changed() => return,
            item = rx.recv() => match item {
                Some(item) => item,
                None => return,
            },
        };
        match parser::encode(&item.header, &item.data) {
            Ok(encoded) => {
                if let Err(e) = state.session.send(EnginePacket::Message(encoded)).await {
                    state.report_error(&item.header.nsp, e.into()).await;
                }
            }
            Err(e) => {
                state
                    .report_error(&item.header.nsp, Error::Encode(e))
                    .await
            }
        }
    }
}

/// Error-dispatcher task: routes queued errors to the `on_error`
/// callback of their namespace. Errors whose namespace has no live view
/// are dropped.
async fn serve_error(state: Arc<ConnState>, mut rx: mpsc::Receiver<ErrorItem>) {
    let mut quit = state.quit_tx.subscribe();
    loop {
        let item = tokio::select! {
            _ = quit.changed() => return,
            item = rx.recv() => match item {
                Some(item) => item,
                None => return,
            },
        };
        let Some(handler) = state.handlers.get(&item.nsp) else {
            continue;
        };
        let Some(nc) = state.nsps.get(&item.nsp).map(|entry| entry.value().clone()) else {
            continue;
        };
        handler.dispatch_error(nc as ArcConn, item.error);
    }
}
