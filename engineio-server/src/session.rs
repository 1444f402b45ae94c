use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use http::{HeaderMap, Uri};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::debug;

use crate::config::EngineIoConfig;
use crate::errors::Error;
use crate::packet::{OpenPacket, Packet};
use crate::sid::Sid;
use crate::transport::Transport;

/// An application payload surfaced by [`Session::next_message`].
#[derive(Debug, Clone, PartialEq)]
pub enum Data {
    Text(String),
    Binary(Bytes),
}

/// One Engine.IO session over one (upgradable) byte transport.
///
/// The session owns the liveness loop: a heartbeat task pings the client
/// every `ping_interval` and arms a pong deadline of `ping_interval +
/// ping_timeout`; any packet read from the client releases the deadline,
/// and an elapsed deadline closes the session. Reads and writes snapshot
/// the active transport under the upgrade lock, set a `ping_timeout`
/// deadline on it and retry temporary failures.
pub struct Session {
    sid: Sid,
    config: EngineIoConfig,

    /// The active transport, swapped under the write lock when an
    /// upgrade commits. Accessors snapshot the `Arc` and release the
    /// lock before doing any IO.
    active: RwLock<Arc<dyn Transport>>,

    /// Armed by the heartbeat at every ping, released by any read.
    pong_deadline: Mutex<Option<JoinHandle<()>>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,

    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl Session {
    /// Create a session over an already-established transport and start
    /// its heartbeat. The caller must follow up with
    /// [`init_session`](Self::init_session) to advertise the parameters.
    pub fn new(sid: Sid, transport: Arc<dyn Transport>, config: EngineIoConfig) -> Arc<Self> {
        let (closed_tx, _) = watch::channel(false);
        let session = Arc::new(Self {
            sid,
            config,
            active: RwLock::new(transport),
            pong_deadline: Mutex::new(None),
            heartbeat: Mutex::new(None),
            closed: AtomicBool::new(false),
            closed_tx,
        });
        session.clone().spawn_heartbeat();
        session
    }

    pub fn id(&self) -> Sid {
        self.sid
    }

    pub fn config(&self) -> &EngineIoConfig {
        &self.config
    }

    /// Snapshot of the active transport.
    pub fn transport(&self) -> Arc<dyn Transport> {
        self.active.read().unwrap().clone()
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport().name()
    }

    pub fn url(&self) -> Uri {
        self.transport().url()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport().local_addr()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.transport().remote_addr()
    }

    pub fn remote_header(&self) -> HeaderMap {
        self.transport().remote_header()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Write the initial `OPEN` packet carrying the session parameters.
    pub async fn init_session(&self) -> Result<(), Error> {
        let open = OpenPacket::new(self.sid, self.transport_name(), &self.config);
        self.send(Packet::Open(open)).await
    }

    /// Write one packet to the client, retrying temporary transport
    /// failures. A fatal failure closes the session.
    pub async fn send(&self, packet: Packet) -> Result<(), Error> {
        loop {
            if self.is_closed() {
                return Err(Error::Closed);
            }
            let conn = self.transport();
            conn.set_write_deadline(Instant::now() + self.config.ping_timeout);
            match conn.write_packet(packet.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_temporary() => continue,
                Err(e) => {
                    debug!(sid = %self.sid, "write failed, closing session: {e}");
                    self.close();
                    return Err(e.into());
                }
            }
        }
    }

    /// Read the next application payload, transparently handling the
    /// liveness packets: a `PING` is answered with a `PONG` echoing the
    /// probe payload, a `PONG` releases the pong deadline, a `CLOSE`
    /// terminates the session.
    pub async fn next_message(&self) -> Result<Data, Error> {
        loop {
            if self.is_closed() {
                return Err(Error::Closed);
            }
            let conn = self.transport();
            conn.set_read_deadline(Instant::now() + self.config.ping_timeout);
            let packet = match conn.read_packet().await {
                Ok(packet) => packet,
                Err(e) if e.is_temporary() => continue,
                Err(e) => {
                    debug!(sid = %self.sid, "read failed, closing session: {e}");
                    self.close();
                    return Err(e.into());
                }
            };
            self.release_pong_deadline();
            match packet {
                Packet::Ping => self.send(Packet::Pong).await?,
                Packet::PingProbe => self.send(Packet::PongProbe).await?,
                Packet::Pong | Packet::PongProbe => {}
                Packet::Close => {
                    self.close();
                    return Err(Error::Closed);
                }
                Packet::Message(msg) => return Ok(Data::Text(msg)),
                Packet::Binary(data) => return Ok(Data::Binary(data)),
                Packet::Open(_) | Packet::Upgrade | Packet::Noop => {
                    debug!(sid = %self.sid, ?packet, "ignoring unexpected packet");
                }
            }
        }
    }

    /// Close the session. Idempotent; aborts the heartbeat and the pong
    /// deadline and closes the active transport.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(sid = %self.sid, "closing session");
        self.release_pong_deadline();
        if let Some(handle) = self.heartbeat.lock().unwrap().take() {
            handle.abort();
        }
        let conn = self.transport();
        tokio::spawn(async move { conn.close().await });
        self.closed_tx.send_replace(true);
    }

    /// Resolves once the session is closed.
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Start the upgrade handshake on a freshly attached transport.
    pub fn upgrade(self: Arc<Self>, transport: Arc<dyn Transport>) {
        tokio::spawn(async move { self.upgrading(transport).await });
    }

    /// The upgrade flow: probe ping/pong on the new transport, pause the
    /// old one, wait for `UPGRADE`, then swap atomically. Any failure
    /// resumes the old transport and drops the new one.
    async fn upgrading(&self, new: Arc<dyn Transport>) {
        let timeout = self.config.ping_timeout;

        new.set_read_deadline(Instant::now() + timeout);
        let pong = match new.read_packet().await {
            Ok(Packet::PingProbe) => Packet::PongProbe,
            Ok(Packet::Ping) => Packet::Pong,
            _ => {
                debug!(sid = %self.sid, "upgrade aborted: no probe ping");
                new.close().await;
                return;
            }
        };
        new.set_write_deadline(Instant::now() + timeout);
        if new.write_packet(pong).await.is_err() {
            new.close().await;
            return;
        }

        let old = self.transport();
        let Some(pauser) = old.pauser() else {
            debug!(sid = %self.sid, "upgrade aborted: old transport cannot pause");
            new.close().await;
            return;
        };
        pauser.pause();

        new.set_read_deadline(Instant::now() + timeout);
        if !matches!(new.read_packet().await, Ok(Packet::Upgrade)) {
            debug!(sid = %self.sid, "upgrade aborted: no upgrade packet, resuming old transport");
            new.close().await;
            pauser.resume();
            return;
        }

        debug!(sid = %self.sid, transport = new.name(), "transport upgraded");
        *self.active.write().unwrap() = new;
        old.close().await;
    }

    fn spawn_heartbeat(self: Arc<Self>) {
        let session = self.clone();
        let handle = tokio::spawn(async move {
            let mut tick = time::interval(session.config.ping_interval);
            tick.tick().await; // the first tick fires immediately
            loop {
                tick.tick().await;
                if session.is_closed() {
                    return;
                }
                session.clone().arm_pong_deadline();
                if let Err(e) = session.send(Packet::Ping).await {
                    debug!(sid = %session.sid, "heartbeat failed: {e}");
                    session.close();
                    return;
                }
            }
        });
        *self.heartbeat.lock().unwrap() = Some(handle);
    }

    fn arm_pong_deadline(self: Arc<Self>) {
        let mut deadline = self.pong_deadline.lock().unwrap();
        if deadline.is_some() {
            return;
        }
        let wait = self.config.ping_interval + self.config.ping_timeout;
        let session = self.clone();
        *deadline = Some(tokio::spawn(async move {
            time::sleep(wait).await;
            debug!(sid = %session.sid, "pong deadline elapsed, closing session");
            session.close();
        }));
    }

    fn release_pong_deadline(&self) {
        if let Some(handle) = self.pong_deadline.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("sid", &self.sid)
            .field("transport", &self.transport_name())
            .field("closed", &self.is_closed())
            .finish()
    }
}
