#![warn(clippy::all, rust_2018_idioms, future_incompatible, nonstandard_style)]

//! Socket.IO v4 server core.
//!
//! A [`Server`] accepts sessions from an [`Engine`](engineio_server::Engine)
//! and multiplexes each of them across user-defined namespaces. Event
//! handlers are registered per namespace and event name; rooms provide
//! targeted fan-out inside a namespace; an optional cluster adapter
//! synchronizes room membership queries and broadcast fan-out across
//! nodes through a redis-class pub/sub bus.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use socketio_server::{Conn, Server, ArcConn};
//! # async fn doc_main(engine: Arc<dyn engineio_server::Engine>) {
//! let server = Arc::new(Server::new(engine));
//! server
//!     .on_connect("/chat", |conn: ArcConn, _auth| {
//!         tracing::info!("connected: {}", conn.id());
//!         Ok(())
//!     })
//!     .await
//!     .unwrap();
//! server
//!     .on_event("/chat", "msg", |_conn: ArcConn, text: String| {
//!         (format!("echo: {text}"),)
//!     })
//!     .await
//!     .unwrap();
//! server.serve().await.ok();
//! # }
//! ```

pub mod broadcast;
pub mod config;
pub mod errors;
pub mod event;
pub mod parser;

mod conn;
mod handler;
mod ns_conn;
mod server;

pub use broadcast::{ArcConn, Broadcaster, Conn, EachFunc, LocalBroadcaster, RemoteBroadcaster};
pub use config::RedisAdapterConfig;
pub use errors::Error;
pub use event::{AckFunc, EventError, EventFunc};
pub use handler::{ConnectError, Handler};
pub use server::{BroadcasterFactory, Server};

pub use engineio_server::{self as engineio, Sid};
