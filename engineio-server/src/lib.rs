#![warn(clippy::all, rust_2018_idioms, future_incompatible, nonstandard_style)]

//! Engine.IO v4 session layer.
//!
//! This crate owns everything between an established byte transport and
//! the application protocol carried on top of it:
//! * the [`Packet`](packet::Packet) grammar (`OPEN`/`CLOSE`/`PING`/`PONG`/
//!   `MESSAGE`/`UPGRADE`/`NOOP`),
//! * the per-connection [`Session`](session::Session) state machine with
//!   its ping/pong liveness loop and the polling → websocket upgrade
//!   handshake,
//! * the [`Transport`](transport::Transport) and [`Engine`](engine::Engine)
//!   contracts implemented by the HTTP layer.
//!
//! The HTTP transports themselves live outside of this crate; anything
//! that can frame packets can drive a session.

pub mod config;
pub mod engine;
pub mod errors;
pub mod packet;
pub mod session;
pub mod sid;
pub mod transport;

pub use config::EngineIoConfig;
pub use engine::Engine;
pub use errors::Error;
pub use packet::{OpenPacket, Packet};
pub use session::{Data, Session};
pub use sid::Sid;
pub use transport::{Pauser, Transport, TransportError};
