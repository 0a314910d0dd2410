//! chatrelay server library
//!
//! A line-oriented TCP relay: every message a client sends is forwarded to all
//! other connected clients as `Client[<port>]:<text>`, and sending `quit`
//! ends the sender's session.
//!
//! The moving parts, leaf to root:
//! - [`registry`]: the locked set of live connections
//! - [`codec`]: bytes <-> text and the wire format
//! - [`broadcast`]: fan-out to every peer but the sender
//! - [`lifecycle`]: the per-connection state machine
//! - [`dispatch`]: the readiness (mio) and completion (tokio) loops driving it

pub mod broadcast;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod lifecycle;
pub mod registry;

pub use broadcast::{broadcast, BroadcastReport};
pub use config::{ConfigLoader, ServerConfig, DEFAULT_PORT};
pub use connection::{display_name, Connection, ConnectionId};
pub use dispatch::{
    serve, ClientHandle, CompletionServer, CompletionShutdown, DispatchStrategy, PolledConnection,
    ReadinessServer, ReadinessShutdown,
};
pub use lifecycle::{CloseReason, ConnectionState, ReadOutcome, Session, Transition};
pub use registry::{ConnectionRegistry, Snapshot};
