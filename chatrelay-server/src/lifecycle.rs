//! Connection lifecycle
//!
//! Per-connection state machine shared by both dispatch strategies:
//!
//! ```text
//! Accepted -> Reading -> Dispatching -> Reading ... -> Closed
//!                    \-> Closed (EOF / read error)
//!                                  \-> Closed (quit token, after broadcast)
//! ```
//!
//! The dispatch loops only perform I/O and feed the results in here; every
//! registry update and broadcast happens inside [`Session`].

use std::fmt;
use std::io;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::broadcast::broadcast;
use crate::codec;
use crate::connection::{display_name, Connection, ConnectionId};
use crate::registry::ConnectionRegistry;

/// Lifecycle state of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Registered, first read not yet armed
    Accepted,
    /// Waiting for bytes
    Reading,
    /// Broadcasting a received message
    Dispatching,
    /// Terminal
    Closed,
}

/// Result of one transport read
#[derive(Debug)]
pub enum ReadOutcome<'a> {
    /// One message worth of bytes
    Data(&'a [u8]),
    /// The peer closed its end
    Eof,
    /// The read failed
    Failed(io::Error),
}

/// What the dispatch loop must do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Issue another read
    Rearm,
    /// The connection is closed; stop driving it
    Closed,
}

/// Why a connection was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client sent the quit token
    Quit,
    /// Zero-length read
    PeerClosed,
    /// The read returned an error
    ReadFailed,
    /// Writing to the peer failed
    WriteFailed,
    /// The server is stopping
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::Quit => "quit",
            Self::PeerClosed => "peer closed",
            Self::ReadFailed => "read failed",
            Self::WriteFailed => "write failed",
            Self::Shutdown => "server shutdown",
        };
        f.write_str(reason)
    }
}

/// One connection driven through its lifecycle
pub struct Session<C: Connection + ?Sized> {
    conn: Arc<C>,
    state: ConnectionState,
}

impl<C: Connection + ?Sized> Session<C> {
    /// Register a freshly accepted connection and arm its first read
    pub fn accept(registry: &ConnectionRegistry<C>, conn: Arc<C>) -> Self {
        registry.add(Arc::clone(&conn));
        info!("{} connected", display_name(conn.as_ref()));

        let mut session = Self {
            conn,
            state: ConnectionState::Accepted,
        };
        session.enter(ConnectionState::Reading);
        session
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The connection this session drives
    pub fn connection(&self) -> &Arc<C> {
        &self.conn
    }

    /// Give up the session, returning its connection handle
    pub fn into_connection(self) -> Arc<C> {
        self.conn
    }

    /// Id of the connection
    pub fn id(&self) -> ConnectionId {
        self.conn.id()
    }

    /// Whether the session reached its terminal state
    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// Feed the result of one read into the state machine
    pub fn on_read(&mut self, registry: &ConnectionRegistry<C>, outcome: ReadOutcome<'_>) -> Transition {
        if self.state != ConnectionState::Reading {
            debug!(conn = %self.id(), state = ?self.state, "Ignoring read outside Reading state");
            return self.transition();
        }

        let bytes = match outcome {
            ReadOutcome::Data(bytes) if !bytes.is_empty() => bytes,
            ReadOutcome::Data(_) | ReadOutcome::Eof => {
                self.close(registry, CloseReason::PeerClosed);
                return Transition::Closed;
            }
            ReadOutcome::Failed(e) => {
                debug!(conn = %self.id(), "Read failed: {}", e);
                self.close(registry, CloseReason::ReadFailed);
                return Transition::Closed;
            }
        };

        self.enter(ConnectionState::Dispatching);
        let text = codec::decode(bytes);
        let name = display_name(self.conn.as_ref());
        info!("{}", codec::format_broadcast(&name, &text));

        broadcast(registry, self.conn.as_ref(), &text);

        if codec::is_quit(&text) {
            self.close(registry, CloseReason::Quit);
            return Transition::Closed;
        }

        self.enter(ConnectionState::Reading);
        Transition::Rearm
    }

    /// Deregister and release the connection
    ///
    /// Idempotent: closing a closed session does nothing.
    pub fn close(&mut self, registry: &ConnectionRegistry<C>, reason: CloseReason) {
        if self.state == ConnectionState::Closed {
            return;
        }
        // Name must be taken while the remote address is still readable
        let name = display_name(self.conn.as_ref());

        registry.remove(self.conn.id());
        self.enter(ConnectionState::Closed);

        match self.conn.close() {
            Ok(true) => info!("{} disconnected ({})", name, reason),
            Ok(false) => debug!(conn = %self.id(), "Connection already closed"),
            Err(e) => warn!("Failed to close {}: {}", name, e),
        }
    }

    fn transition(&self) -> Transition {
        if self.is_closed() {
            Transition::Closed
        } else {
            Transition::Rearm
        }
    }

    fn enter(&mut self, next: ConnectionState) {
        debug!(conn = %self.conn.id(), from = ?self.state, to = ?next, "State transition");
        self.state = next;
    }
}

impl<C: Connection + ?Sized> fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.conn.id())
            .field("state", &self.state)
            .finish()
    }
}
