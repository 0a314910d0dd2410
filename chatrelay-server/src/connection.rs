//! Connection handles
//!
//! A [`Connection`] is one client's bidirectional byte stream as seen by the
//! registry, the broadcaster and the lifecycle. Both dispatch strategies
//! provide their own implementation.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use chatrelay_utils::Result;

/// Placeholder port shown once a connection's remote address is gone
pub const UNKNOWN_PORT: i32 = -1;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Unique connection identifier
///
/// Assigned once at accept and never reused for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next process-unique id
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Create a ConnectionId from a raw value (mainly for testing)
    #[cfg(test)]
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the raw value
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// An open client stream
///
/// Implementations must make [`Connection::close`] idempotent: concurrent or
/// repeated calls release the underlying handle exactly once.
pub trait Connection: Send + Sync {
    /// Identifier assigned at accept
    fn id(&self) -> ConnectionId;

    /// Remote endpoint, `None` once closed
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Whether the connection has not been closed yet
    fn is_open(&self) -> bool;

    /// Deliver one encoded payload to the client
    fn send(&self, payload: &Bytes) -> Result<()>;

    /// Release the underlying handle
    ///
    /// Returns `true` for the call that actually closed it, `false` when it
    /// was already closed.
    fn close(&self) -> Result<bool>;
}

/// Human-readable label for a connection, `Client[<remotePort>]`
///
/// Recomputed on every call from the live remote address; a closed
/// connection yields the `Client[-1]` placeholder.
pub fn display_name<C: Connection + ?Sized>(conn: &C) -> String {
    match conn.peer_addr() {
        Some(addr) if conn.is_open() => format!("Client[{}]", addr.port()),
        _ => format!("Client[{}]", UNKNOWN_PORT),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MockConnection;
    use super::*;

    #[test]
    fn test_connection_ids_are_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
        assert!(b.value() > a.value());
    }

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId::new(42).to_string(), "conn#42");
    }

    #[test]
    fn test_display_name_uses_remote_port() {
        let conn = MockConnection::new(51234);
        assert_eq!(display_name(&conn), "Client[51234]");
    }

    #[test]
    fn test_display_name_after_close_is_placeholder() {
        let conn = MockConnection::new(51234);
        conn.close().unwrap();
        assert_eq!(display_name(&conn), "Client[-1]");
    }

    #[test]
    fn test_display_name_through_trait_object() {
        let conn: Box<dyn Connection> = Box::new(MockConnection::new(9000));
        assert_eq!(display_name(conn.as_ref()), "Client[9000]");
    }
}
