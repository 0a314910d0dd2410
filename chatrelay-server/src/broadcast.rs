//! Broadcast dispatch
//!
//! Fans one sender's message out to every other registered connection.
//!
//! Delivery cost depends on the connection type. Readiness connections write
//! synchronously, so a broadcast takes as long as the slowest receiving socket
//! buffer and stalls the dispatch thread meanwhile. Completion connections only
//! enqueue, and their writer tasks report failures on their own.

use tracing::{debug, warn};

use crate::codec;
use crate::connection::{display_name, Connection};
use crate::registry::ConnectionRegistry;

/// Outcome counts of one broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Recipients the payload was handed to
    pub delivered: usize,
    /// Recipients whose send failed
    pub failed: usize,
    /// Registered connections that were not sent to (the sender, closed ones)
    pub skipped: usize,
}

/// Send `<displayName(sender)>:<text>` to every registered connection but `sender`
///
/// A failing recipient is logged and skipped; it never aborts delivery to the
/// others and never affects the sender.
pub fn broadcast<C, S>(registry: &ConnectionRegistry<C>, sender: &S, text: &str) -> BroadcastReport
where
    C: Connection + ?Sized,
    S: Connection + ?Sized,
{
    let payload = codec::encode(&codec::format_broadcast(&display_name(sender), text));
    let sender_id = sender.id();
    let mut report = BroadcastReport::default();

    let snapshot = registry.snapshot();
    for conn in snapshot.iter() {
        if conn.id() == sender_id || !conn.is_open() {
            report.skipped += 1;
            continue;
        }

        match conn.send(&payload) {
            Ok(()) => report.delivered += 1,
            Err(e) => {
                report.failed += 1;
                warn!(
                    recipient = %conn.id(),
                    disconnect = e.is_disconnect(),
                    "Broadcast to {} failed: {}",
                    display_name(conn.as_ref()),
                    e
                );
            }
        }
    }
    drop(snapshot);

    debug!(
        sender = %sender_id,
        delivered = report.delivered,
        failed = report.failed,
        skipped = report.skipped,
        "Broadcast complete"
    );
    report
}
