//! Completion-driven dispatch
//!
//! Runs on a tokio runtime with a bounded worker pool. The accept loop keeps
//! accepting and spawns one task per connection; that task owns the read half
//! and is the only thing that ever drives the connection's [`Session`], so a
//! connection's read/dispatch/close steps never run concurrently with each
//! other. Writes go through a bounded per-connection queue drained by a writer
//! task; a broadcast only enqueues and never waits on a peer. A failed write
//! is reported back to the connection task, which closes the session.
//!
//! On shutdown the accept loop stops first, then [`CompletionServer::run`]
//! waits for every connection task to close its session before returning.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use chatrelay_utils::{RelayError, Result};

use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionId};
use crate::lifecycle::{CloseReason, ReadOutcome, Session, Transition};
use crate::registry::ConnectionRegistry;

/// Connection handle whose sends enqueue onto a writer task
pub struct ClientHandle {
    id: ConnectionId,
    peer: SocketAddr,
    /// `None` once closed; dropping the sender lets the writer drain and finish
    outbound: Mutex<Option<mpsc::Sender<Bytes>>>,
}

impl ClientHandle {
    fn new(peer: SocketAddr, outbound: mpsc::Sender<Bytes>) -> Self {
        Self {
            id: ConnectionId::next(),
            peer,
            outbound: Mutex::new(Some(outbound)),
        }
    }
}

impl Connection for ClientHandle {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.is_open().then_some(self.peer)
    }

    fn is_open(&self) -> bool {
        self.outbound.lock().is_some()
    }

    fn send(&self, payload: &Bytes) -> Result<()> {
        let outbound = self.outbound.lock();
        let Some(sender) = outbound.as_ref() else {
            return Err(RelayError::ConnectionClosed);
        };

        match sender.try_send(payload.clone()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(RelayError::QueueFull { peer: self.peer })
            }
            // Writer task already gave up on this peer
            Err(mpsc::error::TrySendError::Closed(_)) => Err(RelayError::ConnectionClosed),
        }
    }

    fn close(&self) -> Result<bool> {
        Ok(self.outbound.lock().take().is_some())
    }
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Stops a running [`CompletionServer`]
#[derive(Clone)]
pub struct CompletionShutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl CompletionShutdown {
    /// Stop accepting and close every live connection
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

/// Per-connection sizes copied out of [`ServerConfig`]
#[derive(Debug, Clone, Copy)]
struct ConnectionSettings {
    read_buffer_size: usize,
    outbound_queue: usize,
}

/// Worker-pool completion dispatch loop
pub struct CompletionServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    registry: Arc<ConnectionRegistry<ClientHandle>>,
    settings: ConnectionSettings,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl CompletionServer {
    /// Bind the listener
    pub async fn bind(addr: SocketAddr, config: &ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| RelayError::Bind {
            addr: addr.to_string(),
            source: e,
        })?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, _) = watch::channel(false);

        info!("TCP listener bound to {}", local_addr);

        Ok(Self {
            listener,
            local_addr,
            registry: Arc::new(ConnectionRegistry::new()),
            settings: ConnectionSettings {
                read_buffer_size: config.read_buffer_size.max(1),
                outbound_queue: config.outbound_queue.max(1),
            },
            shutdown_tx: Arc::new(shutdown_tx),
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared view of the live connections
    pub fn registry(&self) -> Arc<ConnectionRegistry<ClientHandle>> {
        Arc::clone(&self.registry)
    }

    /// Handle that stops [`CompletionServer::run`]
    pub fn shutdown_handle(&self) -> CompletionShutdown {
        CompletionShutdown {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Run the accept loop until shut down
    ///
    /// Returns once every connection task has closed its session.
    pub async fn run(self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!("New TCP connection from {}", peer_addr);
                            let (reader, writer) = stream.into_split();
                            connections.spawn(drive_connection(
                                reader,
                                writer,
                                peer_addr,
                                Arc::clone(&self.registry),
                                self.settings,
                                self.shutdown_tx.subscribe(),
                            ));
                        }
                        Err(e) => {
                            error!("{}", RelayError::Accept(e));
                        }
                    }
                }
                // Reap finished connections so the set does not grow unbounded
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    log_join(joined);
                }
                _ = stopped(&mut shutdown_rx) => {
                    info!("Shutdown signal received, stopping TCP accept loop");
                    break;
                }
            }
        }

        debug!("Waiting for {} connection tasks", connections.len());
        while let Some(joined) = connections.join_next().await {
            log_join(joined);
        }

        Ok(())
    }
}

fn log_join(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!("Connection task panicked: {}", e);
        }
    }
}

/// Resolve once shutdown has been requested (or every sender is gone)
async fn stopped(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// One connection's read -> dispatch -> read chain
async fn drive_connection<R, W>(
    mut reader: R,
    writer: W,
    peer: SocketAddr,
    registry: Arc<ConnectionRegistry<ClientHandle>>,
    settings: ConnectionSettings,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(settings.outbound_queue);
    let (failed_tx, mut write_failed) = oneshot::channel();

    let handle = Arc::new(ClientHandle::new(peer, tx));
    tokio::spawn(write_loop(writer, rx, failed_tx, handle.id(), peer));

    let mut session = Session::accept(&registry, handle);
    let mut buf = vec![0u8; settings.read_buffer_size];
    let mut writer_done = false;

    loop {
        tokio::select! {
            result = reader.read(&mut buf) => {
                let outcome = match result {
                    Ok(0) => ReadOutcome::Eof,
                    Ok(n) => ReadOutcome::Data(&buf[..n]),
                    Err(e) => ReadOutcome::Failed(e),
                };
                if session.on_read(&registry, outcome) == Transition::Closed {
                    break;
                }
            }
            // A writer that finishes cleanly drops the sender; only a failure sends
            result = &mut write_failed, if !writer_done => {
                writer_done = true;
                if result.is_ok() {
                    session.close(&registry, CloseReason::WriteFailed);
                    break;
                }
            }
            _ = stopped(&mut shutdown_rx) => {
                session.close(&registry, CloseReason::Shutdown);
                break;
            }
        }
    }
}

/// Drain queued payloads onto the socket
///
/// Ends when the handle is closed (queue sender dropped) or a write fails. A
/// failure is logged and signalled on `failed`.
async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<Bytes>,
    failed: oneshot::Sender<()>,
    id: ConnectionId,
    peer: SocketAddr,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(payload) = rx.recv().await {
        if let Err(e) = writer.write_all(&payload).await {
            let err = RelayError::Write { peer, source: e };
            warn!(conn = %id, disconnect = err.is_disconnect(), "{}", err);
            // The connection task may already be gone
            let _ = failed.send(());
            return;
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!(conn = %id, "Write half shutdown failed: {}", e);
    }
}
