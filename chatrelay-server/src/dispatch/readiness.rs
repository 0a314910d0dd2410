//! Readiness-multiplexed dispatch
//!
//! One control thread waits on a mio [`Poll`] and handles every ready event to
//! completion before waiting again. The poll wait is the only suspension point.
//!
//! The read scratch buffer is shared by all connections and reused on every
//! iteration; that is sound only because the loop is strictly sequential.
//! One drain of a socket stops after [`MAX_READS_PER_DRAIN`] reads. A socket
//! with bytes left over goes on a backlog that is serviced on the next loop
//! iteration, so the buffer stays bounded and a flooding client cannot hold
//! the thread.
//!
//! Broadcast writes are blocking: [`PolledConnection::send`] spins until the
//! whole payload is in the peer's socket buffer. A peer that stops reading
//! therefore stalls delivery to everyone else and the acceptance of new
//! connections until its buffer drains. There is no timeout.

use std::collections::{HashMap, HashSet};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, error, info, warn};

use chatrelay_utils::{RelayError, Result};

use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionId};
use crate::lifecycle::{CloseReason, ReadOutcome, Session, Transition};
use crate::registry::ConnectionRegistry;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CONNECTION_TOKEN: usize = 2;
const EVENTS_CAPACITY: usize = 256;

/// Reads of `read_buffer_size` bytes taken from one socket per drain
pub const MAX_READS_PER_DRAIN: usize = 16;

/// A client socket registered with the poll
pub struct PolledConnection {
    id: ConnectionId,
    stream: TcpStream,
    peer: SocketAddr,
    open: AtomicBool,
}

impl PolledConnection {
    fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            id: ConnectionId::next(),
            stream,
            peer,
            open: AtomicBool::new(true),
        }
    }
}

impl Connection for PolledConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.is_open().then_some(self.peer)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn send(&self, payload: &Bytes) -> Result<()> {
        if !self.is_open() {
            return Err(RelayError::ConnectionClosed);
        }

        let mut written = 0;
        while written < payload.len() {
            match (&self.stream).write(&payload[written..]) {
                Ok(0) => {
                    return Err(RelayError::Write {
                        peer: self.peer,
                        source: io::ErrorKind::WriteZero.into(),
                    })
                }
                Ok(n) => written += n,
                // Keep the write blocking on a non-blocking socket
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::yield_now(),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    return Err(RelayError::Write {
                        peer: self.peer,
                        source: e,
                    })
                }
            }
        }
        Ok(())
    }

    fn close(&self) -> Result<bool> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(true),
            Err(e) => Err(e.into()),
        }
    }
}

/// Stops a running [`ReadinessServer`] from another thread
#[derive(Clone)]
pub struct ReadinessShutdown {
    stopped: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ReadinessShutdown {
    /// Ask the loop to stop and wake it from its poll wait
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            warn!("Failed to wake readiness loop: {}", e);
        }
    }
}

/// How one drain pass ended
struct Drained {
    eof: bool,
    error: Option<io::Error>,
    /// Stopped at the read cap with the socket possibly still readable
    more: bool,
}

/// Single-threaded readiness dispatch loop
pub struct ReadinessServer {
    poll: Poll,
    listener: TcpListener,
    local_addr: SocketAddr,
    registry: Arc<ConnectionRegistry<PolledConnection>>,
    sessions: HashMap<Token, Session<PolledConnection>>,
    /// Sockets whose last drain hit the read cap
    backlog: HashSet<Token>,
    scratch: Vec<u8>,
    read_chunk: usize,
    next_token: usize,
    stopped: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ReadinessServer {
    /// Bind the listener and register it with a new poll
    pub fn bind(addr: SocketAddr, config: &ServerConfig) -> Result<Self> {
        let mut listener = TcpListener::bind(addr).map_err(|e| RelayError::Bind {
            addr: addr.to_string(),
            source: e,
        })?;
        let local_addr = listener.local_addr()?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        info!("Readiness listener bound to {}", local_addr);

        Ok(Self {
            poll,
            listener,
            local_addr,
            registry: Arc::new(ConnectionRegistry::new()),
            sessions: HashMap::new(),
            backlog: HashSet::new(),
            scratch: Vec::with_capacity(config.read_buffer_size),
            read_chunk: config.read_buffer_size.max(1),
            next_token: FIRST_CONNECTION_TOKEN,
            stopped: Arc::new(AtomicBool::new(false)),
            waker,
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared view of the live connections
    pub fn registry(&self) -> Arc<ConnectionRegistry<PolledConnection>> {
        Arc::clone(&self.registry)
    }

    /// Handle that stops [`ReadinessServer::run`]
    pub fn shutdown_handle(&self) -> ReadinessShutdown {
        ReadinessShutdown {
            stopped: Arc::clone(&self.stopped),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Run the loop on the calling thread until shut down
    pub fn run(mut self) -> Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        info!("Readiness dispatcher running on {}", self.local_addr);

        while !self.stopped.load(Ordering::Acquire) {
            // Backlogged sockets get no new edge; don't sleep while they wait
            let timeout = (!self.backlog.is_empty()).then_some(Duration::ZERO);
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("Poll failed: {}", e);
                self.close_all();
                return Err(e.into());
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_ready(),
                    WAKER => debug!("Readiness loop woken"),
                    token => self.read_ready(token),
                }
            }

            let backlog: Vec<Token> = self.backlog.drain().collect();
            for token in backlog {
                self.read_ready(token);
            }
        }

        info!("Shutdown signal received, stopping readiness dispatcher");
        self.close_all();
        Ok(())
    }

    /// Accept every pending connection
    fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;

                    if let Err(e) = self
                        .poll
                        .registry()
                        .register(&mut stream, token, Interest::READABLE)
                    {
                        warn!("Failed to register connection from {}: {}", peer, e);
                        continue;
                    }

                    let conn = Arc::new(PolledConnection::new(stream, peer));
                    let session = Session::accept(&self.registry, conn);
                    self.sessions.insert(token, session);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("{}", RelayError::Accept(e));
                    break;
                }
            }
        }
    }

    /// Read a ready connection to exhaustion and drive its session once
    fn read_ready(&mut self, token: Token) {
        let Some(session) = self.sessions.get_mut(&token) else {
            debug!(?token, "Event for unknown token");
            return;
        };

        let drained = read_to_exhaustion(
            &session.connection().stream,
            &mut self.scratch,
            self.read_chunk,
        );
        if drained.more {
            self.backlog.insert(token);
        }

        let mut transition = Transition::Rearm;
        if !self.scratch.is_empty() {
            transition = session.on_read(&self.registry, ReadOutcome::Data(&self.scratch));
        }
        if transition == Transition::Rearm {
            if let Some(e) = drained.error {
                transition = session.on_read(&self.registry, ReadOutcome::Failed(e));
            } else if drained.eof {
                transition = session.on_read(&self.registry, ReadOutcome::Eof);
            }
        }

        if transition == Transition::Closed {
            self.release(token);
        }
    }

    /// Drop a closed session and deregister its socket
    fn release(&mut self, token: Token) {
        self.backlog.remove(&token);
        let Some(session) = self.sessions.remove(&token) else {
            return;
        };
        let id = session.id();
        // Registry and session were the only owners; the registry let go on close
        match Arc::into_inner(session.into_connection()) {
            Some(mut conn) => {
                if let Err(e) = self.poll.registry().deregister(&mut conn.stream) {
                    debug!(conn = %id, "Deregister failed: {}", e);
                }
            }
            None => warn!(conn = %id, "Closed connection still shared, skipping deregister"),
        }
    }

    fn close_all(&mut self) {
        let tokens: Vec<Token> = self.sessions.keys().copied().collect();
        for token in tokens {
            if let Some(session) = self.sessions.get_mut(&token) {
                session.close(&self.registry, CloseReason::Shutdown);
            }
            self.release(token);
        }
    }
}

/// Read until the socket has no more bytes immediately available
///
/// Appends everything read into `scratch` (cleared first), at most
/// [`MAX_READS_PER_DRAIN`] chunks. mio is edge-triggered, so a drain cut short
/// by the cap reports `more` and the caller must come back to it.
fn read_to_exhaustion(stream: &TcpStream, scratch: &mut Vec<u8>, chunk: usize) -> Drained {
    scratch.clear();
    let mut reader = stream;
    let mut reads = 0;

    loop {
        if reads == MAX_READS_PER_DRAIN {
            return Drained {
                eof: false,
                error: None,
                more: true,
            };
        }
        let start = scratch.len();
        scratch.resize(start + chunk, 0);

        match reader.read(&mut scratch[start..]) {
            Ok(0) => {
                scratch.truncate(start);
                return Drained {
                    eof: true,
                    error: None,
                    more: false,
                };
            }
            Ok(n) => {
                scratch.truncate(start + n);
                reads += 1;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                scratch.truncate(start);
                return Drained {
                    eof: false,
                    error: None,
                    more: false,
                };
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => scratch.truncate(start),
            Err(e) => {
                scratch.truncate(start);
                return Drained {
                    eof: false,
                    error: Some(e),
                    more: false,
                };
            }
        }
    }
}
