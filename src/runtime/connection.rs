//! Per-connection state and the connection table.
//!
//! Connections are handed around as `Arc<Connection>`: a handle stays
//! usable by a worker or the heartbeat thread even while the event loop is
//! tearing the connection down, and the socket closes when the last
//! reference drops. The table lock is the membership authority; poller
//! registration changes happen inside the same critical section as table
//! mutation so the two can never disagree.

use std::collections::{HashMap, VecDeque};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::protocols::Decoder;

/// Opaque per-connection identifier: the socket descriptor.
pub type Handle = RawFd;

/// A single client connection.
pub struct Connection {
    pub(crate) stream: TcpStream,
    fd: RawFd,
    peer: SocketAddr,
    /// FIFO of unsent byte chunks; the mutex is the send lock that keeps
    /// concurrent senders (broadcast, heartbeat, replies) frame-ordered.
    pub(crate) send_queue: Mutex<VecDeque<Vec<u8>>>,
    last_active: Mutex<Instant>,
    heartbeat_enabled: AtomicBool,
    pub(crate) decoder: Mutex<Decoder>,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr, heartbeat_enabled: bool) -> Connection {
        let fd = stream.as_raw_fd();
        Connection {
            stream,
            fd,
            peer,
            send_queue: Mutex::new(VecDeque::new()),
            last_active: Mutex::new(Instant::now()),
            heartbeat_enabled: AtomicBool::new(heartbeat_enabled),
            decoder: Mutex::new(Decoder::Unbound),
        }
    }

    pub fn handle(&self) -> Handle {
        self.fd
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Record activity; called on every successful non-zero read.
    pub fn touch(&self) {
        *self.last_active.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active.lock().unwrap().elapsed()
    }

    pub fn heartbeat_enabled(&self) -> bool {
        self.heartbeat_enabled.load(Ordering::Relaxed)
    }

    /// Protocol override: WebSocket disables the raw-byte heartbeat since
    /// the peer would parse the magic as a frame.
    pub fn set_heartbeat_enabled(&self, enabled: bool) {
        self.heartbeat_enabled.store(enabled, Ordering::Relaxed);
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Registry of active connections keyed by handle.
pub struct ConnectionTable {
    inner: Mutex<HashMap<Handle, Arc<Connection>>>,
}

impl ConnectionTable {
    pub fn new() -> ConnectionTable {
        ConnectionTable {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Insert a connection, running `register` under the table lock.
    ///
    /// The closure performs the poller registration so a handle is in the
    /// table iff its socket is registered with the multiplexer.
    pub fn insert_and<F>(&self, conn: Arc<Connection>, register: F) -> std::io::Result<()>
    where
        F: FnOnce(&Connection) -> std::io::Result<()>,
    {
        let mut map = self.inner.lock().unwrap();
        register(&conn)?;
        map.insert(conn.handle(), conn);
        Ok(())
    }

    /// Remove a connection, running `deregister` under the table lock.
    ///
    /// Returns `None` if the handle was already gone, which makes
    /// concurrent closes idempotent.
    pub fn remove_and<F>(&self, handle: Handle, deregister: F) -> Option<Arc<Connection>>
    where
        F: FnOnce(&Connection),
    {
        let mut map = self.inner.lock().unwrap();
        let conn = map.remove(&handle)?;
        deregister(&conn);
        Some(conn)
    }

    pub fn lookup(&self, handle: Handle) -> Option<Arc<Connection>> {
        self.inner.lock().unwrap().get(&handle).cloned()
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.inner.lock().unwrap().contains_key(&handle)
    }

    /// Copy of the current connection set, taken under the lock and
    /// released before iteration so broadcast never holds the table lock
    /// across I/O.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.inner.lock().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}
