//! Accept and event loop.
//!
//! One dedicated thread owns the multiplexer wait loop and all decoder
//! state; a second drives the heartbeat scan. Everything else (application
//! callbacks) runs on the worker pool. No failure of a single connection
//! escapes its handler: errors close that connection and the loop moves
//! on.

use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::app::{AppContext, Application};
use crate::config::Config;
use crate::protocols::{self, Action, Decoder, ProtocolKind};
use crate::runtime::{heartbeat, Connection, ConnectionTable, Handle, Interest, Poller};
use crate::storage::Store;
use crate::workers::WorkerPool;

/// Wait timeout for one event-loop iteration; also bounds how quickly a
/// stop request and cross-thread interest updates are observed.
const WAIT_TIMEOUT: Duration = Duration::from_millis(100);

/// Read buffer size per recv call.
const READ_BUF_SIZE: usize = 16 * 1024;

/// Most connections a single listener READ event may accept, so one burst
/// of connects cannot starve other fds.
const ACCEPT_BATCH: usize = 32;

/// Socket send/recv buffer size for the listener and accepted sockets.
const SOCKET_BUF_SIZE: usize = 512 * 1024;

/// State shared between the event loop, the heartbeat thread, worker
/// callbacks and the public server handle.
pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) poller: Poller,
    pub(crate) table: ConnectionTable,
    pub(crate) store: Arc<Store>,
    pub(crate) workers: WorkerPool,
    pub(crate) app: Arc<dyn Application>,
    pub(crate) running: AtomicBool,
}

pub struct Server {
    shared: Arc<Shared>,
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    loop_handle: Option<JoinHandle<()>>,
    heartbeat_handle: Option<JoinHandle<()>>,
}

impl Server {
    /// Create the listening socket and runtime state without starting any
    /// threads.
    pub fn bind(config: Config, app: Arc<dyn Application>) -> io::Result<Server> {
        let listener = create_listener(&config)?;
        let local_addr = listener.local_addr()?;
        let poller = Poller::new(config.io_type)?;
        let workers = WorkerPool::new(config.worker_threads)?;

        let shared = Arc::new(Shared {
            config,
            poller,
            table: ConnectionTable::new(),
            store: Store::new(),
            workers,
            app,
            running: AtomicBool::new(false),
        });

        Ok(Server {
            shared,
            listener: Some(listener),
            local_addr,
            loop_handle: None,
            heartbeat_handle: None,
        })
    }

    /// The bound address; useful when the configured port is 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawn the event-loop and heartbeat threads.
    pub fn start(&mut self) -> io::Result<()> {
        let listener = self.listener.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::AlreadyExists, "server already started")
        })?;

        self.shared.running.store(true, Ordering::SeqCst);
        self.shared
            .poller
            .add(listener.as_raw_fd(), Interest::READ | Interest::ERROR)?;

        let shared = Arc::clone(&self.shared);
        self.loop_handle = Some(
            thread::Builder::new()
                .name("event-loop".into())
                .spawn(move || event_loop(shared, listener))?,
        );

        let shared = Arc::clone(&self.shared);
        self.heartbeat_handle = Some(
            thread::Builder::new()
                .name("heartbeat".into())
                .spawn(move || heartbeat_loop(shared))?,
        );

        info!(
            addr = %self.local_addr,
            io_type = ?self.shared.config.io_type,
            workers = self.shared.config.worker_threads,
            "server started"
        );
        Ok(())
    }

    /// Stop the loops and join their threads. Idempotent; observed within
    /// one wait timeout.
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.loop_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.heartbeat_handle.take() {
            let _ = handle.join();
        }
    }

    /// Start (if not already started) and block until the event loop
    /// exits.
    pub fn run(mut self) -> io::Result<()> {
        if self.listener.is_some() {
            self.start()?;
        }
        if let Some(handle) = self.loop_handle.take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Build the listener per the external-interface contract: IPv4 TCP,
/// `SO_REUSEADDR`, large buffers, `SOMAXCONN` backlog, non-blocking.
fn create_listener(config: &Config) -> io::Result<TcpListener> {
    let addr: SocketAddr = format!("{}:{}", config.ip, config.port)
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let domain = match addr {
        SocketAddr::V4(_) => socket2::Domain::IPV4,
        SocketAddr::V6(_) => socket2::Domain::IPV6,
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if let Err(e) = socket.set_send_buffer_size(SOCKET_BUF_SIZE) {
        warn!(error = %e, "could not size listener send buffer, using default");
    }
    if let Err(e) = socket.set_recv_buffer_size(SOCKET_BUF_SIZE) {
        warn!(error = %e, "could not size listener recv buffer, using default");
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(libc::SOMAXCONN)?;
    Ok(socket.into())
}

fn event_loop(shared: Arc<Shared>, listener: TcpListener) {
    let listener_fd = listener.as_raw_fd();
    let mut events = Vec::with_capacity(1024);

    while shared.running.load(Ordering::SeqCst) {
        if let Err(e) = shared.poller.wait(&mut events, WAIT_TIMEOUT) {
            error!(error = %e, "poller wait failed");
            continue;
        }

        for i in 0..events.len() {
            let event = events[i];
            if event.fd == listener_fd {
                accept_batch(&shared, &listener);
                continue;
            }
            if event.readiness.is_readable() {
                handle_read(&shared, event.fd);
            }
            if event.readiness.is_writable() {
                handle_writable(&shared, event.fd);
            }
            if event.readiness.is_error() && shared.table.contains(event.fd) {
                debug!(fd = event.fd, "error readiness, closing");
                close_connection(&shared, event.fd);
            }
        }
    }

    // Teardown: deregister the listener, then close every connection.
    let _ = shared.poller.remove(listener_fd);
    for conn in shared.table.snapshot() {
        close_connection(&shared, conn.handle());
    }
    info!("event loop stopped");
}

fn accept_batch(shared: &Arc<Shared>, listener: &TcpListener) {
    for _ in 0..ACCEPT_BATCH {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nonblocking(true) {
                    error!(peer = %peer, error = %e, "failed to set non-blocking, dropping");
                    continue;
                }
                size_client_buffers(&stream);

                let conn = Arc::new(Connection::new(
                    stream,
                    peer,
                    shared.config.heartbeat_enabled,
                ));
                let fd = conn.handle();

                let registered = shared.table.insert_and(Arc::clone(&conn), |c| {
                    shared
                        .poller
                        .add(c.handle(), Interest::READ | Interest::ERROR)
                });
                match registered {
                    Ok(()) => {
                        info!(fd, peer = %peer, "accepted connection");
                        let ctx = AppContext {
                            shared: Arc::clone(shared),
                        };
                        let app = Arc::clone(&shared.app);
                        shared.workers.submit(move || {
                            if catch_unwind(AssertUnwindSafe(|| app.on_connect(&ctx, fd))).is_err()
                            {
                                error!(fd, "on_connect panicked, closing connection");
                                ctx.close(fd);
                            }
                        });
                    }
                    Err(e) => {
                        error!(fd, error = %e, "failed to register connection");
                        conn.shutdown();
                    }
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                // Resource exhaustion or transient failure: keep serving.
                error!(error = %e, "accept failed");
                break;
            }
        }
    }
}

fn size_client_buffers(stream: &TcpStream) {
    let sock = socket2::SockRef::from(stream);
    if let Err(e) = sock.set_send_buffer_size(SOCKET_BUF_SIZE) {
        warn!(error = %e, "could not size client send buffer");
    }
    if let Err(e) = sock.set_recv_buffer_size(SOCKET_BUF_SIZE) {
        warn!(error = %e, "could not size client recv buffer");
    }
}

fn handle_read(shared: &Arc<Shared>, fd: Handle) {
    let Some(conn) = shared.table.lookup(fd) else {
        return;
    };

    let mut buf = [0u8; READ_BUF_SIZE];
    match (&conn.stream).read(&mut buf) {
        Ok(0) => {
            debug!(fd, "peer closed");
            close_connection(shared, fd);
        }
        Ok(n) => {
            conn.touch();
            dispatch(shared, &conn, &buf[..n]);
        }
        Err(ref e)
            if e.kind() == io::ErrorKind::WouldBlock
                || e.kind() == io::ErrorKind::Interrupted => {}
        Err(e) => {
            error!(fd, error = %e, "read failed");
            close_connection(shared, fd);
        }
    }
}

fn handle_writable(shared: &Arc<Shared>, fd: Handle) {
    let Some(conn) = shared.table.lookup(fd) else {
        return;
    };
    if let Err(e) = conn.flush(&shared.poller) {
        error!(fd, error = %e, "flush failed");
        close_connection(shared, fd);
    }
}

/// Route freshly read bytes to the connection's decoder, binding one on
/// the first read, then apply whatever the decoder asks for.
fn dispatch(shared: &Arc<Shared>, conn: &Arc<Connection>, bytes: &[u8]) {
    let fd = conn.handle();

    let result = {
        let mut decoder = conn.decoder.lock().unwrap();
        if matches!(*decoder, Decoder::Unbound) {
            let kind = protocols::detect(bytes, ProtocolKind::WebSocket);
            *decoder = Decoder::bind(kind, &shared.config, &shared.store);
            if kind == ProtocolKind::WebSocket {
                // Raw magic would be parsed as a frame by the peer.
                conn.set_heartbeat_enabled(false);
            }
            debug!(fd, protocol = ?kind, "bound protocol decoder");
        }
        decoder.on_data(bytes)
    };

    match result {
        Ok(actions) => apply_actions(shared, conn, actions),
        Err(e) => {
            warn!(fd, error = %e, "protocol error, closing");
            close_connection(shared, fd);
        }
    }
}

fn apply_actions(shared: &Arc<Shared>, conn: &Arc<Connection>, actions: Vec<Action>) {
    let fd = conn.handle();
    for action in actions {
        match action {
            Action::Reply(bytes) => {
                if let Err(e) = conn.enqueue(&shared.poller, bytes) {
                    error!(fd, error = %e, "reply send failed");
                    close_connection(shared, fd);
                    return;
                }
            }
            Action::Deliver(payload) => {
                let ctx = AppContext {
                    shared: Arc::clone(shared),
                };
                let app = Arc::clone(&shared.app);
                shared.workers.submit(move || {
                    // The connection may have closed between decode and
                    // this job running; closed handles get no callbacks.
                    if !ctx.is_open(fd) {
                        return;
                    }
                    if catch_unwind(AssertUnwindSafe(|| app.on_message(&ctx, fd, payload)))
                        .is_err()
                    {
                        error!(fd, "on_message panicked, closing connection");
                        ctx.close(fd);
                    }
                });
            }
            Action::Close => {
                close_connection(shared, fd);
                return;
            }
        }
    }
}

/// Close path: table removal, poller deregistration and socket shutdown in
/// one critical section; `on_close` fires exactly once, from the pool.
/// Safe to call from any thread, idempotent.
pub(crate) fn close_connection(shared: &Arc<Shared>, handle: Handle) {
    let removed = shared.table.remove_and(handle, |conn| {
        if let Err(e) = shared.poller.remove(handle) {
            debug!(fd = handle, error = %e, "poller deregistration failed");
        }
        conn.shutdown();
    });

    if let Some(conn) = removed {
        info!(fd = handle, peer = %conn.peer(), "connection closed");
        let ctx = AppContext {
            shared: Arc::clone(shared),
        };
        let app = Arc::clone(&shared.app);
        shared.workers.submit(move || {
            if catch_unwind(AssertUnwindSafe(|| app.on_close(&ctx, handle))).is_err() {
                error!(fd = handle, "on_close panicked");
            }
        });
    }
}

fn heartbeat_loop(shared: Arc<Shared>) {
    let interval = shared.config.heartbeat_interval;
    let mut last_scan = Instant::now();

    while shared.running.load(Ordering::SeqCst) {
        // Short sleep so stop requests are observed promptly.
        thread::sleep(Duration::from_millis(100));
        if last_scan.elapsed() < interval {
            continue;
        }
        last_scan = Instant::now();
        heartbeat_scan(&shared);
    }
    info!("heartbeat stopped");
}

fn heartbeat_scan(shared: &Arc<Shared>) {
    for conn in shared.table.snapshot() {
        let fd = conn.handle();

        if conn.idle_for() > shared.config.heartbeat_timeout {
            info!(fd, "idle beyond heartbeat timeout, closing");
            close_connection(shared, fd);
            continue;
        }

        let probe = heartbeat::probe(
            &conn,
            shared.config.ws_enable_ping,
            shared.config.ws_ping_interval,
        );
        if let Some(bytes) = probe {
            debug!(fd, "heartbeat probe queued");
            if let Err(e) = conn.enqueue(&shared.poller, bytes) {
                warn!(fd, error = %e, "heartbeat send failed, closing");
                close_connection(shared, fd);
            }
        }
    }
}
