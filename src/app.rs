//! Application surface: the callback trait and its runtime context.
//!
//! Applications never touch sockets. They receive decoded payloads and
//! answer through [`AppContext`], which routes everything back through the
//! send pipeline so replies, broadcasts and heartbeats interleave at chunk
//! boundaries, never mid-frame.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::protocols::websocket::frame::Frame;
use crate::protocols::websocket::{WsState, CLOSE_NORMAL};
use crate::protocols::Decoder;
use crate::runtime::Handle;
use crate::server::{close_connection, Shared};

/// Callbacks invoked by the connection runtime, always from the worker
/// pool. Implementations must be thread-safe; a panicking callback is
/// caught, logged, and closes only the offending connection.
pub trait Application: Send + Sync {
    fn on_connect(&self, ctx: &AppContext, handle: Handle);
    fn on_message(&self, ctx: &AppContext, handle: Handle, payload: Vec<u8>);
    fn on_close(&self, ctx: &AppContext, handle: Handle);
}

/// Handle into the connection runtime, given to every callback.
#[derive(Clone)]
pub struct AppContext {
    pub(crate) shared: Arc<Shared>,
}

impl AppContext {
    /// Whether the handle is still in the connection table.
    pub fn is_open(&self, handle: Handle) -> bool {
        self.shared.table.contains(handle)
    }

    /// Queue raw bytes on one connection. Returns false if the handle is
    /// gone or the socket failed (in which case it is closed).
    pub fn send(&self, handle: Handle, bytes: Vec<u8>) -> bool {
        let Some(conn) = self.shared.table.lookup(handle) else {
            return false;
        };
        match conn.enqueue(&self.shared.poller, bytes) {
            Ok(()) => true,
            Err(e) => {
                warn!(fd = handle, error = %e, "send failed, closing");
                close_connection(&self.shared, handle);
                false
            }
        }
    }

    /// Fan a text message out to every OPEN WebSocket peer.
    ///
    /// The frame is encoded once and the connection set is snapshotted up
    /// front, so no lock is held across socket writes. Peers are written
    /// independently; there is no cross-connection ordering guarantee.
    pub fn broadcast_text(&self, text: &str) {
        let wire = Frame::text(text).encode();
        let peers = self.shared.table.snapshot();
        debug!(peers = peers.len(), len = wire.len(), "broadcast");

        for conn in peers {
            let ws_open = matches!(
                &*conn.decoder.lock().unwrap(),
                Decoder::WebSocket(ws) if ws.state() == WsState::Open
            );
            if !ws_open {
                continue;
            }
            if let Err(e) = conn.enqueue(&self.shared.poller, wire.clone()) {
                warn!(fd = conn.handle(), error = %e, "broadcast send failed, closing");
                close_connection(&self.shared, conn.handle());
            }
        }
    }

    /// Close a connection. An OPEN WebSocket peer gets a best-effort
    /// CLOSE(1000) frame first; teardown proceeds regardless.
    pub fn close(&self, handle: Handle) {
        if let Some(conn) = self.shared.table.lookup(handle) {
            let farewell = {
                let mut decoder = conn.decoder.lock().unwrap();
                match &mut *decoder {
                    Decoder::WebSocket(ws) if ws.state() == WsState::Open => {
                        Some(ws.initiate_close(CLOSE_NORMAL, "server closing"))
                    }
                    _ => None,
                }
            };
            if let Some(bytes) = farewell {
                let _ = conn.enqueue(&self.shared.poller, bytes);
            }
        }
        close_connection(&self.shared, handle);
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.shared.table.len()
    }
}

/// Reference application: echoes every message to all connected WebSocket
/// peers, tagged with the sender's handle.
pub struct BroadcastApp;

impl Application for BroadcastApp {
    fn on_connect(&self, _ctx: &AppContext, handle: Handle) {
        info!(fd = handle, "client connected");
    }

    fn on_message(&self, ctx: &AppContext, handle: Handle, payload: Vec<u8>) {
        let text = String::from_utf8_lossy(&payload);
        info!(fd = handle, len = payload.len(), "message received");
        let message = format!("[client{handle}]: {text}");
        ctx.broadcast_text(&message);
    }

    fn on_close(&self, ctx: &AppContext, handle: Handle) {
        info!(fd = handle, remaining = ctx.connection_count(), "client disconnected");
    }
}
