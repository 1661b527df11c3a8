//! Protocol dispatch.
//!
//! Each connection carries one decoder for its whole lifetime, selected by
//! peeking at the first bytes it sends. Decoders share a uniform contract:
//! `on_data` consumes what it can, keeps the rest in an internal buffer,
//! and reports what the runtime should do next as a list of actions.

pub mod resp;
pub mod websocket;

use std::sync::Arc;

use crate::config::Config;
use crate::error::ProtocolError;
use crate::storage::Store;

use resp::RespCodec;
use websocket::WsCodec;

/// What the runtime should do with the outcome of a decode pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Hand a completed application payload to the packet callback.
    Deliver(Vec<u8>),
    /// Transmit bytes back on this connection (handshake response, PONG,
    /// CLOSE, RESP reply).
    Reply(Vec<u8>),
    /// Tear the connection down.
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    WebSocket,
    Resp,
}

/// Per-connection protocol state machine. Starts unbound; the first read
/// binds it and it never changes afterwards.
pub enum Decoder {
    Unbound,
    WebSocket(WsCodec),
    Resp(RespCodec),
}

impl Decoder {
    pub fn kind(&self) -> Option<ProtocolKind> {
        match self {
            Decoder::Unbound => None,
            Decoder::WebSocket(_) => Some(ProtocolKind::WebSocket),
            Decoder::Resp(_) => Some(ProtocolKind::Resp),
        }
    }

    /// Construct the decoder for a freshly detected protocol.
    pub fn bind(kind: ProtocolKind, config: &Config, store: &Arc<Store>) -> Decoder {
        match kind {
            ProtocolKind::WebSocket => Decoder::WebSocket(WsCodec::new(config.ws_max_frame_size)),
            ProtocolKind::Resp => Decoder::Resp(RespCodec::new(Arc::clone(store))),
        }
    }

    pub fn on_data(&mut self, input: &[u8]) -> Result<Vec<Action>, ProtocolError> {
        match self {
            Decoder::Unbound => Ok(Vec::new()),
            Decoder::WebSocket(ws) => ws.on_data(input),
            Decoder::Resp(resp) => resp.on_data(input),
        }
    }
}

/// Pick a protocol from the first bytes of a connection.
///
/// `*` is the RESP array marker; an HTTP GET whose headers mention a
/// websocket upgrade is a WebSocket handshake. Anything else falls back
/// to the server default, which also catches a handshake whose headers
/// have not fully arrived yet, since the WebSocket codec buffers until
/// the terminator.
pub fn detect(first: &[u8], default: ProtocolKind) -> ProtocolKind {
    if first.first() == Some(&b'*') {
        return ProtocolKind::Resp;
    }
    if first.starts_with(b"GET ") {
        let lower = String::from_utf8_lossy(first).to_ascii_lowercase();
        if lower.contains("upgrade:") && lower.contains("websocket") {
            return ProtocolKind::WebSocket;
        }
    }
    default
}
