//! Protocol-level error types.
//!
//! Errors here are always local to a single connection: the event loop
//! logs them and tears the connection down, it never propagates them.

use thiserror::Error;

/// Errors raised by the per-connection protocol decoders.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Malformed or incomplete-forever WebSocket upgrade request.
    #[error("invalid handshake: {0}")]
    Handshake(String),

    /// Frame opcode outside the RFC 6455 set.
    #[error("reserved opcode {0:#x}")]
    ReservedOpcode(u8),

    /// Control frame payload exceeded the 125-byte RFC limit.
    #[error("control frame payload too large: {0} bytes")]
    ControlFrameTooLarge(usize),

    /// Control frame arrived with FIN=0.
    #[error("fragmented control frame")]
    FragmentedControlFrame,

    /// Frame or assembled message exceeded the configured cap.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// RESP input that cannot ever parse into an array of bulk strings.
    #[error("malformed RESP input: {0}")]
    Resp(String),
}
