//! WebSocket server protocol state machine (RFC 6455).
//!
//! States run `CONNECTING → OPEN → CLOSING → CLOSED`, never backwards.
//! The codec owns its decode buffer: bytes are appended on each read and
//! consumed frame by frame, so frames split across TCP segments simply
//! wait for the next read. Fragmented messages are reassembled before
//! delivery and text payloads are UTF-8 validated on the assembled
//! message.

pub mod frame;
pub mod handshake;
pub mod opcode;

use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use tracing::{debug, warn};

use crate::error::ProtocolError;

use super::Action;
use frame::Frame;
use opcode::OpCode;

pub use frame::MAX_CONTROL_PAYLOAD;

/// Hard upper bound on frame and message payloads; the configured
/// `websocket.max_frame_size` may only lower it.
pub const HARD_MAX_FRAME: usize = 10 * 1024 * 1024;

/// Upper bound on buffered handshake headers.
const MAX_HANDSHAKE: usize = 16 * 1024;

/// RFC 6455 close codes used by the server.
pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
pub const CLOSE_UNSUPPORTED: u16 = 1003;
pub const CLOSE_INVALID_PAYLOAD: u16 = 1007;
pub const CLOSE_TOO_BIG: u16 = 1009;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsState {
    Connecting,
    Open,
    Closing,
    Closed,
}

pub struct WsCodec {
    state: WsState,
    buffer: BytesMut,
    max_frame: usize,
    frag_opcode: Option<OpCode>,
    frag_payload: Vec<u8>,
    last_ping: Instant,
}

impl WsCodec {
    pub fn new(max_frame_size: usize) -> WsCodec {
        WsCodec {
            state: WsState::Connecting,
            buffer: BytesMut::with_capacity(4096),
            max_frame: max_frame_size.min(HARD_MAX_FRAME),
            frag_opcode: None,
            frag_payload: Vec::new(),
            last_ping: Instant::now(),
        }
    }

    pub fn state(&self) -> WsState {
        self.state
    }

    /// Feed freshly read bytes through the state machine.
    ///
    /// Bytes that do not yet form a complete handshake or frame stay in
    /// the internal buffer. `Err` means close without farewell bytes;
    /// protocol errors that warrant a CLOSE frame come back as
    /// `Reply` + `Close` actions instead.
    pub fn on_data(&mut self, input: &[u8]) -> Result<Vec<Action>, ProtocolError> {
        if self.state == WsState::Closed {
            debug!(len = input.len(), "data after close ignored");
            return Ok(Vec::new());
        }

        self.buffer.extend_from_slice(input);
        let mut actions = Vec::new();

        if self.state == WsState::Connecting {
            let Some(end) = find_header_end(&self.buffer) else {
                if self.buffer.len() > MAX_HANDSHAKE {
                    self.state = WsState::Closed;
                    return Err(ProtocolError::Handshake("headers exceed 16 KiB".into()));
                }
                return Ok(actions);
            };

            let request = self.buffer.split_to(end);
            match handshake::respond(&request) {
                Ok(response) => {
                    self.state = WsState::Open;
                    actions.push(Action::Reply(response));
                }
                Err(e) => {
                    // Malformed handshake: send nothing, signal the error.
                    self.state = WsState::Closed;
                    return Err(e);
                }
            }
        }

        while self.state == WsState::Open || self.state == WsState::Closing {
            match Frame::parse(&self.buffer, self.max_frame) {
                Ok(None) => break,
                Ok(Some((frame, consumed))) => {
                    self.buffer.advance(consumed);
                    self.handle_frame(frame, &mut actions);
                }
                Err(e) => {
                    let code = match e {
                        ProtocolError::ReservedOpcode(_) => CLOSE_UNSUPPORTED,
                        ProtocolError::FrameTooLarge { .. } => CLOSE_TOO_BIG,
                        _ => CLOSE_PROTOCOL_ERROR,
                    };
                    warn!(error = %e, code, "websocket protocol error");
                    self.close_with(code, &e.to_string(), &mut actions);
                    break;
                }
            }
        }

        Ok(actions)
    }

    fn handle_frame(&mut self, frame: Frame, actions: &mut Vec<Action>) {
        if frame.rsv {
            // No extensions are negotiated; tolerate but flag it.
            warn!("RSV bits set without negotiated extension");
        }

        match frame.opcode {
            OpCode::Text | OpCode::Binary | OpCode::Continuation => {
                self.assemble(frame, actions);
            }
            OpCode::Ping => {
                actions.push(Action::Reply(Frame::pong(frame.payload).encode()));
            }
            OpCode::Pong => {
                debug!("received PONG");
            }
            OpCode::Close => {
                if self.state == WsState::Open {
                    // Echo the peer's code back before teardown.
                    let code = if frame.payload.len() >= 2 {
                        u16::from_be_bytes([frame.payload[0], frame.payload[1]])
                    } else {
                        CLOSE_NORMAL
                    };
                    actions.push(Action::Reply(Frame::close(code, "").encode()));
                }
                self.state = WsState::Closed;
                actions.push(Action::Close);
            }
        }
    }

    /// Accumulate data frames into a complete message (reassembling
    /// continuation fragments), then deliver.
    fn assemble(&mut self, frame: Frame, actions: &mut Vec<Action>) {
        match (frame.opcode, self.frag_opcode) {
            (OpCode::Continuation, None) => {
                self.close_with(
                    CLOSE_PROTOCOL_ERROR,
                    "unexpected continuation frame",
                    actions,
                );
                return;
            }
            (OpCode::Continuation, Some(_)) => {}
            (_, Some(_)) => {
                self.close_with(
                    CLOSE_PROTOCOL_ERROR,
                    "data frame during fragmented message",
                    actions,
                );
                return;
            }
            (opcode, None) => self.frag_opcode = Some(opcode),
        }

        if self.frag_payload.len() + frame.payload.len() > self.max_frame {
            self.close_with(CLOSE_TOO_BIG, "message too large", actions);
            self.frag_opcode = None;
            self.frag_payload.clear();
            return;
        }
        self.frag_payload.extend_from_slice(&frame.payload);

        if !frame.fin {
            return;
        }

        let opcode = self.frag_opcode.take().unwrap_or(OpCode::Binary);
        let payload = std::mem::take(&mut self.frag_payload);

        if opcode == OpCode::Text && std::str::from_utf8(&payload).is_err() {
            warn!("TEXT frame with invalid UTF-8, closing");
            self.close_with(CLOSE_INVALID_PAYLOAD, "Invalid UTF-8 in TEXT frame", actions);
            return;
        }

        actions.push(Action::Deliver(payload));
    }

    fn close_with(&mut self, code: u16, reason: &str, actions: &mut Vec<Action>) {
        actions.push(Action::Reply(Frame::close(code, reason).encode()));
        actions.push(Action::Close);
        self.state = WsState::Closed;
    }

    /// Begin a server-initiated close: queue a CLOSE frame and move to
    /// CLOSING. Returns the frame bytes to transmit.
    pub fn initiate_close(&mut self, code: u16, reason: &str) -> Vec<u8> {
        if self.state == WsState::Open {
            self.state = WsState::Closing;
        }
        Frame::close(code, reason).encode()
    }

    /// Frame a text message. UTF-8 validity is guaranteed by the `&str`
    /// argument, satisfying the validate-before-framing rule by type.
    pub fn encode_text(&self, text: &str) -> Vec<u8> {
        Frame::text(text.as_bytes().to_vec()).encode()
    }

    pub fn encode_binary(&self, payload: &[u8]) -> Vec<u8> {
        Frame::binary(payload.to_vec()).encode()
    }

    pub fn encode_ping(&self, payload: &[u8]) -> Vec<u8> {
        Frame::ping(payload.to_vec()).encode()
    }

    /// True once per `interval`, resetting the clock when due.
    pub fn ping_due(&mut self, interval: Duration) -> bool {
        if self.state != WsState::Open {
            return false;
        }
        if self.last_ping.elapsed() >= interval {
            self.last_ping = Instant::now();
            true
        } else {
            false
        }
    }
}

/// Offset just past the `\r\n\r\n` header terminator, if present.
fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_HANDSHAKE: &[u8] = b"GET /chat HTTP/1.1\r\n\
        Host: example.com\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\r\n";

    fn open_codec() -> WsCodec {
        let mut codec = WsCodec::new(65536);
        let actions = codec.on_data(SAMPLE_HANDSHAKE).unwrap();
        assert_eq!(codec.state(), WsState::Open);
        assert_eq!(actions.len(), 1);
        codec
    }

    fn masked(frame: &Frame) -> Vec<u8> {
        let key = [0x11, 0x22, 0x33, 0x44];
        let mut out = Vec::new();
        let mut byte0 = frame.opcode.as_u8();
        if frame.fin {
            byte0 |= 0x80;
        }
        out.push(byte0);
        let len = frame.payload.len();
        assert!(len < 126, "test helper handles short frames only");
        out.push(0x80 | len as u8);
        out.extend_from_slice(&key);
        out.extend(
            frame
                .payload
                .iter()
                .enumerate()
                .map(|(i, b)| b ^ key[i % 4]),
        );
        out
    }

    #[test]
    fn handshake_moves_to_open_and_replies_101() {
        let mut codec = WsCodec::new(65536);
        let actions = codec.on_data(SAMPLE_HANDSHAKE).unwrap();
        match &actions[0] {
            Action::Reply(bytes) => {
                let text = std::str::from_utf8(bytes).unwrap();
                assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
            }
            other => panic!("expected Reply, got {other:?}"),
        }
    }

    #[test]
    fn partial_handshake_waits_for_more_bytes() {
        let mut codec = WsCodec::new(65536);
        let actions = codec.on_data(&SAMPLE_HANDSHAKE[..40]).unwrap();
        assert!(actions.is_empty());
        assert_eq!(codec.state(), WsState::Connecting);

        let actions = codec.on_data(&SAMPLE_HANDSHAKE[40..]).unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(codec.state(), WsState::Open);
    }

    #[test]
    fn malformed_handshake_closes_silently() {
        let mut codec = WsCodec::new(65536);
        let result = codec.on_data(b"POST / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(matches!(result, Err(ProtocolError::Handshake(_))));
        assert_eq!(codec.state(), WsState::Closed);
    }

    #[test]
    fn masked_text_frame_delivered() {
        let mut codec = open_codec();
        let wire = masked(&Frame::text("hello"));
        let actions = codec.on_data(&wire).unwrap();
        assert_eq!(actions, vec![Action::Deliver(b"hello".to_vec())]);
    }

    #[test]
    fn frame_split_across_reads_is_reassembled() {
        let mut codec = open_codec();
        let wire = masked(&Frame::text("hello"));
        assert!(codec.on_data(&wire[..3]).unwrap().is_empty());
        let actions = codec.on_data(&wire[3..]).unwrap();
        assert_eq!(actions, vec![Action::Deliver(b"hello".to_vec())]);
    }

    #[test]
    fn ping_answered_with_pong_not_delivered() {
        let mut codec = open_codec();
        let wire = masked(&Frame::ping(b"probe".to_vec()));
        let actions = codec.on_data(&wire).unwrap();
        assert_eq!(
            actions,
            vec![Action::Reply(Frame::pong(b"probe".to_vec()).encode())]
        );
    }

    #[test]
    fn pong_is_swallowed() {
        let mut codec = open_codec();
        let wire = masked(&Frame::pong(b"probe".to_vec()));
        assert!(codec.on_data(&wire).unwrap().is_empty());
    }

    #[test]
    fn invalid_utf8_text_closes_1007() {
        let mut codec = open_codec();
        let wire = masked(&Frame::text(vec![0xC3, 0x28]));
        let actions = codec.on_data(&wire).unwrap();
        assert_eq!(codec.state(), WsState::Closed);
        match &actions[0] {
            Action::Reply(bytes) => {
                assert_eq!(bytes[0], 0x88);
                assert_eq!(&bytes[2..4], &CLOSE_INVALID_PAYLOAD.to_be_bytes());
                assert!(bytes.ends_with(b"Invalid UTF-8 in TEXT frame"));
            }
            other => panic!("expected Reply, got {other:?}"),
        }
        assert_eq!(actions[1], Action::Close);
    }

    #[test]
    fn reserved_opcode_closes_1003() {
        let mut codec = open_codec();
        // Opcode 0x3 is reserved.
        let actions = codec.on_data(&[0x83, 0x00]).unwrap();
        assert_eq!(codec.state(), WsState::Closed);
        match &actions[0] {
            Action::Reply(bytes) => {
                assert_eq!(&bytes[2..4], &CLOSE_UNSUPPORTED.to_be_bytes());
            }
            other => panic!("expected Reply, got {other:?}"),
        }
    }

    #[test]
    fn peer_close_is_echoed_then_torn_down() {
        let mut codec = open_codec();
        let wire = masked(&Frame::close(CLOSE_NORMAL, "bye"));
        let actions = codec.on_data(&wire).unwrap();
        assert_eq!(codec.state(), WsState::Closed);
        match &actions[0] {
            Action::Reply(bytes) => {
                assert_eq!(bytes[0], 0x88);
                assert_eq!(&bytes[2..4], &CLOSE_NORMAL.to_be_bytes());
            }
            other => panic!("expected Reply, got {other:?}"),
        }
        assert_eq!(actions[1], Action::Close);
    }

    #[test]
    fn fragmented_message_reassembled() {
        let mut codec = open_codec();
        let first = masked(&Frame {
            fin: false,
            rsv: false,
            opcode: OpCode::Text,
            payload: b"Hel".to_vec(),
        });
        let second = masked(&Frame {
            fin: true,
            rsv: false,
            opcode: OpCode::Continuation,
            payload: b"lo".to_vec(),
        });
        assert!(codec.on_data(&first).unwrap().is_empty());
        let actions = codec.on_data(&second).unwrap();
        assert_eq!(actions, vec![Action::Deliver(b"Hello".to_vec())]);
    }

    #[test]
    fn bare_continuation_closes_1002() {
        let mut codec = open_codec();
        let wire = masked(&Frame {
            fin: true,
            rsv: false,
            opcode: OpCode::Continuation,
            payload: b"lost".to_vec(),
        });
        let actions = codec.on_data(&wire).unwrap();
        assert_eq!(codec.state(), WsState::Closed);
        match &actions[0] {
            Action::Reply(bytes) => {
                assert_eq!(&bytes[2..4], &CLOSE_PROTOCOL_ERROR.to_be_bytes());
            }
            other => panic!("expected Reply, got {other:?}"),
        }
    }

    #[test]
    fn oversize_frame_closes_1009() {
        let mut codec = WsCodec::new(16);
        codec.on_data(SAMPLE_HANDSHAKE).unwrap();
        let wire = masked(&Frame::binary(vec![0u8; 32]));
        let actions = codec.on_data(&wire).unwrap();
        assert_eq!(codec.state(), WsState::Closed);
        match &actions[0] {
            Action::Reply(bytes) => {
                assert_eq!(&bytes[2..4], &CLOSE_TOO_BIG.to_be_bytes());
            }
            other => panic!("expected Reply, got {other:?}"),
        }
    }

    #[test]
    fn state_never_moves_backwards() {
        let mut codec = open_codec();
        let bytes = codec.initiate_close(CLOSE_NORMAL, "shutting down");
        assert_eq!(bytes[0], 0x88);
        assert_eq!(codec.state(), WsState::Closing);

        // Peer acknowledgment lands us in CLOSED, terminal.
        let wire = masked(&Frame::close(CLOSE_NORMAL, ""));
        let actions = codec.on_data(&wire).unwrap();
        assert_eq!(codec.state(), WsState::Closed);
        assert_eq!(actions, vec![Action::Close]);

        // Everything after CLOSED is ignored.
        let wire = masked(&Frame::text("late"));
        assert!(codec.on_data(&wire).unwrap().is_empty());
        assert_eq!(codec.state(), WsState::Closed);
    }

    #[test]
    fn data_after_handshake_in_same_read_is_processed() {
        let mut codec = WsCodec::new(65536);
        let mut wire = SAMPLE_HANDSHAKE.to_vec();
        wire.extend(masked(&Frame::text("early")));
        let actions = codec.on_data(&wire).unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[1], Action::Deliver(b"early".to_vec()));
    }
}
