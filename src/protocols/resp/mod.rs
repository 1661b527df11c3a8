//! RESP protocol decoder: streaming buffer, heartbeat filter, command
//! execution against the shared store.

pub mod commands;
pub mod parser;

use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tracing::trace;

use crate::error::ProtocolError;
use crate::runtime::heartbeat;
use crate::storage::Store;

use super::Action;

pub use parser::Frame;

pub struct RespCodec {
    buffer: BytesMut,
    store: Arc<Store>,
}

impl RespCodec {
    pub fn new(store: Arc<Store>) -> RespCodec {
        RespCodec {
            buffer: BytesMut::with_capacity(4096),
            store,
        }
    }

    /// Feed freshly read bytes; replies come back as `Reply` actions.
    ///
    /// Heartbeat magics are stripped from the buffer head before each
    /// parse attempt since probes from peer framework instances share the
    /// byte stream with commands. A parse error closes the connection.
    pub fn on_data(&mut self, input: &[u8]) -> Result<Vec<Action>, ProtocolError> {
        self.buffer.extend_from_slice(input);
        let mut actions = Vec::new();

        loop {
            self.strip_heartbeats();
            // A truncated magic at the head cannot be told apart from
            // garbage yet; wait for the remaining bytes.
            if !self.buffer.is_empty()
                && self.buffer.len() < 4
                && heartbeat::magic_bytes().starts_with(&self.buffer)
            {
                break;
            }
            match parser::parse_command(&self.buffer)? {
                None => break,
                Some((args, consumed)) => {
                    self.buffer.advance(consumed);
                    if args.is_empty() {
                        continue;
                    }
                    let reply = commands::execute(&args, &self.store);
                    actions.push(Action::Reply(reply.encode().to_vec()));
                }
            }
        }

        Ok(actions)
    }

    /// Drop leading heartbeat markers, handling back-to-back probes that
    /// coalesced into one TCP segment.
    fn strip_heartbeats(&mut self) {
        let magic = heartbeat::magic_bytes();
        let mut stripped = 0usize;
        while self.buffer.len() >= 4 && self.buffer[..4] == magic {
            self.buffer.advance(4);
            stripped += 4;
        }
        if stripped > 0 {
            trace!(stripped, "filtered heartbeat markers");
        }
    }
}

impl std::fmt::Debug for RespCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RespCodec")
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply_bytes(actions: &[Action]) -> Vec<u8> {
        let mut out = Vec::new();
        for action in actions {
            match action {
                Action::Reply(bytes) => out.extend_from_slice(bytes),
                other => panic!("expected Reply, got {other:?}"),
            }
        }
        out
    }

    #[test]
    fn ping_replies_pong() {
        let mut codec = RespCodec::new(Store::new());
        let actions = codec.on_data(b"*1\r\n$4\r\nPING\r\n").unwrap();
        assert_eq!(reply_bytes(&actions), b"+PONG\r\n");
    }

    #[test]
    fn set_then_get_roundtrip() {
        let mut codec = RespCodec::new(Store::new());
        let actions = codec
            .on_data(b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$3\r\nabc\r\n*2\r\n$3\r\nGET\r\n$1\r\nk\r\n")
            .unwrap();
        assert_eq!(reply_bytes(&actions), b"+OK\r\n$3\r\nabc\r\n");
    }

    #[test]
    fn command_split_across_reads() {
        let mut codec = RespCodec::new(Store::new());
        assert!(codec.on_data(b"*1\r\n$4\r\nPI").unwrap().is_empty());
        let actions = codec.on_data(b"NG\r\n").unwrap();
        assert_eq!(reply_bytes(&actions), b"+PONG\r\n");
    }

    #[test]
    fn heartbeat_magic_stripped_before_parse() {
        let mut codec = RespCodec::new(Store::new());
        let mut wire = heartbeat::magic_bytes().to_vec();
        wire.extend_from_slice(&heartbeat::magic_bytes());
        wire.extend_from_slice(b"*1\r\n$4\r\nPING\r\n");
        let actions = codec.on_data(&wire).unwrap();
        assert_eq!(reply_bytes(&actions), b"+PONG\r\n");
    }

    #[test]
    fn heartbeat_between_commands_stripped() {
        let mut codec = RespCodec::new(Store::new());
        let mut wire = b"*1\r\n$4\r\nPING\r\n".to_vec();
        wire.extend_from_slice(&heartbeat::magic_bytes());
        wire.extend_from_slice(b"*1\r\n$4\r\nPING\r\n");
        let actions = codec.on_data(&wire).unwrap();
        assert_eq!(reply_bytes(&actions), b"+PONG\r\n+PONG\r\n");
    }

    #[test]
    fn partial_magic_waits_for_more() {
        let mut codec = RespCodec::new(Store::new());
        assert!(codec.on_data(&[0xFA, 0xFB]).unwrap().is_empty());
        let mut rest = vec![0xFC, 0xFD];
        rest.extend_from_slice(b"*1\r\n$4\r\nPING\r\n");
        let actions = codec.on_data(&rest).unwrap();
        assert_eq!(reply_bytes(&actions), b"+PONG\r\n");
    }

    #[test]
    fn garbage_is_a_protocol_error() {
        let mut codec = RespCodec::new(Store::new());
        assert!(codec.on_data(b"GARBAGE\r\n").is_err());
    }

    #[test]
    fn shared_store_across_codecs() {
        let store = Store::new();
        let mut one = RespCodec::new(Arc::clone(&store));
        let mut two = RespCodec::new(store);
        one.on_data(b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n").unwrap();
        let actions = two.on_data(b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n").unwrap();
        assert_eq!(reply_bytes(&actions), b"$1\r\nv\r\n");
    }
}
