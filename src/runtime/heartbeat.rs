//! Liveness probes.
//!
//! One periodic task scans the connection table: connections idle past the
//! timeout are closed, everything else gets a probe enqueued through the
//! send pipeline. Raw and RESP connections share the TCP stream with an
//! in-band 4-byte magic marker that their decoders strip before parsing;
//! WebSocket connections use protocol-native PING frames instead, because
//! a browser would parse the raw magic as a (garbage) frame header.

use std::time::Duration;

use crate::protocols::Decoder;
use crate::runtime::Connection;

/// In-band heartbeat marker, transmitted in network byte order.
pub const HEARTBEAT_MAGIC: u32 = 0xFAFB_FCFD;

/// The marker as it appears on the wire.
pub fn magic_bytes() -> [u8; 4] {
    HEARTBEAT_MAGIC.to_be_bytes()
}

/// Decide the liveness probe for one connection, if any.
///
/// Returns the bytes to enqueue. Unbound connections get no probe (their
/// protocol is unknown until the first read); they are still covered by
/// the idle timeout.
pub fn probe(conn: &Connection, enable_ping: bool, ping_interval: Duration) -> Option<Vec<u8>> {
    let mut decoder = conn.decoder.lock().unwrap();
    match &mut *decoder {
        Decoder::WebSocket(ws) => {
            if enable_ping && ws.ping_due(ping_interval) {
                Some(ws.encode_ping(b""))
            } else {
                None
            }
        }
        Decoder::Resp(_) => {
            if conn.heartbeat_enabled() {
                Some(magic_bytes().to_vec())
            } else {
                None
            }
        }
        Decoder::Unbound => None,
    }
}
