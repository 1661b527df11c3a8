//! WebSocket opening handshake (RFC 6455 §4).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::{Digest, Sha1};

use crate::error::ProtocolError;

/// GUID appended to the client key before hashing (RFC 6455 §1.3).
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// `Sec-WebSocket-Accept = base64(SHA1(key || GUID))`.
///
/// ```
/// use wirehub::protocols::websocket::handshake::compute_accept_key;
///
/// let accept = compute_accept_key("dGhlIHNhbXBsZSBub25jZQ==");
/// assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
/// ```
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Parse an upgrade request and produce the 101 response.
///
/// Requirements are the lenient server-side minimum: a `GET` request line,
/// an `Upgrade` header mentioning `websocket` (case-insensitive), and a
/// `Sec-WebSocket-Key`. Anything else is a handshake failure; the caller
/// sends nothing and tears the connection down.
pub fn respond(request: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let text = std::str::from_utf8(request)
        .map_err(|_| ProtocolError::Handshake("request is not valid UTF-8".into()))?;

    let mut lines = text.lines();
    let request_line = lines
        .next()
        .ok_or_else(|| ProtocolError::Handshake("empty request".into()))?;
    if !request_line.starts_with("GET ") {
        return Err(ProtocolError::Handshake(format!(
            "expected GET request line, got {request_line:?}"
        )));
    }

    let mut upgrade_websocket = false;
    let mut key: Option<&str> = None;

    for line in lines {
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("upgrade") && value.to_ascii_lowercase().contains("websocket")
        {
            upgrade_websocket = true;
        } else if name.eq_ignore_ascii_case("sec-websocket-key") {
            key = Some(value);
        }
    }

    if !upgrade_websocket {
        return Err(ProtocolError::Handshake(
            "missing Upgrade: websocket header".into(),
        ));
    }
    let key = key
        .ok_or_else(|| ProtocolError::Handshake("missing Sec-WebSocket-Key header".into()))?;

    let accept = compute_accept_key(key);
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\r\n"
    );
    Ok(response.into_bytes())
}
