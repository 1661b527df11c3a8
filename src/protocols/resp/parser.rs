//! RESP wire format: reply frames and the request parser.
//!
//! Requests are restricted to the array-of-bulk-strings form every Redis
//! client emits:
//!
//! ```text
//! *<N>\r\n
//! $<L1>\r\n<bytes1>\r\n
//! …
//! ```
//!
//! Replies use the full RESP2 frame set.

use bytes::{Bytes, BytesMut};

use crate::error::ProtocolError;

/// RESP reply frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Simple string: `+OK\r\n`
    Simple(String),
    /// Error: `-ERR message\r\n`
    Error(String),
    /// Integer: `:1000\r\n`
    Integer(i64),
    /// Bulk string: `$5\r\nhello\r\n` or `$-1\r\n` (null)
    Bulk(Option<Bytes>),
    /// Array: `*2\r\n...` of further frames
    Array(Vec<Frame>),
}

impl Frame {
    pub fn simple<S: Into<String>>(s: S) -> Frame {
        Frame::Simple(s.into())
    }

    pub fn error<S: Into<String>>(s: S) -> Frame {
        Frame::Error(s.into())
    }

    pub fn integer(n: i64) -> Frame {
        Frame::Integer(n)
    }

    pub fn bulk<B: Into<Bytes>>(data: B) -> Frame {
        Frame::Bulk(Some(data.into()))
    }

    pub fn null() -> Frame {
        Frame::Bulk(None)
    }

    pub fn array(frames: Vec<Frame>) -> Frame {
        Frame::Array(frames)
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Frame::Simple(s) => {
                buf.extend_from_slice(b"+");
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            Frame::Error(s) => {
                buf.extend_from_slice(b"-");
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            Frame::Integer(n) => {
                buf.extend_from_slice(b":");
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            Frame::Bulk(None) => {
                buf.extend_from_slice(b"$-1\r\n");
            }
            Frame::Bulk(Some(data)) => {
                buf.extend_from_slice(b"$");
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
                buf.extend_from_slice(data);
                buf.extend_from_slice(b"\r\n");
            }
            Frame::Array(frames) => {
                buf.extend_from_slice(b"*");
                buf.extend_from_slice(frames.len().to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
                for frame in frames {
                    frame.encode_into(buf);
                }
            }
        }
    }
}

/// Find CRLF, returning the position of `\r`.
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    (0..buffer.len().saturating_sub(1)).find(|&i| buffer[i] == b'\r' && buffer[i + 1] == b'\n')
}

/// Parse the decimal line after a type byte, e.g. the `3` of `*3\r\n`.
///
/// Returns `(value, offset past the CRLF)`.
fn parse_length(buffer: &[u8], what: &str) -> Result<Option<(i64, usize)>, ProtocolError> {
    let Some(end) = find_crlf(buffer) else {
        return Ok(None);
    };
    let digits = std::str::from_utf8(&buffer[1..end])
        .map_err(|_| ProtocolError::Resp(format!("non-ASCII {what} length")))?;
    let value: i64 = digits
        .parse()
        .map_err(|_| ProtocolError::Resp(format!("invalid {what} length: {digits:?}")))?;
    Ok(Some((value, end + 2)))
}

/// Greedily parse one command (array of bulk strings) from `buffer`.
///
/// `Ok(None)` means insufficient bytes: leave the buffer and wait.
/// `Err` means the input can never parse; the connection is closed.
pub fn parse_command(buffer: &[u8]) -> Result<Option<(Vec<Vec<u8>>, usize)>, ProtocolError> {
    if buffer.is_empty() {
        return Ok(None);
    }
    if buffer[0] != b'*' {
        return Err(ProtocolError::Resp(format!(
            "expected array, got {:?}",
            buffer[0] as char
        )));
    }

    let Some((count, mut pos)) = parse_length(buffer, "array")? else {
        return Ok(None);
    };
    if count < 0 {
        return Err(ProtocolError::Resp("negative array length".into()));
    }

    let mut args = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if pos >= buffer.len() {
            return Ok(None);
        }
        if buffer[pos] != b'$' {
            return Err(ProtocolError::Resp(format!(
                "expected bulk string, got {:?}",
                buffer[pos] as char
            )));
        }
        let Some((len, consumed)) = parse_length(&buffer[pos..], "bulk string")? else {
            return Ok(None);
        };
        if len < 0 {
            return Err(ProtocolError::Resp("null bulk string in command".into()));
        }
        pos += consumed;

        let len = len as usize;
        if buffer.len() < pos + len + 2 {
            return Ok(None);
        }
        if &buffer[pos + len..pos + len + 2] != b"\r\n" {
            return Err(ProtocolError::Resp("bulk string missing CRLF".into()));
        }
        args.push(buffer[pos..pos + len].to_vec());
        pos += len + 2;
    }

    Ok(Some((args, pos)))
}
