//! WebSocket frame parsing and construction (RFC 6455 §5).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |                 Masking key (if MASK set)                     |
//! +---------------------------------------------------------------+
//! |                         Payload data                          |
//! +---------------------------------------------------------------+
//! ```

use crate::error::ProtocolError;

use super::opcode::OpCode;

/// Control frame payloads may not exceed 125 bytes (RFC 6455 §5.5).
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// A parsed or to-be-encoded frame. Parsed payloads are already unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub rsv: bool,
    pub opcode: OpCode,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn text(payload: impl Into<Vec<u8>>) -> Frame {
        Frame::data(OpCode::Text, payload.into())
    }

    pub fn binary(payload: impl Into<Vec<u8>>) -> Frame {
        Frame::data(OpCode::Binary, payload.into())
    }

    pub fn ping(payload: impl Into<Vec<u8>>) -> Frame {
        Frame::data(OpCode::Ping, payload.into())
    }

    pub fn pong(payload: impl Into<Vec<u8>>) -> Frame {
        Frame::data(OpCode::Pong, payload.into())
    }

    /// Close frame payload is `[code_hi, code_lo, reason bytes…]`.
    pub fn close(code: u16, reason: &str) -> Frame {
        let mut payload = code.to_be_bytes().to_vec();
        payload.extend_from_slice(reason.as_bytes());
        Frame::data(OpCode::Close, payload)
    }

    fn data(opcode: OpCode, payload: Vec<u8>) -> Frame {
        Frame {
            fin: true,
            rsv: false,
            opcode,
            payload,
        }
    }

    /// Try to parse one frame from the head of `buf`.
    ///
    /// Returns `Ok(None)` while the buffer does not yet hold a complete
    /// frame, `Ok(Some((frame, consumed)))` on success. Masked payloads
    /// are unmasked during the copy. `max_payload` bounds the declared
    /// payload length before any allocation happens.
    pub fn parse(buf: &[u8], max_payload: usize) -> Result<Option<(Frame, usize)>, ProtocolError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let byte0 = buf[0];
        let byte1 = buf[1];

        let fin = byte0 & 0x80 != 0;
        let rsv = byte0 & 0x70 != 0;
        let opcode = OpCode::from_u8(byte0 & 0x0F)?;
        let masked = byte1 & 0x80 != 0;

        let (payload_len, mut offset) = match byte1 & 0x7F {
            126 => {
                if buf.len() < 4 {
                    return Ok(None);
                }
                (u16::from_be_bytes([buf[2], buf[3]]) as u64, 4usize)
            }
            127 => {
                if buf.len() < 10 {
                    return Ok(None);
                }
                let mut len = [0u8; 8];
                len.copy_from_slice(&buf[2..10]);
                (u64::from_be_bytes(len), 10usize)
            }
            n => (n as u64, 2usize),
        };

        if payload_len > max_payload as u64 {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len.min(usize::MAX as u64) as usize,
                max: max_payload,
            });
        }
        let payload_len = payload_len as usize;

        if opcode.is_control() {
            if !fin {
                return Err(ProtocolError::FragmentedControlFrame);
            }
            if payload_len > MAX_CONTROL_PAYLOAD {
                return Err(ProtocolError::ControlFrameTooLarge(payload_len));
            }
        }

        let mask = if masked {
            if buf.len() < offset + 4 {
                return Ok(None);
            }
            let key = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
            offset += 4;
            Some(key)
        } else {
            None
        };

        if buf.len() < offset + payload_len {
            return Ok(None);
        }

        let mut payload = buf[offset..offset + payload_len].to_vec();
        if let Some(key) = mask {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= key[i % 4];
            }
        }

        Ok(Some((
            Frame {
                fin,
                rsv,
                opcode,
                payload,
            },
            offset + payload_len,
        )))
    }

    /// Encode for transmission. Server frames are never masked and use the
    /// smallest of the 7/16/64-bit length forms.
    pub fn encode(&self) -> Vec<u8> {
        let len = self.payload.len();
        let mut out = Vec::with_capacity(len + 10);

        let mut byte0 = self.opcode.as_u8();
        if self.fin {
            byte0 |= 0x80;
        }
        out.push(byte0);

        if len < 126 {
            out.push(len as u8);
        } else if len <= u16::MAX as usize {
            out.push(126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            out.push(127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }

        out.extend_from_slice(&self.payload);
        out
    }
}
