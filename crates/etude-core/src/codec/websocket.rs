//! WebSocket (RFC 6455 subset), server side.
//!
//! A connection starts in the handshake phase: `input` waits for a complete
//! HTTP Upgrade request and answers it with `Input::Upgrade`. After that every
//! `input` call frames exactly one WebSocket frame and `decode` turns frames
//! into messages, reassembling fragments in an explicit accumulator.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |   Masking-key, if MASK set    |          Payload Data         |
//! +-------------------------------+-------------------------------+
//! ```

use super::http::{HttpResponse, find_header_end, raw_header};
use super::{Codec, Inbound, Input, Payload};
use crate::error::ProtocolError;
use base64::Engine;
use sha1::{Digest, Sha1};

/// GUID appended to the client key before hashing (RFC 6455 section 1.3).
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Longest possible frame header: 2 + 8 extended length + 4 mask.
pub const MAX_HEADER_LEN: usize = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    pub const fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(ProtocolError::InvalidOpcode(value)),
        }
    }
}

/// `base64(SHA1(key + GUID))`.
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

pub fn apply_mask(payload: &mut [u8], mask_key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask_key[i % 4];
    }
}

/// Encode one unmasked, final frame.
pub fn encode_frame(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let len = payload.len();
    let mut out = Vec::with_capacity(len + 10);
    out.push(0x80 | opcode as u8);
    if len <= 125 {
        out.push(len as u8);
    } else if len <= 65535 {
        out.push(126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
    out.extend_from_slice(payload);
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameHeader {
    fin: bool,
    opcode: Opcode,
    mask: Option<[u8; 4]>,
    header_len: usize,
    payload_len: u64,
}

/// Parse a frame header. `Ok(None)` while the header itself is incomplete.
fn parse_header(buf: &[u8]) -> Result<Option<FrameHeader>, ProtocolError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let fin = buf[0] & 0x80 != 0;
    let opcode = Opcode::from_u8(buf[0] & 0x0F)?;
    let masked = buf[1] & 0x80 != 0;

    let (payload_len, mut header_len) = match buf[1] & 0x7F {
        126 => {
            let Some(ext) = buf.get(2..4) else {
                return Ok(None);
            };
            (u64::from(u16::from_be_bytes([ext[0], ext[1]])), 4)
        }
        127 => {
            let Some(ext) = buf.get(2..10) else {
                return Ok(None);
            };
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(ext);
            let len = u64::from_be_bytes(bytes);
            if len & (1 << 63) != 0 {
                return Err(ProtocolError::FrameTooLarge(len));
            }
            (len, 10)
        }
        n => (u64::from(n), 2),
    };

    let mask = if masked {
        let Some(key) = buf.get(header_len..header_len + 4) else {
            return Ok(None);
        };
        header_len += 4;
        Some([key[0], key[1], key[2], key[3]])
    } else {
        None
    };

    Ok(Some(FrameHeader {
        fin,
        opcode,
        mask,
        header_len,
        payload_len,
    }))
}

/// Per-connection WebSocket state: handshake flag, framed-length cache and
/// the fragment accumulator.
#[derive(Debug, Clone)]
pub struct WebSocketCodec {
    max_frame: usize,
    handshaken: bool,
    pending_len: Option<usize>,
    partial: Option<Vec<u8>>,
}

impl WebSocketCodec {
    /// A codec waiting for the HTTP Upgrade request. Frames (and reassembled
    /// messages) longer than `max_frame` bytes are rejected.
    pub fn new(max_frame: usize) -> Self {
        Self {
            max_frame,
            handshaken: false,
            pending_len: None,
            partial: None,
        }
    }

    /// A codec that already completed its handshake.
    pub fn upgraded(max_frame: usize) -> Self {
        Self {
            handshaken: true,
            ..Self::new(max_frame)
        }
    }

    pub fn is_handshaken(&self) -> bool {
        self.handshaken
    }

    /// True while a fragmented message is being reassembled.
    pub fn is_fragmented(&self) -> bool {
        self.partial.is_some()
    }

    fn handshake(&mut self, buf: &[u8]) -> Result<Input, ProtocolError> {
        let start = &buf[..buf.len().min(4)];
        if !b"GET ".starts_with(start) {
            return Err(ProtocolError::InvalidHandshake("not a GET request"));
        }
        let Some(pos) = find_header_end(buf) else {
            if buf.len() > self.max_frame {
                return Err(ProtocolError::PayloadTooLarge(buf.len()));
            }
            return Ok(Input::Incomplete);
        };

        let head = &buf[..pos];
        let request_line = head.split(|&b| b == b'\r').next().unwrap_or_default();
        let mut parts = request_line.split(|&b| b == b' ');
        let (Some(b"GET"), Some(uri), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ProtocolError::InvalidHandshake("malformed request line"));
        };
        if uri.is_empty() || !version.starts_with(b"HTTP/1.") {
            return Err(ProtocolError::InvalidHandshake("malformed request line"));
        }

        let key = raw_header(head, "Sec-WebSocket-Key")
            .filter(|k| !k.is_empty())
            .ok_or(ProtocolError::InvalidHandshake("missing Sec-WebSocket-Key"))?;
        let key = std::str::from_utf8(key)
            .map_err(|_| ProtocolError::InvalidHandshake("Sec-WebSocket-Key is not ASCII"))?;

        let response = HttpResponse::new(101)
            .header("Upgrade", "websocket")
            .header("Connection", "Upgrade")
            .header("Sec-WebSocket-Accept", compute_accept_key(key))
            .to_bytes();

        self.handshaken = true;
        Ok(Input::Upgrade {
            consumed: pos + 4,
            response,
        })
    }
}

impl Codec for WebSocketCodec {
    fn input(&mut self, buf: &[u8]) -> Result<Input, ProtocolError> {
        if !self.handshaken {
            return self.handshake(buf);
        }

        if let Some(len) = self.pending_len {
            if buf.len() < len {
                return Ok(Input::Incomplete);
            }
            self.pending_len = None;
            return Ok(Input::Frame(len));
        }

        let Some(header) = parse_header(buf)? else {
            return Ok(Input::Incomplete);
        };
        let total = header.header_len as u64 + header.payload_len;
        if total > self.max_frame as u64 {
            return Err(ProtocolError::FrameTooLarge(header.payload_len));
        }
        let total = total as usize;
        if total > buf.len() {
            self.pending_len = Some(total);
            return Ok(Input::Incomplete);
        }
        Ok(Input::Frame(total))
    }

    fn decode(&mut self, frame: &[u8]) -> Result<Option<Inbound>, ProtocolError> {
        let header = parse_header(frame)?
            .ok_or(ProtocolError::InvalidControlFrame("truncated frame header"))?;
        let start = header.header_len;
        let end = start + header.payload_len as usize;
        let mut payload = frame
            .get(start..end)
            .ok_or(ProtocolError::InvalidControlFrame("truncated frame payload"))?
            .to_vec();
        if let Some(mask) = header.mask {
            apply_mask(&mut payload, mask);
        }

        if header.opcode.is_control() {
            if !header.fin || payload.len() > 125 {
                return Err(ProtocolError::InvalidControlFrame(
                    "control frames must be final and at most 125 bytes",
                ));
            }
            return Ok(Some(match header.opcode {
                Opcode::Close => Inbound::Close,
                Opcode::Ping => Inbound::Ping(payload),
                _ => Inbound::Pong(payload),
            }));
        }

        let message = match self.partial.take() {
            Some(mut acc) => {
                acc.extend_from_slice(&payload);
                if acc.len() > self.max_frame {
                    return Err(ProtocolError::FrameTooLarge(acc.len() as u64));
                }
                acc
            }
            None => payload,
        };

        if header.fin {
            Ok(Some(Inbound::Message(message)))
        } else {
            self.partial = Some(message);
            Ok(None)
        }
    }

    fn encode(&self, payload: Payload) -> Vec<u8> {
        match payload {
            Payload::Message(bytes) => encode_frame(Opcode::Text, &bytes),
            Payload::Response(response) => response.to_bytes(),
            Payload::Raw(bytes) => bytes,
        }
    }
}
