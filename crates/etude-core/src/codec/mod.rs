//! Wire protocols. A codec frames bytes (`input`), parses complete frames
//! (`decode`) and serializes outbound payloads (`encode`).

pub mod http;
pub mod websocket;

pub use http::{HttpCodec, HttpRequest, HttpResponse, Method};
pub use websocket::{Opcode, WebSocketCodec};

use crate::error::{EtudeError, EtudeResult, ProtocolError};

/// Result of framing the head of a receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// Need more bytes.
    Incomplete,
    /// The first `n` bytes form one complete frame.
    Frame(usize),
    /// Handshake accepted: drop `consumed` bytes and send `response` before
    /// anything else.
    Upgrade { consumed: usize, response: Vec<u8> },
}

/// A decoded inbound unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Request(HttpRequest),
    Message(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

/// Something to put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Application message; framed by WebSocket, sent verbatim by HTTP.
    Message(Vec<u8>),
    Response(HttpResponse),
    /// Bypasses framing.
    Raw(Vec<u8>),
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Message(s.as_bytes().to_vec())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Message(s.into_bytes())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Message(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Payload::Message(bytes.to_vec())
    }
}

impl From<HttpResponse> for Payload {
    fn from(response: HttpResponse) -> Self {
        Payload::Response(response)
    }
}

pub trait Codec {
    /// Frame the head of `buf`. A returned `Frame(n)` never exceeds `buf.len()`.
    fn input(&mut self, buf: &[u8]) -> Result<Input, ProtocolError>;

    /// Parse one complete frame. `Ok(None)` for frames that carry no
    /// deliverable unit yet (non-final fragments).
    fn decode(&mut self, frame: &[u8]) -> Result<Option<Inbound>, ProtocolError>;

    fn encode(&self, payload: Payload) -> Vec<u8>;
}

/// Listener protocol, chosen by the scheme of the listen address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http,
    WebSocket,
}

impl Protocol {
    pub fn from_scheme(scheme: &str) -> EtudeResult<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "ws" => Ok(Protocol::WebSocket),
            other => Err(EtudeError::Config(format!(
                "unsupported protocol scheme `{other}`"
            ))),
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::WebSocket => "ws",
        }
    }

    /// Fresh per-connection codec state.
    pub fn codec(&self, max_frame: usize) -> CodecState {
        match self {
            Protocol::Http => CodecState::Http(HttpCodec::new(max_frame)),
            Protocol::WebSocket => CodecState::WebSocket(WebSocketCodec::new(max_frame)),
        }
    }
}

/// Per-connection codec.
#[derive(Debug, Clone)]
pub enum CodecState {
    Http(HttpCodec),
    WebSocket(WebSocketCodec),
}

impl CodecState {
    pub fn protocol(&self) -> Protocol {
        match self {
            CodecState::Http(_) => Protocol::Http,
            CodecState::WebSocket(_) => Protocol::WebSocket,
        }
    }
}

impl Codec for CodecState {
    fn input(&mut self, buf: &[u8]) -> Result<Input, ProtocolError> {
        match self {
            CodecState::Http(c) => c.input(buf),
            CodecState::WebSocket(c) => c.input(buf),
        }
    }

    fn decode(&mut self, frame: &[u8]) -> Result<Option<Inbound>, ProtocolError> {
        match self {
            CodecState::Http(c) => c.decode(frame),
            CodecState::WebSocket(c) => c.decode(frame),
        }
    }

    fn encode(&self, payload: Payload) -> Vec<u8> {
        match self {
            CodecState::Http(c) => c.encode(payload),
            CodecState::WebSocket(c) => c.encode(payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_from_scheme() {
        assert_eq!(Protocol::from_scheme("http").unwrap(), Protocol::Http);
        assert_eq!(Protocol::from_scheme("WS").unwrap(), Protocol::WebSocket);
        assert!(matches!(
            Protocol::from_scheme("gopher"),
            Err(EtudeError::Config(_))
        ));
    }

    #[test]
    fn test_codec_state_dispatch() {
        let state = Protocol::WebSocket.codec(1024);
        assert_eq!(state.protocol(), Protocol::WebSocket);
        assert_eq!(state.encode("hi".into()), vec![0x81, 2, b'h', b'i']);

        let state = Protocol::Http.codec(1024);
        assert_eq!(state.encode("hi".into()), b"hi".to_vec());
    }
}
