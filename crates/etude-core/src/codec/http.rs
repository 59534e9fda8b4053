//! HTTP/1.1 subset: fixed-length requests, no chunked transfer-encoding.

use super::{Codec, Inbound, Input, Payload};
use crate::error::ProtocolError;
use memchr::memmem;

const HEADER_END: &[u8] = b"\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
    Trace,
    Connect,
    Unknown,
}

impl Method {
    pub fn from_bytes(b: &[u8]) -> Self {
        match b {
            b"GET" => Method::Get,
            b"POST" => Method::Post,
            b"PUT" => Method::Put,
            b"DELETE" => Method::Delete,
            b"PATCH" => Method::Patch,
            b"HEAD" => Method::Head,
            b"OPTIONS" => Method::Options,
            b"TRACE" => Method::Trace,
            b"CONNECT" => Method::Connect,
            _ => Method::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
            Method::Unknown => "UNKNOWN",
        }
    }
}

/// A decoded request. Header order and name casing are kept as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub uri: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Case-insensitive header lookup; the first match wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The URI without its query string.
    pub fn path(&self) -> &str {
        self.uri.split_once('?').map_or(&self.uri, |(p, _)| p)
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.split_once('?').map(|(_, q)| q)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub version: String,
    pub code: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(code: u16) -> Self {
        Self {
            version: "HTTP/1.1".to_string(),
            code,
            reason: reason_phrase(code).to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.headers.push((name.into(), value.to_string()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Status line, headers, blank line, body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.headers.len() * 32 + self.body.len());
        out.extend_from_slice(self.version.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.code.to_string().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.reason.as_bytes());
        out.extend_from_slice(b"\r\n");
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        102 => "Processing",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        203 => "Non-Authoritative Information",
        204 => "No Content",
        205 => "Reset Content",
        206 => "Partial Content",
        207 => "Multi-Status",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        305 => "Use Proxy",
        306 => "Unused",
        307 => "Temporary Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        408 => "Request Time-out",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Request Entity Too Large",
        414 => "Request-URI Too Large",
        415 => "Unsupported Media Type",
        416 => "Requested range not satisfiable",
        417 => "Expectation Failed",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Time-out",
        505 => "HTTP Version not supported",
        _ => "Unknown",
    }
}

/// Stateless request framer and parser.
#[derive(Debug, Clone)]
pub struct HttpCodec {
    max_request: usize,
}

impl HttpCodec {
    pub fn new(max_request: usize) -> Self {
        Self { max_request }
    }
}

/// Position of the `\r\n\r\n` separator.
pub(crate) fn find_header_end(buf: &[u8]) -> Option<usize> {
    memmem::find(buf, HEADER_END)
}

/// Value of `name` in a raw header block (request line first), matched
/// case-insensitively.
pub(crate) fn raw_header<'a>(head: &'a [u8], name: &str) -> Option<&'a [u8]> {
    head.split(|&b| b == b'\n').skip(1).find_map(|line| {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let colon = memchr::memchr(b':', line)?;
        let (key, value) = line.split_at(colon);
        key.eq_ignore_ascii_case(name.as_bytes())
            .then(|| value[1..].trim_ascii())
    })
}

impl Codec for HttpCodec {
    fn input(&mut self, buf: &[u8]) -> Result<Input, ProtocolError> {
        let Some(pos) = find_header_end(buf) else {
            if buf.len() > self.max_request {
                return Err(ProtocolError::PayloadTooLarge(buf.len()));
            }
            return Ok(Input::Incomplete);
        };

        let body_len = match raw_header(&buf[..pos], "Content-Length") {
            None => 0,
            Some(v) if v.is_empty() => 0,
            Some(v) => std::str::from_utf8(v)
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .ok_or(ProtocolError::BadRequest("invalid Content-Length"))?,
        };

        let total = (pos + HEADER_END.len())
            .checked_add(body_len)
            .ok_or(ProtocolError::PayloadTooLarge(usize::MAX))?;
        if total > self.max_request {
            return Err(ProtocolError::PayloadTooLarge(total));
        }
        if total > buf.len() {
            return Ok(Input::Incomplete);
        }
        Ok(Input::Frame(total))
    }

    fn decode(&mut self, frame: &[u8]) -> Result<Option<Inbound>, ProtocolError> {
        let pos = find_header_end(frame).ok_or(ProtocolError::BadRequest("incomplete header"))?;
        let head = std::str::from_utf8(&frame[..pos])
            .map_err(|_| ProtocolError::BadRequest("header is not valid UTF-8"))?;
        let body = frame[pos + HEADER_END.len()..].to_vec();

        let mut lines = head.split("\r\n");
        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split(' ');
        let (Some(method), Some(uri), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ProtocolError::BadRequest("malformed request line"));
        };
        if method.is_empty() || uri.is_empty() {
            return Err(ProtocolError::BadRequest("malformed request line"));
        }
        if version != "HTTP/1.1" && version != "HTTP/1.0" {
            return Err(ProtocolError::BadRequest("unsupported HTTP version"));
        }

        let mut headers = Vec::new();
        for line in lines {
            let (name, value) = line
                .split_once(": ")
                .ok_or(ProtocolError::BadRequest("malformed header line"))?;
            headers.push((name.to_string(), value.to_string()));
        }

        Ok(Some(Inbound::Request(HttpRequest {
            method: Method::from_bytes(method.as_bytes()),
            uri: uri.to_string(),
            version: version.to_string(),
            headers,
            body,
        })))
    }

    fn encode(&self, payload: Payload) -> Vec<u8> {
        match payload {
            Payload::Response(response) => response.to_bytes(),
            Payload::Message(bytes) | Payload::Raw(bytes) => bytes,
        }
    }
}
