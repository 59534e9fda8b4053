use std::io;

use thiserror::Error;

/// Central error type for the Etude engine.
#[derive(Debug, Error)]
pub enum EtudeError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid listener address or server configuration. Raised before any
    /// socket is created.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed wire data on a connection.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Shared counter store failure.
    #[error("Shared store error: {0}")]
    Store(#[from] StoreError),

    /// Connection set reached its maximum capacity.
    #[error("Connection slab is full")]
    SlabFull,

    /// A server with the same store key already records a live pid.
    #[error("Server already running with pid {0}")]
    AlreadyRunning(i32),

    /// A control command found no running server.
    #[error("Server is not running")]
    NotRunning,
}

/// Wire-level failures detected by a codec or by the receive path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("bad request: {0}")]
    BadRequest(&'static str),

    #[error("request of {0} bytes exceeds the receive buffer")]
    PayloadTooLarge(usize),

    #[error("receive buffer exceeded {0} bytes")]
    BufferOverflow(usize),

    #[error("invalid websocket handshake: {0}")]
    InvalidHandshake(&'static str),

    #[error("invalid websocket opcode {0:#x}")]
    InvalidOpcode(u8),

    #[error("websocket frame of {0} bytes exceeds the receive buffer")]
    FrameTooLarge(u64),

    #[error("invalid control frame: {0}")]
    InvalidControlFrame(&'static str),
}

impl ProtocolError {
    /// HTTP status used when the error is answered inside a request context.
    pub fn status_code(&self) -> u16 {
        match self {
            ProtocolError::PayloadTooLarge(_) => 413,
            _ => 400,
        }
    }
}

/// Failures of the shared counter store.
///
/// Variants carry no heap data so the store stays usable right after `fork`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("value is not an integer")]
    NotInteger,

    #[error("counter name exceeds {0} bytes")]
    KeyTooLong(usize),

    #[error("no free counter slot")]
    Full,

    #[error("mutex operation failed with code {0}")]
    Lock(i32),

    #[error("segment is not initialised")]
    NotInitialized,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type EtudeResult<T> = Result<T, EtudeError>;
pub type StoreResult<T> = Result<T, StoreError>;
