// src/lib.rs
pub mod codec;
pub mod config;
pub mod conn;
pub mod error;
pub mod event_loop;
pub mod logging;
pub mod responder;
pub mod shm;
pub mod site;
pub mod slab;
pub mod status;
pub mod supervisor;
pub mod syscalls;
pub mod worker;

// Re-exports for users
pub use codec::{Codec, HttpRequest, HttpResponse, Inbound, Method, Payload, Protocol};
pub use config::{HostConfig, ListenAddr, ServerConfig};
pub use conn::ConnectionHandle;
pub use error::{EtudeError, EtudeResult, ProtocolError, StoreError};
pub use event_loop::{EventLoop, Interest, TimerId, TimerKind};
pub use shm::{SharedCounters, Value};
pub use site::{GuessMime, HostResolver, MimeResolver, StaticSite, VirtualHosts};
pub use status::StatusSnapshot;
pub use supervisor::Server;
pub use worker::{Handlers, Worker, WorkerSettings};
