//! Logging initialisation for Etude binaries.
//!
//! The engine only emits `tracing` events. Nothing is printed until a
//! subscriber is installed, which is the job of the binary embedding the
//! engine:
//!
//! ```rust,no_run
//! use etude_core::{Server, logging::init_logging};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     init_logging();
//!     Server::bind("http://0.0.0.0:8080")?.run()?;
//!     Ok(())
//! }
//! ```
//!
//! The level is read from `RUST_LOG`:
//!
//! ```bash
//! RUST_LOG=etude_core=debug etude start http://0.0.0.0:8080
//! ```
//!
//! Worker processes inherit the subscriber installed in the supervisor
//! because they are forked from it.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a plain text subscriber, `info` unless `RUST_LOG` says otherwise.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_logging() {
    init_logging_with_level("info");
}

/// Install a plain text subscriber with `level` as the fallback filter.
///
/// `RUST_LOG` still takes precedence when set.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_logging_with_level(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

/// Install a JSON subscriber for log aggregation.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_logging_json() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}
