//! Server status counters and their report.

use crate::error::{EtudeError, EtudeResult};
use crate::shm::SharedCounters;
use serde::Serialize;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub const PID: &str = "pid";
pub const START_AT: &str = "start_at";
pub const WORKERS: &str = "workers";
pub const CURRENT_CONNECTIONS: &str = "current_connections";
pub const FAILED_CONNECTIONS: &str = "failed_connections";
pub const TOTAL_CONNECTIONS: &str = "total_connections";

/// Every counter the supervisor publishes, in report order.
pub const ALL: [&str; 6] = [
    PID,
    START_AT,
    WORKERS,
    CURRENT_CONNECTIONS,
    FAILED_CONNECTIONS,
    TOTAL_CONNECTIONS,
];

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub pid: i64,
    /// Seconds since the supervisor started.
    pub runtime: i64,
    pub workers: i64,
    pub current_connections: i64,
    pub failed_connections: i64,
    pub total_connections: i64,
}

impl StatusSnapshot {
    /// Read all counters. Fails with `NotRunning` when no pid is recorded.
    pub fn read(counters: &SharedCounters) -> EtudeResult<Self> {
        let int = |name: &str| counters.get(name).and_then(|v| v.as_int()).unwrap_or(0);
        let pid = int(PID);
        if pid == 0 {
            return Err(EtudeError::NotRunning);
        }
        let start_at = int(START_AT);
        Ok(Self {
            pid,
            runtime: (unix_now() - start_at).max(0),
            workers: int(WORKERS),
            current_connections: int(CURRENT_CONNECTIONS),
            failed_connections: int(FAILED_CONNECTIONS),
            total_connections: int(TOTAL_CONNECTIONS),
        })
    }
}

impl fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID: {}\r\n", self.pid)?;
        write!(f, "Runtime: {}\r\n", self.runtime)?;
        write!(f, "Workers: {}\r\n", self.workers)?;
        write!(f, "Current Connections: {}\r\n", self.current_connections)?;
        write!(f, "Failed Connections: {}\r\n", self.failed_connections)?;
        // Label has no colon in the established report format.
        write!(f, "Total Connections {}\r\n", self.total_connections)
    }
}
