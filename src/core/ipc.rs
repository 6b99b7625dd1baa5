//! Wire contract between the supervisor and its workers
//!
//! Messages are newline-delimited JSON objects tagged by `type`. The
//! supervisor writes to the child's stdin, the child answers on its stdout.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable carrying [`WorkerOptions`] into each child
pub const WORKER_OPTIONS_ENV: &str = "STICKY_POOL_WORKER_OPTIONS";

/// Supervisor to worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SupervisorMessage {
    /// Exit gracefully within `time` milliseconds
    Die { time: u64 },
}

impl SupervisorMessage {
    pub fn die(grace: Duration) -> Self {
        SupervisorMessage::Die {
            time: grace.as_millis() as u64,
        }
    }
}

/// Bound listening address reported by a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenAddr {
    pub port: u16,
}

/// Worker to supervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerMessage {
    /// The worker is listening and ready for traffic
    Addr { addr: ListenAddr },
    /// Liveness check; the supervisor only has to keep its end open
    Ping,
}

impl WorkerMessage {
    pub fn addr(port: u16) -> Self {
        WorkerMessage::Addr {
            addr: ListenAddr { port },
        }
    }
}

/// Settings handed to every worker at spawn time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerOptions {
    pub assume_ready: bool,
    #[serde(default)]
    pub ping_interval_ms: Option<u64>,
    #[serde(default)]
    pub title: Option<String>,
    pub worker_index: u64,
}

impl WorkerOptions {
    pub fn ping_interval(&self) -> Option<Duration> {
        self.ping_interval_ms.map(Duration::from_millis)
    }
}

/// Encode one message as a single wire line, newline included
pub fn encode_line<T: Serialize>(message: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}
