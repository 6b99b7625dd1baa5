//! Worker handle and its lifecycle state machine
//!
//! ```text
//! Spawning ──addr──▶ Spawned ──shutdown──▶ Terminating ──exit──▶ Terminated
//!    │  └──shutdown (kill)──────────────────────▲                  ▲
//!    └──exit──────────────────────────────────────────────────────┘
//!                     Spawned ──exit──────────────────────────────┘
//! ```

use std::fmt;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::Instant;

use super::ipc::{SupervisorMessage, WorkerMessage};
use super::spawner::WorkerProcess;

/// Supervisor-local worker identifier, unique for the life of the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u64);

impl WorkerId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    /// Process created, no port reported yet
    Spawning,
    /// Listening on its port, eligible for routing
    Spawned,
    /// Shutdown requested, no longer routable
    Terminating,
    /// Process exited
    Terminated,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Spawning => write!(f, "spawning"),
            WorkerState::Spawned => write!(f, "spawned"),
            WorkerState::Terminating => write!(f, "terminating"),
            WorkerState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Something that happened to a worker process, as reported by its spawner
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerEvent {
    pub worker: WorkerId,
    pub kind: WorkerEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEventKind {
    /// A protocol message arrived on the worker channel
    Message(WorkerMessage),
    /// The process is gone
    Exited { code: Option<i32> },
    /// The grace period plus kill timeout of a terminating worker elapsed
    KillDeadline,
}

impl WorkerEvent {
    pub fn message(worker: WorkerId, message: WorkerMessage) -> Self {
        Self {
            worker,
            kind: WorkerEventKind::Message(message),
        }
    }

    pub fn exited(worker: WorkerId, code: Option<i32>) -> Self {
        Self {
            worker,
            kind: WorkerEventKind::Exited { code },
        }
    }

    pub fn kill_deadline(worker: WorkerId) -> Self {
        Self {
            worker,
            kind: WorkerEventKind::KillDeadline,
        }
    }
}

/// Lifecycle notification produced by every state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub worker: WorkerId,
    pub from: WorkerState,
    pub to: WorkerState,
}

/// One supervised worker process
pub struct WorkerHandle {
    id: WorkerId,
    pid: Option<u32>,
    state: WorkerState,
    port: Option<u16>,
    birth: Instant,
    process: Box<dyn WorkerProcess>,
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("state", &self.state)
            .field("port", &self.port)
            .finish()
    }
}

impl fmt::Display for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pid {
            Some(pid) => write!(f, "{} (pid {})", self.id, pid),
            None => write!(f, "{}", self.id),
        }
    }
}

impl WorkerHandle {
    /// Wrap a freshly spawned process; the handle starts in `Spawning`
    pub fn new(id: WorkerId, process: Box<dyn WorkerProcess>) -> Self {
        Self {
            id,
            pid: process.pid(),
            state: WorkerState::Spawning,
            port: None,
            birth: Instant::now(),
            process,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn age(&self) -> Duration {
        self.birth.elapsed()
    }

    fn transition(&mut self, to: WorkerState) -> Transition {
        let from = std::mem::replace(&mut self.state, to);
        Transition {
            worker: self.id,
            from,
            to,
        }
    }

    /// Apply a message received from the worker
    pub fn on_message(&mut self, message: WorkerMessage) -> Option<Transition> {
        match message {
            WorkerMessage::Addr { addr } => {
                if self.state != WorkerState::Spawning {
                    debug!(
                        "Ignoring late listening report from worker {} in state {}",
                        self, self.state
                    );
                    return None;
                }
                info!("Worker {} listening on port {}", self, addr.port);
                self.port = Some(addr.port);
                Some(self.transition(WorkerState::Spawned))
            }
            WorkerMessage::Ping => None,
        }
    }

    /// Ask the worker to go away
    ///
    /// A spawned worker is told to exit within `grace`; a worker that is
    /// still spawning holds no bound port and is killed outright.
    pub fn shutdown(&mut self, grace: Duration) -> Option<Transition> {
        match self.state {
            WorkerState::Spawned => {
                debug!("Telling worker {} to exit in {}ms", self, grace.as_millis());
                if let Err(e) = self.process.send(&SupervisorMessage::die(grace)) {
                    warn!("Failed to deliver shutdown to worker {}: {}", self, e);
                }
                Some(self.transition(WorkerState::Terminating))
            }
            WorkerState::Spawning => {
                debug!("Killing spawning worker {}", self);
                if let Err(e) = self.process.kill() {
                    warn!("{}", e);
                }
                Some(self.transition(WorkerState::Terminating))
            }
            WorkerState::Terminating | WorkerState::Terminated => None,
        }
    }

    /// Kill a worker that outlived its shutdown window
    pub fn force_kill(&mut self) {
        if self.state == WorkerState::Terminating {
            warn!("Worker {} ignored its shutdown window, killing it", self);
            if let Err(e) = self.process.kill() {
                warn!("{}", e);
            }
        }
    }

    /// Apply the exit of the underlying process
    pub fn on_exit(&mut self, code: Option<i32>) -> Option<Transition> {
        match self.state {
            WorkerState::Terminated => None,
            WorkerState::Terminating => {
                debug!("Worker {} exited with code {:?}", self, code);
                Some(self.transition(WorkerState::Terminated))
            }
            WorkerState::Spawning | WorkerState::Spawned => {
                warn!(
                    "Worker {} exited unexpectedly while {} (code {:?})",
                    self, self.state, code
                );
                Some(self.transition(WorkerState::Terminated))
            }
        }
    }
}
