//! Core abstractions for supervising a pool of worker processes
//!
//! - Worker handle and its lifecycle state machine
//! - Pool orchestration: sizing, respawn policy, reloads, round robin
//! - The spawn primitive and the supervisor/worker wire contract

pub mod error;
pub mod ipc;
pub mod pool;
pub mod spawner;
pub mod worker;

pub use error::{ProcessError, ProcessResult};
pub use ipc::{ListenAddr, SupervisorMessage, WorkerMessage, WorkerOptions, WORKER_OPTIONS_ENV};
pub use pool::{PoolConfig, PoolEvent, PoolSnapshot, ReloadCallback, WorkerPool, WorkerSummary};
pub use spawner::{CommandSpawner, Spawner, WorkerCommand, WorkerProcess};
pub use worker::{Transition, WorkerEvent, WorkerEventKind, WorkerHandle, WorkerId, WorkerState};
