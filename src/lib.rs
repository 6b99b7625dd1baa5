pub mod config;
pub mod core;
pub mod logging;
pub mod policies;
pub mod router;
pub mod server;
pub mod supervisor;
pub mod worker_runtime;

pub use crate::config::{AllocatorConfig, ConfigError, ConfigResult, SupervisorConfig};
pub use crate::core::{PoolConfig, PoolEvent, WorkerId, WorkerPool, WorkerState};
pub use crate::router::{Route, RouteError, Router};
pub use crate::supervisor::{start, SupervisorHandle};
