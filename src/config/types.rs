use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::{ConfigError, ConfigResult};
use crate::core::{CommandSpawner, PoolConfig, WorkerCommand};
use crate::policies::DEFAULT_COOKIE_NAME;

/// Environment variable selecting development defaults
pub const ENVIRONMENT_VAR: &str = "STICKY_POOL_ENV";

const DEV_SHUTDOWN_GRACE: Duration = Duration::from_millis(500);
const PROD_SHUTDOWN_GRACE: Duration = Duration::from_secs(10 * 60);
const DEFAULT_MIN_EXPECTED_LIFETIME: Duration = Duration::from_secs(20);
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(60);

/// Deployment flavour, only affects defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn from_env() -> Self {
        match std::env::var(ENVIRONMENT_VAR).as_deref() {
            Ok("development") => Environment::Development,
            _ => Environment::Production,
        }
    }
}

/// How session tokens are extracted from requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocatorConfig {
    /// Token kept in a cookie, minted on first contact
    Cookie { name: String },
    /// socket.io long-polling URL preset
    SocketIo,
    /// SockJS URL preset
    SockJs,
    /// Custom URL regex, first capture group is the token
    Pattern(String),
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        AllocatorConfig::Cookie {
            name: DEFAULT_COOKIE_NAME.to_string(),
        }
    }
}

impl FromStr for AllocatorConfig {
    type Err = std::convert::Infallible;

    /// `cookie`, `cookie:<name>`, `socket.io`, `sockjs`, or a regex
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "cookie" => AllocatorConfig::default(),
            "socket.io" => AllocatorConfig::SocketIo,
            "sockjs" => AllocatorConfig::SockJs,
            other => match other.strip_prefix("cookie:") {
                Some(name) if !name.is_empty() => AllocatorConfig::Cookie {
                    name: name.to_string(),
                },
                _ => AllocatorConfig::Pattern(other.to_string()),
            },
        })
    }
}

impl fmt::Display for AllocatorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocatorConfig::Cookie { name } => write!(f, "cookie:{}", name),
            AllocatorConfig::SocketIo => write!(f, "socket.io"),
            AllocatorConfig::SockJs => write!(f, "sockjs"),
            AllocatorConfig::Pattern(pattern) => write!(f, "{}", pattern),
        }
    }
}

/// Pool size, either fixed or relative to the number of CPUs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCount {
    Fixed(usize),
    Cpus,
    CpusTimes(usize),
    CpusDiv(usize),
    CpusPlus(usize),
    CpusMinus(usize),
}

impl WorkerCount {
    /// Concrete count for a machine with `cpus` cores
    ///
    /// Expressions over `cpus` that fall below one on a small machine are
    /// raised to one; a literal zero is rejected when parsing.
    pub fn resolve(self, cpus: usize) -> usize {
        let count = match self {
            WorkerCount::Fixed(n) => n,
            WorkerCount::Cpus => cpus,
            WorkerCount::CpusTimes(n) => cpus.saturating_mul(n),
            WorkerCount::CpusDiv(n) => cpus / n,
            WorkerCount::CpusPlus(n) => cpus.saturating_add(n),
            WorkerCount::CpusMinus(n) => cpus.saturating_sub(n),
        };
        count.max(1)
    }
}

impl FromStr for WorkerCount {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        let invalid = |reason: &str| ConfigError::InvalidWorkerCount {
            expr: s.to_string(),
            reason: reason.to_string(),
        };

        let expr: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        if let Ok(n) = expr.parse::<usize>() {
            if n == 0 {
                return Err(invalid("a pool needs at least one worker"));
            }
            return Ok(WorkerCount::Fixed(n));
        }

        let Some(rest) = expr.strip_prefix("cpus") else {
            return Err(invalid("expected a number or an expression over 'cpus'"));
        };
        if rest.is_empty() {
            return Ok(WorkerCount::Cpus);
        }

        let mut chars = rest.chars();
        let op = chars.next();
        let operand = chars
            .as_str()
            .parse::<usize>()
            .map_err(|_| invalid("operand must be a non-negative integer"))?;
        match op {
            Some('*') if operand == 0 => Err(invalid("a pool needs at least one worker")),
            Some('*') => Ok(WorkerCount::CpusTimes(operand)),
            Some('/') if operand == 0 => Err(invalid("division by zero")),
            Some('/') => Ok(WorkerCount::CpusDiv(operand)),
            Some('+') => Ok(WorkerCount::CpusPlus(operand)),
            Some('-') => Ok(WorkerCount::CpusMinus(operand)),
            _ => Err(invalid("operator must be one of * / + -")),
        }
    }
}

/// Number of cores available to this process
pub fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Parse a human duration such as `500ms`, `10m` or `20s`; bare integers
/// are milliseconds
pub fn parse_duration(value: &str) -> ConfigResult<Duration> {
    let value = value.trim();
    if let Ok(ms) = value.parse::<u64>() {
        return Ok(Duration::from_millis(ms));
    }
    humantime::parse_duration(value).map_err(|e| ConfigError::InvalidDuration {
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// Everything the supervisor needs to run a pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// What each worker process runs
    pub worker: WorkerCommand,
    pub num_workers: usize,
    /// Grace period given to workers told to exit; zero disables
    /// overlapping reloads
    pub worker_shutdown_grace: Duration,
    pub keep_alive: bool,
    pub min_expected_lifetime: Duration,
    /// `None` disables worker liveness pings
    pub worker_ping_interval: Option<Duration>,
    pub allocator: AllocatorConfig,
    /// Workers are ready as soon as they listen, without an explicit signal
    pub assume_ready: bool,
    /// Process title prefix: workers run as `<title> worker` and log lines
    /// carry `<title> master`
    pub title: Option<String>,
    /// Forced kill after grace + this; `None` lets terminating workers linger
    pub kill_timeout: Option<Duration>,
}

impl SupervisorConfig {
    /// Defaults for the environment named by `STICKY_POOL_ENV`
    pub fn new(worker: WorkerCommand) -> Self {
        Self::for_environment(worker, Environment::from_env())
    }

    pub fn for_environment(worker: WorkerCommand, environment: Environment) -> Self {
        let (num_workers, worker_shutdown_grace) = match environment {
            Environment::Development => (1, DEV_SHUTDOWN_GRACE),
            Environment::Production => (available_cpus(), PROD_SHUTDOWN_GRACE),
        };
        Self {
            worker,
            num_workers,
            worker_shutdown_grace,
            keep_alive: false,
            min_expected_lifetime: DEFAULT_MIN_EXPECTED_LIFETIME,
            worker_ping_interval: Some(DEFAULT_PING_INTERVAL),
            allocator: AllocatorConfig::default(),
            assume_ready: true,
            title: None,
            kill_timeout: None,
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            desired: self.num_workers,
            shutdown_grace: self.worker_shutdown_grace,
            keep_alive: self.keep_alive,
            min_expected_lifetime: self.min_expected_lifetime,
            kill_timeout: self.kill_timeout,
        }
    }

    pub fn spawner(&self) -> CommandSpawner {
        CommandSpawner::new(self.worker.clone())
            .assume_ready(self.assume_ready)
            .ping_interval(self.worker_ping_interval)
            .title(self.title.clone())
    }
}
