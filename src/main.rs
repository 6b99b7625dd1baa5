use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Parser};
use log::{info, warn, LevelFilter};
use sticky_pool::config::{
    available_cpus, parse_duration, AllocatorConfig, ConfigError, ConfigResult, ConfigValidator,
    SupervisorConfig, WorkerCount,
};
use sticky_pool::core::WorkerCommand;
use sticky_pool::logging::{init_logging, LoggingConfig};
use sticky_pool::policies::AllocatorFactory;
use sticky_pool::server::{self, AppState, ServerConfig};
use sticky_pool::{Router, SupervisorHandle};

#[derive(Parser, Debug)]
#[command(name = "sticky-pool")]
#[command(about = "Supervise a pool of worker processes and balance HTTP traffic across them")]
#[command(long_about = r#"
Supervise a pool of worker processes and balance HTTP traffic across them

Each worker is started with its options in STICKY_POOL_WORKER_OPTIONS, binds
its own port and reports it as a JSON line on stdout. Requests carrying a
sticky token always reach the same worker while the pool size is stable.

Defaults follow STICKY_POOL_ENV: "development" runs one worker with a 500ms
shutdown grace; anything else runs one worker per core with a 10m grace.

Examples:
  # Four workers, cookie stickiness
  sticky-pool --num-workers 4 -- ./my-app --flag

  # socket.io session ids, replace crashed workers
  sticky-pool --allocator socket.io --keep-alive -- ./chat-server

SIGHUP or SIGUSR2 reloads the pool; Ctrl+C stops it.
"#)]
struct CliArgs {
    /// Host address to bind the distributor
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port number to bind the distributor
    #[arg(long, default_value_t = 3000)]
    port: u16,

    /// Worker count: an integer or an expression over cpus (e.g. "cpus", "cpus * 2", "cpus - 1")
    #[arg(long)]
    num_workers: Option<String>,

    /// Grace period for workers told to exit (e.g. "10m", "500ms"); 0 disables overlapping reloads
    #[arg(long)]
    worker_shutdown_grace: Option<String>,

    /// Replace workers that die unexpectedly
    #[arg(long, default_value_t = false)]
    keep_alive: bool,

    /// Workers dying younger than this are not replaced
    #[arg(long)]
    min_expected_lifetime: Option<String>,

    /// Interval between worker liveness pings
    #[arg(long)]
    worker_ping_interval: Option<String>,

    /// Disable worker liveness pings
    #[arg(long, default_value_t = false)]
    no_worker_ping: bool,

    /// Sticky allocator: "cookie", "cookie:NAME", "socket.io", "sockjs", or a regex with a capture group
    #[arg(long, default_value = "cookie")]
    allocator: String,

    /// Route to workers as soon as they listen; when false they must signal readiness
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    assume_ready: bool,

    /// Process title prefix; workers show up as "<title> worker"
    #[arg(long)]
    title: Option<String>,

    /// Kill workers still running this long after their grace period
    #[arg(long)]
    kill_timeout: Option<String>,

    /// Request timeout in seconds for proxied requests
    #[arg(long, default_value_t = 600)]
    request_timeout_secs: u64,

    /// Set the logging level
    #[arg(long, default_value = "info", value_parser = ["debug", "info", "warn", "error"])]
    log_level: String,

    /// Worker program followed by its arguments
    #[arg(required = true, num_args = 1.., trailing_var_arg = true, allow_hyphen_values = true)]
    worker: Vec<String>,
}

impl CliArgs {
    fn optional_duration(value: &Option<String>) -> ConfigResult<Option<Duration>> {
        value.as_deref().map(parse_duration).transpose()
    }

    /// Convert CLI arguments to SupervisorConfig
    fn to_supervisor_config(&self) -> ConfigResult<SupervisorConfig> {
        let Some((program, args)) = self.worker.split_first() else {
            return Err(ConfigError::MissingRequired {
                field: "worker".to_string(),
            });
        };
        let mut config = SupervisorConfig::new(WorkerCommand::new(program).args(args.iter().cloned()));

        if let Some(expr) = &self.num_workers {
            config.num_workers = expr.parse::<WorkerCount>()?.resolve(available_cpus());
        }
        if let Some(grace) = Self::optional_duration(&self.worker_shutdown_grace)? {
            config.worker_shutdown_grace = grace;
        }
        if let Some(lifetime) = Self::optional_duration(&self.min_expected_lifetime)? {
            config.min_expected_lifetime = lifetime;
        }
        if let Some(interval) = Self::optional_duration(&self.worker_ping_interval)? {
            config.worker_ping_interval = Some(interval);
        }
        if self.no_worker_ping {
            config.worker_ping_interval = None;
        }
        config.keep_alive = self.keep_alive;
        config.allocator = self.allocator.parse::<AllocatorConfig>().unwrap_or_default();
        config.assume_ready = self.assume_ready;
        config.title = self.title.clone();
        config.kill_timeout = Self::optional_duration(&self.kill_timeout)?;
        Ok(config)
    }

    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }

    fn level(&self) -> LevelFilter {
        match self.log_level.as_str() {
            "debug" => LevelFilter::Debug,
            "warn" => LevelFilter::Warn,
            "error" => LevelFilter::Error,
            _ => LevelFilter::Info,
        }
    }
}

#[cfg(unix)]
async fn reload_on_signal(supervisor: SupervisorHandle) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut hangup, mut user2) = match (signal(SignalKind::hangup()), signal(SignalKind::user_defined2())) {
        (Ok(hangup), Ok(user2)) => (hangup, user2),
        (Err(e), _) | (_, Err(e)) => {
            warn!("Reload signals unavailable: {}", e);
            return;
        }
    };
    loop {
        tokio::select! {
            Some(()) = hangup.recv() => {}
            Some(()) = user2.recv() => {}
            else => break,
        }
        info!("Reload requested");
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            match supervisor.reload().await {
                Ok(()) => info!("Reload complete"),
                Err(e) => warn!("Reload abandoned: {}", e),
            }
        });
    }
}

#[cfg(not(unix))]
async fn reload_on_signal(_supervisor: SupervisorHandle) {}

async fn run(server_config: ServerConfig, config: SupervisorConfig) -> anyhow::Result<()> {
    let allocator = AllocatorFactory::create(&config.allocator)?;
    let supervisor = sticky_pool::start(config.pool_config(), Arc::new(config.spawner()));
    info!(
        "Supervising {} worker(s) of {} with {} stickiness",
        config.num_workers,
        config.worker.program.display(),
        allocator.name()
    );

    let router = Router::new(allocator, supervisor.clone());
    let app_state = AppState::new(router, server_config.request_timeout)?;
    let server = server::build(server_config, app_state)?;
    let server_handle = server.handle();
    let mut server_task = actix_web::rt::spawn(server);
    tokio::spawn(reload_on_signal(supervisor.clone()));

    tokio::select! {
        result = &mut server_task => {
            result??;
            warn!("Distributor exited");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            server_handle.stop(true).await;
        }
    }
    supervisor.shutdown().await?;
    info!("All workers stopped");
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    let config = args.to_supervisor_config()?;
    ConfigValidator::validate(&config)?;

    init_logging(LoggingConfig {
        level: args.level(),
        title: config.title.as_ref().map(|title| format!("{} master", title)),
    });

    actix_web::rt::System::new().block_on(run(args.server_config(), config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_command_and_trailing_args() {
        let args = CliArgs::parse_from(["sticky-pool", "--num-workers", "3", "--", "./server", "app.toml", "--port", "0"]);
        let config = args.to_supervisor_config().unwrap();
        assert_eq!(config.worker.program.to_str(), Some("./server"));
        assert_eq!(config.worker.args, vec!["app.toml", "--port", "0"]);
        assert_eq!(config.num_workers, 3);
    }

    #[test]
    fn test_durations_and_flags() {
        let args = CliArgs::parse_from([
            "sticky-pool",
            "--worker-shutdown-grace",
            "0",
            "--kill-timeout",
            "5s",
            "--no-worker-ping",
            "--allocator",
            "sockjs",
            "--assume-ready",
            "false",
            "worker",
        ]);
        let config = args.to_supervisor_config().unwrap();
        assert_eq!(config.worker_shutdown_grace, Duration::ZERO);
        assert_eq!(config.kill_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.worker_ping_interval, None);
        assert_eq!(config.allocator, AllocatorConfig::SockJs);
        assert!(!config.assume_ready);
    }

    #[test]
    fn test_bad_worker_count_is_rejected() {
        for expr in ["cpus / 0", "0"] {
            let args = CliArgs::parse_from(["sticky-pool", "--num-workers", expr, "worker"]);
            assert!(matches!(
                args.to_supervisor_config(),
                Err(ConfigError::InvalidWorkerCount { .. })
            ));
        }
    }
}
