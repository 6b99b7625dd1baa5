//! Supervisor event loop
//!
//! A single task owns the [`WorkerPool`] and applies worker events and
//! caller commands one at a time. [`SupervisorHandle`] is the cloneable
//! front door.

use std::sync::Arc;

use log::{debug, info};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::core::{PoolConfig, PoolEvent, PoolSnapshot, Spawner, WorkerEvent, WorkerPool};
use crate::policies::StickyToken;
use crate::router::select_target;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Supervisor is not running")]
    Stopped,
}

enum Command {
    Route {
        token: Option<StickyToken>,
        reply: oneshot::Sender<u16>,
    },
    Reload {
        done: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<PoolSnapshot>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running supervisor
///
/// When every handle is dropped the supervisor shuts its workers down and
/// exits.
#[derive(Clone)]
pub struct SupervisorHandle {
    commands: mpsc::UnboundedSender<Command>,
    notifications: broadcast::Sender<PoolEvent>,
}

impl SupervisorHandle {
    fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        // A closed loop drops `tx`, which the caller sees as `Stopped`
        let _ = self.commands.send(command(tx));
        rx
    }

    /// Port of the worker that should serve `token`, waiting for a worker if
    /// none is active
    pub async fn route(&self, token: Option<StickyToken>) -> Result<u16, SupervisorError> {
        self.call(|reply| Command::Route { token, reply })
            .await
            .map_err(|_| SupervisorError::Stopped)
    }

    /// Replace every worker; resolves once the reload completes
    pub async fn reload(&self) -> Result<(), SupervisorError> {
        self.call(|done| Command::Reload { done })
            .await
            .map_err(|_| SupervisorError::Stopped)
    }

    pub async fn snapshot(&self) -> Result<PoolSnapshot, SupervisorError> {
        self.call(|reply| Command::Snapshot { reply })
            .await
            .map_err(|_| SupervisorError::Stopped)
    }

    /// Shut every worker down and stop once all of them have exited
    pub async fn shutdown(&self) -> Result<(), SupervisorError> {
        self.call(|done| Command::Shutdown { done })
            .await
            .map_err(|_| SupervisorError::Stopped)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.notifications.subscribe()
    }
}

struct Supervisor {
    pool: WorkerPool,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    stopped: Vec<oneshot::Sender<()>>,
}

/// Start a supervisor for a pool of `config.desired` workers
///
/// Must be called from within a Tokio runtime.
pub fn start(config: PoolConfig, spawner: Arc<dyn Spawner>) -> SupervisorHandle {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();

    let pool = WorkerPool::new(config, spawner, events_tx);
    let notifications = pool.notifier();

    let supervisor = Supervisor {
        pool,
        events: events_rx,
        commands: commands_rx,
        stopped: Vec::new(),
    };
    tokio::spawn(supervisor.run());

    SupervisorHandle {
        commands: commands_tx,
        notifications,
    }
}

impl Supervisor {
    async fn run(mut self) {
        let desired = self.pool.config().desired;
        info!("Supervisor starting {} workers", desired);
        self.pool.spawn_pool(desired);

        let mut commands_open = true;
        loop {
            tokio::select! {
                Some(event) = self.events.recv() => self.pool.handle_event(event),
                command = self.commands.recv(), if commands_open => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        commands_open = false;
                        if !self.pool.is_stopping() {
                            info!("All supervisor handles dropped, stopping workers");
                            self.pool.stop();
                        }
                    }
                },
            }

            if self.pool.is_stopping() && self.pool.is_empty() {
                for done in self.stopped.drain(..) {
                    let _ = done.send(());
                }
                break;
            }
        }
        info!("Supervisor stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Route { token, reply } => {
                if self.pool.is_stopping() {
                    return;
                }
                match select_target(&mut self.pool, token.as_ref()) {
                    Some(port) => {
                        let _ = reply.send(port);
                    }
                    None => {
                        debug!("No active worker, deferring request");
                        self.pool.defer(reply);
                    }
                }
            }
            Command::Reload { done } => {
                self.pool.reload(Some(Box::new(move || {
                    let _ = done.send(());
                })));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.pool.snapshot());
            }
            Command::Shutdown { done } => {
                if !self.pool.is_stopping() {
                    self.pool.stop();
                }
                self.stopped.push(done);
            }
        }
    }
}
