//! Worker-side half of the supervisor protocol
//!
//! A worker binary builds a [`WorkerRuntime`] from its environment, reports
//! its listening port once bound, and then waits for instructions:
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use sticky_pool::worker_runtime::{Instruction, WorkerRuntime};
//!
//! let mut runtime = WorkerRuntime::from_env()?;
//! runtime.listening(8080).await?;
//! match runtime.next_instruction().await {
//!     Instruction::Die(grace) => { /* drain within `grace`, then exit */ }
//!     Instruction::SupervisorGone => { /* exit now */ }
//! }
//! # Ok(())
//! # }
//! ```

use std::io;
use std::time::Duration;

use log::{debug, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin, Stdout};
use tokio::time::{Interval, MissedTickBehavior};

use crate::core::ipc::{encode_line, SupervisorMessage, WorkerMessage, WorkerOptions, WORKER_OPTIONS_ENV};

#[derive(Debug, thiserror::Error)]
pub enum WorkerRuntimeError {
    #[error("{WORKER_OPTIONS_ENV} is not set; was this process started by the supervisor?")]
    MissingOptions,
    #[error("Invalid worker options: {0}")]
    InvalidOptions(#[from] serde_json::Error),
}

/// What the supervisor wants the worker to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    /// Stop accepting work and exit within the given window
    Die(Duration),
    /// The supervisor channel closed; exit immediately
    SupervisorGone,
}

pub struct WorkerRuntime {
    options: WorkerOptions,
    port: Option<u16>,
    ready: bool,
    reported: bool,
    stdout: Stdout,
    lines: Lines<BufReader<Stdin>>,
    ping: Option<Interval>,
}

impl WorkerRuntime {
    /// Read options handed over by the supervisor
    pub fn from_env() -> Result<Self, WorkerRuntimeError> {
        let raw = std::env::var(WORKER_OPTIONS_ENV).map_err(|_| WorkerRuntimeError::MissingOptions)?;
        let options: WorkerOptions = serde_json::from_str(&raw)?;
        Ok(Self::with_options(options))
    }

    /// Must be called from within a tokio runtime
    pub fn with_options(options: WorkerOptions) -> Self {
        let ping = options.ping_interval().map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        Self {
            options,
            port: None,
            ready: false,
            reported: false,
            stdout: tokio::io::stdout(),
            lines: BufReader::new(tokio::io::stdin()).lines(),
            ping,
        }
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    /// Record the bound port; it is reported right away unless the
    /// supervisor asked for an explicit [`WorkerRuntime::ready`]
    pub async fn listening(&mut self, port: u16) -> io::Result<()> {
        self.port = Some(port);
        if self.options.assume_ready || self.ready {
            self.report().await?;
        }
        Ok(())
    }

    /// Mark the worker ready for traffic
    pub async fn ready(&mut self) -> io::Result<()> {
        self.ready = true;
        if self.port.is_some() {
            self.report().await?;
        }
        Ok(())
    }

    async fn report(&mut self) -> io::Result<()> {
        let Some(port) = self.port else {
            return Ok(());
        };
        if self.reported {
            return Ok(());
        }
        self.send(&WorkerMessage::addr(port)).await?;
        self.reported = true;
        Ok(())
    }

    async fn send(&mut self, message: &WorkerMessage) -> io::Result<()> {
        let line = encode_line(message).map_err(io::Error::other)?;
        self.stdout.write_all(line.as_bytes()).await?;
        self.stdout.flush().await
    }

    /// Wait for the next instruction, pinging the supervisor meanwhile
    pub async fn next_instruction(&mut self) -> Instruction {
        loop {
            tokio::select! {
                line = self.lines.next_line() => match line {
                    Ok(Some(line)) => match serde_json::from_str::<SupervisorMessage>(line.trim()) {
                        Ok(SupervisorMessage::Die { time }) => {
                            return Instruction::Die(Duration::from_millis(time));
                        }
                        Err(e) => debug!("Ignoring unknown supervisor line ({}): {}", e, line),
                    },
                    Ok(None) => return Instruction::SupervisorGone,
                    Err(e) => {
                        warn!("Supervisor channel failed: {}", e);
                        return Instruction::SupervisorGone;
                    }
                },
                _ = tick(&mut self.ping) => {
                    if self.send(&WorkerMessage::Ping).await.is_err() {
                        return Instruction::SupervisorGone;
                    }
                }
            }
        }
    }
}

async fn tick(ping: &mut Option<Interval>) {
    match ping {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
