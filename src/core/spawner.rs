//! Abstract "spawn a child with a message channel" primitive
//!
//! The pool only sees [`Spawner`] and [`WorkerProcess`]. [`CommandSpawner`]
//! is the production implementation on top of `tokio::process`.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use log::{debug, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::error::{ProcessError, ProcessResult};
use super::ipc::{encode_line, SupervisorMessage, WorkerMessage, WorkerOptions, WORKER_OPTIONS_ENV};
use super::worker::{WorkerEvent, WorkerId};

/// How long an exit report waits for the stdout reader to drain
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// Live channel to one spawned worker
pub trait WorkerProcess: Send {
    /// OS process id, informational only
    fn pid(&self) -> Option<u32>;

    /// Queue a message for the worker
    fn send(&mut self, message: &SupervisorMessage) -> ProcessResult<()>;

    /// Terminate the worker without a grace period
    fn kill(&mut self) -> ProcessResult<()>;
}

/// Creates worker processes
///
/// Implementations must report every message and the final exit of the
/// process through `events`, tagged with `id`.
pub trait Spawner: Send + Sync {
    fn spawn(
        &self,
        id: WorkerId,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> ProcessResult<Box<dyn WorkerProcess>>;
}

/// Program and arguments every worker runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// Spawns workers as OS processes speaking newline-delimited JSON over stdio
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    command: WorkerCommand,
    assume_ready: bool,
    ping_interval: Option<Duration>,
    title: Option<String>,
}

impl CommandSpawner {
    pub fn new(command: WorkerCommand) -> Self {
        Self {
            command,
            assume_ready: true,
            ping_interval: None,
            title: None,
        }
    }

    pub fn assume_ready(mut self, assume_ready: bool) -> Self {
        self.assume_ready = assume_ready;
        self
    }

    pub fn ping_interval(mut self, interval: Option<Duration>) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn title(mut self, title: Option<String>) -> Self {
        self.title = title;
        self
    }

    fn options_for(&self, id: WorkerId) -> WorkerOptions {
        WorkerOptions {
            assume_ready: self.assume_ready,
            ping_interval_ms: self.ping_interval.map(|d| d.as_millis() as u64),
            title: self.title.clone(),
            worker_index: id.get(),
        }
    }
}

impl Spawner for CommandSpawner {
    fn spawn(
        &self,
        id: WorkerId,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> ProcessResult<Box<dyn WorkerProcess>> {
        let options = serde_json::to_string(&self.options_for(id))?;

        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args)
            .env(WORKER_OPTIONS_ENV, options)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        #[cfg(unix)]
        if let Some(title) = &self.title {
            cmd.arg0(format!("{} worker", title));
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ProcessError::SpawnFailed(e.to_string()))?;

        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProcessError::SpawnFailed("worker stdin was not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProcessError::SpawnFailed("worker stdout was not piped".to_string()))?;

        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_outbox(stdin, outbox_rx));

        let reader = tokio::spawn(read_messages(id, stdout, events.clone()));

        let (kill, kill_rx) = oneshot::channel();
        tokio::spawn(wait_for_exit(id, child, kill_rx, reader, events));

        debug!("Worker {} created with pid {:?}", id, pid);
        Ok(Box::new(ChildProcess {
            id,
            pid,
            outbox,
            kill: Some(kill),
        }))
    }
}

struct ChildProcess {
    id: WorkerId,
    pid: Option<u32>,
    outbox: mpsc::UnboundedSender<String>,
    kill: Option<oneshot::Sender<()>>,
}

impl WorkerProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn send(&mut self, message: &SupervisorMessage) -> ProcessResult<()> {
        let line = encode_line(message)?;
        self.outbox
            .send(line)
            .map_err(|_| ProcessError::ChannelClosed {
                worker: self.id.to_string(),
            })
    }

    fn kill(&mut self) -> ProcessResult<()> {
        match self.kill.take() {
            Some(kill) => kill.send(()).map_err(|_| ProcessError::KillFailed {
                worker: self.id.to_string(),
                reason: "process already reaped".to_string(),
            }),
            None => Ok(()),
        }
    }
}

async fn write_outbox(mut stdin: ChildStdin, mut outbox: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = outbox.recv().await {
        if stdin.write_all(line.as_bytes()).await.is_err() || stdin.flush().await.is_err() {
            break;
        }
    }
}

async fn read_messages(
    id: WorkerId,
    stdout: ChildStdout,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<WorkerMessage>(line) {
            Ok(message) => {
                if events.send(WorkerEvent::message(id, message)).is_err() {
                    break;
                }
            }
            Err(e) => debug!("Worker {} wrote a non-protocol line ({}): {}", id, e, line),
        }
    }
}

async fn wait_for_exit(
    id: WorkerId,
    mut child: Child,
    mut kill: oneshot::Receiver<()>,
    reader: JoinHandle<()>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        Ok(()) = &mut kill => None,
    };

    let status = match exited {
        Some(status) => status,
        None => {
            if let Err(e) = child.start_kill() {
                warn!("Failed to kill worker {}: {}", id, e);
            }
            child.wait().await
        }
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!("Failed to reap worker {}: {}", id, e);
            None
        }
    };

    // Messages written just before exit must be seen before the exit itself
    let _ = tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await;
    let _ = events.send(WorkerEvent::exited(id, code));
}
