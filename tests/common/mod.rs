// Shared by every integration test binary
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sticky_pool::core::{
    PoolConfig, PoolSnapshot, ProcessError, ProcessResult, Spawner, SupervisorMessage,
    WorkerEvent, WorkerMessage, WorkerPool, WorkerProcess,
};
use sticky_pool::{SupervisorHandle, WorkerId};
use tokio::sync::mpsc;

/// Something the pool asked a mock process to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Send(WorkerId, SupervisorMessage),
    Kill(WorkerId),
}

#[derive(Default)]
struct Recorded {
    spawned: Vec<WorkerId>,
    calls: Vec<Call>,
    channels: HashMap<WorkerId, mpsc::UnboundedSender<WorkerEvent>>,
    failures: usize,
}

/// In-memory spawner
///
/// In manual mode nothing happens until the test calls [`MockSpawner::listen`]
/// or [`MockSpawner::exit`]. In auto mode workers listen on
/// [`MockSpawner::port_for`] as soon as they spawn and exit as soon as they
/// are told to die or killed.
#[derive(Clone, Default)]
pub struct MockSpawner {
    recorded: Arc<Mutex<Recorded>>,
    auto: bool,
}

impl MockSpawner {
    pub fn manual() -> Self {
        Self::default()
    }

    pub fn auto() -> Self {
        Self {
            auto: true,
            ..Self::default()
        }
    }

    pub fn port_for(id: WorkerId) -> u16 {
        4000 + id.get() as u16
    }

    pub fn spawned(&self) -> Vec<WorkerId> {
        self.recorded.lock().unwrap().spawned.clone()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.recorded.lock().unwrap().calls.clone()
    }

    /// Workers that were sent a die message, in order
    pub fn told_to_die(&self) -> Vec<WorkerId> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Send(id, SupervisorMessage::Die { .. }) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn killed(&self) -> Vec<WorkerId> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Kill(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Make the next `n` spawns fail
    pub fn fail_next(&self, n: usize) {
        self.recorded.lock().unwrap().failures = n;
    }

    fn emit(&self, event: WorkerEvent) {
        let recorded = self.recorded.lock().unwrap();
        let channel = recorded
            .channels
            .get(&event.worker)
            .expect("worker was never spawned");
        let _ = channel.send(event);
    }

    pub fn listen(&self, id: WorkerId) {
        self.emit(WorkerEvent::message(id, WorkerMessage::addr(Self::port_for(id))));
    }

    pub fn exit(&self, id: WorkerId, code: Option<i32>) {
        self.emit(WorkerEvent::exited(id, code));
    }
}

impl Spawner for MockSpawner {
    fn spawn(
        &self,
        id: WorkerId,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> ProcessResult<Box<dyn WorkerProcess>> {
        let mut recorded = self.recorded.lock().unwrap();
        if recorded.failures > 0 {
            recorded.failures -= 1;
            return Err(ProcessError::SpawnFailed(format!("mock refused {}", id)));
        }
        recorded.spawned.push(id);
        recorded.channels.insert(id, events.clone());
        if self.auto {
            let _ = events.send(WorkerEvent::message(id, WorkerMessage::addr(Self::port_for(id))));
        }
        Ok(Box::new(MockProcess {
            id,
            recorded: self.recorded.clone(),
            auto: self.auto,
            events,
        }))
    }
}

struct MockProcess {
    id: WorkerId,
    recorded: Arc<Mutex<Recorded>>,
    auto: bool,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl WorkerProcess for MockProcess {
    fn pid(&self) -> Option<u32> {
        Some(10_000 + self.id.get() as u32)
    }

    fn send(&mut self, message: &SupervisorMessage) -> ProcessResult<()> {
        self.recorded
            .lock()
            .unwrap()
            .calls
            .push(Call::Send(self.id, message.clone()));
        if self.auto {
            let _ = self.events.send(WorkerEvent::exited(self.id, Some(0)));
        }
        Ok(())
    }

    fn kill(&mut self) -> ProcessResult<()> {
        self.recorded.lock().unwrap().calls.push(Call::Kill(self.id));
        if self.auto {
            let _ = self.events.send(WorkerEvent::exited(self.id, None));
        }
        Ok(())
    }
}

/// Pool driven by hand: events queue on the returned receiver until pumped
pub fn test_pool(
    config: PoolConfig,
    spawner: &MockSpawner,
) -> (WorkerPool, mpsc::UnboundedReceiver<WorkerEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (WorkerPool::new(config, Arc::new(spawner.clone()), tx), rx)
}

/// Apply every queued worker event
pub fn pump(pool: &mut WorkerPool, events: &mut mpsc::UnboundedReceiver<WorkerEvent>) {
    while let Ok(event) = events.try_recv() {
        pool.handle_event(event);
    }
}

pub fn id(raw: u64) -> WorkerId {
    WorkerId::new(raw)
}

/// Poll the supervisor until exactly `n` workers are active
pub async fn wait_for_active(supervisor: &SupervisorHandle, n: usize) -> PoolSnapshot {
    for _ in 0..500 {
        let snapshot = supervisor.snapshot().await.expect("supervisor stopped");
        if snapshot.active.len() == n && snapshot.spawning.is_empty() {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("pool never reached {} active workers", n);
}
