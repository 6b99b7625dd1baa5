//! Worker pool orchestration
//!
//! [`WorkerPool`] owns every [`WorkerHandle`], keeps the pool at its desired
//! size, runs the reload protocol and hands out workers in round-robin
//! order. It is a plain state machine: the supervisor loop feeds it
//! [`WorkerEvent`]s one at a time, so none of its collections need locking.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc, oneshot};

use super::spawner::Spawner;
use super::worker::{
    Transition, WorkerEvent, WorkerEventKind, WorkerHandle, WorkerId, WorkerState,
};

/// Capacity of the lifecycle notification channel
const NOTIFICATION_CAPACITY: usize = 256;

/// Callback fired once a reload has completed
pub type ReloadCallback = Box<dyn FnOnce() + Send>;

/// Sizing and lifecycle policy of a pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Target number of workers
    pub desired: usize,
    /// Time a spawned worker gets to exit after being told to.
    /// Zero selects non-overlapping reloads.
    pub shutdown_grace: Duration,
    /// Replace workers that die unexpectedly
    pub keep_alive: bool,
    /// Workers dying younger than this are not replaced
    pub min_expected_lifetime: Duration,
    /// Kill terminating workers still alive after grace + this
    pub kill_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            desired: 1,
            shutdown_grace: Duration::from_secs(600),
            keep_alive: false,
            min_expected_lifetime: Duration::from_secs(20),
            kill_timeout: None,
        }
    }
}

/// Lifecycle notifications published to observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// A worker became routable
    Spawned { worker: WorkerId, port: u16 },
    /// A worker left the routable set on request
    Terminating { worker: WorkerId },
    /// A worker process is gone
    Terminated { worker: WorkerId, unexpected: bool },
    /// A reload completed
    Reloaded,
}

/// Point-in-time view of one worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSummary {
    pub id: WorkerId,
    pub pid: Option<u32>,
    pub state: WorkerState,
    pub port: Option<u16>,
}

impl From<&WorkerHandle> for WorkerSummary {
    fn from(handle: &WorkerHandle) -> Self {
        Self {
            id: handle.id(),
            pid: handle.pid(),
            state: handle.state(),
            port: handle.port(),
        }
    }
}

/// Point-in-time view of the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub desired: usize,
    /// Routable workers, in round-robin order
    pub active: Vec<WorkerSummary>,
    pub spawning: Vec<WorkerSummary>,
    pub terminating: Vec<WorkerSummary>,
}

enum PendingReload {
    /// Overlapping: waiting for the first new worker, then retire `outgoing`
    Cutover {
        outgoing: Vec<WorkerId>,
        callback: Option<ReloadCallback>,
    },
    /// Non-overlapping: waiting for every old worker to exit
    Draining { callback: Option<ReloadCallback> },
    /// Non-overlapping: new generation started, waiting for its first worker
    Respawning { callback: Option<ReloadCallback> },
}

pub struct WorkerPool {
    config: PoolConfig,
    spawner: Arc<dyn Spawner>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    handles: HashMap<WorkerId, WorkerHandle>,
    active: Vec<WorkerId>,
    spawning: Vec<WorkerId>,
    cursor: Option<usize>,
    next_id: u64,
    reloads: Vec<PendingReload>,
    waiters: Vec<oneshot::Sender<u16>>,
    notifications: broadcast::Sender<PoolEvent>,
    stopping: bool,
}

impl WorkerPool {
    /// Create an empty pool. Processes report back through `events`, which
    /// the owner must drain into [`WorkerPool::handle_event`].
    pub fn new(
        config: PoolConfig,
        spawner: Arc<dyn Spawner>,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            config,
            spawner,
            events,
            handles: HashMap::new(),
            active: Vec::new(),
            spawning: Vec::new(),
            cursor: None,
            next_id: 1,
            reloads: Vec::new(),
            waiters: Vec::new(),
            notifications,
            stopping: false,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.notifications.subscribe()
    }

    pub(crate) fn notifier(&self) -> broadcast::Sender<PoolEvent> {
        self.notifications.clone()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn spawning_len(&self) -> usize {
        self.spawning.len()
    }

    /// True once no handle of any state is left
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    pub fn get(&self, id: WorkerId) -> Option<&WorkerHandle> {
        self.handles.get(&id)
    }

    /// Active worker at a fixed index
    pub fn active_at(&self, index: usize) -> Option<&WorkerHandle> {
        self.active.get(index).and_then(|id| self.handles.get(id))
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let summarize = |ids: &[WorkerId]| -> Vec<WorkerSummary> {
            ids.iter()
                .filter_map(|id| self.handles.get(id))
                .map(WorkerSummary::from)
                .collect()
        };
        let mut terminating: Vec<WorkerSummary> = self
            .handles
            .values()
            .filter(|h| h.state() == WorkerState::Terminating)
            .map(WorkerSummary::from)
            .collect();
        terminating.sort_by_key(|w| w.id);

        PoolSnapshot {
            desired: self.config.desired,
            active: summarize(&self.active),
            spawning: summarize(&self.spawning),
            terminating,
        }
    }

    /// Spawn `n` workers
    pub fn spawn_pool(&mut self, n: usize) -> Vec<WorkerId> {
        debug!("Spawning {} workers", n);
        (0..n).filter_map(|_| self.spawn_one()).collect()
    }

    /// Spawn exactly one worker, tracked as spawning until it reports a port
    pub fn spawn_one(&mut self) -> Option<WorkerId> {
        if self.stopping {
            debug!("Pool is stopping, not spawning");
            return None;
        }

        let id = WorkerId::new(self.next_id);
        self.next_id += 1;

        match self.spawner.spawn(id, self.events.clone()) {
            Ok(process) => {
                let handle = WorkerHandle::new(id, process);
                info!("Started worker {}", handle);
                self.handles.insert(id, handle);
                self.spawning.push(id);
                Some(id)
            }
            Err(e) => {
                error!("Failed to start worker {}: {}", id, e);
                None
            }
        }
    }

    /// Shut down every worker the pool knows about
    pub fn shutdown_all(&mut self) {
        let mut ids: Vec<WorkerId> = self.handles.keys().copied().collect();
        ids.sort();
        for id in ids {
            self.shutdown_worker(id);
        }
    }

    /// Stop for good: no more spawns, reloads or deferred routes
    pub fn stop(&mut self) {
        info!("Stopping pool of {} workers", self.handles.len());
        self.stopping = true;
        self.reloads.clear();
        self.waiters.clear();
        self.shutdown_all();
    }

    /// Replace the current generation of workers
    ///
    /// With a non-zero grace period the new generation starts alongside the
    /// old one and the reload completes as soon as the first new worker is
    /// listening. With a zero grace period the old generation is drained
    /// completely before the new one is started.
    pub fn reload(&mut self, callback: Option<ReloadCallback>) {
        if self.stopping {
            warn!("Ignoring reload request, pool is stopping");
            return;
        }

        // Half-started workers would contend with the new generation
        let spawning = self.spawning.clone();
        for id in spawning {
            self.shutdown_worker(id);
        }

        if self.config.shutdown_grace > Duration::ZERO {
            let outgoing = self.active.clone();
            info!(
                "Reloading: spawning {} new workers alongside {} old ones",
                self.config.desired,
                outgoing.len()
            );
            self.reloads
                .push(PendingReload::Cutover { outgoing, callback });
            self.spawn_pool(self.config.desired);
        } else {
            info!("Reloading: removing {} old workers", self.active.len());
            let outgoing = self.active.clone();
            for id in outgoing {
                self.shutdown_worker(id);
            }
            self.reloads.push(PendingReload::Draining { callback });
            self.respawn_if_drained();
        }
    }

    /// Next active worker in round-robin order
    pub fn next_by_round_robin(&mut self) -> Option<&WorkerHandle> {
        if self.active.is_empty() {
            return None;
        }
        let next = self.cursor.map_or(0, |c| c + 1);
        let next = if next >= self.active.len() { 0 } else { next };
        self.cursor = Some(next);
        self.handles.get(&self.active[next])
    }

    fn next_port_by_round_robin(&mut self) -> Option<u16> {
        self.next_by_round_robin().and_then(WorkerHandle::port)
    }

    /// Resolve `waiter` with a round-robin pick now, or as soon as a worker
    /// becomes active
    pub fn defer(&mut self, waiter: oneshot::Sender<u16>) {
        if self.stopping {
            return;
        }
        match self.next_port_by_round_robin() {
            Some(port) => {
                let _ = waiter.send(port);
            }
            None => {
                // Callers that gave up leave closed senders behind
                self.waiters.retain(|w| !w.is_closed());
                self.waiters.push(waiter);
            }
        }
    }

    /// Routes waiting for the first active worker
    pub fn deferred_len(&self) -> usize {
        self.waiters.len()
    }

    /// Apply one event reported by a spawner
    pub fn handle_event(&mut self, event: WorkerEvent) {
        let Some(handle) = self.handles.get_mut(&event.worker) else {
            debug!("Dropping {:?} for unknown worker {}", event.kind, event.worker);
            return;
        };

        let transition = match event.kind {
            WorkerEventKind::Message(message) => handle.on_message(message),
            WorkerEventKind::Exited { code } => handle.on_exit(code),
            WorkerEventKind::KillDeadline => {
                handle.force_kill();
                None
            }
        };

        if let Some(transition) = transition {
            self.apply(transition);
        }
    }

    fn shutdown_worker(&mut self, id: WorkerId) {
        let grace = self.config.shutdown_grace;
        let Some(transition) = self.handles.get_mut(&id).and_then(|h| h.shutdown(grace)) else {
            return;
        };
        if transition.from == WorkerState::Spawned {
            self.schedule_kill_deadline(id);
        }
        self.apply(transition);
    }

    fn schedule_kill_deadline(&self, id: WorkerId) {
        let Some(kill_timeout) = self.config.kill_timeout else {
            return;
        };
        let deadline = self.config.shutdown_grace + kill_timeout;
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let _ = events.send(WorkerEvent::kill_deadline(id));
        });
    }

    fn apply(&mut self, transition: Transition) {
        debug!(
            "Worker {}: {} -> {}",
            transition.worker, transition.from, transition.to
        );
        match transition.to {
            WorkerState::Spawning => {}
            WorkerState::Spawned => self.on_spawned(transition.worker),
            WorkerState::Terminating => {
                self.remove_from_lists(transition.worker);
                self.emit(PoolEvent::Terminating {
                    worker: transition.worker,
                });
            }
            WorkerState::Terminated => self.on_terminated(transition),
        }
    }

    /// Returns true when the worker was routable
    fn remove_from_lists(&mut self, id: WorkerId) -> bool {
        self.spawning.retain(|w| *w != id);
        match self.active.iter().position(|w| *w == id) {
            Some(index) => {
                self.active.remove(index);
                self.cursor = None;
                true
            }
            None => false,
        }
    }

    fn on_spawned(&mut self, id: WorkerId) {
        self.spawning.retain(|w| *w != id);
        self.active.push(id);

        let Some(port) = self.handles.get(&id).and_then(WorkerHandle::port) else {
            return;
        };
        self.emit(PoolEvent::Spawned { worker: id, port });

        for waiter in std::mem::take(&mut self.waiters) {
            if let Some(port) = self.next_port_by_round_robin() {
                let _ = waiter.send(port);
            }
        }

        for reload in std::mem::take(&mut self.reloads) {
            match reload {
                PendingReload::Cutover { outgoing, callback } => {
                    info!(
                        "Worker {} spawned, retiring {} old workers",
                        id,
                        outgoing.len()
                    );
                    self.complete_reload(callback);
                    for old in outgoing {
                        self.shutdown_worker(old);
                    }
                }
                PendingReload::Respawning { callback } => self.complete_reload(callback),
                draining @ PendingReload::Draining { .. } => self.reloads.push(draining),
            }
        }
    }

    fn on_terminated(&mut self, transition: Transition) {
        let id = transition.worker;
        let was_active = self.remove_from_lists(id);
        let dead = self.handles.remove(&id);

        self.emit(PoolEvent::Terminated {
            worker: id,
            unexpected: transition.from != WorkerState::Terminating,
        });

        if was_active {
            if let Some(dead) = &dead {
                self.maybe_respawn(dead);
            }
        }
        self.respawn_if_drained();
    }

    fn maybe_respawn(&mut self, dead: &WorkerHandle) {
        if !self.config.keep_alive || self.stopping {
            return;
        }
        if self.active.len() + self.spawning.len() >= self.config.desired {
            return;
        }
        let age = dead.age();
        if age < self.config.min_expected_lifetime {
            warn!(
                "Worker {} died after {}ms, younger than the expected {}ms; not respawning",
                dead,
                age.as_millis(),
                self.config.min_expected_lifetime.as_millis()
            );
            return;
        }
        info!("Worker {} found dead, spawning a replacement", dead);
        self.spawn_one();
    }

    fn respawn_if_drained(&mut self) {
        if self.stopping || !self.handles.is_empty() {
            return;
        }
        if !self
            .reloads
            .iter()
            .any(|r| matches!(r, PendingReload::Draining { .. }))
        {
            return;
        }

        info!(
            "All workers removed, spawning {} new workers",
            self.config.desired
        );
        self.reloads = std::mem::take(&mut self.reloads)
            .into_iter()
            .map(|reload| match reload {
                PendingReload::Draining { callback } => PendingReload::Respawning { callback },
                other => other,
            })
            .collect();
        self.spawn_pool(self.config.desired);
    }

    fn complete_reload(&mut self, callback: Option<ReloadCallback>) {
        self.emit(PoolEvent::Reloaded);
        if let Some(callback) = callback {
            callback();
        }
    }

    fn emit(&self, event: PoolEvent) {
        let _ = self.notifications.send(event);
    }
}
