mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{id, pump, test_pool, Call, MockSpawner};
use sticky_pool::core::{PoolConfig, PoolEvent, SupervisorMessage, WorkerState};
use tokio::sync::{broadcast, oneshot};

fn config(desired: usize) -> PoolConfig {
    PoolConfig {
        desired,
        shutdown_grace: Duration::from_secs(1),
        ..Default::default()
    }
}

fn counter() -> (Arc<AtomicUsize>, Box<dyn FnOnce() + Send>) {
    let count = Arc::new(AtomicUsize::new(0));
    let inner = count.clone();
    (
        count,
        Box::new(move || {
            inner.fetch_add(1, Ordering::SeqCst);
        }),
    )
}

fn drain(events: &mut broadcast::Receiver<PoolEvent>) -> Vec<PoolEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

#[test]
fn test_round_robin_visits_every_worker_once_per_cycle() {
    for k in 1..=4 {
        let spawner = MockSpawner::auto();
        let (mut pool, mut events) = test_pool(config(k), &spawner);
        pool.spawn_pool(k);
        pump(&mut pool, &mut events);
        assert_eq!(pool.active_len(), k);

        let picks: Vec<_> = (0..2 * k)
            .map(|_| pool.next_by_round_robin().unwrap().id())
            .collect();
        let mut first_cycle = picks[..k].to_vec();
        assert_eq!(picks[k..], first_cycle[..], "cycle repeats for k = {}", k);
        first_cycle.sort();
        first_cycle.dedup();
        assert_eq!(first_cycle.len(), k, "cycle covers every worker for k = {}", k);
    }
}

#[test]
fn test_round_robin_restarts_after_pool_shrinks() {
    let spawner = MockSpawner::auto();
    let (mut pool, mut events) = test_pool(config(3), &spawner);
    pool.spawn_pool(3);
    pump(&mut pool, &mut events);

    assert_eq!(pool.next_by_round_robin().unwrap().id(), id(1));
    assert_eq!(pool.next_by_round_robin().unwrap().id(), id(2));

    spawner.exit(id(3), Some(1));
    pump(&mut pool, &mut events);
    assert_eq!(pool.active_len(), 2);
    assert_eq!(pool.next_by_round_robin().unwrap().id(), id(1));
}

#[test]
fn test_spawned_workers_wait_for_their_port() {
    let spawner = MockSpawner::manual();
    let (mut pool, mut events) = test_pool(config(2), &spawner);
    let mut notifications = pool.subscribe();

    assert_eq!(pool.spawn_pool(2), vec![id(1), id(2)]);
    assert_eq!(pool.spawning_len(), 2);
    assert_eq!(pool.active_len(), 0);
    assert!(pool.next_by_round_robin().is_none());

    spawner.listen(id(2));
    pump(&mut pool, &mut events);
    assert_eq!(pool.active_len(), 1);
    assert_eq!(pool.active_at(0).unwrap().port(), Some(MockSpawner::port_for(id(2))));
    assert_eq!(
        drain(&mut notifications),
        vec![PoolEvent::Spawned {
            worker: id(2),
            port: MockSpawner::port_for(id(2)),
        }]
    );
}

#[test]
fn test_late_listening_report_is_ignored() {
    let spawner = MockSpawner::manual();
    let (mut pool, mut events) = test_pool(config(1), &spawner);
    pool.spawn_pool(1);
    pool.shutdown_all();
    assert_eq!(spawner.killed(), vec![id(1)]);
    assert_eq!(pool.get(id(1)).unwrap().state(), WorkerState::Terminating);

    spawner.listen(id(1));
    pump(&mut pool, &mut events);
    assert_eq!(pool.active_len(), 0);
    assert_eq!(pool.get(id(1)).unwrap().port(), None);

    spawner.exit(id(1), None);
    pump(&mut pool, &mut events);
    assert!(pool.is_empty());
}

#[test]
fn test_failed_spawn_is_skipped() {
    let spawner = MockSpawner::manual();
    let (mut pool, _events) = test_pool(config(3), &spawner);
    spawner.fail_next(1);
    let started = pool.spawn_pool(3);
    assert_eq!(started, vec![id(2), id(3)]);
    assert_eq!(pool.spawning_len(), 2);
}

#[test]
fn test_deferred_waiter_resolves_on_first_spawn() {
    let spawner = MockSpawner::manual();
    let (mut pool, mut events) = test_pool(config(1), &spawner);
    pool.spawn_pool(1);

    let (tx, mut rx) = oneshot::channel();
    pool.defer(tx);
    assert!(rx.try_recv().is_err());

    spawner.listen(id(1));
    pump(&mut pool, &mut events);
    assert_eq!(rx.try_recv().unwrap(), MockSpawner::port_for(id(1)));
}

#[test]
fn test_abandoned_waiters_are_pruned() {
    let spawner = MockSpawner::manual();
    let (mut pool, mut events) = test_pool(config(1), &spawner);
    spawner.fail_next(1);
    pool.spawn_pool(1);

    for _ in 0..3 {
        let (tx, rx) = oneshot::channel();
        pool.defer(tx);
        drop(rx);
    }
    let (tx, mut rx) = oneshot::channel();
    pool.defer(tx);
    assert_eq!(pool.deferred_len(), 1);

    pool.spawn_one();
    spawner.listen(id(2));
    pump(&mut pool, &mut events);
    assert_eq!(rx.try_recv().unwrap(), MockSpawner::port_for(id(2)));
    assert_eq!(pool.deferred_len(), 0);
}

#[test]
fn test_unexpected_exit_without_keep_alive_does_not_respawn() {
    let spawner = MockSpawner::auto();
    let (mut pool, mut events) = test_pool(config(2), &spawner);
    let mut notifications = pool.subscribe();
    pool.spawn_pool(2);
    pump(&mut pool, &mut events);
    drain(&mut notifications);

    spawner.exit(id(1), Some(1));
    pump(&mut pool, &mut events);
    assert_eq!(spawner.spawned().len(), 2);
    assert_eq!(pool.active_len(), 1);
    assert_eq!(
        drain(&mut notifications),
        vec![PoolEvent::Terminated {
            worker: id(1),
            unexpected: true,
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_skips_workers_that_die_young() {
    let spawner = MockSpawner::auto();
    let (mut pool, mut events) = test_pool(
        PoolConfig {
            keep_alive: true,
            min_expected_lifetime: Duration::from_secs(20),
            ..config(2)
        },
        &spawner,
    );
    pool.spawn_pool(2);
    pump(&mut pool, &mut events);

    tokio::time::advance(Duration::from_secs(5)).await;
    spawner.exit(id(1), Some(1));
    pump(&mut pool, &mut events);
    assert_eq!(spawner.spawned(), vec![id(1), id(2)]);
    assert_eq!(pool.active_len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_replaces_a_mature_worker_exactly_once() {
    let spawner = MockSpawner::auto();
    let (mut pool, mut events) = test_pool(
        PoolConfig {
            keep_alive: true,
            min_expected_lifetime: Duration::from_secs(20),
            ..config(2)
        },
        &spawner,
    );
    pool.spawn_pool(2);
    pump(&mut pool, &mut events);

    tokio::time::advance(Duration::from_secs(30)).await;
    spawner.exit(id(1), Some(1));
    pump(&mut pool, &mut events);
    assert_eq!(spawner.spawned(), vec![id(1), id(2), id(3)]);
    assert_eq!(pool.active_len(), 2);
    assert_eq!(pool.active_at(1).unwrap().id(), id(3));
}

#[test]
fn test_deliberate_shutdown_is_not_respawned() {
    let spawner = MockSpawner::auto();
    let (mut pool, mut events) = test_pool(
        PoolConfig {
            keep_alive: true,
            min_expected_lifetime: Duration::ZERO,
            ..config(1)
        },
        &spawner,
    );
    pool.spawn_pool(1);
    pump(&mut pool, &mut events);

    pool.stop();
    pump(&mut pool, &mut events);
    assert!(pool.is_empty());
    assert_eq!(spawner.spawned(), vec![id(1)]);
    assert!(pool.spawn_one().is_none());
}

#[test]
fn test_overlapping_reload_retires_old_workers_after_first_spawn() {
    let spawner = MockSpawner::manual();
    let (mut pool, mut events) = test_pool(config(2), &spawner);
    let mut notifications = pool.subscribe();
    pool.spawn_pool(2);
    spawner.listen(id(1));
    spawner.listen(id(2));
    pump(&mut pool, &mut events);

    let (reloaded, callback) = counter();
    pool.reload(Some(callback));
    assert_eq!(spawner.spawned(), vec![id(1), id(2), id(3), id(4)]);
    assert_eq!(pool.active_len(), 2);
    assert!(spawner.told_to_die().is_empty());
    assert_eq!(reloaded.load(Ordering::SeqCst), 0);
    drain(&mut notifications);

    spawner.listen(id(3));
    pump(&mut pool, &mut events);
    assert_eq!(reloaded.load(Ordering::SeqCst), 1);
    assert_eq!(
        spawner.calls(),
        vec![
            Call::Send(id(1), SupervisorMessage::Die { time: 1000 }),
            Call::Send(id(2), SupervisorMessage::Die { time: 1000 }),
        ]
    );
    let seen = drain(&mut notifications);
    assert_eq!(seen.iter().filter(|e| **e == PoolEvent::Reloaded).count(), 1);
    assert_eq!(pool.active_len(), 1);

    spawner.listen(id(4));
    pump(&mut pool, &mut events);
    assert_eq!(reloaded.load(Ordering::SeqCst), 1);
    assert_eq!(pool.active_len(), 2);
    assert_eq!(pool.active_at(0).unwrap().id(), id(3));
    assert_eq!(pool.active_at(1).unwrap().id(), id(4));
}

#[test]
fn test_reload_kills_workers_still_spawning() {
    let spawner = MockSpawner::manual();
    let (mut pool, mut events) = test_pool(config(2), &spawner);
    pool.spawn_pool(2);
    spawner.listen(id(1));
    pump(&mut pool, &mut events);

    pool.reload(None);
    assert_eq!(spawner.killed(), vec![id(2)]);
    assert_eq!(pool.get(id(2)).unwrap().state(), WorkerState::Terminating);
    assert_eq!(pool.spawning_len(), 2);
}

#[test]
fn test_non_overlapping_reload_drains_before_respawning() {
    let spawner = MockSpawner::manual();
    let (mut pool, mut events) = test_pool(
        PoolConfig {
            shutdown_grace: Duration::ZERO,
            ..config(2)
        },
        &spawner,
    );
    pool.spawn_pool(2);
    spawner.listen(id(1));
    spawner.listen(id(2));
    pump(&mut pool, &mut events);

    let (reloaded, callback) = counter();
    pool.reload(Some(callback));
    assert_eq!(spawner.told_to_die(), vec![id(1), id(2)]);
    assert_eq!(spawner.calls()[0], Call::Send(id(1), SupervisorMessage::Die { time: 0 }));
    assert_eq!(pool.active_len(), 0);

    spawner.exit(id(1), Some(0));
    pump(&mut pool, &mut events);
    assert_eq!(spawner.spawned().len(), 2, "no spawn while a worker remains");

    spawner.exit(id(2), Some(0));
    pump(&mut pool, &mut events);
    assert_eq!(spawner.spawned(), vec![id(1), id(2), id(3), id(4)]);
    assert_eq!(reloaded.load(Ordering::SeqCst), 0);

    spawner.listen(id(3));
    pump(&mut pool, &mut events);
    assert_eq!(reloaded.load(Ordering::SeqCst), 1);
}

#[test]
fn test_non_overlapping_reload_of_empty_pool_respawns_immediately() {
    let spawner = MockSpawner::manual();
    let (mut pool, mut events) = test_pool(
        PoolConfig {
            shutdown_grace: Duration::ZERO,
            ..config(1)
        },
        &spawner,
    );

    let (reloaded, callback) = counter();
    pool.reload(Some(callback));
    assert_eq!(spawner.spawned(), vec![id(1)]);

    spawner.listen(id(1));
    pump(&mut pool, &mut events);
    assert_eq!(reloaded.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_kill_timeout_forces_lingering_workers_out() {
    let spawner = MockSpawner::manual();
    let (mut pool, mut events) = test_pool(
        PoolConfig {
            kill_timeout: Some(Duration::from_secs(2)),
            ..config(1)
        },
        &spawner,
    );
    pool.spawn_pool(1);
    spawner.listen(id(1));
    pump(&mut pool, &mut events);

    pool.shutdown_all();
    assert_eq!(spawner.told_to_die(), vec![id(1)]);
    assert!(spawner.killed().is_empty());

    tokio::time::sleep(Duration::from_secs(4)).await;
    pump(&mut pool, &mut events);
    assert_eq!(spawner.killed(), vec![id(1)]);

    spawner.exit(id(1), None);
    pump(&mut pool, &mut events);
    assert!(pool.is_empty());
}
