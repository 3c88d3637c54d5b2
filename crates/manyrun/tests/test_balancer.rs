//! Load balancer behavior, directly and through manager sessions.
//!
//! The balancer's round-robin cursor is thread-local, so every test that
//! depends on it runs its scenario on a fresh thread.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Barrier;
use std::thread;

use manyrun::mock::MockLoader;
use manyrun::mock::MockSource;
use manyrun::DefaultEnvironment;
use manyrun::InstanceManager;
use manyrun::LoadBalancer;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;

fn on_fresh_thread<T: Send>(f: impl FnOnce() -> T + Send) -> T {
    thread::scope(|s| s.spawn(f).join().expect("test thread panicked"))
}

#[test]
fn test_slots_in_range_and_sum_tracks_outstanding() {
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for n in [1, 2, 3, 7, 16] {
        let balancer = LoadBalancer::new(n);
        let mut held = Vec::new();

        for _ in 0..500 {
            if held.is_empty() || rng.gen_bool(0.6) {
                let slot = balancer.acquire();
                assert!(slot < n, "slot {} out of range for {} slots", slot, n);
                held.push(slot);
            } else {
                let slot = held.swap_remove(rng.gen_range(0..held.len()));
                balancer.free(slot);
            }

            let loads = balancer.loads();
            assert_eq!(loads.iter().sum::<u64>(), held.len() as u64);
            for (slot, load) in loads.iter().enumerate() {
                let expected = held.iter().filter(|&&s| s == slot).count() as u64;
                assert_eq!(*load, expected, "slot {} miscounted", slot);
            }
        }

        for slot in held.drain(..) {
            balancer.free(slot);
        }
        assert!(balancer.loads().iter().all(|&load| load == 0));
    }
}

#[test]
fn test_concurrent_sum_at_quiescence() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 200;

    let balancer = LoadBalancer::new(5);
    let barrier = Barrier::new(THREADS + 1);

    thread::scope(|s| {
        for t in 0..THREADS {
            let balancer = &balancer;
            let barrier = &barrier;
            s.spawn(move || {
                let mut rng = StdRng::seed_from_u64(t as u64);
                let mut held = Vec::new();
                for _ in 0..ROUNDS {
                    if held.is_empty() || rng.gen_bool(0.5) {
                        held.push(balancer.acquire());
                    } else {
                        balancer.free(held.swap_remove(rng.gen_range(0..held.len())));
                    }
                }
                let keep = held.len().min(3);
                for slot in held.drain(keep..) {
                    balancer.free(slot);
                }

                // Quiescent point: everyone holds `keep` slots.
                barrier.wait();
                barrier.wait();
                for slot in held {
                    balancer.free(slot);
                }
            });
        }

        barrier.wait();
        let outstanding: u64 = balancer.loads().iter().sum();
        assert!(outstanding <= (THREADS * 3) as u64);
        barrier.wait();
    });

    assert_eq!(balancer.loads(), vec![0; 5]);
}

#[test]
fn test_round_robin_from_cursor() {
    on_fresh_thread(|| {
        let balancer = LoadBalancer::new(4);
        assert_eq!(balancer.acquire(), 0);
        balancer.free(0);

        // The cursor moved past slot 0 even though it is idle again.
        assert_eq!(balancer.acquire(), 1);
        balancer.free(1);
        assert_eq!(balancer.acquire(), 2);
        assert_eq!(balancer.acquire(), 3);
        balancer.free(2);
        balancer.free(3);

        // Wraps around.
        assert_eq!(balancer.acquire(), 0);
    });
}

#[test]
fn test_idle_slots_are_preferred() {
    on_fresh_thread(|| {
        let balancer = LoadBalancer::new(3);
        let a = balancer.acquire();
        let b = balancer.acquire();
        let c = balancer.acquire();
        let mut slots = vec![a, b, c];
        slots.sort_unstable();
        assert_eq!(slots, vec![0, 1, 2]);

        balancer.free(b);
        assert_eq!(balancer.acquire(), b, "the only idle slot must be claimed");
    });
}

#[test]
fn test_concurrent_acquires_spread_over_idle_slots() {
    const N: usize = 4;

    let balancer = LoadBalancer::new(N);
    let barrier = Barrier::new(N);

    let slots: Vec<usize> = thread::scope(|s| {
        let handles: Vec<_> = (0..N)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    balancer.acquire()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().expect("acquire thread")).collect()
    });

    let distinct: HashSet<usize> = slots.iter().copied().collect();
    assert_eq!(distinct.len(), N, "slots {:?} are not a permutation", slots);
    assert_eq!(balancer.loads(), vec![1; N]);
}

#[test]
fn test_oversubscription_picks_least_loaded() {
    on_fresh_thread(|| {
        let balancer = LoadBalancer::new(3);
        for _ in 0..3 {
            balancer.acquire();
        }
        // Every slot busy: the next acquisitions stack up but stay balanced.
        for _ in 0..3 {
            balancer.acquire();
        }
        assert_eq!(balancer.loads(), vec![2, 2, 2]);

        balancer.free(1);
        balancer.free(1);
        assert_eq!(balancer.acquire(), 1);
        assert_eq!(balancer.loads(), vec![2, 1, 2]);
    });
}

#[test]
#[should_panic(expected = "at least one slot")]
fn test_zero_slots_panics() {
    let _ = LoadBalancer::new(0);
}

fn manager(count: usize) -> InstanceManager {
    InstanceManager::builder()
        .instances(count)
        .environment(Arc::new(DefaultEnvironment::new()))
        .source(MockSource::new())
        .loader(MockLoader::new())
        .build()
        .expect("Failed to build manager")
}

#[test]
fn test_sessions_hold_slots_until_dropped() {
    let manager = manager(3);

    on_fresh_thread(|| {
        let sessions: Vec<_> =
            (0..3).map(|_| manager.acquire_session().expect("session")).collect();
        assert_eq!(manager.loads(), vec![1, 1, 1]);

        let instances: HashSet<_> = sessions.iter().map(|s| s.instance().id()).collect();
        assert_eq!(instances.len(), 3);

        drop(sessions);
        assert_eq!(manager.loads(), vec![0, 0, 0]);
    });
}

#[test]
fn test_concurrent_sessions_spread_over_instances() {
    const N: usize = 4;

    let manager = manager(N);
    let barrier = Barrier::new(N);

    let sessions: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..N)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    manager.acquire_session().expect("session")
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().expect("session thread")).collect()
    });

    let mut slots: Vec<usize> = sessions.iter().map(|s| s.slot().expect("balanced session")).collect();
    slots.sort_unstable();
    assert_eq!(slots, (0..N).collect::<Vec<_>>());

    let instances: HashSet<_> = sessions.iter().map(|s| s.instance().id()).collect();
    assert_eq!(instances.len(), N);
    assert_eq!(manager.loads(), vec![1; N]);

    drop(sessions);
    assert_eq!(manager.loads(), vec![0; N]);
}

#[test]
fn test_pinned_sessions_do_not_count() {
    let manager = manager(2);
    let instance = manager.instance(1).expect("instance");

    let session = manager.acquire_session_on(instance).expect("session");
    assert_eq!(session.slot(), None);
    assert_eq!(manager.loads(), vec![0, 0]);
}

#[test]
fn test_session_freed_on_another_thread() {
    let manager = manager(2);

    let session = on_fresh_thread(|| manager.acquire_session().expect("session"));
    let slot = session.slot().expect("balanced session has a slot");
    assert_eq!(manager.loads()[slot], 1);

    thread::scope(|s| {
        s.spawn(move || drop(session));
    });
    assert_eq!(manager.loads(), vec![0, 0]);
}

#[test]
fn test_slot_released_when_session_call_fails() {
    let manager = manager(2);

    on_fresh_thread(|| {
        let mut session = manager.acquire_session().expect("session");
        assert!(session.global("no_such_module", "x").is_err());
        assert!(session.eval("undefined_name").is_err());
        drop(session);
        assert_eq!(manager.loads(), vec![0, 0]);
    });
}
