//! # Load Balancer
//!
//! Picks one of N instances for a new session without ever blocking.
//!
//! ## Algorithm
//!
//! Each slot has a usage counter on its own cache line. A thread-local cursor
//! gives every calling thread its own round-robin starting point. `acquire`
//! scans at most N slots from the cursor, trying to claim each one with a
//! `0 -> 1` compare-exchange; the first idle slot wins. If every slot is busy,
//! the least-used slot seen during the scan is taken anyway and its counter
//! incremented.
//!
//! ## Invariants
//! - `acquire` returns a slot in `[0, N)` and never waits on another thread.
//! - At a quiescent point the sum of all counters equals the number of
//!   acquisitions not yet freed.
//! - Counters are advisory. Two callers may hold the same slot; the counts
//!   only steer new sessions towards idle instances. There is no fairness
//!   across threads.

use std::cell::Cell;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crossbeam_utils::CachePadded;

thread_local! {
    static CURSOR: Cell<usize> = const { Cell::new(0) };
}

pub struct LoadBalancer {
    uses: Box<[CachePadded<AtomicU64>]>,
}

impl LoadBalancer {
    /// Creates a balancer over `n` slots.
    ///
    /// # Panics
    /// Panics if `n` is zero.
    pub fn new(n: usize) -> Self {
        assert!(n > 0, "load balancer needs at least one slot");
        let uses = (0..n).map(|_| CachePadded::new(AtomicU64::new(0))).collect();
        Self { uses }
    }

    pub fn len(&self) -> usize {
        self.uses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uses.is_empty()
    }

    pub fn acquire(&self) -> usize {
        let n = self.uses.len();
        CURSOR.with(|cursor| {
            let mut last = cursor.get();
            let mut min_uses = u64::MAX;
            let mut min_idx = 0;

            for _ in 0..n {
                // The cursor is shared by every balancer the thread touches.
                if last >= n {
                    last = 0;
                }
                match self.uses[last].compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst) {
                    Ok(_) => {
                        cursor.set(last + 1);
                        tracing::trace!(slot = last, "claimed idle slot");
                        return last;
                    }
                    Err(prev) => {
                        if prev < min_uses {
                            min_uses = prev;
                            min_idx = last;
                        }
                    }
                }
                last += 1;
            }

            cursor.set(last);
            let prev = self.uses[min_idx].fetch_add(1, Ordering::SeqCst);
            tracing::trace!(slot = min_idx, uses = prev + 1, "all slots busy, oversubscribing");
            min_idx
        })
    }

    /// Releases one acquisition of `slot`. May be called from any thread.
    pub fn free(&self, slot: usize) {
        let prev = self.uses[slot].fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "slot {} freed more often than acquired", slot);
        tracing::trace!(slot, uses = prev.wrapping_sub(1), "freed slot");
    }

    /// Snapshot of the per-slot counters.
    pub fn loads(&self) -> Vec<u64> {
        self.uses.iter().map(|uses| uses.load(Ordering::SeqCst)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_slot() {
        let balancer = LoadBalancer::new(1);
        assert_eq!(balancer.acquire(), 0);
        assert_eq!(balancer.acquire(), 0);
        assert_eq!(balancer.loads(), vec![2]);
        balancer.free(0);
        balancer.free(0);
        assert_eq!(balancer.loads(), vec![0]);
    }

    #[test]
    fn test_prefers_idle_slots() {
        let balancer = LoadBalancer::new(3);
        let mut held: Vec<usize> = (0..3).map(|_| balancer.acquire()).collect();
        held.sort_unstable();
        assert_eq!(held, vec![0, 1, 2]);
        assert_eq!(balancer.loads(), vec![1, 1, 1]);
    }

    #[test]
    fn test_oversubscribes_least_used() {
        let balancer = LoadBalancer::new(2);
        let a = balancer.acquire();
        let b = balancer.acquire();
        assert_ne!(a, b);

        // Both busy: the extra acquisition lands on one of them.
        let c = balancer.acquire();
        assert!(c < 2);
        assert_eq!(balancer.loads().iter().sum::<u64>(), 3);

        // With one slot at 2 and one at 1, the next goes to the lighter one.
        let lighter = if c == a { b } else { a };
        assert_eq!(balancer.acquire(), lighter);
    }

    #[test]
    fn test_cursor_survives_smaller_balancer() {
        let big = LoadBalancer::new(8);
        for _ in 0..6 {
            let slot = big.acquire();
            big.free(slot);
        }
        let small = LoadBalancer::new(2);
        assert!(small.acquire() < 2);
    }

    #[test]
    #[should_panic]
    fn test_zero_slots_rejected() {
        let _ = LoadBalancer::new(0);
    }
}
