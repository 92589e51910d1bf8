// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

/// Admission control for concurrently served connections.
///
/// The counter is only ever moved with compare-and-swap so `active` stays inside
/// `[0, capacity]` no matter how many tasks race on it. After `shutdown` every
/// acquire fails until `reset`. Both bump the generation, which retires older permits.
#[derive(Debug)]
pub struct ConnectionPool {
    capacity: usize,
    active: AtomicUsize,
    closed: AtomicBool,
    generation: AtomicU64,
}

impl ConnectionPool {
    pub fn new(capacity: usize) -> Self {
        ConnectionPool {
            capacity,
            active: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        }
    }

    pub fn try_acquire(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                if active < self.capacity {
                    Some(active + 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    /// Give back one slot. Releasing with nothing held is a caller bug; it is logged and
    /// the counter stays at zero.
    pub fn release(&self) {
        let result = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                active.checked_sub(1)
            });
        if result.is_err() {
            warn!("connection pool release without a matching acquire");
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.active_count())
    }

    pub fn is_full(&self) -> bool {
        self.active_count() >= self.capacity
    }

    pub fn is_shutdown(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Refuse further admissions and forget every outstanding slot.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
        let drained = self.active.swap(0, Ordering::AcqRel);
        debug!("connection pool shut down, {} slots drained", drained);
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.active.store(0, Ordering::Release);
        self.closed.store(false, Ordering::Release);
    }
}

/// A held slot. Dropping it releases the slot exactly once.
#[derive(Debug)]
pub struct PoolPermit {
    pool: Arc<ConnectionPool>,
    generation: u64,
}

impl PoolPermit {
    pub fn try_acquire(pool: &Arc<ConnectionPool>) -> Option<PoolPermit> {
        // read first: a shutdown racing the acquire leaves the permit on the old generation
        let generation = pool.generation();
        if pool.try_acquire() {
            Some(PoolPermit {
                pool: pool.clone(),
                generation,
            })
        } else {
            None
        }
    }
}

impl Drop for PoolPermit {
    fn drop(&mut self) {
        // a shutdown or reset since the acquire already zeroed the counter
        if self.pool.generation() == self.generation && !self.pool.is_shutdown() {
            self.pool.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn acquire_up_to_capacity() {
        let pool = ConnectionPool::new(2);
        assert!(pool.try_acquire());
        assert!(pool.try_acquire());
        assert!(!pool.try_acquire());
        assert!(pool.is_full());
        assert_eq!(pool.available(), 0);
        pool.release();
        assert_eq!(pool.active_count(), 1);
        assert!(pool.try_acquire());
    }

    #[test]
    fn release_without_acquire_stays_at_zero() {
        let pool = ConnectionPool::new(1);
        pool.release();
        assert_eq!(pool.active_count(), 0);
        assert!(pool.try_acquire());
    }

    #[test]
    fn shutdown_blocks_until_reset() {
        let pool = ConnectionPool::new(3);
        assert!(pool.try_acquire());
        pool.shutdown();
        assert_eq!(pool.active_count(), 0);
        assert!(!pool.try_acquire());
        pool.reset();
        assert!(pool.try_acquire());
    }

    #[test]
    fn permit_releases_on_drop() {
        let pool = Arc::new(ConnectionPool::new(1));
        let permit = PoolPermit::try_acquire(&pool);
        assert!(permit.is_some());
        assert!(PoolPermit::try_acquire(&pool).is_none());
        drop(permit);
        assert_eq!(pool.active_count(), 0);
    }

    #[rstest]
    #[case(1)]
    #[case(7)]
    #[case(64)]
    fn concurrent_acquire_never_overshoots(#[case] capacity: usize) {
        let pool = Arc::new(ConnectionPool::new(capacity));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || (0..100).filter(|_| pool.try_acquire()).count())
            })
            .collect();
        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted, capacity);
        assert_eq!(pool.active_count(), capacity);
    }

    #[rstest]
    #[case(1)]
    #[case(4)]
    #[case(32)]
    fn mixed_acquire_and_stray_release_stay_in_bounds(#[case] capacity: usize) {
        let pool = Arc::new(ConnectionPool::new(capacity));
        let handles: Vec<_> = (0..8)
            .map(|thread| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for step in 0..5_000 {
                        if (thread + step) % 7 == 0 {
                            pool.release();
                        } else if pool.try_acquire() {
                            assert!(pool.active_count() <= capacity);
                            pool.release();
                        }
                        assert!(pool.active_count() <= capacity);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.active_count(), 0);
    }

    #[test]
    fn permits_from_before_reset_do_not_release_new_slots() {
        let pool = Arc::new(ConnectionPool::new(2));
        let old = PoolPermit::try_acquire(&pool).unwrap();
        pool.shutdown();
        pool.reset();

        let current = PoolPermit::try_acquire(&pool).unwrap();
        assert_eq!(pool.active_count(), 1);
        drop(old);
        assert_eq!(pool.active_count(), 1);
        drop(current);
        assert_eq!(pool.active_count(), 0);
    }
}
