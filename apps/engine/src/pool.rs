//! Bounded collaborator resource pool.
//!
//! Explicit free list and in-use set with manual TTL cleanup and an explicit
//! release call. Capacity exhaustion parks the caller until a lease comes
//! back; idle entries past their TTL are rebuilt on the next acquire.

use std::collections::HashSet;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub capacity: usize,
    pub idle_ttl: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 4,
            idle_ttl: Duration::from_secs(300),
        }
    }
}

struct Idle<T> {
    resource: T,
    parked_at: Instant,
}

struct PoolState<T> {
    free: Vec<Idle<T>>,
    in_use: HashSet<u64>,
    next_lease: u64,
}

struct Shared<T> {
    state: Mutex<PoolState<T>>,
    notify: Notify,
}

/// A leased resource. Call `release` to return it for reuse; dropping the
/// lease instead discards the resource and only frees the capacity slot.
pub struct Lease<T: Send + 'static> {
    resource: Option<T>,
    id: u64,
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.resource.as_ref().expect("lease already released")
    }
}

impl<T: Send + 'static> Lease<T> {
    /// Returns the resource to the free list.
    pub async fn release(mut self) {
        let resource = self.resource.take().expect("lease already released");
        let mut state = self.shared.state.lock().await;
        state.in_use.remove(&self.id);
        state.free.push(Idle {
            resource,
            parked_at: Instant::now(),
        });
        drop(state);
        self.shared.notify.notify_one();
    }
}

impl<T: Send + 'static> Drop for Lease<T> {
    fn drop(&mut self) {
        if self.resource.is_some() {
            // Not released: discard the resource but free the slot so the
            // pool cannot leak capacity.
            let shared = Arc::clone(&self.shared);
            let id = self.id;
            let locked = {
                match shared.state.try_lock() {
                    Ok(mut state) => {
                        state.in_use.remove(&id);
                        true
                    }
                    Err(_) => false,
                }
            };
            if locked {
                shared.notify.notify_one();
            } else {
                tokio::spawn(async move {
                    shared.state.lock().await.in_use.remove(&id);
                    shared.notify.notify_one();
                });
            }
        }
    }
}

pub struct ResourcePool<T: Send> {
    shared: Arc<Shared<T>>,
    factory: Box<dyn Fn() -> T + Send + Sync>,
    config: PoolConfig,
}

impl<T: Send + 'static> ResourcePool<T> {
    pub fn new(config: PoolConfig, factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        assert!(config.capacity > 0, "pool capacity must be nonzero");
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState {
                    free: Vec::new(),
                    in_use: HashSet::new(),
                    next_lease: 0,
                }),
                notify: Notify::new(),
            }),
            factory: Box::new(factory),
            config,
        }
    }

    /// Acquires a resource, reusing an idle one when its TTL has not lapsed,
    /// building a new one while under capacity, otherwise waiting for a
    /// release.
    pub async fn acquire(&self) -> Lease<T> {
        loop {
            {
                let mut state = self.shared.state.lock().await;

                // Manual TTL cleanup: expired idle entries are dropped here,
                // on the acquire path, not by a background task.
                let ttl = self.config.idle_ttl;
                state.free.retain(|idle| idle.parked_at.elapsed() <= ttl);

                let occupied = state.free.len() + state.in_use.len();
                let reusable = state.free.pop();

                if let Some(idle) = reusable {
                    let id = state.next_lease;
                    state.next_lease += 1;
                    state.in_use.insert(id);
                    return Lease {
                        resource: Some(idle.resource),
                        id,
                        shared: Arc::clone(&self.shared),
                    };
                }

                if occupied < self.config.capacity {
                    let id = state.next_lease;
                    state.next_lease += 1;
                    state.in_use.insert(id);
                    let resource = (self.factory)();
                    return Lease {
                        resource: Some(resource),
                        id,
                        shared: Arc::clone(&self.shared),
                    };
                }
            }

            self.shared.notify.notified().await;
        }
    }

    /// Currently leased resource count.
    pub async fn in_use(&self) -> usize {
        self.shared.state.lock().await.in_use.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_pool(capacity: usize, idle_ttl: Duration) -> (Arc<AtomicUsize>, ResourcePool<u64>) {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&built);
        let pool = ResourcePool::new(PoolConfig { capacity, idle_ttl }, move || {
            counter.fetch_add(1, Ordering::SeqCst) as u64
        });
        (built, pool)
    }

    #[tokio::test]
    async fn test_release_enables_reuse() {
        let (built, pool) = counting_pool(2, Duration::from_secs(60));

        let lease = pool.acquire().await;
        assert_eq!(*lease, 0);
        lease.release().await;

        let lease = pool.acquire().await;
        assert_eq!(*lease, 0, "released resource should be reused");
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_capacity_is_never_exceeded() {
        let (_built, pool) = counting_pool(2, Duration::from_secs(60));

        let a = pool.acquire().await;
        let _b = pool.acquire().await;
        assert_eq!(pool.in_use().await, 2);

        // Third acquire must park until something comes back.
        let blocked =
            tokio::time::timeout(Duration::from_millis(20), pool.acquire()).await;
        assert!(blocked.is_err(), "acquire should wait at capacity");

        a.release().await;
        let c = tokio::time::timeout(Duration::from_millis(100), pool.acquire())
            .await
            .expect("acquire should succeed after release");
        assert_eq!(pool.in_use().await, 2);
        drop(c);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expired_idle_entry_is_rebuilt() {
        let (built, pool) = counting_pool(2, Duration::from_secs(10));

        pool.acquire().await.release().await;
        assert_eq!(built.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(11)).await;

        let lease = pool.acquire().await;
        assert_eq!(built.load(Ordering::SeqCst), 2, "stale entry must be rebuilt");
        drop(lease);
    }

    #[tokio::test]
    async fn test_dropped_lease_frees_slot_without_reuse() {
        let (built, pool) = counting_pool(1, Duration::from_secs(60));

        drop(pool.acquire().await);
        tokio::task::yield_now().await;

        let lease = tokio::time::timeout(Duration::from_millis(100), pool.acquire())
            .await
            .expect("slot must be freed by drop");
        // Dropped resource is discarded, so the factory ran again.
        assert_eq!(built.load(Ordering::SeqCst), 2);
        drop(lease);
    }
}
