//! Global live-connection budget shared by every target pool.
//!
//! A slot is taken before a pool opens a physical connection and given
//! back when the connection leaves the pool. Pools whose queued callers are
//! blocked only by this budget register as *starved*; freed slots wake them
//! in registration order. A starved pool may also take an idle connection
//! from the least recently used other pool and close it to free a slot.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::factory::ConnectionFactory;
use crate::pool::TargetPool;

pub(crate) struct GlobalBudget<F: ConnectionFactory> {
    max: usize,
    live: AtomicUsize,
    starved: Mutex<VecDeque<Weak<TargetPool<F>>>>,
    /// Every pool drawing on this budget, including evicted ones that still
    /// have connections lent out.
    members: Mutex<Vec<Weak<TargetPool<F>>>>,
    next_connection_id: AtomicU64,
}

impl<F: ConnectionFactory> GlobalBudget<F> {
    pub(crate) fn new(max: usize) -> Self {
        Self {
            max,
            live: AtomicUsize::new(0),
            starved: Mutex::new(VecDeque::new()),
            members: Mutex::new(Vec::new()),
            next_connection_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn max(&self) -> usize {
        self.max
    }

    /// Live connections (opening, borrowed and idle) across all pools.
    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Take one slot if the budget allows it.
    pub(crate) fn try_reserve(&self) -> bool {
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                (live < self.max).then_some(live + 1)
            })
            .is_ok()
    }

    /// Give back `n` slots and offer the freed capacity to starved pools.
    ///
    /// Must not be called while holding a target pool lock.
    pub(crate) fn release(&self, n: usize) {
        if n == 0 {
            return;
        }
        self.live.fetch_sub(n, Ordering::SeqCst);

        while self.live() < self.max {
            let next = self.starved.lock().pop_front();
            let Some(weak) = next else { break };
            if let Some(pool) = weak.upgrade() {
                pool.wake_starved();
            }
        }
    }

    /// Queue a pool to be woken when a slot frees up. Called with the
    /// pool's own lock held, so it only touches the starved list.
    pub(crate) fn register_starved(&self, pool: Weak<TargetPool<F>>) {
        self.starved.lock().push_back(pool);
    }

    /// Whether a live pool other than `me` is queued waiting for a slot.
    ///
    /// Only compares pointers: upgrading here could drop the last handle to
    /// a pool while the starved list is locked.
    pub(crate) fn has_starved_other(&self, me: &TargetPool<F>) -> bool {
        let me = me as *const TargetPool<F>;
        self.starved
            .lock()
            .iter()
            .any(|weak| weak.strong_count() > 0 && weak.as_ptr() != me)
    }

    pub(crate) fn enroll(&self, pool: &Arc<TargetPool<F>>) {
        let mut members = self.members.lock();
        members.retain(|weak| weak.strong_count() > 0);
        members.push(Arc::downgrade(pool));
    }

    /// Pools still alive that draw on this budget.
    pub(crate) fn members(&self) -> Vec<Arc<TargetPool<F>>> {
        let members: Vec<_> = self.members.lock().clone();
        members.iter().filter_map(Weak::upgrade).collect()
    }

    /// Close the oldest idle connection of the least recently used pool
    /// other than `starved` and release its slot, which wakes starved pools.
    /// Returns `false` if no other pool had an idle connection.
    pub(crate) async fn reclaim_idle_for(&self, starved: &TargetPool<F>) -> bool {
        let mut donors: Vec<_> = self
            .members()
            .into_iter()
            .filter(|pool| !std::ptr::eq(Arc::as_ptr(pool), starved))
            .collect();
        donors.sort_by_key(|pool| pool.lru_key());

        for donor in donors {
            if let Some(tracked) = donor.take_oldest_idle() {
                tracing::debug!(
                    pool = %donor.identity(),
                    starved = %starved.identity(),
                    conn_id = tracked.id,
                    "closing idle connection to free a global slot"
                );
                self.release(1);
                donor.close(tracked).await;
                return true;
            }
        }
        false
    }

    /// Unique id for a newly opened connection.
    pub(crate) fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::BoxFuture;
    use tidepool_core::TargetConfig;

    struct NoopFactory;

    impl ConnectionFactory for NoopFactory {
        type Connection = ();

        fn connect<'a>(&'a self, _target: &'a TargetConfig) -> BoxFuture<'a, Result<(), String>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[test]
    fn reserve_respects_cap() {
        let budget = GlobalBudget::<NoopFactory>::new(2);
        assert!(budget.try_reserve());
        assert!(budget.try_reserve());
        assert!(!budget.try_reserve());
        assert_eq!(budget.live(), 2);

        budget.release(1);
        assert_eq!(budget.live(), 1);
        assert!(budget.try_reserve());
    }

    #[test]
    fn release_zero_is_a_noop() {
        let budget = GlobalBudget::<NoopFactory>::new(1);
        assert!(budget.try_reserve());
        budget.release(0);
        assert_eq!(budget.live(), 1);
    }

    #[test]
    fn dead_starved_entries_are_skipped() {
        let budget = GlobalBudget::<NoopFactory>::new(1);
        budget.register_starved(Weak::new());
        assert!(budget.try_reserve());
        budget.release(1);
        assert!(budget.starved.lock().is_empty());
    }

    #[test]
    fn dead_starved_entries_do_not_count() {
        let budget = GlobalBudget::<NoopFactory>::new(1);
        budget.register_starved(Weak::new());
        assert!(!budget.starved.lock().is_empty());

        let pool = TargetPool::new(
            TargetConfig::new("db1", 1433, "sales", "svc"),
            &crate::testing::config(1, 0),
            Arc::new(NoopFactory),
            Arc::new(GlobalBudget::new(1)),
        );
        assert!(!budget.has_starved_other(&pool));
        budget.register_starved(Arc::downgrade(&pool));
        assert!(!budget.has_starved_other(&pool));
    }

    #[test]
    fn connection_ids_are_unique() {
        let budget = GlobalBudget::<NoopFactory>::new(1);
        let a = budget.next_connection_id();
        let b = budget.next_connection_id();
        assert_ne!(a, b);
    }
}
