//! Pool statistics.

use serde::Serialize;

/// Counters for one target pool, or summed over all of them.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Number of target pools these numbers cover.
    pub targets: usize,
    /// Connections currently lent to callers.
    pub borrowed: usize,
    /// Connections sitting idle in the pool.
    pub idle: usize,
    /// Connections being opened by the factory right now.
    pub opening: usize,
    /// Callers waiting in the FIFO queue.
    pub queued: usize,
    /// Per-target cap (`pool_size + max_overflow`), summed for aggregates.
    pub capacity: usize,
    /// Times a caller had to queue.
    pub wait_count: u64,
    /// Times a queued caller gave up after its timeout.
    pub timeout_count: u64,
    /// Physical connections opened.
    pub created_count: u64,
    /// Physical connections closed.
    pub closed_count: u64,
}

impl PoolStats {
    /// Live connections (borrowed, idle and opening).
    pub fn total(&self) -> usize {
        self.borrowed + self.idle + self.opening
    }

    pub(crate) fn merge(&mut self, other: &PoolStats) {
        self.targets += other.targets;
        self.borrowed += other.borrowed;
        self.idle += other.idle;
        self.opening += other.opening;
        self.queued += other.queued;
        self.capacity += other.capacity;
        self.wait_count += other.wait_count;
        self.timeout_count += other.timeout_count;
        self.created_count += other.created_count;
        self.closed_count += other.closed_count;
    }
}
