//! Per-target connection pool.
//!
//! A [`TargetPool`] owns the idle connections for one [`TargetIdentity`],
//! counts the ones it has lent out or is opening, and queues callers in
//! arrival order once it hits `pool_size + max_overflow` or the global
//! budget runs dry.
//!
//! Every handoff to a queued caller (a returned connection or a permit to
//! open one) happens with the pool lock held, so a caller that cancels
//! either gets the delivery back from its channel or is never sent one.

use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tidepool_core::{TargetConfig, TargetIdentity};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::budget::GlobalBudget;
use crate::config::PoolConfig;
use crate::connection::{PooledConnection, Tracked};
use crate::error::{PoolError, PoolResult};
use crate::factory::ConnectionFactory;
use crate::stats::PoolStats;

/// Where a target pool is in its life.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    /// Lending and accepting connections.
    Open,
    /// Force-closed by the registry to admit another target.
    Evicted,
    /// Removed by the reaper after it drained.
    Retired,
    /// The broker is shutting down.
    ShuttingDown,
}

/// What a queued caller receives.
enum Delivery<C> {
    /// A returned connection, already counted as borrowed.
    Connection(Tracked<C>),
    /// Permission to open a connection, already counted as opening.
    Permit,
    Failed(PoolError),
}

struct Waiter<C> {
    id: u64,
    tx: oneshot::Sender<Delivery<C>>,
}

struct State<C> {
    idle: VecDeque<Tracked<C>>,
    borrowed: usize,
    opening: usize,
    waiters: VecDeque<Waiter<C>>,
    lifecycle: Lifecycle,
    last_activity: Instant,
    /// Registered with the global budget as waiting for a slot.
    starved: bool,
    next_waiter_id: u64,
    wait_count: u64,
    timeout_count: u64,
    created_count: u64,
    closed_count: u64,
}

impl<C> State<C> {
    fn live(&self) -> usize {
        self.idle.len() + self.borrowed + self.opening
    }
}

/// Connection pool for a single target identity.
pub struct TargetPool<F: ConnectionFactory> {
    identity: TargetIdentity,
    target: TargetConfig,
    factory: Arc<F>,
    budget: Arc<GlobalBudget<F>>,
    pool_size: usize,
    capacity: usize,
    health_check_on_acquire: bool,
    created_at: Instant,
    state: Mutex<State<F::Connection>>,
}

enum Grant<'a, F: ConnectionFactory> {
    Idle(Tracked<F::Connection>),
    Handoff(Tracked<F::Connection>),
    Create(Reservation<'a, F>),
}

enum Step<'a, F: ConnectionFactory> {
    Ready(Grant<'a, F>),
    /// Queued. The flag is set when the global budget, not this pool's own
    /// cap, is what keeps the caller waiting.
    Queued(WaitTicket<'a, F>, bool),
}

impl<F: ConnectionFactory> TargetPool<F> {
    pub(crate) fn new(
        target: TargetConfig,
        config: &PoolConfig,
        factory: Arc<F>,
        budget: Arc<GlobalBudget<F>>,
    ) -> Arc<Self> {
        let now = Instant::now();
        let pool = Arc::new(Self {
            identity: target.identity(),
            target,
            factory,
            budget,
            pool_size: config.pool_size,
            capacity: config.capacity(),
            health_check_on_acquire: config.health_check_on_acquire,
            created_at: now,
            state: Mutex::new(State {
                idle: VecDeque::new(),
                borrowed: 0,
                opening: 0,
                waiters: VecDeque::new(),
                lifecycle: Lifecycle::Open,
                last_activity: now,
                starved: false,
                next_waiter_id: 0,
                wait_count: 0,
                timeout_count: 0,
                created_count: 0,
                closed_count: 0,
            }),
        });
        pool.budget.enroll(&pool);
        pool
    }

    pub fn identity(&self) -> &TargetIdentity {
        &self.identity
    }

    pub fn target(&self) -> &TargetConfig {
        &self.target
    }

    pub(crate) fn factory(&self) -> &Arc<F> {
        &self.factory
    }

    /// Steady-state size this pool was configured with.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Hard cap on live connections: `pool_size + max_overflow`.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lock().lifecycle
    }

    pub fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    pub fn borrowed_count(&self) -> usize {
        self.state.lock().borrowed
    }

    pub fn queued_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Connections lent out or still being opened.
    pub fn outstanding(&self) -> usize {
        let state = self.state.lock();
        state.borrowed + state.opening
    }

    pub fn last_activity(&self) -> Instant {
        self.state.lock().last_activity
    }

    /// Sort key for LRU eviction: oldest activity first, then oldest pool.
    pub(crate) fn lru_key(&self) -> (Instant, Instant) {
        (self.last_activity(), self.created_at)
    }

    pub(crate) fn touch(&self) {
        self.state.lock().last_activity = Instant::now();
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            targets: 1,
            borrowed: state.borrowed,
            idle: state.idle.len(),
            opening: state.opening,
            queued: state.waiters.len(),
            capacity: self.capacity,
            wait_count: state.wait_count,
            timeout_count: state.timeout_count,
            created_count: state.created_count,
            closed_count: state.closed_count,
        }
    }

    /// Borrow a connection, waiting up to `timeout` if the pool is full.
    ///
    /// Idle connections are reused most-recently-returned first. When none
    /// is idle and both the per-target cap and the global budget allow it,
    /// a new connection is opened; otherwise the caller joins the FIFO
    /// queue. Dropping the returned future at any point leaves the pool
    /// consistent.
    pub async fn acquire(self: &Arc<Self>, timeout: Duration) -> PoolResult<PooledConnection<F>> {
        let started = Instant::now();
        let deadline = started + timeout;

        let mut grant = match self.begin_acquire()? {
            Step::Ready(grant) => grant,
            Step::Queued(ticket, starved) => {
                if starved {
                    self.budget.reclaim_idle_for(self).await;
                }
                ticket.wait(deadline, started).await?
            }
        };

        loop {
            match grant {
                Grant::Idle(tracked) => {
                    let mut conn = PooledConnection::new(tracked, Arc::clone(self));
                    if !self.health_check_on_acquire || conn.check_health().await {
                        return Ok(conn);
                    }
                    tracing::debug!(
                        pool = %self.identity,
                        conn_id = conn.id(),
                        "discarded unhealthy idle connection"
                    );
                    // Keep the caller's place: the dead connection's slot
                    // becomes its next grant instead of going to the queue.
                    let doomed = conn.detach();
                    let next = self.replace_unhealthy();
                    self.close(doomed).await;
                    grant = next?;
                }
                Grant::Handoff(tracked) => {
                    return Ok(PooledConnection::new(tracked, Arc::clone(self)));
                }
                Grant::Create(reservation) => return self.open(reservation).await,
            }
        }
    }

    fn begin_acquire(self: &Arc<Self>) -> PoolResult<Step<'_, F>> {
        let mut starved = false;
        let ticket = {
            let mut state = self.state.lock();
            if state.lifecycle != Lifecycle::Open {
                return Err(self.closed_error(state.lifecycle));
            }
            state.last_activity = Instant::now();

            if state.waiters.is_empty() {
                if let Some(tracked) = state.idle.pop_back() {
                    state.borrowed += 1;
                    return Ok(Step::Ready(Grant::Idle(tracked)));
                }
                if state.live() < self.capacity {
                    if self.budget.try_reserve() {
                        state.opening += 1;
                        return Ok(Step::Ready(Grant::Create(Reservation::new(self))));
                    }
                    self.mark_starved(&mut state);
                    starved = true;
                }
            }

            let (tx, rx) = oneshot::channel();
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            state.waiters.push_back(Waiter { id, tx });
            state.wait_count += 1;

            tracing::debug!(
                pool = %self.identity,
                queued = state.waiters.len(),
                live = state.live(),
                "pool at capacity, caller queued"
            );

            WaitTicket {
                pool: self,
                id,
                rx,
                settled: false,
            }
        };

        // Earlier waiters may be serviceable now that someone else is queued too.
        starved |= self.pump(false);
        Ok(Step::Queued(ticket, starved))
    }

    /// Swap a borrowed connection that failed its health check for the
    /// next idle one, or for a permit to open a new one on the same slot.
    fn replace_unhealthy(self: &Arc<Self>) -> PoolResult<Grant<'_, F>> {
        let mut state = self.state.lock();
        state.borrowed -= 1;
        if state.lifecycle != Lifecycle::Open {
            let lifecycle = state.lifecycle;
            drop(state);
            self.budget.release(1);
            return Err(self.closed_error(lifecycle));
        }
        if let Some(tracked) = state.idle.pop_back() {
            state.borrowed += 1;
            self.hand_off_slot(state);
            return Ok(Grant::Idle(tracked));
        }
        state.opening += 1;
        Ok(Grant::Create(Reservation::new(self)))
    }

    async fn open(self: &Arc<Self>, mut reservation: Reservation<'_, F>) -> PoolResult<PooledConnection<F>> {
        match self.factory.connect(&self.target).await {
            Ok(conn) => {
                reservation.disarm();
                let tracked = Tracked::new(self.budget.next_connection_id(), conn);

                let refused = {
                    let mut state = self.state.lock();
                    state.opening -= 1;
                    state.created_count += 1;
                    if state.lifecycle == Lifecycle::Open {
                        state.borrowed += 1;
                        None
                    } else {
                        Some(state.lifecycle)
                    }
                };

                if let Some(lifecycle) = refused {
                    self.budget.release(1);
                    self.close(tracked).await;
                    return Err(self.closed_error(lifecycle));
                }

                tracing::debug!(
                    pool = %self.identity,
                    conn_id = tracked.id,
                    "created new connection"
                );
                Ok(PooledConnection::new(tracked, Arc::clone(self)))
            }
            Err(reason) => {
                drop(reservation);
                tracing::warn!(
                    pool = %self.identity,
                    reason = %reason,
                    "failed to open connection"
                );
                Err(PoolError::Connection {
                    target: self.identity.to_string(),
                    reason,
                })
            }
        }
    }

    /// Take a connection back from a borrower.
    ///
    /// Returns the connection if it has to be closed instead of pooled.
    pub(crate) fn check_in(
        &self,
        mut tracked: Tracked<F::Connection>,
        broken: bool,
    ) -> Option<Tracked<F::Connection>> {
        let mut state = self.state.lock();
        let now = Instant::now();
        state.borrowed -= 1;
        state.last_activity = now;

        if broken || state.lifecycle != Lifecycle::Open {
            self.hand_off_slot(state);
            return Some(tracked);
        }

        tracked.idle_since = now;
        let mut delivery = Delivery::Connection(tracked);
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.tx.send(delivery) {
                Ok(()) => {
                    state.borrowed += 1;
                    return None;
                }
                Err(returned) => delivery = returned,
            }
        }

        let Delivery::Connection(tracked) = delivery else {
            return None;
        };

        // Another target is queued on the global budget; give it our slot.
        if self.budget.has_starved_other(self) {
            drop(state);
            self.budget.release(1);
            return Some(tracked);
        }

        state.idle.push_back(tracked);
        None
    }

    /// A slot this pool held is free. Give it to the oldest waiter as a
    /// permit to open a connection, or return it to the global budget.
    fn hand_off_slot(&self, mut state: MutexGuard<'_, State<F::Connection>>) {
        let transferred = state.lifecycle == Lifecycle::Open && Self::grant_permit(&mut state);
        drop(state);
        if !transferred {
            self.budget.release(1);
        }
    }

    fn grant_permit(state: &mut State<F::Connection>) -> bool {
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.tx.send(Delivery::Permit).is_ok() {
                state.opening += 1;
                return true;
            }
        }
        false
    }

    fn cancel_reservation(&self) {
        let mut state = self.state.lock();
        state.opening -= 1;
        self.hand_off_slot(state);
    }

    fn mark_starved(self: &Arc<Self>, state: &mut State<F::Connection>) {
        if !state.starved {
            state.starved = true;
            self.budget.register_starved(Arc::downgrade(self));
        }
    }

    /// Grant permits to queued callers while this pool has room under its
    /// own cap and the global budget has slots. Returns `true` if callers
    /// are left waiting on the budget.
    fn pump(self: &Arc<Self>, woken: bool) -> bool {
        let mut spare = 0;
        let mut starved = false;
        {
            let mut state = self.state.lock();
            if woken {
                state.starved = false;
            }
            while state.lifecycle == Lifecycle::Open
                && !state.waiters.is_empty()
                && state.live() < self.capacity
            {
                if !self.budget.try_reserve() {
                    self.mark_starved(&mut state);
                    starved = true;
                    break;
                }
                if !Self::grant_permit(&mut state) {
                    spare += 1;
                    break;
                }
            }
        }
        self.budget.release(spare);
        starved
    }

    /// Called by the global budget when a slot frees up.
    pub(crate) fn wake_starved(self: &Arc<Self>) {
        self.pump(true);
    }

    /// Give up the longest-idle connection so another pool can use its
    /// global slot. The caller releases the slot and closes the connection.
    pub(crate) fn take_oldest_idle(&self) -> Option<Tracked<F::Connection>> {
        let mut state = self.state.lock();
        if state.lifecycle != Lifecycle::Open {
            return None;
        }
        state.idle.pop_front()
    }

    /// Close a connection that has already left the pool's accounting.
    pub(crate) async fn close(&self, tracked: Tracked<F::Connection>) {
        self.state.lock().closed_count += 1;
        tracing::debug!(pool = %self.identity, conn_id = tracked.id, "closing connection");
        self.factory.close(tracked.conn).await;
    }

    /// Like [`close`](Self::close) but for synchronous contexts such as `Drop`.
    pub(crate) fn close_detached(self: &Arc<Self>, tracked: Tracked<F::Connection>) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = Arc::clone(self);
                handle.spawn(async move { pool.close(tracked).await });
            }
            Err(_) => {
                self.state.lock().closed_count += 1;
                drop(tracked);
            }
        }
    }

    /// Force-close the pool to make room for another target.
    pub async fn evict(&self) {
        self.close_down(Lifecycle::Evicted).await;
    }

    pub async fn shutdown(&self) {
        self.close_down(Lifecycle::ShuttingDown).await;
    }

    /// Stop lending: fail queued callers, close idle connections and mark
    /// borrowed ones for close on release.
    async fn close_down(&self, lifecycle: Lifecycle) {
        let (idle, waiters, borrowed) = {
            let mut state = self.state.lock();
            if state.lifecycle == Lifecycle::Open || lifecycle == Lifecycle::ShuttingDown {
                state.lifecycle = lifecycle;
            }
            (
                mem::take(&mut state.idle),
                mem::take(&mut state.waiters),
                state.borrowed,
            )
        };

        let error = self.closed_error(lifecycle);
        for waiter in waiters {
            let _ = waiter.tx.send(Delivery::Failed(error.clone()));
        }

        tracing::info!(
            pool = %self.identity,
            lifecycle = ?lifecycle,
            idle = idle.len(),
            borrowed = borrowed,
            "closing target pool"
        );

        self.budget.release(idle.len());
        for tracked in idle {
            self.close(tracked).await;
        }
    }

    /// Close idle connections that have sat unused longer than `idle_timeout`.
    /// Returns how many were closed.
    pub async fn reap_idle(&self, idle_timeout: Duration) -> usize {
        let now = Instant::now();
        let expired = {
            let mut state = self.state.lock();
            let (expired, keep): (VecDeque<_>, VecDeque<_>) = mem::take(&mut state.idle)
                .into_iter()
                .partition(|tracked| now.duration_since(tracked.idle_since) > idle_timeout);
            state.idle = keep;
            expired
        };

        if expired.is_empty() {
            return 0;
        }

        let reaped = expired.len();
        self.budget.release(reaped);
        for tracked in expired {
            self.close(tracked).await;
        }

        tracing::info!(
            pool = %self.identity,
            reaped = reaped,
            remaining_idle = self.idle_count(),
            "reaped idle connections"
        );
        reaped
    }

    /// Mark an open pool with no connections and no waiters as retired.
    /// Returns `true` if the pool is retired (now or already) and empty.
    pub(crate) fn retire_if_drained(&self) -> bool {
        let mut state = self.state.lock();
        let drained = state.live() == 0 && state.waiters.is_empty();
        if drained && state.lifecycle == Lifecycle::Open {
            state.lifecycle = Lifecycle::Retired;
        }
        drained && state.lifecycle == Lifecycle::Retired
    }

    fn closed_error(&self, lifecycle: Lifecycle) -> PoolError {
        match lifecycle {
            Lifecycle::ShuttingDown => PoolError::ShuttingDown,
            _ => PoolError::Evicted {
                target: self.identity.to_string(),
            },
        }
    }

    fn exhausted(&self, waited: Duration) -> PoolError {
        PoolError::Exhausted {
            target: self.identity.to_string(),
            waited,
        }
    }

    fn reclaim(self: &Arc<Self>, delivery: Delivery<F::Connection>) {
        match delivery {
            Delivery::Connection(tracked) => {
                if let Some(doomed) = self.check_in(tracked, false) {
                    self.close_detached(doomed);
                }
            }
            Delivery::Permit => self.cancel_reservation(),
            Delivery::Failed(_) => {}
        }
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for TargetPool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TargetPool")
            .field("identity", &self.identity)
            .field("capacity", &self.capacity)
            .field("lifecycle", &state.lifecycle)
            .field("idle", &state.idle.len())
            .field("borrowed", &state.borrowed)
            .field("opening", &state.opening)
            .field("queued", &state.waiters.len())
            .finish_non_exhaustive()
    }
}

impl<F: ConnectionFactory> Drop for TargetPool<F> {
    fn drop(&mut self) {
        let idle = self.state.get_mut().idle.len();
        self.budget.release(idle);
    }
}

/// A global slot plus a per-target `opening` count taken on behalf of one
/// caller. Returned to the pool unless disarmed by a successful connect.
struct Reservation<'a, F: ConnectionFactory> {
    pool: &'a Arc<TargetPool<F>>,
    armed: bool,
}

impl<'a, F: ConnectionFactory> Reservation<'a, F> {
    fn new(pool: &'a Arc<TargetPool<F>>) -> Self {
        Self { pool, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<F: ConnectionFactory> Drop for Reservation<'_, F> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.cancel_reservation();
        }
    }
}

/// A caller's place in the wait queue.
struct WaitTicket<'a, F: ConnectionFactory> {
    pool: &'a Arc<TargetPool<F>>,
    id: u64,
    rx: oneshot::Receiver<Delivery<F::Connection>>,
    settled: bool,
}

impl<'a, F: ConnectionFactory> WaitTicket<'a, F> {
    async fn wait(mut self, deadline: Instant, started: Instant) -> PoolResult<Grant<'a, F>> {
        let pool = self.pool;
        let outcome = tokio::time::timeout_at(deadline, &mut self.rx).await;
        let delivery = match outcome {
            Ok(Ok(delivery)) => Some(delivery),
            Ok(Err(_)) => {
                self.settled = true;
                return Err(pool.closed_error(Lifecycle::Evicted));
            }
            // A delivery may have raced the deadline.
            Err(_) => self.cancel(),
        };
        self.settled = true;

        match delivery {
            Some(Delivery::Connection(tracked)) => Ok(Grant::Handoff(tracked)),
            Some(Delivery::Permit) => Ok(Grant::Create(Reservation::new(pool))),
            Some(Delivery::Failed(err)) => Err(err),
            None => {
                let waited = started.elapsed();
                pool.state.lock().timeout_count += 1;
                tracing::debug!(
                    pool = %pool.identity,
                    waited_ms = waited.as_millis() as u64,
                    "queued caller timed out"
                );
                Err(pool.exhausted(waited))
            }
        }
    }

    /// Leave the queue. Returns anything that was sent before we left.
    fn cancel(&mut self) -> Option<Delivery<F::Connection>> {
        let id = self.id;
        self.pool.state.lock().waiters.retain(|w| w.id != id);
        self.rx.close();
        self.rx.try_recv().ok()
    }
}

impl<F: ConnectionFactory> Drop for WaitTicket<'_, F> {
    fn drop(&mut self) {
        if !self.settled {
            if let Some(delivery) = self.cancel() {
                self.pool.reclaim(delivery);
            }
        }
    }
}
