//! Counting Mutex Module
//!
//! A counting semaphore with a FIFO waiter queue and runtime-resizable capacity.
//!
//! Every transition (grant, release, hand-off to the oldest waiter) happens inside
//! one short critical section, so the observable `in_use` count never exceeds
//! capacity when a unit moves from one holder to the next.

use std::collections::VecDeque;
use std::sync::{Mutex as StdMutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, oneshot};
use tracing::trace;

/// Notifications buffered per subscriber before the oldest are dropped.
pub(crate) const EVENT_BUFFER: usize = 64;

// == Mutex Event ==
/// Observability notifications emitted by a [`Mutex`].
///
/// These are informational only; nothing in the semaphore depends on them being read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexEvent {
    /// A caller obtained a unit
    Acquired { in_use: usize },
    /// A holder gave a unit back (possibly straight to the next waiter)
    Released { in_use: usize },
    /// The last held unit was released
    AllClear,
    /// A caller found the mutex full and joined the queue
    Queued { waiting: usize },
}

#[derive(Debug)]
struct State {
    capacity: usize,
    in_use: usize,
    /// Oldest waiter at the front
    waiters: VecDeque<oneshot::Sender<usize>>,
}

impl State {
    /// Drops abandoned waiters and returns how many are still listening.
    fn prune_waiters(&mut self) -> usize {
        self.waiters.retain(|tx| !tx.is_closed());
        self.waiters.len()
    }

    /// Grants a unit to the oldest waiter still listening, reporting `count` to it.
    /// Abandoned waiters are discarded on the way.
    fn hand_off(&mut self, count: usize) -> bool {
        while let Some(tx) = self.waiters.pop_front() {
            if tx.send(count).is_ok() {
                return true;
            }
        }
        false
    }

    /// Hands free room to waiters, oldest first, until full or nobody is left.
    fn admit_waiters(&mut self) -> usize {
        let mut admitted = 0;
        while self.in_use < self.capacity {
            let next = self.in_use + 1;
            if !self.hand_off(next) {
                break;
            }
            self.in_use = next;
            admitted += 1;
        }
        admitted
    }
}

/// Outcome of the synchronous half of `lock()`.
#[derive(Debug)]
pub(crate) enum Ticket {
    Granted(usize),
    Queued(oneshot::Receiver<usize>),
}

// == Mutex ==
/// Counting semaphore with strictly FIFO wake order.
///
/// A `Mutex::new(1)` behaves like a plain async mutex without a guarded value;
/// larger capacities bound how many holders may run at once.
///
/// Every `lock()` must be paired with exactly one `unlock()`. Prefer
/// [`Mutex::acquire`], which releases the unit when the permit drops.
#[derive(Debug)]
pub struct Mutex {
    state: StdMutex<State>,
    events: broadcast::Sender<MutexEvent>,
}

impl Mutex {
    // == Constructor ==
    /// Creates a mutex that admits up to `capacity` concurrent holders.
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            state: StdMutex::new(State {
                capacity,
                in_use: 0,
                waiters: VecDeque::new(),
            }),
            events,
        }
    }

    // == Lock ==
    /// Acquires one unit, waiting behind older callers when the mutex is full.
    ///
    /// # Returns
    /// The number of units in use right after this caller was admitted.
    pub async fn lock(&self) -> usize {
        let ticket = self.begin_lock();
        self.wait(ticket).await
    }

    /// Grants a unit immediately if there is room and nobody is queued ahead,
    /// otherwise enqueues the caller as the newest waiter.
    pub(crate) fn begin_lock(&self) -> Ticket {
        let mut state = self.state();

        let waiting = state.prune_waiters();
        if state.in_use < state.capacity && waiting == 0 {
            state.in_use += 1;
            let in_use = state.in_use;
            drop(state);

            trace!(in_use, "mutex acquired");
            self.emit(MutexEvent::Acquired { in_use });
            return Ticket::Granted(in_use);
        }

        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(tx);
        let waiting = waiting + 1;
        drop(state);

        trace!(waiting, "mutex full, caller queued");
        self.emit(MutexEvent::Queued { waiting });
        Ticket::Queued(rx)
    }

    /// Resolves a ticket, suspending until a unit is handed over.
    pub(crate) async fn wait(&self, mut ticket: Ticket) -> usize {
        loop {
            match ticket {
                Ticket::Granted(count) => return count,
                Ticket::Queued(rx) => {
                    let mut pending = PendingLock {
                        mutex: self,
                        rx,
                        granted: false,
                    };
                    match (&mut pending.rx).await {
                        Ok(count) => {
                            pending.granted = true;
                            trace!(in_use = count, "mutex handed to waiter");
                            self.emit(MutexEvent::Acquired { in_use: count });
                            return count;
                        }
                        // Sender vanished without granting; queue up again
                        Err(_) => ticket = self.begin_lock(),
                    }
                }
            }
        }
    }

    // == Acquire ==
    /// Locks and returns a permit that unlocks when dropped.
    pub async fn acquire(&self) -> MutexPermit<'_> {
        let count = self.lock().await;
        MutexPermit { mutex: self, count }
    }

    // == Unlock ==
    /// Releases one unit.
    ///
    /// If a waiter is queued and there is room for it, the unit passes directly to
    /// the oldest waiter and `in_use` is unchanged. Otherwise `in_use` drops by one.
    /// Unlocking an idle mutex is a no-op.
    ///
    /// # Returns
    /// The number of units in use after the release.
    pub fn unlock(&self) -> usize {
        let mut state = self.state();
        if state.in_use == 0 {
            return 0;
        }

        let count = state.in_use;
        let handed_off = count <= state.capacity && state.hand_off(count);
        if !handed_off {
            state.in_use -= 1;
        }
        let in_use = state.in_use;
        drop(state);

        trace!(in_use, handed_off, "mutex released");
        self.emit(MutexEvent::Released { in_use });
        if in_use == 0 {
            self.emit(MutexEvent::AllClear);
        }
        in_use
    }

    // == Release All ==
    /// Releases every held unit at once, then refills the freed room from the
    /// queue oldest-first.
    ///
    /// # Returns
    /// How many units were held before the release.
    pub fn release_all(&self) -> usize {
        let mut state = self.state();
        let released = state.in_use;
        state.in_use = 0;
        let admitted = state.admit_waiters();
        let in_use = state.in_use;
        drop(state);

        if released > 0 {
            trace!(released, admitted, "mutex released all units");
            self.emit(MutexEvent::Released { in_use });
            if in_use == 0 {
                self.emit(MutexEvent::AllClear);
            }
        }
        released
    }

    // == Resize ==
    /// Changes the capacity. Growing it admits queued waiters oldest-first into
    /// the new room; shrinking it never revokes units already held.
    ///
    /// # Arguments
    /// * `capacity` - New maximum number of concurrent holders
    ///
    /// # Returns
    /// The new capacity.
    pub fn resize(&self, capacity: usize) -> usize {
        let mut state = self.state();
        state.capacity = capacity;
        let admitted = state.admit_waiters();
        drop(state);

        trace!(capacity, admitted, "mutex resized");
        capacity
    }

    /// True when no further unit can be granted without a release.
    pub fn full(&self) -> bool {
        let state = self.state();
        state.in_use >= state.capacity
    }

    /// Number of callers currently queued.
    pub fn waiting(&self) -> usize {
        self.state().prune_waiters()
    }

    /// Number of units currently held.
    pub fn in_use(&self) -> usize {
        self.state().in_use
    }

    /// Maximum number of concurrent holders.
    pub fn capacity(&self) -> usize {
        self.state().capacity
    }

    #[cfg(test)]
    fn queue_len(&self) -> usize {
        self.state().waiters.len()
    }

    /// Subscribes to acquire/release/all-clear/queued notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<MutexEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: MutexEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new(1)
    }
}

// == Pending Lock ==
/// A queued `lock()` in progress. If the future is dropped after a unit was
/// handed to it but before it observed the grant, the unit is given back.
struct PendingLock<'a> {
    mutex: &'a Mutex,
    rx: oneshot::Receiver<usize>,
    granted: bool,
}

impl Drop for PendingLock<'_> {
    fn drop(&mut self) {
        if self.granted {
            return;
        }
        self.rx.close();
        if self.rx.try_recv().is_ok() {
            trace!("waiter abandoned after hand-off, returning unit");
            self.mutex.unlock();
        }
    }
}

// == Mutex Permit ==
/// One held unit of a [`Mutex`], released on drop.
#[derive(Debug)]
#[must_use = "dropping the permit releases the unit immediately"]
pub struct MutexPermit<'a> {
    mutex: &'a Mutex,
    count: usize,
}

impl MutexPermit<'_> {
    /// Units in use at the moment this permit was granted.
    pub fn count(&self) -> usize {
        self.count
    }
}

impl Drop for MutexPermit<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}
