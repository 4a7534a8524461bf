//! Rate Limiter Module
//!
//! Bounds operations two ways at once: at most `concurrency` in flight, and at
//! most `limit` started within each `interval`-long window.
//!
//! The window is a [`Mutex`] whose units are never returned by callers. They are
//! all released together when the window elapses, either by the next `lock()` or
//! by the cleaner task armed while callers are queued on a full window.

use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::mutex::{Mutex, MutexEvent, Ticket, EVENT_BUFFER};
use crate::config::Config;
use crate::tasks::spawn_window_cleaner;

/// Operations started per window by default.
pub const DEFAULT_LIMIT: usize = 20;
/// Default window length.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);
/// Operations in flight by default.
pub const DEFAULT_CONCURRENCY: usize = 2;

// == Limiter Event ==
/// Window notifications emitted by a [`RateLimiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimiterEvent {
    /// A caller obtained a slot in the current window
    WindowAcquired { in_window: usize },
    /// Slots of an elapsed window were handed back
    WindowReleased { released: usize },
    /// A new window started
    WindowReset,
}

#[derive(Debug)]
struct Window {
    /// `None` until the first `lock()` opens a window
    start: Option<Instant>,
    interval: Duration,
    cleaner: Option<JoinHandle<()>>,
    /// Bumped on every arming so a superseded cleaner can tell it is stale
    generation: u64,
}

impl Window {
    fn elapsed(&self, now: Instant) -> bool {
        match self.start {
            Some(start) => now.saturating_duration_since(start) >= self.interval,
            None => true,
        }
    }

    fn deadline(&self, now: Instant) -> Instant {
        self.start.unwrap_or(now) + self.interval
    }
}

#[derive(Debug)]
pub(crate) struct Inner {
    concurrency: Mutex,
    window: Mutex,
    clock: StdMutex<Window>,
    events: broadcast::Sender<LimiterEvent>,
}

impl Inner {
    /// Opens a new window if the current one elapsed, then takes a window slot or
    /// queues for one. Queuing on a full window arms the cleaner.
    fn enter_window(self: &Arc<Self>) -> Ticket {
        let mut clock = self.clock();
        let now = Instant::now();

        if clock.elapsed(now) {
            self.reset_window(&mut clock, now);
        }

        let ticket = self.window.begin_lock();
        if matches!(ticket, Ticket::Queued(_)) && clock.cleaner.is_none() {
            self.arm_cleaner(&mut clock, now);
        }
        ticket
    }

    fn reset_window(&self, clock: &mut Window, now: Instant) {
        let released = self.window.release_all();
        clock.start = Some(now);

        debug!(released, "Rate limiter window reset");
        if released > 0 {
            self.emit(LimiterEvent::WindowReleased { released });
        }
        self.emit(LimiterEvent::WindowReset);
    }

    fn arm_cleaner(self: &Arc<Self>, clock: &mut Window, now: Instant) {
        clock.generation += 1;
        // Nothing a reset could admit
        if self.window.capacity() == 0 {
            return;
        }
        let deadline = clock.deadline(now);
        clock.cleaner = spawn_window_cleaner(Arc::downgrade(self), clock.generation, deadline);
    }

    /// Cancels any pending cleaner and schedules a fresh one if callers are queued.
    fn rearm_cleaner(self: &Arc<Self>) {
        let mut clock = self.clock();
        if let Some(handle) = clock.cleaner.take() {
            handle.abort();
        }
        clock.generation += 1;

        if self.window.waiting() > 0 {
            self.arm_cleaner(&mut clock, Instant::now());
        }
    }

    /// Called by the cleaner task when its deadline passes.
    ///
    /// # Returns
    /// The next deadline while callers remain queued, `None` once the task should retire.
    pub(crate) fn on_cleaner_fired(&self, generation: u64) -> Option<Instant> {
        let mut clock = self.clock();
        if clock.generation != generation {
            return None;
        }

        let now = Instant::now();
        // A lock() may already have opened a fresh window
        if clock.elapsed(now) {
            self.reset_window(&mut clock, now);
        }

        if self.window.waiting() > 0 && self.window.capacity() > 0 {
            Some(clock.deadline(now))
        } else {
            clock.cleaner = None;
            None
        }
    }

    fn emit(&self, event: LimiterEvent) {
        let _ = self.events.send(event);
    }

    fn clock(&self) -> MutexGuard<'_, Window> {
        self.clock.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let clock = self.clock.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = clock.cleaner.take() {
            handle.abort();
        }
    }
}

// == Rate Limiter ==
/// Sliding-window plus concurrency limiter.
///
/// Cloning is cheap and every clone shares the same windows and queues.
///
/// ```ignore
/// let limiter = RateLimiter::new(4, Duration::from_millis(500), 2);
/// let page = limiter.run(fetch_page(id)).await;
/// ```
#[derive(Debug, Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

impl RateLimiter {
    // == Constructor ==
    /// Creates a limiter admitting `limit` starts per `interval` and `concurrency`
    /// operations in flight.
    ///
    /// A `limit` of zero blocks every caller until the limit is raised. A zero
    /// `interval` opens a new window on every call, leaving only the concurrency bound.
    pub fn new(limit: usize, interval: Duration, concurrency: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(Inner {
                concurrency: Mutex::new(concurrency),
                window: Mutex::new(limit),
                clock: StdMutex::new(Window {
                    start: None,
                    interval,
                    cleaner: None,
                    generation: 0,
                }),
                events,
            }),
        }
    }

    /// Creates a limiter from the `RATE_*` settings.
    ///
    /// # Arguments
    /// * `config` - Loaded configuration; `rate_limit`, `rate_interval_ms` and
    ///   `concurrency` are used
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.rate_limit, config.rate_interval(), config.concurrency)
    }

    // == Lock ==
    /// Waits for a window slot, then for a concurrency slot.
    ///
    /// Window contention queues callers before they compete for concurrency.
    ///
    /// # Returns
    /// Operations in flight right after this caller was admitted.
    pub async fn lock(&self) -> usize {
        let ticket = self.inner.enter_window();
        let in_window = self.inner.window.wait(ticket).await;
        trace!(in_window, "rate limiter window slot acquired");
        self.inner.emit(LimiterEvent::WindowAcquired { in_window });

        self.inner.concurrency.lock().await
    }

    /// Releases the concurrency slot only; the window slot stays counted until
    /// the window elapses.
    pub fn unlock(&self) -> usize {
        self.inner.concurrency.unlock()
    }

    /// Locks and returns a permit that unlocks when dropped.
    pub async fn acquire(&self) -> LimiterPermit<'_> {
        let count = self.lock().await;
        LimiterPermit {
            limiter: self,
            count,
        }
    }

    /// Runs `operation` while holding a permit, releasing it however the operation ends.
    pub async fn run<F>(&self, operation: F) -> F::Output
    where
        F: Future,
    {
        let _permit = self.acquire().await;
        operation.await
    }

    // == Concurrency Bound ==
    /// Changes how many operations may be in flight at once.
    ///
    /// # Arguments
    /// * `concurrency` - New concurrency bound; raising it admits queued callers
    pub fn resize(&self, concurrency: usize) -> usize {
        self.inner.concurrency.resize(concurrency)
    }

    /// True when every concurrency slot is taken.
    pub fn full(&self) -> bool {
        self.inner.concurrency.full()
    }

    /// Callers queued for a concurrency slot.
    pub fn waiting(&self) -> usize {
        self.inner.concurrency.waiting()
    }

    /// Operations currently in flight.
    pub fn in_use(&self) -> usize {
        self.inner.concurrency.in_use()
    }

    /// Maximum operations in flight at once.
    pub fn concurrency(&self) -> usize {
        self.inner.concurrency.capacity()
    }

    /// Subscribes to notifications of the concurrency bound.
    pub fn subscribe(&self) -> broadcast::Receiver<MutexEvent> {
        self.inner.concurrency.subscribe()
    }

    // == Window Bound ==
    /// Maximum operations started per window.
    pub fn limit(&self) -> usize {
        self.inner.window.capacity()
    }

    /// Changes how many operations may start per window. Raising it admits
    /// queued callers that now fit straight away.
    ///
    /// # Arguments
    /// * `limit` - Starts allowed per window; zero blocks new callers
    pub fn set_limit(&self, limit: usize) {
        self.inner.window.resize(limit);
        self.inner.rearm_cleaner();
        debug!(limit, "Rate limiter window limit changed");
    }

    /// Current window length.
    pub fn interval(&self) -> Duration {
        self.inner.clock().interval
    }

    /// Changes the window length. The current window keeps its start time.
    pub fn set_interval(&self, interval: Duration) {
        self.inner.clock().interval = interval;
        self.inner.rearm_cleaner();
        debug!(interval_ms = interval.as_millis() as u64, "Rate limiter interval changed");
    }

    /// Callers queued for a window slot.
    pub fn window_waiting(&self) -> usize {
        self.inner.window.waiting()
    }

    /// Operations started in the current window.
    pub fn window_in_use(&self) -> usize {
        self.inner.window.in_use()
    }

    /// Subscribes to window acquire/release/reset notifications.
    pub fn subscribe_window(&self) -> broadcast::Receiver<LimiterEvent> {
        self.inner.events.subscribe()
    }

    #[cfg(test)]
    pub(crate) fn has_cleaner(&self) -> bool {
        self.inner.clock().cleaner.is_some()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_LIMIT, DEFAULT_INTERVAL, DEFAULT_CONCURRENCY)
    }
}

// == Limiter Permit ==
/// A held concurrency slot of a [`RateLimiter`], released on drop.
#[derive(Debug)]
#[must_use = "dropping the permit releases the slot immediately"]
pub struct LimiterPermit<'a> {
    limiter: &'a RateLimiter,
    count: usize,
}

impl LimiterPermit<'_> {
    /// Operations in flight at the moment this permit was granted.
    pub fn count(&self) -> usize {
        self.count
    }
}

impl Drop for LimiterPermit<'_> {
    fn drop(&mut self) {
        self.limiter.unlock();
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, timeout};
    use tokio_test::task;
    use tokio_test::{assert_pending, assert_ready};

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_defaults() {
        let limiter = RateLimiter::default();
        assert_eq!(limiter.limit(), 20);
        assert_eq!(limiter.interval(), Duration::from_secs(10));
        assert_eq!(limiter.concurrency(), 2);
    }

    #[test]
    fn test_from_config() {
        let config = Config {
            rate_limit: 7,
            rate_interval_ms: 250,
            concurrency: 3,
            ..Config::default()
        };
        let limiter = RateLimiter::from_config(&config);
        assert_eq!(limiter.limit(), 7);
        assert_eq!(limiter.interval(), ms(250));
        assert_eq!(limiter.concurrency(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_and_concurrency_bounds() {
        let limiter = RateLimiter::new(4, ms(500), 2);
        let results = Arc::new(StdMutex::new(Vec::new()));
        let start = Instant::now();

        for i in 0..10usize {
            let limiter = limiter.clone();
            let results = results.clone();
            tokio::spawn(async move {
                limiter.lock().await;
                results.lock().unwrap().push((i, start.elapsed()));
                sleep(ms(50)).await;
                limiter.unlock();
            });
        }

        assert!(results.lock().unwrap().is_empty());
        sleep(ms(900)).await;
        assert_eq!(results.lock().unwrap().len(), 8);
        sleep(ms(1000)).await;

        let results = results.lock().unwrap().clone();
        assert_eq!(results.len(), 10);

        let window = |from: u64, to: u64| {
            let mut ids: Vec<usize> = results
                .iter()
                .filter(|(_, at)| *at >= ms(from) && *at < ms(to))
                .map(|(i, _)| *i)
                .collect();
            ids.sort_unstable();
            ids
        };
        assert_eq!(window(0, 500), vec![0, 1, 2, 3]);
        assert_eq!(window(500, 1000), vec![4, 5, 6, 7]);
        assert_eq!(window(1000, 2000), vec![8, 9]);

        // Concurrency staggers each window in pairs
        assert_eq!(results.iter().filter(|(_, at)| *at == ms(550)).count(), 2);

        assert_eq!(limiter.window_waiting(), 0);
        assert!(!limiter.has_cleaner());
    }

    #[test]
    fn test_zero_interval_only_bounds_concurrency() {
        let limiter = RateLimiter::new(1, Duration::ZERO, 2);

        assert_ready!(task::spawn(limiter.lock()).poll());
        assert_ready!(task::spawn(limiter.lock()).poll());

        let mut third = task::spawn(limiter.lock());
        assert_pending!(third.poll());
        assert_eq!(limiter.window_waiting(), 0);
        assert_eq!(limiter.waiting(), 1);

        limiter.unlock();
        assert_ready!(third.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_limit_blocks_until_raised() {
        let limiter = RateLimiter::new(0, ms(100), 2);

        assert!(timeout(Duration::from_secs(5), limiter.lock()).await.is_err());
        assert!(!limiter.has_cleaner());

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.lock().await })
        };
        sleep(ms(1)).await;
        assert_eq!(limiter.window_waiting(), 1);

        limiter.set_limit(1);
        assert_eq!(timeout(ms(10), waiter).await.unwrap().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_raising_limit_admits_queued_callers() {
        let limiter = RateLimiter::new(1, Duration::from_secs(10), 4);
        limiter.lock().await;

        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.lock().await })
            })
            .collect();
        sleep(ms(1)).await;
        assert_eq!(limiter.window_waiting(), 2);
        assert!(limiter.has_cleaner());

        let start = Instant::now();
        limiter.set_limit(3);
        for waiter in waiters {
            timeout(ms(10), waiter).await.unwrap().unwrap();
        }
        assert!(start.elapsed() < ms(10));
        assert_eq!(limiter.window_in_use(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleaner_retires_when_queue_empties() {
        let limiter = RateLimiter::new(1, ms(100), 2);
        limiter.lock().await;
        assert!(!limiter.has_cleaner());

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.lock().await })
        };
        sleep(ms(1)).await;
        assert!(limiter.has_cleaner());

        sleep(ms(150)).await;
        assert!(waiter.is_finished());
        assert!(!limiter.has_cleaner());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shorter_interval_reschedules_cleaner() {
        let limiter = RateLimiter::new(1, Duration::from_secs(10), 2);
        limiter.lock().await;

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.lock().await })
        };
        sleep(ms(1)).await;

        limiter.set_interval(ms(100));
        assert_eq!(limiter.interval(), ms(100));
        sleep(ms(150)).await;
        assert!(waiter.is_finished());
    }

    #[tokio::test]
    async fn test_unlock_keeps_window_slot() {
        let limiter = RateLimiter::new(2, Duration::from_secs(10), 1);

        assert_eq!(limiter.lock().await, 1);
        assert!(limiter.full());
        assert_eq!(limiter.unlock(), 0);
        assert_eq!(limiter.window_in_use(), 1);

        limiter.lock().await;
        limiter.unlock();
        assert_eq!(limiter.window_in_use(), 2);
    }

    #[tokio::test]
    async fn test_window_events() {
        let limiter = RateLimiter::new(2, Duration::from_secs(10), 1);
        let mut events = limiter.subscribe_window();

        limiter.lock().await;
        limiter.unlock();

        assert_eq!(events.try_recv().unwrap(), LimiterEvent::WindowReset);
        assert_eq!(
            events.try_recv().unwrap(),
            LimiterEvent::WindowAcquired { in_window: 1 }
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_window_releases_slots() {
        let limiter = RateLimiter::new(2, ms(100), 2);
        let mut events = limiter.subscribe_window();

        limiter.run(async {}).await;
        limiter.run(async {}).await;
        assert_eq!(limiter.window_in_use(), 2);

        sleep(ms(100)).await;
        limiter.run(async {}).await;
        assert_eq!(limiter.window_in_use(), 1);

        let seen: Vec<LimiterEvent> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        assert!(seen.contains(&LimiterEvent::WindowReleased { released: 2 }));
        assert_eq!(
            seen.iter()
                .filter(|e| **e == LimiterEvent::WindowReset)
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_run_releases_permit() {
        let limiter = RateLimiter::new(5, Duration::from_secs(10), 1);

        let value = limiter.run(async { 42 }).await;
        assert_eq!(value, 42);
        assert_eq!(limiter.in_use(), 0);

        let permit = limiter.acquire().await;
        assert_eq!(permit.count(), 1);
        assert!(limiter.full());
        drop(permit);
        assert!(!limiter.full());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let limiter = RateLimiter::new(5, Duration::from_secs(10), 2);
        let other = limiter.clone();

        limiter.lock().await;
        assert_eq!(other.in_use(), 1);
        other.resize(4);
        assert_eq!(limiter.concurrency(), 4);
        other.unlock();
        assert_eq!(limiter.in_use(), 0);
    }
}
