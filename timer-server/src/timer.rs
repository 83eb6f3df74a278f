//! Per-request wake-up timers.
//!
//! Every accepted request gets one timer that fires no earlier than the
//! request's due time.  This module provides:
//! - [`Clock`]: the wall-clock source due times are compared against.
//! - [`sleep_until_due`]: the arm / wake / re-check loop.
//! - [`Scheduler`]: spawns one timer task per request and funnels
//!   completions into a single per-session channel as [`Matured`] events.
//! - [`TimerHandle`] / [`TimerSet`]: cancellation, individually or all at
//!   once when a session is torn down.
//!
//! Due times are whole seconds since the Unix epoch while the clock has
//! sub-second resolution, so a request due at `T` matures at exactly `T.000`.
//! A wake-up that finds the clock still short of the due time (coarse timer
//! resolution, wall clock stepped backwards) simply sleeps again for the
//! remainder.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Shortest sleep a timer will take between clock checks.
const MIN_RECHECK: Duration = Duration::from_millis(1);

// ---------------------------------------------------------------------------
// Clocks
// ---------------------------------------------------------------------------

/// Source of wall-clock time, as a duration since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
}

/// Reads the operating system's wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
    }
}

/// A wall-clock reading taken once and advanced by tokio's monotonic clock.
///
/// Immune to wall-clock steps after creation, and follows paused/advanced
/// time under `tokio::time::pause`.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    anchor_wall: Duration,
    anchor: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::starting_at(SystemClock.now())
    }

    /// Start the clock at `wall` (time since the Unix epoch).
    pub fn starting_at(wall: Duration) -> Self {
        Self {
            anchor_wall: wall,
            anchor: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.anchor_wall + self.anchor.elapsed()
    }
}

/// Time left until `due_time` (Unix seconds); zero once it has passed.
pub fn remaining(now: Duration, due_time: u64) -> Duration {
    Duration::from_secs(due_time).saturating_sub(now)
}

/// Sleep until `clock` reads at least `due_time`.
///
/// Each sleep lasts at most `recheck`, after which the clock is read again,
/// so wall-clock adjustments in either direction are noticed.  Returns the
/// number of sleeps taken (zero for a due time already in the past).
pub async fn sleep_until_due(clock: &dyn Clock, due_time: u64, recheck: Duration) -> u32 {
    let recheck = recheck.max(MIN_RECHECK);
    let mut sleeps = 0u32;
    loop {
        let left = remaining(clock.now(), due_time);
        if left.is_zero() {
            return sleeps;
        }
        tokio::time::sleep(left.min(recheck)).await;
        sleeps += 1;
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Completion signal of one timer.
///
/// `token` identifies the registration, so a late event for a cancelled
/// timer can never complete a newer request that reuses the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Matured {
    pub id: u32,
    pub token: u64,
}

/// A running timer.  Dropping the handle does **not** cancel the timer.
#[derive(Debug)]
pub struct TimerHandle {
    id: u32,
    token: u64,
    task: JoinHandle<()>,
}

impl TimerHandle {
    /// Stop the timer.  Calling this more than once, or after the timer has
    /// fired, is a no-op.
    pub fn cancel(&self) {
        self.task.abort();
    }
}

/// Spawns timers for one session and delivers their [`Matured`] events.
pub struct Scheduler {
    clock: Arc<dyn Clock>,
    recheck: Duration,
    events: mpsc::Sender<Matured>,
    next_token: u64,
}

impl Scheduler {
    /// Build a scheduler and the receiving end of its event channel.
    ///
    /// `capacity` bounds undelivered events; sessions pass their pending
    /// request limit, which bounds the number of live timers anyway.
    pub fn new(
        clock: Arc<dyn Clock>,
        recheck: Duration,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Matured>) {
        let (events, rx) = mpsc::channel(capacity.max(1));
        let scheduler = Self {
            clock,
            recheck,
            events,
            next_token: 0,
        };
        (scheduler, rx)
    }

    /// Arm a timer for request `id` due at `due_time` (Unix seconds).
    ///
    /// Exactly one [`Matured`] event is sent unless the timer is cancelled
    /// first.  Timers with equal due times fire independently.
    pub fn schedule(&mut self, id: u32, due_time: u64) -> TimerHandle {
        let token = self.next_token;
        self.next_token += 1;

        let clock = Arc::clone(&self.clock);
        let events = self.events.clone();
        let recheck = self.recheck;
        let task = tokio::spawn(async move {
            let sleeps = sleep_until_due(clock.as_ref(), due_time, recheck).await;
            log::trace!("[timer] request {id} matured after {sleeps} sleep(s)");
            // The receiver is gone once its session has ended.
            let _ = events.send(Matured { id, token }).await;
        });

        TimerHandle { id, token, task }
    }
}

// ---------------------------------------------------------------------------
// TimerSet
// ---------------------------------------------------------------------------

/// The live timers of one session, keyed by request id.
///
/// Dropping the set cancels everything still in it.
#[derive(Debug, Default)]
pub struct TimerSet {
    handles: HashMap<u32, TimerHandle>,
}

impl TimerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `handle`.  A handle already stored under the same id is
    /// cancelled and replaced.
    pub fn insert(&mut self, handle: TimerHandle) {
        if let Some(old) = self.handles.insert(handle.id, handle) {
            old.cancel();
        }
    }

    /// Retire the timer that produced `event`.
    ///
    /// Returns `false` for events whose registration is no longer tracked
    /// (cancelled, or superseded by a newer token); those must be ignored.
    pub fn complete(&mut self, event: &Matured) -> bool {
        match self.handles.get(&event.id) {
            Some(handle) if handle.token == event.token => {
                self.handles.remove(&event.id);
                true
            }
            _ => false,
        }
    }

    /// Cancel every timer and return how many there were.
    pub fn cancel_all(&mut self) -> usize {
        let count = self.handles.len();
        for (_, handle) in self.handles.drain() {
            handle.cancel();
        }
        count
    }
}

impl Drop for TimerSet {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::mpsc::error::TryRecvError;

    const START: u64 = 1_700_000_000;

    fn clock_at(secs: u64) -> MonotonicClock {
        MonotonicClock::starting_at(Duration::from_secs(secs))
    }

    impl TimerHandle {
        fn token(&self) -> u64 {
            self.token
        }
    }

    impl TimerSet {
        fn contains(&self, id: u32) -> bool {
            self.handles.contains_key(&id)
        }

        fn len(&self) -> usize {
            self.handles.len()
        }
    }

    /// Reads one second fast for its first `ahead_reads` reads, as if the
    /// wall clock was stepped back right after the timer was armed.
    struct SteppedBackClock {
        inner: MonotonicClock,
        ahead_reads: AtomicU32,
    }

    impl Clock for SteppedBackClock {
        fn now(&self) -> Duration {
            let now = self.inner.now();
            if self.ahead_reads.load(Ordering::SeqCst) > 0 {
                self.ahead_reads.fetch_sub(1, Ordering::SeqCst);
                now + Duration::from_secs(1)
            } else {
                now
            }
        }
    }

    #[test]
    fn remaining_is_zero_for_past_due() {
        assert_eq!(remaining(Duration::from_secs(START + 5), START), Duration::ZERO);
        assert_eq!(remaining(Duration::from_secs(START), START), Duration::ZERO);
    }

    #[test]
    fn remaining_accounts_for_fractional_now() {
        let now = Duration::from_secs(START) + Duration::from_millis(250);
        assert_eq!(remaining(now, START + 2), Duration::from_millis(1750));
    }

    #[test]
    fn system_clock_is_after_2020() {
        assert!(SystemClock.now() > Duration::from_secs(1_577_836_800));
    }

    #[tokio::test(start_paused = true)]
    async fn sleeps_until_due_time() {
        let clock = clock_at(START);
        let started = Instant::now();
        let sleeps = sleep_until_due(&clock, START + 2, Duration::from_secs(60)).await;
        assert_eq!(sleeps, 1);
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(started.elapsed() < Duration::from_millis(2010));
        assert!(clock.now() >= Duration::from_secs(START + 2));
    }

    #[tokio::test(start_paused = true)]
    async fn past_due_returns_without_sleeping() {
        let clock = clock_at(START);
        let started = Instant::now();
        assert_eq!(sleep_until_due(&clock, START - 10, Duration::from_secs(60)).await, 0);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn long_waits_recheck_the_clock() {
        let clock = clock_at(START);
        let sleeps = sleep_until_due(&clock, START + 150, Duration::from_secs(60)).await;
        // 60 + 60 + 30
        assert_eq!(sleeps, 3);
        assert!(clock.now() >= Duration::from_secs(START + 150));
    }

    #[tokio::test(start_paused = true)]
    async fn early_wake_rearms_and_never_fires_before_due() {
        let clock = SteppedBackClock {
            inner: clock_at(START),
            ahead_reads: AtomicU32::new(1),
        };
        let sleeps = sleep_until_due(&clock, START + 3, Duration::from_secs(60)).await;
        assert_eq!(sleeps, 2, "first wake is a second early and must re-arm");
        assert!(clock.inner.now() >= Duration::from_secs(START + 3));
    }

    #[tokio::test(start_paused = true)]
    async fn scheduler_delivers_one_event_per_timer() {
        let clock: Arc<dyn Clock> = Arc::new(clock_at(START));
        let (mut scheduler, mut rx) = Scheduler::new(clock, Duration::from_secs(60), 4);
        let a = scheduler.schedule(1, START + 1);
        let b = scheduler.schedule(2, START + 1);
        assert_ne!(a.token(), b.token());

        let mut got = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        got.sort_by_key(|m| m.id);
        assert_eq!(
            got,
            vec![
                Matured { id: 1, token: a.token() },
                Matured { id: 2, token: b.token() }
            ]
        );

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let clock: Arc<dyn Clock> = Arc::new(clock_at(START));
        let (mut scheduler, mut rx) = Scheduler::new(clock, Duration::from_secs(60), 4);
        let handle = scheduler.schedule(9, START + 5);
        handle.cancel();
        handle.cancel();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn timer_set_ignores_stale_tokens() {
        let clock: Arc<dyn Clock> = Arc::new(clock_at(START));
        let (mut scheduler, _rx) = Scheduler::new(clock, Duration::from_secs(60), 4);
        let mut set = TimerSet::new();

        let first = scheduler.schedule(4, START + 100);
        let stale = Matured { id: 4, token: first.token() };
        set.insert(first);
        let second = scheduler.schedule(4, START + 100);
        let fresh = Matured { id: 4, token: second.token() };
        set.insert(second);

        assert!(!set.complete(&stale));
        assert!(set.contains(4));
        assert!(set.complete(&fresh));
        assert!(!set.contains(4));
        assert!(!set.complete(&fresh));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_reports_count_and_silences_timers() {
        let clock: Arc<dyn Clock> = Arc::new(clock_at(START));
        let (mut scheduler, mut rx) = Scheduler::new(clock, Duration::from_secs(60), 8);
        let mut set = TimerSet::new();
        for id in 0..3 {
            set.insert(scheduler.schedule(id, START + 2));
        }
        assert_eq!(set.len(), 3);
        assert_eq!(set.cancel_all(), 3);
        assert_eq!(set.cancel_all(), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }
}
