use std::fmt;
use std::future::{pending, Future};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::time::{sleep_until, Instant};

/// TTLs at or beyond this are treated as "never fires".
const NEVER: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

const SCHEDULED: u8 = 0;
const FIRED: u8 = 1;
const CANCELED: u8 = 2;

/// Lifecycle of a [`TimerHandle`].
///
/// A handle starts `Scheduled` and makes exactly one transition, to either
/// `Fired` or `Canceled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Scheduled,
    Fired,
    Canceled,
}

/// Converts a millisecond TTL into a [`Duration`].
///
/// Zero and negative values mean "expire at the earliest opportunity".
pub fn ttl_from_millis(ttl_ms: i64) -> Duration {
    u64::try_from(ttl_ms)
        .map(Duration::from_millis)
        .unwrap_or(Duration::ZERO)
}

struct Inner {
    key: String,
    ttl: Duration,
    deadline: Option<Instant>,
    state: AtomicU8,
    cancel: Notify,
    finished: watch::Sender<bool>,
}

/// The pending expiration of one key.
///
/// Handles are cheap to clone; clones compare equal and observe the same
/// state. Only the store that created a handle can fire or cancel it.
#[derive(Clone)]
pub struct TimerHandle {
    inner: Arc<Inner>,
}

impl TimerHandle {
    pub(crate) fn new(key: &str, ttl: Duration) -> Self {
        let deadline = if ttl >= NEVER {
            None
        } else {
            Instant::now().checked_add(ttl)
        };
        Self::with_state(key, ttl, deadline, SCHEDULED)
    }

    /// A handle that was never armed, handed out by a disposed store.
    pub(crate) fn canceled(key: &str, ttl: Duration) -> Self {
        Self::with_state(key, ttl, None, CANCELED)
    }

    fn with_state(key: &str, ttl: Duration, deadline: Option<Instant>, state: u8) -> Self {
        let (finished, _) = watch::channel(state != SCHEDULED);
        Self {
            inner: Arc::new(Inner {
                key: key.to_owned(),
                ttl,
                deadline,
                state: AtomicU8::new(state),
                cancel: Notify::new(),
                finished,
            }),
        }
    }

    /// The key this timer expires.
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// The TTL the timer was armed with, after clamping negatives to zero.
    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    /// When the timer fires, or `None` if the TTL is 100 years or more and the
    /// timer never elapses.
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Time left until the deadline; zero once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TimerState {
        match self.inner.state.load(Ordering::Acquire) {
            SCHEDULED => TimerState::Scheduled,
            FIRED => TimerState::Fired,
            _ => TimerState::Canceled,
        }
    }

    /// `true` until the timer has fired or been canceled.
    pub fn is_scheduled(&self) -> bool {
        self.state() == TimerState::Scheduled
    }

    /// Resolves once the timer task has stopped running.
    ///
    /// Completes immediately for handles whose task already finished or that
    /// were never armed.
    pub async fn finished(&self) {
        let mut done = self.inner.finished.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = done.wait_for(|finished| *finished).await;
    }

    /// Whether the timer task has stopped, or was dropped without running.
    pub(crate) fn is_finished(&self) -> bool {
        *self.inner.finished.borrow()
    }

    /// Scheduled -> Fired. Returns false if the timer already left `Scheduled`.
    pub(crate) fn try_fire(&self) -> bool {
        self.transition(FIRED)
    }

    /// Scheduled -> Canceled, waking the timer task so it exits without firing.
    pub(crate) fn try_cancel(&self) -> bool {
        if self.transition(CANCELED) {
            // notify_one keeps a permit if the task has not been polled yet.
            self.inner.cancel.notify_one();
            true
        } else {
            false
        }
    }

    fn transition(&self, to: u8) -> bool {
        self.inner
            .state
            .compare_exchange(SCHEDULED, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Body of the spawned timer task. `on_expire` runs at most once, when the
    /// deadline passes before a cancellation arrives.
    ///
    /// The handle counts as finished as soon as the returned future is
    /// dropped, whether or not it was ever polled.
    pub(crate) fn run<F>(self, on_expire: F) -> impl Future<Output = ()> + Send + 'static
    where
        F: FnOnce(&TimerHandle) + Send + 'static,
    {
        let finished = FinishGuard(Arc::clone(&self.inner));

        async move {
            let _finished = finished;

            tokio::select! {
                _ = self.inner.cancel.notified() => {}
                _ = self.elapsed() => on_expire(&self),
            }
        }
    }

    async fn elapsed(&self) {
        match self.inner.deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => pending().await,
        }
    }
}

impl PartialEq for TimerHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for TimerHandle {}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("key", &self.inner.key)
            .field("ttl", &self.inner.ttl)
            .field("state", &self.state())
            .finish()
    }
}

/// Marks the timer finished when its task is dropped, even unpolled.
struct FinishGuard(Arc<Inner>);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.0.finished.send_replace(true);
    }
}
