use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::runtime::Handle;
use tracing::{debug, trace, warn};

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::timer::{ttl_from_millis, TimerHandle};

/// State shared by every clone of an [`ExpiringKeys`].
///
/// Invariant: every handle in `keys` is `Scheduled`. Handles only leave
/// `Scheduled` while their shard is write-locked and the entry is being
/// removed or replaced.
struct Shared {
    keys: DashMap<String, TimerHandle>,
    runtime: Handle,
    disposed: AtomicBool,
}

impl Shared {
    /// Expiry callback, run from the timer task.
    fn expire(&self, timer: &TimerHandle) {
        let expired = self
            .keys
            .remove_if(timer.key(), |_, current| current == timer && timer.try_fire());

        if expired.is_some() {
            debug!(key = timer.key(), "key expired");
        } else {
            trace!(key = timer.key(), "stale expiry timer ignored");
        }
    }

    fn take(&self, key: &str) -> Option<TimerHandle> {
        self.keys
            .remove_if(key, |_, timer| timer.try_cancel())
            .map(|(_, timer)| timer)
    }

    fn drain(&self) -> Vec<TimerHandle> {
        let mut drained = Vec::new();
        self.keys.retain(|_, timer| {
            timer.try_cancel();
            drained.push(timer.clone());
            false
        });
        drained
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.disposed.store(true, Ordering::SeqCst);
        let drained = self.drain();
        if !drained.is_empty() {
            debug!(count = drained.len(), "store dropped, timers canceled");
        }
    }
}

/// A concurrent set of keys that delete themselves after a TTL.
///
/// Each key owns one timer task on the configured tokio runtime. The timer
/// either fires and removes the key, or is canceled when the key is removed,
/// replaced, cleared or the store is disposed; never both.
///
/// Cloning is cheap and clones share the same keys. Dropping the last clone
/// disposes the store.
///
/// # Disposal
///
/// After [`dispose`](Self::dispose) or [`dispose_sync`](Self::dispose_sync)
/// the store behaves as permanently empty: lookups return `false`, `try_add`
/// returns `false`, `add_or_update` does nothing and `get_or_add` hands back
/// an already-canceled handle.
///
/// # Example
///
/// ```rust,no_run
/// use expiring_keys::ExpiringKeys;
///
/// #[tokio::main]
/// async fn main() -> Result<(), expiring_keys::Error> {
///     let tokens = ExpiringKeys::new()?;
///
///     // Idempotency token valid for five seconds.
///     assert!(tokens.try_add("req-42", 5_000)?);
///     assert!(!tokens.try_add("req-42", 5_000)?);
///
///     tokens.remove("req-42").await;
///     tokens.dispose().await;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct ExpiringKeys {
    shared: Arc<Shared>,
}

impl ExpiringKeys {
    /// Creates a store driven by the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoRuntime`](crate::Error::NoRuntime) when called
    /// outside a runtime context.
    pub fn new() -> Result<Self> {
        Self::with_config(StoreConfig::default())
    }

    /// Creates a store with custom configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoRuntime`](crate::Error::NoRuntime) when no runtime
    /// is configured and none is current.
    pub fn with_config(config: StoreConfig) -> Result<Self> {
        let runtime = match config.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current()?,
        };

        Ok(Self {
            shared: Arc::new(Shared {
                keys: DashMap::with_capacity(config.capacity),
                runtime,
                disposed: AtomicBool::new(false),
            }),
        })
    }

    /// Returns `true` if `key` is present and has not expired.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.shared.keys.contains_key(key)
    }

    /// Inserts `key`, or restarts its expiration clock if already present.
    ///
    /// A `ttl_ms` of zero or less expires the key at the earliest opportunity.
    /// A TTL of 100 years or more never elapses; the key stays until removed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RuntimeShutdown`] if the timer runtime is gone. The
    /// key is left absent in that case.
    pub fn add_or_update(&self, key: impl Into<String>, ttl_ms: i64) -> Result<()> {
        let key = key.into();
        let timer = TimerHandle::new(&key, ttl_from_millis(ttl_ms));

        match self.shared.keys.entry(key) {
            Entry::Occupied(mut occupied) => {
                let previous = occupied.insert(timer.clone());
                previous.try_cancel();
            }
            Entry::Vacant(vacant) => {
                if self.is_disposed() {
                    return Ok(());
                }
                vacant.insert(timer.clone());
            }
        }

        self.arm(timer)
    }

    /// Inserts `key` only if it is absent.
    ///
    /// Returns `false`, leaving the existing timer untouched, if the key is
    /// already present. TTLs follow [`add_or_update`](Self::add_or_update).
    ///
    /// # Errors
    ///
    /// Returns [`Error::RuntimeShutdown`] if the timer runtime is gone.
    pub fn try_add(&self, key: impl Into<String>, ttl_ms: i64) -> Result<bool> {
        let timer = match self.shared.keys.entry(key.into()) {
            Entry::Occupied(_) => return Ok(false),
            Entry::Vacant(vacant) => {
                if self.is_disposed() {
                    return Ok(false);
                }
                let timer = TimerHandle::new(vacant.key(), ttl_from_millis(ttl_ms));
                vacant.insert(timer.clone());
                timer
            }
        };

        self.arm(timer)?;
        Ok(true)
    }

    /// Returns the timer of `key`, inserting the key first if it is absent.
    ///
    /// Concurrent callers for the same key all receive the same handle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RuntimeShutdown`] if the timer runtime is gone.
    pub fn get_or_add(&self, key: impl Into<String>, ttl_ms: i64) -> Result<TimerHandle> {
        let timer = match self.shared.keys.entry(key.into()) {
            Entry::Occupied(occupied) => return Ok(occupied.get().clone()),
            Entry::Vacant(vacant) => {
                let ttl = ttl_from_millis(ttl_ms);
                if self.is_disposed() {
                    return Ok(TimerHandle::canceled(vacant.key(), ttl));
                }
                let timer = TimerHandle::new(vacant.key(), ttl);
                vacant.insert(timer.clone());
                timer
            }
        };

        self.arm(timer.clone())?;
        Ok(timer)
    }

    /// Returns the current timer of `key` without inserting anything.
    pub fn timer(&self, key: &str) -> Option<TimerHandle> {
        self.shared.keys.get(key).map(|timer| timer.value().clone())
    }

    /// Removes `key` and waits for its timer task to stop.
    pub async fn try_remove(&self, key: &str) {
        self.remove(key).await;
    }

    /// Removes `key` without waiting on its timer task.
    pub fn try_remove_sync(&self, key: &str) {
        self.remove_sync(key);
    }

    /// Removes `key` and waits for its timer task to stop.
    ///
    /// Returns `true` if this call removed the key, `false` if it was absent
    /// (including when its timer won the race and expired it first).
    pub async fn remove(&self, key: &str) -> bool {
        match self.shared.take(key) {
            Some(timer) => {
                debug!(key, "key removed");
                timer.finished().await;
                true
            }
            None => false,
        }
    }

    /// Non-suspending variant of [`remove`](Self::remove).
    pub fn remove_sync(&self, key: &str) -> bool {
        match self.shared.take(key) {
            Some(_) => {
                debug!(key, "key removed");
                true
            }
            None => false,
        }
    }

    /// Removes every key and waits for all of their timer tasks to stop.
    pub async fn clear(&self) {
        for timer in self.drain() {
            timer.finished().await;
        }
    }

    /// Removes every key, canceling their timers without waiting.
    pub fn clear_sync(&self) {
        self.drain();
    }

    /// Clears the store and refuses further insertions. Idempotent.
    pub async fn dispose(&self) {
        self.mark_disposed();
        self.clear().await;
    }

    /// Non-suspending variant of [`dispose`](Self::dispose).
    pub fn dispose_sync(&self) {
        self.mark_disposed();
        self.clear_sync();
    }

    /// Returns `true` once [`dispose`](Self::dispose) or
    /// [`dispose_sync`](Self::dispose_sync) has run.
    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::SeqCst)
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.keys.len()
    }

    /// Returns `true` if no key is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.keys.is_empty()
    }

    /// Snapshot of the live keys, in no particular order.
    pub fn keys(&self) -> Vec<String> {
        self.shared
            .keys
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn drain(&self) -> Vec<TimerHandle> {
        let drained = self.shared.drain();
        if !drained.is_empty() {
            debug!(count = drained.len(), "store cleared");
        }
        drained
    }

    // Set before draining: an insert that locks a shard after the drain has
    // passed it is guaranteed to see the flag.
    fn mark_disposed(&self) {
        if !self.shared.disposed.swap(true, Ordering::SeqCst) {
            debug!("store disposed");
        }
    }

    /// Spawns the task that drives `timer`. Must be called after the shard
    /// lock protecting its entry is released.
    ///
    /// A runtime that has shut down drops the task unpolled, which leaves the
    /// handle finished yet still scheduled. A task that ran always leaves it
    /// fired or canceled first.
    fn arm(&self, timer: TimerHandle) -> Result<()> {
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        trace!(key = timer.key(), ttl = ?timer.ttl(), "expiry timer armed");

        self.shared.runtime.spawn(timer.clone().run(move |fired| {
            if let Some(shared) = shared.upgrade() {
                shared.expire(fired);
            }
        }));

        if timer.is_finished() && timer.is_scheduled() {
            self.shared
                .keys
                .remove_if(timer.key(), |_, current| current == &timer && timer.try_cancel());
            warn!(key = timer.key(), "runtime shut down, key not kept");
            return Err(Error::RuntimeShutdown {
                key: timer.key().to_owned(),
            });
        }

        Ok(())
    }
}

impl fmt::Debug for ExpiringKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpiringKeys")
            .field("len", &self.len())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
