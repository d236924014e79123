//! A thread-safe set of keys that expire on their own.
//!
//! Every key inserted into an [`ExpiringKeys`] store carries a time-to-live.
//! When it elapses the key removes itself; no polling loop is involved. The
//! presence of a key is the datum: use it for idempotency tokens, rate-limit
//! markers or lease flags.
//!
//! - Concurrent access through `DashMap`, locking only the shard of a key
//! - One tokio timer task per key, canceled on removal or replacement
//! - Suspending (`remove`, `clear`, `dispose`) and non-suspending
//!   (`remove_sync`, `clear_sync`, `dispose_sync`) release paths

mod config;
mod error;
mod store;
mod timer;

pub use config::StoreConfig;
pub use error::{Error, Result};
pub use store::ExpiringKeys;
pub use timer::{ttl_from_millis, TimerHandle, TimerState};
