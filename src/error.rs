use thiserror::Error;

/// Resource-level failures of an [`ExpiringKeys`](crate::ExpiringKeys) store.
///
/// Lookups and removals never fail: a missing key is a no-op, not an error.
#[derive(Debug, Error)]
pub enum Error {
    /// No tokio runtime was configured and none was current, so expiry timers
    /// could never be driven.
    #[error("no tokio runtime available to drive expiry timers")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),

    /// The runtime driving the timers has shut down; the key was not kept.
    #[error("expiry timer for key {key:?} could not be armed: runtime has shut down")]
    RuntimeShutdown { key: String },
}

/// Shorthand for results carrying this crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
