use tokio::runtime::Handle;

/// Configuration for an [`ExpiringKeys`](crate::ExpiringKeys) store.
///
/// # Example
///
/// ```rust
/// use expiring_keys::StoreConfig;
///
/// let config = StoreConfig::default().with_capacity(1024);
/// assert_eq!(config.capacity, 1024);
/// ```
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    /// Initial capacity of the key map (default: 0).
    pub capacity: usize,
    /// Runtime that drives the expiry timers. When unset, the runtime current
    /// at construction time is used.
    pub runtime: Option<Handle>,
}

impl StoreConfig {
    /// Creates a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-allocates room for `capacity` keys.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Drives expiry timers on `runtime` instead of the current one.
    ///
    /// Lets a store be built, and used, from threads that are not inside a
    /// runtime context.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }
}
