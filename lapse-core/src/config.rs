use std::time::Duration;

use crate::entry::Expiry;

/// Default mailbox depth of each entry's read and write ports
pub const DEFAULT_PORT_CAPACITY: usize = 16;

/// Configuration for a [`Cache`](crate::Cache)
///
/// # Example
///
/// ```rust
/// use lapse_core::CacheConfig;
/// use std::time::Duration;
///
/// let config = CacheConfig::default()
///     .with_default_ttl(Duration::from_secs(30))
///     .with_extend_on_read(true);
/// ```
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Expiry applied by [`Cache::set`](crate::Cache::set) (default: 60 seconds)
    pub default_ttl: Expiry,
    /// Whether every successful read rearms the entry's timer (default: false)
    pub extend_on_read: bool,
    /// Mailbox depth of each entry's read and write ports (default: 16)
    pub port_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Expiry::After(Duration::from_secs(60)),
            extend_on_read: false,
            port_capacity: DEFAULT_PORT_CAPACITY,
        }
    }
}

impl CacheConfig {
    /// Creates a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the expiry used when a value is stored without an explicit TTL
    ///
    /// # Example
    ///
    /// ```rust
    /// use lapse_core::{CacheConfig, Expiry};
    ///
    /// // Entries stored with `set` never expire on their own
    /// let config = CacheConfig::default().with_default_ttl(Expiry::Never);
    /// ```
    pub fn with_default_ttl(mut self, ttl: impl Into<Expiry>) -> Self {
        self.default_ttl = ttl.into();
        self
    }

    /// Enables or disables extending an entry's lifetime on every read
    pub fn with_extend_on_read(mut self, extend: bool) -> Self {
        self.extend_on_read = extend;
        self
    }

    /// Sets the mailbox depth of each entry's ports
    ///
    /// A capacity of zero is raised to one.
    pub fn with_port_capacity(mut self, capacity: usize) -> Self {
        self.port_capacity = capacity.max(1);
        self
    }
}
