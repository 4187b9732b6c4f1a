use std::hash::Hash;
use std::sync::{Arc, Weak};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::CacheConfig;
use crate::entry::{EntryHandle, Expiry, Update};
use crate::error::CacheError;
use crate::table::{Claim, EntryTable};

/// In-memory key/value cache where every entry expires on its own timer.
///
/// Each stored value is owned by a dedicated actor task that serves reads,
/// applies updates and removes its key from the cache when its timer fires.
/// The cache itself only keeps lightweight handles to those actors, so a slow
/// exchange on one key never blocks operations on another.
///
/// The cache lives until its parent cancellation token fires, [`shutdown`]
/// is called, or the last clone is dropped. After that every write fails
/// with [`CacheError::Canceled`] and every read misses.
///
/// [`shutdown`]: Cache::shutdown
///
/// # Example
///
/// ```rust,no_run
/// use lapse_core::Cache;
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() -> Result<(), lapse_core::CacheError> {
///     let cache = Cache::new(None, Duration::from_secs(30), true);
///
///     cache.set("user:123", "John Doe").await?;
///     assert_eq!(cache.get(&"user:123").await, Some("John Doe"));
///
///     cache.delete(&"user:123");
///     Ok(())
/// }
/// ```
pub struct Cache<K, V> {
    table: Arc<EntryTable<K, V>>,
    default_ttl: Expiry,
    extend_on_read: bool,
}

impl<K, V> Clone for Cache<K, V> {
    fn clone(&self) -> Self {
        Self {
            table: Arc::clone(&self.table),
            default_ttl: self.default_ttl,
            extend_on_read: self.extend_on_read,
        }
    }
}

/// Result of handing an update to an entry actor
enum Delivery<V> {
    Applied,
    /// The caller's token fired first
    Canceled,
    /// The cache scope ended first
    TornDown,
    /// The actor exited without applying; the value comes back for a retry
    Closed(V),
    /// The actor exited while the update was in flight
    Lost,
}

impl<K, V> Cache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a cache whose lifetime is bound to `parent`.
    ///
    /// Without a parent the cache owns its own root scope. `default_ttl` is
    /// the expiry used by [`set`](Cache::set); with `extend_on_read` every
    /// successful read rearms the entry's timer.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime context.
    pub fn new(
        parent: Option<CancellationToken>,
        default_ttl: impl Into<Expiry>,
        extend_on_read: bool,
    ) -> Self {
        let config = CacheConfig::default()
            .with_default_ttl(default_ttl)
            .with_extend_on_read(extend_on_read);
        Self::with_config(parent, config)
    }

    /// Creates a cache with custom configuration
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime context. Entry actors and
    /// the lifecycle supervisor are spawned onto the current runtime.
    pub fn with_config(parent: Option<CancellationToken>, config: CacheConfig) -> Self {
        if tokio::runtime::Handle::try_current().is_err() {
            panic!(
                "lapse_core::Cache requires a Tokio runtime. \
                 Ensure you are calling Cache::new() or Cache::with_config() \
                 from within a #[tokio::main] or #[tokio::test] context, \
                 or from code running on a Tokio runtime."
            );
        }

        let scope = match parent {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };

        let table = EntryTable::new(scope.clone(), config.port_capacity);
        tokio::spawn(Self::supervise(Arc::downgrade(&table), scope));

        tracing::debug!(
            default_ttl = ?config.default_ttl,
            extend_on_read = config.extend_on_read,
            "cache created"
        );

        Self {
            table,
            default_ttl: config.default_ttl,
            extend_on_read: config.extend_on_read,
        }
    }

    /// Waits for the cache scope to end, then seals the table
    async fn supervise(table: Weak<EntryTable<K, V>>, scope: CancellationToken) {
        scope.cancelled().await;
        if let Some(table) = table.upgrade() {
            table.seal();
        }
    }

    /// Returns the value stored for `key`.
    ///
    /// Returns `None` if the key is absent, has expired, or the cache has been
    /// torn down. Never waits past the end of the cache's lifecycle.
    pub async fn get(&self, key: &K) -> Option<V> {
        self.read(self.table.scope(), key).await
    }

    /// Like [`get`](Cache::get), but also gives up when `cancel` fires.
    pub async fn get_with_cancel(&self, cancel: &CancellationToken, key: &K) -> Option<V> {
        self.read(cancel, key).await
    }

    /// Stores `value` under `key` with the default TTL.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Canceled`] once the cache has been torn down.
    pub async fn set(&self, key: K, value: V) -> Result<(), CacheError> {
        self.write(self.table.scope(), key, value, self.default_ttl).await
    }

    /// Like [`set`](Cache::set), but gives up when `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::OperationCanceled`] if `cancel` fires while
    /// waiting on a busy entry.
    pub async fn set_with_cancel(
        &self,
        cancel: &CancellationToken,
        key: K,
        value: V,
    ) -> Result<(), CacheError> {
        self.write(cancel, key, value, self.default_ttl).await
    }

    /// Stores `value` under `key`, expiring after `ttl`.
    ///
    /// For an existing key the value is replaced and, unless `ttl` is
    /// [`Expiry::Never`], the entry's timer is rearmed to `ttl` from now.
    /// `Expiry::Never` on a new key stores it until deletion or teardown.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Canceled`] once the cache has been torn down.
    pub async fn set_ttl(
        &self,
        key: K,
        value: V,
        ttl: impl Into<Expiry>,
    ) -> Result<(), CacheError> {
        self.write(self.table.scope(), key, value, ttl.into()).await
    }

    /// Like [`set_ttl`](Cache::set_ttl), but gives up when `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Canceled`] once the cache has been torn down, or
    /// [`CacheError::OperationCanceled`] if `cancel` fires first.
    pub async fn set_ttl_with_cancel(
        &self,
        cancel: &CancellationToken,
        key: K,
        value: V,
        ttl: impl Into<Expiry>,
    ) -> Result<(), CacheError> {
        self.write(cancel, key, value, ttl.into()).await
    }

    /// Removes `key`, stopping its actor.
    ///
    /// Returns `true` if the key existed. Deleting an absent key is a no-op.
    pub fn delete(&self, key: &K) -> bool {
        self.table.remove(key)
    }

    /// Ends the cache's lifecycle, tearing down every entry.
    ///
    /// The parent token, if any, is left untouched. This is also done when the
    /// last clone of the cache is dropped.
    pub fn shutdown(&self) {
        self.table.scope().cancel();
    }

    /// Returns `true` once the cache no longer accepts writes
    pub fn is_sealed(&self) -> bool {
        self.table.is_sealed() || self.table.scope().is_cancelled()
    }

    /// Returns the number of live entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Returns `true` if the cache holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks whether `key` currently has a live entry, without reading it.
    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.table.contains_key(key)
    }

    /// Returns all keys with a live entry, in no particular order
    pub fn keys(&self) -> Vec<K> {
        self.table.keys()
    }

    /// Returns the cache's own scope. Canceling it is equivalent to [`shutdown`](Cache::shutdown).
    pub fn cancellation_token(&self) -> CancellationToken {
        self.table.scope().clone()
    }

    /// Returns the expiry applied by [`set`](Cache::set)
    pub fn default_ttl(&self) -> Expiry {
        self.default_ttl
    }

    /// Returns `true` if reads rearm the entry's timer
    pub fn extend_on_read(&self) -> bool {
        self.extend_on_read
    }

    async fn read(&self, cancel: &CancellationToken, key: &K) -> Option<V> {
        let scope = self.table.scope();
        if scope.is_cancelled() {
            return None;
        }

        let Some(handle) = self.table.lookup(key) else {
            tracing::trace!("get miss");
            return None;
        };

        let exchange = async {
            let (reply, value) = oneshot::channel();
            handle.read.send(reply).await.ok()?;
            value.await.ok()
        };

        tokio::select! {
            _ = scope.cancelled() => None,
            _ = cancel.cancelled() => None,
            value = exchange => value,
        }
    }

    async fn write(
        &self,
        cancel: &CancellationToken,
        key: K,
        mut value: V,
        ttl: Expiry,
    ) -> Result<(), CacheError> {
        let mut stale = None;

        loop {
            if self.table.scope().is_cancelled() {
                self.table.seal();
                return Err(CacheError::Canceled);
            }

            let handle = match self.table.lookup(&key) {
                Some(handle) if Some(handle.id) != stale => handle,
                _ => {
                    let extend = self.extend_on_read;
                    match self.table.claim(key.clone(), value, ttl, extend, stale)? {
                        Claim::Spawned => return Ok(()),
                        Claim::Occupied(handle, returned) => {
                            value = returned;
                            handle
                        }
                    }
                }
            };

            match Self::deliver(self.table.scope(), cancel, &handle, value, ttl).await {
                Delivery::Applied => return Ok(()),
                Delivery::TornDown => {
                    self.table.seal();
                    return Err(CacheError::Canceled);
                }
                Delivery::Canceled if self.table.scope().is_cancelled() => {
                    return Err(CacheError::Canceled)
                }
                Delivery::Canceled => return Err(CacheError::OperationCanceled),
                Delivery::Closed(returned) => {
                    stale = Some(handle.id);
                    value = returned;
                }
                Delivery::Lost if self.table.scope().is_cancelled() => {
                    return Err(CacheError::Canceled)
                }
                // The update raced the entry's end and is ordered before it
                Delivery::Lost => return Ok(()),
            }
        }
    }

    /// Hands `value` to the actor behind `handle` and waits for its answer.
    ///
    /// The cache scope is polled ahead of the caller's token, so a write that
    /// outlives the cache reports teardown even when both tokens are the same.
    async fn deliver(
        scope: &CancellationToken,
        cancel: &CancellationToken,
        handle: &EntryHandle<V>,
        value: V,
        ttl: Expiry,
    ) -> Delivery<V> {
        let permit = tokio::select! {
            biased;
            _ = scope.cancelled() => return Delivery::TornDown,
            _ = cancel.cancelled() => return Delivery::Canceled,
            permit = handle.write.reserve() => permit,
        };
        let Ok(permit) = permit else {
            return Delivery::Closed(value);
        };

        let (applied, ack) = oneshot::channel();
        permit.send(Update {
            value,
            ttl,
            applied,
        });

        tokio::select! {
            biased;
            _ = scope.cancelled() => Delivery::TornDown,
            _ = cancel.cancelled() => Delivery::Canceled,
            ack = ack => match ack {
                Ok(Ok(())) => Delivery::Applied,
                Ok(Err(value)) => Delivery::Closed(value),
                Err(_) => Delivery::Lost,
            },
        }
    }
}
