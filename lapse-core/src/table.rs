use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::entry::{self, EntryHandle, Expiry};
use crate::error::CacheError;

/// Membership state of the table. Once `Sealed`, it never becomes `Active` again.
enum Entries<K, V> {
    Active(HashMap<K, EntryHandle<V>>),
    Sealed,
}

/// Outcome of claiming a key for a write
pub(crate) enum Claim<V> {
    /// A new actor now holds the value
    Spawned,
    /// A live actor already owns the key; the value is handed back for an update
    Occupied(EntryHandle<V>, V),
}

/// Key -> actor handle mapping behind a single lock.
///
/// The lock guards membership only. Values live inside their actors and are
/// exchanged over the handles' ports outside the lock.
pub(crate) struct EntryTable<K, V> {
    entries: RwLock<Entries<K, V>>,
    scope: CancellationToken,
    next_id: AtomicU64,
    port_capacity: usize,
}

impl<K, V> EntryTable<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(scope: CancellationToken, port_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            entries: RwLock::new(Entries::Active(HashMap::new())),
            scope,
            next_id: AtomicU64::new(0),
            port_capacity: port_capacity.max(1),
        })
    }

    /// The cache-wide scope every entry scope derives from
    pub(crate) fn scope(&self) -> &CancellationToken {
        &self.scope
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn port_capacity(&self) -> usize {
        self.port_capacity
    }

    /// Returns a clone of the handle registered for `key`.
    pub(crate) fn lookup(&self, key: &K) -> Option<EntryHandle<V>> {
        match &*self.entries.read() {
            Entries::Active(map) => map.get(key).cloned(),
            Entries::Sealed => None,
        }
    }

    /// Spawns an actor for `key` unless a live one already owns it.
    ///
    /// A handle whose generation equals `stale` belongs to an actor that has
    /// already exited and is replaced rather than returned.
    pub(crate) fn claim(
        self: &Arc<Self>,
        key: K,
        value: V,
        ttl: Expiry,
        extend: bool,
        stale: Option<u64>,
    ) -> Result<Claim<V>, CacheError> {
        let mut entries = self.entries.write();

        // The supervisor may not have run yet
        if self.scope.is_cancelled() {
            seal_locked(&mut *entries);
        }

        let Entries::Active(map) = &mut *entries else {
            return Err(CacheError::Canceled);
        };

        if let Some(handle) = map.get(&key) {
            if Some(handle.id) != stale {
                return Ok(Claim::Occupied(handle.clone(), value));
            }
            tracing::debug!(entry = handle.id, "replacing handle of exited entry");
        }

        let handle = entry::spawn(self, key.clone(), value, ttl, extend);
        map.insert(key, handle);
        Ok(Claim::Spawned)
    }

    /// Cancels and removes the entry for `key`. Returns whether one existed.
    pub(crate) fn remove(&self, key: &K) -> bool {
        let mut entries = self.entries.write();
        let Entries::Active(map) = &mut *entries else {
            return false;
        };

        match map.remove(key) {
            Some(handle) => {
                handle.cancel.cancel();
                tracing::debug!(entry = handle.id, "entry deleted");
                true
            }
            None => false,
        }
    }

    /// Removes `key` on behalf of its exiting actor.
    ///
    /// No-op once the cache scope is canceled, or when the key already points
    /// at a newer actor.
    pub(crate) fn reap(&self, key: &K, id: u64) {
        if self.scope.is_cancelled() {
            return;
        }

        let mut entries = self.entries.write();
        if let Entries::Active(map) = &mut *entries {
            if map.get(key).is_some_and(|handle| handle.id == id) {
                map.remove(key);
            }
        }
    }

    /// Cancels every live entry and permanently seals the table.
    ///
    /// Returns the number of entries torn down; zero if already sealed.
    pub(crate) fn seal(&self) -> usize {
        let mut entries = self.entries.write();
        seal_locked(&mut *entries)
    }

    pub(crate) fn is_sealed(&self) -> bool {
        matches!(&*self.entries.read(), Entries::Sealed)
    }

    pub(crate) fn len(&self) -> usize {
        match &*self.entries.read() {
            Entries::Active(map) => map.len(),
            Entries::Sealed => 0,
        }
    }

    pub(crate) fn contains_key(&self, key: &K) -> bool {
        match &*self.entries.read() {
            Entries::Active(map) => map.contains_key(key),
            Entries::Sealed => false,
        }
    }

    pub(crate) fn keys(&self) -> Vec<K> {
        match &*self.entries.read() {
            Entries::Active(map) => map.keys().cloned().collect(),
            Entries::Sealed => Vec::new(),
        }
    }

    /// Registers a handle without spawning an actor behind it.
    #[cfg(test)]
    pub(crate) fn insert_handle(&self, key: K, handle: EntryHandle<V>) {
        if let Entries::Active(map) = &mut *self.entries.write() {
            map.insert(key, handle);
        }
    }
}

fn seal_locked<K, V>(entries: &mut Entries<K, V>) -> usize {
    match std::mem::replace(entries, Entries::Sealed) {
        Entries::Active(map) => {
            for handle in map.values() {
                handle.cancel.cancel();
            }
            tracing::info!(entries = map.len(), "cache sealed");
            map.len()
        }
        Entries::Sealed => 0,
    }
}

impl<K, V> Drop for EntryTable<K, V> {
    fn drop(&mut self) {
        // Tear down every actor and let the supervisor exit
        self.scope.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::sleep;

    fn test_table() -> Arc<EntryTable<String, u32>> {
        EntryTable::new(CancellationToken::new(), 4)
    }

    fn spawn_key(table: &Arc<EntryTable<String, u32>>, key: &str, ttl: Expiry) {
        let claim = table.claim(key.to_string(), 1, ttl, false, None).unwrap();
        assert!(matches!(claim, Claim::Spawned));
    }

    #[tokio::test]
    async fn test_claim_spawns_then_occupies() {
        let table = test_table();
        spawn_key(&table, "k", Expiry::Never);

        match table.claim("k".to_string(), 2, Expiry::Never, false, None).unwrap() {
            Claim::Occupied(_, value) => assert_eq!(value, 2),
            Claim::Spawned => panic!("expected occupied key"),
        }
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_claim_replaces_stale_handle() {
        let table = test_table();
        spawn_key(&table, "k", Expiry::Never);
        let old = table.lookup(&"k".to_string()).unwrap();

        let claim = table
            .claim("k".to_string(), 2, Expiry::Never, false, Some(old.id))
            .unwrap();
        assert!(matches!(claim, Claim::Spawned));

        let new = table.lookup(&"k".to_string()).unwrap();
        assert_ne!(old.id, new.id);
    }

    #[tokio::test]
    async fn test_remove_cancels_entry() {
        let table = test_table();
        spawn_key(&table, "k", Expiry::Never);
        let handle = table.lookup(&"k".to_string()).unwrap();

        assert!(table.remove(&"k".to_string()));
        assert!(handle.cancel.is_cancelled());
        assert!(!table.contains_key(&"k".to_string()));
        assert!(!table.remove(&"k".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_reaps_itself() {
        let table = test_table();
        spawn_key(&table, "short", Expiry::After(Duration::from_millis(50)));
        spawn_key(&table, "long", Expiry::After(Duration::from_secs(60)));

        sleep(Duration::from_millis(60)).await;

        assert!(!table.contains_key(&"short".to_string()));
        assert!(table.contains_key(&"long".to_string()));
    }

    #[tokio::test]
    async fn test_reap_ignores_newer_generation() {
        let table = test_table();
        spawn_key(&table, "k", Expiry::Never);
        let handle = table.lookup(&"k".to_string()).unwrap();

        table.reap(&"k".to_string(), handle.id + 1);
        assert!(table.contains_key(&"k".to_string()));

        table.reap(&"k".to_string(), handle.id);
        assert!(!table.contains_key(&"k".to_string()));
    }

    #[tokio::test]
    async fn test_seal_cancels_all_and_rejects_claims() {
        let table = test_table();
        spawn_key(&table, "a", Expiry::Never);
        spawn_key(&table, "b", Expiry::Never);
        let a = table.lookup(&"a".to_string()).unwrap();
        let b = table.lookup(&"b".to_string()).unwrap();

        assert_eq!(table.seal(), 2);
        assert!(table.is_sealed());
        assert!(a.cancel.is_cancelled());
        assert!(b.cancel.is_cancelled());

        let result = table.claim("c".to_string(), 1, Expiry::Never, false, None);
        assert_eq!(result.err(), Some(CacheError::Canceled));
        assert_eq!(table.seal(), 0);
        assert_eq!(table.len(), 0);
        assert!(table.keys().is_empty());
    }

    #[tokio::test]
    async fn test_claim_seals_when_scope_canceled() {
        let table = test_table();
        spawn_key(&table, "a", Expiry::Never);

        table.scope().cancel();

        let result = table.claim("b".to_string(), 1, Expiry::Never, false, None);
        assert_eq!(result.err(), Some(CacheError::Canceled));
        assert!(table.is_sealed());
    }

    #[tokio::test]
    async fn test_drop_cancels_scope() {
        let scope = CancellationToken::new();
        let table: Arc<EntryTable<String, u32>> = EntryTable::new(scope.clone(), 4);
        drop(table);

        assert!(scope.is_cancelled());
    }
}
