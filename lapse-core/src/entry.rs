use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::table::EntryTable;
use crate::timer::EntryTimer;

/// How long an entry lives before its actor exits on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Expiry {
    /// The entry only ends through deletion or cache teardown
    Never,
    /// The entry expires this long after it was written (or last read, with extend-on-read)
    After(Duration),
}

impl Expiry {
    /// Returns `true` for entries that never expire on their own
    pub fn is_never(&self) -> bool {
        matches!(self, Expiry::Never)
    }

    /// Returns the TTL, or `None` for persistent entries
    pub fn duration(&self) -> Option<Duration> {
        match self {
            Expiry::Never => None,
            Expiry::After(ttl) => Some(*ttl),
        }
    }
}

impl From<Duration> for Expiry {
    fn from(ttl: Duration) -> Self {
        Expiry::After(ttl)
    }
}

/// Replacement value in transit on an entry's write port
pub(crate) struct Update<V> {
    pub(crate) value: V,
    pub(crate) ttl: Expiry,
    /// Answered with `Ok` once applied, or with the value if the actor exits first
    pub(crate) applied: oneshot::Sender<Result<(), V>>,
}

/// A pending read; the actor answers with a clone of its current value
pub(crate) type ReadRequest<V> = oneshot::Sender<V>;

/// Table-side handle to a live entry actor
pub(crate) struct EntryHandle<V> {
    /// Generation of the actor behind this handle, unique per table
    pub(crate) id: u64,
    /// Entry scope, a child of the cache scope
    pub(crate) cancel: CancellationToken,
    pub(crate) read: mpsc::Sender<ReadRequest<V>>,
    pub(crate) write: mpsc::Sender<Update<V>>,
}

impl<V> Clone for EntryHandle<V> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            cancel: self.cancel.clone(),
            read: self.read.clone(),
            write: self.write.clone(),
        }
    }
}

/// Why an actor's loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Canceled,
    Expired,
}

/// The single owner of one cached value.
///
/// All access to `value` goes through the loop in [`EntryActor::run`], one
/// message at a time.
struct EntryActor<K, V> {
    key: K,
    value: V,
    ttl: Expiry,
    extend: bool,
    id: u64,
    cancel: CancellationToken,
    table: Weak<EntryTable<K, V>>,
    reads: mpsc::Receiver<ReadRequest<V>>,
    writes: mpsc::Receiver<Update<V>>,
    reads_open: bool,
    writes_open: bool,
}

/// Starts an actor holding `value` and returns its handle.
///
/// The actor's scope is derived from the table's scope. The caller registers
/// the handle in the table.
pub(crate) fn spawn<K, V>(
    table: &Arc<EntryTable<K, V>>,
    key: K,
    value: V,
    ttl: Expiry,
    extend: bool,
) -> EntryHandle<V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let id = table.next_id();
    let cancel = table.scope().child_token();
    let (read_tx, read_rx) = mpsc::channel(table.port_capacity());
    let (write_tx, write_rx) = mpsc::channel(table.port_capacity());

    let actor = EntryActor {
        key,
        value,
        ttl,
        extend,
        id,
        cancel: cancel.clone(),
        table: Arc::downgrade(table),
        reads: read_rx,
        writes: write_rx,
        reads_open: true,
        writes_open: true,
    };

    tracing::debug!(entry = id, ?ttl, extend, "spawning entry");
    tokio::spawn(actor.run().instrument(tracing::debug_span!("entry", id)));

    EntryHandle {
        id,
        cancel,
        read: read_tx,
        write: write_tx,
    }
}

impl<K, V> EntryActor<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    async fn run(mut self) {
        let mut timer = EntryTimer::new(self.ttl);

        let exit = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break Exit::Canceled,
                _ = timer.fired() => break Exit::Expired,
                update = self.writes.recv(), if self.writes_open => match update {
                    Some(update) => self.apply(update, &mut timer),
                    None => {
                        // Write side closed out of band: keep serving the last value
                        self.writes_open = false;
                        tracing::trace!("write port closed, continuing with last value");
                    }
                },
                request = self.reads.recv(), if self.reads_open => match request {
                    Some(reply) => self.serve(reply, &mut timer),
                    None => self.reads_open = false,
                },
            }
        };

        self.finish(exit);
    }

    fn apply(&mut self, update: Update<V>, timer: &mut EntryTimer) {
        // The writer gave up before the update reached us
        if update.applied.is_closed() {
            tracing::trace!("dropping abandoned update");
            return;
        }

        self.value = update.value;
        if let Expiry::After(_) = update.ttl {
            self.ttl = update.ttl;
            timer.reset(update.ttl);
        }

        let _ = update.applied.send(Ok(()));
    }

    fn serve(&self, reply: ReadRequest<V>, timer: &mut EntryTimer) {
        if reply.send(self.value.clone()).is_err() {
            return;
        }

        if self.extend {
            timer.reset(self.ttl);
            tracing::trace!("read extended entry lifetime");
        }
    }

    fn finish(mut self, exit: Exit) {
        match exit {
            Exit::Canceled => tracing::trace!("entry canceled"),
            Exit::Expired => tracing::debug!(entry = self.id, "entry expired"),
        }

        // Hand queued updates back so their writers can retry elsewhere
        self.writes.close();
        while let Ok(update) = self.writes.try_recv() {
            let _ = update.applied.send(Err(update.value));
        }

        if let Some(table) = self.table.upgrade() {
            table.reap(&self.key, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, timeout};

    fn test_table() -> Arc<EntryTable<&'static str, String>> {
        EntryTable::new(CancellationToken::new(), 4)
    }

    async fn read(handle: &EntryHandle<String>) -> Option<String> {
        let (tx, rx) = oneshot::channel();
        handle.read.send(tx).await.ok()?;
        rx.await.ok()
    }

    async fn write(handle: &EntryHandle<String>, value: &str, ttl: Expiry) -> bool {
        let (applied, done) = oneshot::channel();
        let update = Update {
            value: value.to_string(),
            ttl,
            applied,
        };
        handle.write.send(update).await.is_ok() && matches!(done.await, Ok(Ok(())))
    }

    #[test]
    fn test_expiry_from_duration() {
        let expiry: Expiry = Duration::from_secs(5).into();
        assert_eq!(expiry, Expiry::After(Duration::from_secs(5)));
        assert_eq!(expiry.duration(), Some(Duration::from_secs(5)));
        assert!(!expiry.is_never());

        assert!(Expiry::Never.is_never());
        assert_eq!(Expiry::Never.duration(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_and_write_through_ports() {
        let table = test_table();
        let handle = spawn(&table, "k", "a".to_string(), Expiry::Never, false);

        assert_eq!(read(&handle).await.as_deref(), Some("a"));
        assert!(write(&handle, "b", Expiry::Never).await);
        assert_eq!(read(&handle).await.as_deref(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_expiry_closes_ports() {
        let table = test_table();
        let handle = spawn(&table, "k", "a".to_string(), Duration::from_millis(100).into(), false);

        sleep(Duration::from_millis(50)).await;
        assert_eq!(read(&handle).await.as_deref(), Some("a"));

        sleep(Duration::from_millis(60)).await;
        assert_eq!(read(&handle).await, None);
        assert!(!write(&handle, "b", Expiry::Never).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_actor() {
        let table = test_table();
        let handle = spawn(&table, "k", "a".to_string(), Expiry::Never, false);

        handle.cancel.cancel();
        sleep(Duration::from_millis(1)).await;

        assert_eq!(read(&handle).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_rearms_timer() {
        let table = test_table();
        let handle = spawn(&table, "k", "a".to_string(), Duration::from_millis(100).into(), false);

        sleep(Duration::from_millis(80)).await;
        assert!(write(&handle, "b", Duration::from_millis(100).into()).await);

        // Past the original deadline, inside the new one
        sleep(Duration::from_millis(80)).await;
        assert_eq!(read(&handle).await.as_deref(), Some("b"));

        sleep(Duration::from_millis(30)).await;
        assert_eq!(read(&handle).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_with_never_keeps_deadline() {
        let table = test_table();
        let handle = spawn(&table, "k", "a".to_string(), Duration::from_millis(100).into(), false);

        assert!(write(&handle, "b", Expiry::Never).await);
        sleep(Duration::from_millis(110)).await;

        assert_eq!(read(&handle).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_extends_when_enabled() {
        let table = test_table();
        let handle = spawn(&table, "k", "a".to_string(), Duration::from_millis(100).into(), true);

        for _ in 0..5 {
            sleep(Duration::from_millis(60)).await;
            assert_eq!(read(&handle).await.as_deref(), Some("a"));
        }

        sleep(Duration::from_millis(110)).await;
        assert_eq!(read(&handle).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_does_not_extend_when_disabled() {
        let table = test_table();
        let handle = spawn(&table, "k", "a".to_string(), Duration::from_millis(100).into(), false);

        sleep(Duration::from_millis(60)).await;
        assert_eq!(read(&handle).await.as_deref(), Some("a"));

        sleep(Duration::from_millis(50)).await;
        assert_eq!(read(&handle).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_write_port_keeps_serving_reads() {
        let table = test_table();
        let EntryHandle {
            read: reads,
            write: writes,
            ..
        } = spawn(&table, "k", "a".to_string(), Duration::from_millis(100).into(), false);
        drop(writes);

        sleep(Duration::from_millis(10)).await;
        let (tx, rx) = oneshot::channel();
        reads.send(tx).await.unwrap();
        assert_eq!(rx.await.unwrap(), "a");

        // Still expires on schedule
        sleep(Duration::from_millis(100)).await;
        let (tx, _rx) = oneshot::channel();
        assert!(reads.send(tx).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_update_is_not_applied() {
        let table = test_table();
        let handle = spawn(&table, "k", "a".to_string(), Expiry::Never, false);

        let (applied, done) = oneshot::channel();
        drop(done);
        let update = Update {
            value: "b".to_string(),
            ttl: Expiry::Never,
            applied,
        };
        handle.write.send(update).await.unwrap();

        assert_eq!(read(&handle).await.as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_read_does_not_stall_actor() {
        let table = test_table();
        let handle = spawn(&table, "k", "a".to_string(), Expiry::Never, false);

        let (tx, rx) = oneshot::channel();
        drop(rx);
        handle.read.send(tx).await.unwrap();

        let result = timeout(Duration::from_secs(1), read(&handle)).await;
        assert_eq!(result.unwrap().as_deref(), Some("a"));
    }
}
