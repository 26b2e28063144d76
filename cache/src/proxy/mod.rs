//! The reader façade: a proxy pairing the two cache layers with the
//! backing store and routing every read to the right one.

mod transaction;


pub use transaction::ReadWriteTransaction;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::cache::snapshot::SnapshotCache;
use crate::cache::watching::WatchingCache;
use crate::config::ProxyConfig;
use crate::error::{Error, SchemaResult};
use crate::revision::Revision;
use crate::schema::{CaveatDefinition, NamespaceDefinition};
use crate::store::engine::SchemaStore;
use crate::store::RevisionedDefinition;

/// A revision-aware caching proxy in front of a versioned schema store.
///
/// Reads go through [`SchemaReader`] values obtained from
/// [`snapshot_reader`](Self::snapshot_reader). With the watching cache
/// enabled, reads at revisions the replica has observed are answered from
/// memory; everything else is answered by the snapshot cache, which
/// coalesces concurrent misses into single store reads. Writes go to the
/// store through [`read_write_tx`](Self::read_write_tx); the proxy learns
/// of them through the store's change stream like any other writer's.
pub struct CachingProxy {
    inner: Arc<ProxyInner>,
}

struct ProxyInner {
    store: Arc<dyn SchemaStore>,
    snapshot: Arc<SnapshotCache>,
    watching: Option<WatchingCache>,
    closed: AtomicBool,
}

impl CachingProxy {
    /// Creates a proxy bound to `store`. When the configuration enables the
    /// watching cache, [`start`](Self::start) must be called before it
    /// serves from memory; until then every read uses the snapshot cache.
    pub fn new(store: Arc<dyn SchemaStore>, config: ProxyConfig) -> Self {
        let snapshot =
            Arc::new(SnapshotCache::new(Arc::clone(&store), config.snapshot_cache_max_bytes));
        let watching = config.watch_enabled.then(|| {
            WatchingCache::new(Arc::clone(&store), Arc::clone(&snapshot), &config)
        });
        CachingProxy {
            inner: Arc::new(ProxyInner { store, snapshot, watching, closed: AtomicBool::new(false) }),
        }
    }

    /// Subscribes the watching cache to the store's change stream. A no-op
    /// when the watching cache is disabled, and idempotent otherwise.
    pub async fn start(&self) -> SchemaResult<()> {
        match &self.inner.watching {
            Some(watching) => watching.start().await,
            None => Ok(()),
        }
    }

    /// Stops the watch worker and rejects subsequent operations. A second
    /// close is a no-op; reads already in flight either complete or return
    /// [`Error::Cancelled`].
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(watching) = &self.inner.watching {
            watching.close().await;
        }
    }

    /// Returns a cheap read handle bound to `revision`.
    pub fn snapshot_reader(&self, revision: Revision) -> SchemaReader {
        SchemaReader { revision, inner: Arc::clone(&self.inner) }
    }

    /// The store's most recent committed revision.
    pub async fn head_revision(&self) -> SchemaResult<Revision> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::ProxyClosed);
        }
        self.inner.store.head_revision().await
    }

    /// Begins a read/write transaction.
    ///
    /// The transaction reads through its own transaction-local cache and
    /// never consults the snapshot or watching caches: writes mutate state
    /// within the transaction, and observing external cache state there
    /// would risk stale reads.
    pub async fn read_write_tx(&self) -> SchemaResult<ReadWriteTransaction> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::ProxyClosed);
        }
        let tx = self.inner.store.begin_tx().await?;
        Ok(ReadWriteTransaction::new(tx))
    }
}

/// A per-revision read handle; cheap to create and clone.
#[derive(Clone)]
pub struct SchemaReader {
    revision: Revision,
    inner: Arc<ProxyInner>,
}

impl SchemaReader {
    pub fn revision(&self) -> Revision {
        self.revision
    }

    fn check_open(&self) -> SchemaResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::ProxyClosed);
        }
        Ok(())
    }

    pub async fn read_namespace_by_name(
        &self,
        name: &str,
    ) -> SchemaResult<RevisionedDefinition<NamespaceDefinition>> {
        self.check_open()?;
        match &self.inner.watching {
            Some(watching) => watching.read_namespace(self.revision, name).await,
            None => self.inner.snapshot.read_namespace(self.revision, name).await,
        }
    }

    pub async fn read_caveat_by_name(
        &self,
        name: &str,
    ) -> SchemaResult<RevisionedDefinition<CaveatDefinition>> {
        self.check_open()?;
        match &self.inner.watching {
            Some(watching) => watching.read_caveat(self.revision, name).await,
            None => self.inner.snapshot.read_caveat(self.revision, name).await,
        }
    }

    /// Resolves the named namespaces, skipping those that do not exist at
    /// this revision.
    pub async fn lookup_namespaces_with_names(
        &self,
        names: &[String],
    ) -> SchemaResult<Vec<RevisionedDefinition<NamespaceDefinition>>> {
        self.check_open()?;
        match &self.inner.watching {
            Some(watching) => watching.lookup_namespaces(self.revision, names).await,
            None => self.inner.snapshot.lookup_namespaces(self.revision, names).await,
        }
    }

    /// Resolves the named caveats, skipping those that do not exist at this
    /// revision.
    pub async fn lookup_caveats_with_names(
        &self,
        names: &[String],
    ) -> SchemaResult<Vec<RevisionedDefinition<CaveatDefinition>>> {
        self.check_open()?;
        match &self.inner.watching {
            Some(watching) => watching.lookup_caveats(self.revision, names).await,
            None => self.inner.snapshot.lookup_caveats(self.revision, names).await,
        }
    }
}
