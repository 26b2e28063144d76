//! Instrumented store implementations shared by the cache and proxy test
//! suites: read counting, read disabling, and a hand-driven change stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::cache::versioned::{Lookup, VersionedEntries};
use crate::error::{Error, SchemaResult};
use crate::revision::Revision;
use crate::schema::{CaveatDefinition, NamespaceDefinition, SchemaDefinition};
use crate::store::engine::{SchemaStore, SchemaTransaction, SchemaWatch, SnapshotReader};
use crate::store::memory::MemorySchemaStore;
use crate::store::{RevisionedDefinition, SchemaState};

/// Polls `condition` until it holds, panicking after a generous deadline.
/// Used to wait for the watch worker to apply messages it receives
/// asynchronously.
pub(crate) async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("timed out waiting for {what}");
}

struct CountingState {
    reads: AtomicUsize,
    tx_reads: AtomicUsize,
    reads_enabled: AtomicBool,
    read_delay: Mutex<Duration>,
}

impl CountingState {
    async fn before_read(&self) -> SchemaResult<()> {
        let delay = *self.read_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !self.reads_enabled.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("reads disabled".to_string()));
        }
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Wraps a [`MemorySchemaStore`], counting snapshot and transactional reads
/// and optionally failing or delaying snapshot reads.
pub(crate) struct CountingStore {
    inner: MemorySchemaStore,
    state: Arc<CountingState>,
}

impl CountingStore {
    pub fn new(inner: MemorySchemaStore) -> Self {
        CountingStore {
            inner,
            state: Arc::new(CountingState {
                reads: AtomicUsize::new(0),
                tx_reads: AtomicUsize::new(0),
                reads_enabled: AtomicBool::new(true),
                read_delay: Mutex::new(Duration::ZERO),
            }),
        }
    }

    /// Snapshot reads (including batched lookups) issued so far.
    pub fn reads(&self) -> usize {
        self.state.reads.load(Ordering::SeqCst)
    }

    /// Reads issued against transactional readers so far.
    pub fn tx_reads(&self) -> usize {
        self.state.tx_reads.load(Ordering::SeqCst)
    }

    pub fn set_reads_enabled(&self, enabled: bool) {
        self.state.reads_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn set_read_delay(&self, delay: Duration) {
        *self.state.read_delay.lock() = delay;
    }
}

#[async_trait]
impl SchemaStore for CountingStore {
    fn snapshot_reader(&self, revision: Revision) -> Box<dyn SnapshotReader> {
        Box::new(CountingReader {
            inner: self.inner.snapshot_reader(revision),
            state: Arc::clone(&self.state),
        })
    }

    async fn head_revision(&self) -> SchemaResult<Revision> {
        self.inner.head_revision().await
    }

    async fn watch_schema(&self, from_revision: Revision) -> SchemaResult<SchemaWatch> {
        self.inner.watch_schema(from_revision).await
    }

    async fn begin_tx(&self) -> SchemaResult<Box<dyn SchemaTransaction>> {
        Ok(Box::new(CountingTransaction {
            inner: self.inner.begin_tx().await?,
            state: Arc::clone(&self.state),
        }))
    }
}

struct CountingReader {
    inner: Box<dyn SnapshotReader>,
    state: Arc<CountingState>,
}

#[async_trait]
impl SnapshotReader for CountingReader {
    async fn read_namespace_by_name(
        &self,
        name: &str,
    ) -> SchemaResult<RevisionedDefinition<NamespaceDefinition>> {
        self.state.before_read().await?;
        self.inner.read_namespace_by_name(name).await
    }

    async fn read_caveat_by_name(
        &self,
        name: &str,
    ) -> SchemaResult<RevisionedDefinition<CaveatDefinition>> {
        self.state.before_read().await?;
        self.inner.read_caveat_by_name(name).await
    }

    async fn lookup_namespaces_with_names(
        &self,
        names: &[String],
    ) -> SchemaResult<Vec<RevisionedDefinition<NamespaceDefinition>>> {
        self.state.before_read().await?;
        self.inner.lookup_namespaces_with_names(names).await
    }

    async fn lookup_caveats_with_names(
        &self,
        names: &[String],
    ) -> SchemaResult<Vec<RevisionedDefinition<CaveatDefinition>>> {
        self.state.before_read().await?;
        self.inner.lookup_caveats_with_names(names).await
    }
}

struct CountingTransaction {
    inner: Box<dyn SchemaTransaction>,
    state: Arc<CountingState>,
}

#[async_trait]
impl SchemaTransaction for CountingTransaction {
    fn revision(&self) -> Revision {
        self.inner.revision()
    }

    async fn read_namespace_by_name(
        &mut self,
        name: &str,
    ) -> SchemaResult<RevisionedDefinition<NamespaceDefinition>> {
        self.state.tx_reads.fetch_add(1, Ordering::SeqCst);
        self.inner.read_namespace_by_name(name).await
    }

    async fn read_caveat_by_name(
        &mut self,
        name: &str,
    ) -> SchemaResult<RevisionedDefinition<CaveatDefinition>> {
        self.state.tx_reads.fetch_add(1, Ordering::SeqCst);
        self.inner.read_caveat_by_name(name).await
    }

    async fn write_namespace(&mut self, definition: NamespaceDefinition) -> SchemaResult<()> {
        self.inner.write_namespace(definition).await
    }

    async fn write_caveat(&mut self, definition: CaveatDefinition) -> SchemaResult<()> {
        self.inner.write_caveat(definition).await
    }

    async fn delete_namespace(&mut self, name: &str) -> SchemaResult<()> {
        self.inner.delete_namespace(name).await
    }

    async fn delete_caveat(&mut self, name: &str) -> SchemaResult<()> {
        self.inner.delete_caveat(name).await
    }

    async fn commit(self: Box<Self>) -> SchemaResult<Revision> {
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> SchemaResult<()> {
        self.inner.rollback().await
    }
}

#[derive(Default)]
struct ManualDefs {
    namespaces: HashMap<String, VersionedEntries<NamespaceDefinition>>,
    caveats: HashMap<String, VersionedEntries<CaveatDefinition>>,
}

struct ManualWatch {
    states: mpsc::Sender<SchemaState>,
    errors: Option<oneshot::Sender<Error>>,
}

struct ManualState {
    defs: Mutex<ManualDefs>,
    head: Mutex<Revision>,
    reads: AtomicUsize,
    reads_enabled: AtomicBool,
    watch_enabled: AtomicBool,
    watches: Mutex<Vec<ManualWatch>>,
    subscriptions: AtomicUsize,
}

/// A store whose change stream is driven by hand: the test decides what the
/// stream delivers and when it fails, independently of the definitions the
/// snapshot readers see. Transactions are unsupported.
pub(crate) struct ManualStore {
    state: Arc<ManualState>,
}

impl ManualStore {
    pub fn new(head: Revision) -> Self {
        ManualStore {
            state: Arc::new(ManualState {
                defs: Mutex::new(ManualDefs::default()),
                head: Mutex::new(head),
                reads: AtomicUsize::new(0),
                reads_enabled: AtomicBool::new(true),
                watch_enabled: AtomicBool::new(true),
                watches: Mutex::new(Vec::new()),
                subscriptions: AtomicUsize::new(0),
            }),
        }
    }

    /// Makes new watch subscriptions fail, keeping a recovering worker in
    /// its retry loop.
    pub fn set_watch_enabled(&self, enabled: bool) {
        self.state.watch_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn set_head(&self, revision: Revision) {
        *self.state.head.lock() = revision;
    }

    pub fn reads(&self) -> usize {
        self.state.reads.load(Ordering::SeqCst)
    }

    pub fn set_reads_enabled(&self, enabled: bool) {
        self.state.reads_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Number of watch subscriptions made over the store's lifetime.
    pub fn subscriptions(&self) -> usize {
        self.state.subscriptions.load(Ordering::SeqCst)
    }

    /// Writes a definition into the store's own state without emitting a
    /// stream message; the test controls the stream separately.
    pub fn put_namespace(&self, revision: Revision, definition: NamespaceDefinition) {
        self.state
            .defs
            .lock()
            .namespaces
            .entry(definition.name().to_string())
            .or_default()
            .append(revision, Some(definition))
            .expect("manual writes must advance the revision");
    }

    pub fn delete_namespace_at(&self, revision: Revision, name: &str) {
        self.state
            .defs
            .lock()
            .namespaces
            .entry(name.to_string())
            .or_default()
            .append(revision, None)
            .expect("manual writes must advance the revision");
    }

    pub fn put_caveat(&self, revision: Revision, definition: CaveatDefinition) {
        self.state
            .defs
            .lock()
            .caveats
            .entry(definition.name().to_string())
            .or_default()
            .append(revision, Some(definition))
            .expect("manual writes must advance the revision");
    }

    /// Delivers a message on the most recent subscription's stream.
    pub async fn send(&self, state: SchemaState) {
        let sender = {
            let watches = self.state.watches.lock();
            watches.last().expect("no active watch").states.clone()
        };
        sender.send(state).await.expect("watch receiver dropped");
    }

    /// Fails the most recent subscription's stream with a terminal error.
    pub fn fail_stream(&self, error: Error) {
        let mut watches = self.state.watches.lock();
        let watch = watches.last_mut().expect("no active watch");
        if let Some(errors) = watch.errors.take() {
            let _ = errors.send(error);
        }
    }
}

fn manual_read<D: SchemaDefinition>(
    map: &HashMap<String, VersionedEntries<D>>,
    revision: Revision,
    name: &str,
) -> SchemaResult<RevisionedDefinition<D>> {
    match map.get(name).map(|list| list.lookup(revision)) {
        Some(Lookup::Found(definition, last_written)) => {
            Ok(RevisionedDefinition { definition: definition.clone(), last_written })
        }
        Some(Lookup::Tombstone(_)) => {
            Err(Error::NotFoundAtRevision { kind: D::KIND, name: name.to_string(), revision })
        }
        Some(Lookup::Absent) | None => {
            Err(Error::NotFound { kind: D::KIND, name: name.to_string() })
        }
    }
}

#[async_trait]
impl SchemaStore for ManualStore {
    fn snapshot_reader(&self, revision: Revision) -> Box<dyn SnapshotReader> {
        Box::new(ManualReader { state: Arc::clone(&self.state), revision })
    }

    async fn head_revision(&self) -> SchemaResult<Revision> {
        Ok(*self.state.head.lock())
    }

    async fn watch_schema(&self, _from_revision: Revision) -> SchemaResult<SchemaWatch> {
        if !self.state.watch_enabled.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("watch disabled".to_string()));
        }
        let (states_tx, states_rx) = mpsc::channel(64);
        let (errors_tx, errors_rx) = oneshot::channel();
        self.state
            .watches
            .lock()
            .push(ManualWatch { states: states_tx, errors: Some(errors_tx) });
        self.state.subscriptions.fetch_add(1, Ordering::SeqCst);
        Ok(SchemaWatch { states: states_rx, errors: errors_rx })
    }

    async fn begin_tx(&self) -> SchemaResult<Box<dyn SchemaTransaction>> {
        Err(Error::StoreUnavailable("manual store does not support transactions".to_string()))
    }
}

struct ManualReader {
    state: Arc<ManualState>,
    revision: Revision,
}

impl ManualReader {
    fn before_read(&self) -> SchemaResult<()> {
        if !self.state.reads_enabled.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("reads disabled".to_string()));
        }
        self.state.reads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl SnapshotReader for ManualReader {
    async fn read_namespace_by_name(
        &self,
        name: &str,
    ) -> SchemaResult<RevisionedDefinition<NamespaceDefinition>> {
        self.before_read()?;
        manual_read(&self.state.defs.lock().namespaces, self.revision, name)
    }

    async fn read_caveat_by_name(
        &self,
        name: &str,
    ) -> SchemaResult<RevisionedDefinition<CaveatDefinition>> {
        self.before_read()?;
        manual_read(&self.state.defs.lock().caveats, self.revision, name)
    }

    async fn lookup_namespaces_with_names(
        &self,
        names: &[String],
    ) -> SchemaResult<Vec<RevisionedDefinition<NamespaceDefinition>>> {
        self.before_read()?;
        let defs = self.state.defs.lock();
        Ok(names
            .iter()
            .filter_map(|name| manual_read(&defs.namespaces, self.revision, name).ok())
            .collect())
    }

    async fn lookup_caveats_with_names(
        &self,
        names: &[String],
    ) -> SchemaResult<Vec<RevisionedDefinition<CaveatDefinition>>> {
        self.before_read()?;
        let defs = self.state.defs.lock();
        Ok(names
            .iter()
            .filter_map(|name| manual_read(&defs.caveats, self.revision, name).ok())
            .collect())
    }
}
