use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::snapshot::SnapshotCache;
use crate::cache::versioned::{Lookup, VersionedEntries};
use crate::config::{BackoffConfig, ProxyConfig};
use crate::error::{Error, SchemaResult};
use crate::revision::Revision;
use crate::schema::{CaveatDefinition, NamespaceDefinition, SchemaDefinition};
use crate::store::engine::{SchemaStore, SchemaWatch};
use crate::store::{RevisionedDefinition, SchemaState};

/// Per-kind replica state.
///
/// The checkpoint and fallback flag share the kind's lock so a reader never
/// observes a torn `(entries, checkpoint, fallback)` triple.
struct WatchIndex<D: SchemaDefinition> {
    entries: HashMap<String, VersionedEntries<D>>,
    checkpoint: Option<Revision>,
    fallback_mode: bool,
}

impl<D: SchemaDefinition> WatchIndex<D> {
    fn new() -> Self {
        WatchIndex { entries: HashMap::new(), checkpoint: None, fallback_mode: false }
    }

    /// Whether reads at `revision` may be answered from this replica.
    fn serves(&self, revision: Revision) -> bool {
        !self.fallback_mode && self.checkpoint.map_or(false, |checkpoint| revision <= checkpoint)
    }

    /// Records one change (or tombstone, for `None`) from the stream.
    fn apply_change(
        &mut self,
        revision: Revision,
        name: &str,
        definition: Option<D>,
    ) -> SchemaResult<()> {
        let list = self.entries.entry(name.to_string()).or_default();
        if list.last_revision() == Some(revision) {
            // The stream re-delivered this revision; the newest payload wins.
            list.replace_last(definition);
            Ok(())
        } else {
            list.append(revision, definition)
        }
    }

    /// The stream is revision-ordered, so any message at `revision` proves
    /// nothing at or below it remains undelivered.
    fn advance_checkpoint(&mut self, revision: Revision) {
        if self.checkpoint.map_or(true, |checkpoint| checkpoint < revision) {
            self.checkpoint = Some(revision);
        }
    }

    /// A gap in the stream means the replica can no longer be trusted:
    /// discard it wholesale and route readers to the backing store.
    fn enter_fallback(&mut self) {
        self.entries.clear();
        self.checkpoint = None;
        self.fallback_mode = true;
    }

    /// Resumes serving from `head`, the revision of a fresh subscription.
    fn resume_at(&mut self, head: Revision) {
        self.entries.clear();
        self.checkpoint = Some(head);
        self.fallback_mode = false;
    }

    fn trim_before(&mut self, revision: Revision) {
        self.entries.retain(|_, list| {
            list.trim_before(revision);
            // A lone tombstone at or below the trim point can go entirely;
            // the absent name falls through to the backing store.
            !(list.only_tombstone()
                && list.last_revision().map_or(false, |last| last <= revision))
        });
    }
}

/// The watching cache: a live replica of schema definitions fed by the
/// store's change stream.
///
/// Reads at revisions the replica has fully observed are answered from
/// memory; everything else falls through to the snapshot cache. A failed
/// stream flips the cache into fallback mode (all reads fall through) until
/// a background re-subscription succeeds.
pub struct WatchingCache {
    inner: Arc<WatchingInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for WatchingCache {
    fn drop(&mut self) {
        // A dropped cache that was never closed must not leak its worker.
        self.inner.cancel.cancel();
    }
}

struct WatchingInner {
    store: Arc<dyn SchemaStore>,
    fallback: Arc<SnapshotCache>,
    namespaces: RwLock<WatchIndex<NamespaceDefinition>>,
    caveats: RwLock<WatchIndex<CaveatDefinition>>,
    started: AtomicBool,
    closed: AtomicBool,
    cancel: CancellationToken,
    backoff: BackoffConfig,
    retention_horizon: Option<Duration>,
}

impl WatchingCache {
    pub fn new(
        store: Arc<dyn SchemaStore>,
        fallback: Arc<SnapshotCache>,
        config: &ProxyConfig,
    ) -> Self {
        WatchingCache {
            inner: Arc::new(WatchingInner {
                store,
                fallback,
                namespaces: RwLock::new(WatchIndex::new()),
                caveats: RwLock::new(WatchIndex::new()),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                backoff: config.backoff.clone(),
                retention_horizon: config.retention_horizon,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Subscribes to the store's change stream at its current head and
    /// spawns the consuming worker. Reads at revisions at or below the head
    /// become servable from memory as soon as this returns. Calling `start`
    /// twice is a no-op.
    pub async fn start(&self) -> SchemaResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::ProxyClosed);
        }
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let (head, watch) = match try_subscribe(&self.inner).await {
            Ok(subscribed) => subscribed,
            Err(err) => {
                self.inner.started.store(false, Ordering::Release);
                return Err(err);
            }
        };
        self.inner.namespaces.write().resume_at(head);
        self.inner.caveats.write().resume_at(head);
        log::info!("schema watch established at revision {head}");

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(run_worker(inner, watch));
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    /// Cancels the worker and rejects subsequent reads. Idempotent; an
    /// in-progress message application is finished before the worker exits.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel.cancel();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub async fn read_namespace(
        &self,
        revision: Revision,
        name: &str,
    ) -> SchemaResult<RevisionedDefinition<NamespaceDefinition>> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::ProxyClosed);
        }
        if let Some(result) = read_replica(&self.inner.namespaces, revision, name) {
            return result;
        }
        self.inner.fallback.read_namespace(revision, name).await
    }

    pub async fn read_caveat(
        &self,
        revision: Revision,
        name: &str,
    ) -> SchemaResult<RevisionedDefinition<CaveatDefinition>> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::ProxyClosed);
        }
        if let Some(result) = read_replica(&self.inner.caveats, revision, name) {
            return result;
        }
        self.inner.fallback.read_caveat(revision, name).await
    }

    /// Resolves the named namespaces, answering from the replica where it
    /// can and issuing one batched fallback lookup for the rest. Tombstoned
    /// names are authoritatively filtered out.
    pub async fn lookup_namespaces(
        &self,
        revision: Revision,
        names: &[String],
    ) -> SchemaResult<Vec<RevisionedDefinition<NamespaceDefinition>>> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::ProxyClosed);
        }
        let (mut resolved, unresolved) = lookup_replica(&self.inner.namespaces, revision, names);
        if !unresolved.is_empty() {
            resolved.extend(self.inner.fallback.lookup_namespaces(revision, &unresolved).await?);
        }
        Ok(resolved)
    }

    /// Resolves the named caveats; see [`Self::lookup_namespaces`].
    pub async fn lookup_caveats(
        &self,
        revision: Revision,
        names: &[String],
    ) -> SchemaResult<Vec<RevisionedDefinition<CaveatDefinition>>> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::ProxyClosed);
        }
        let (mut resolved, unresolved) = lookup_replica(&self.inner.caveats, revision, names);
        if !unresolved.is_empty() {
            resolved.extend(self.inner.fallback.lookup_caveats(revision, &unresolved).await?);
        }
        Ok(resolved)
    }
}

#[cfg(test)]
impl WatchingCache {
    pub(crate) fn namespace_checkpoint(&self) -> Option<Revision> {
        self.inner.namespaces.read().checkpoint
    }

    pub(crate) fn caveat_checkpoint(&self) -> Option<Revision> {
        self.inner.caveats.read().checkpoint
    }

    pub(crate) fn in_fallback(&self) -> bool {
        self.inner.namespaces.read().fallback_mode
    }
}

/// Attempts to answer a read from the replica. `None` means the replica
/// cannot decide (fallback mode, revision above the checkpoint, or the name
/// was never observed this far back) and the caller must fall through.
fn read_replica<D: SchemaDefinition>(
    index: &RwLock<WatchIndex<D>>,
    revision: Revision,
    name: &str,
) -> Option<SchemaResult<RevisionedDefinition<D>>> {
    let index = index.read();
    if !index.serves(revision) {
        return None;
    }
    match index.entries.get(name).map(|list| list.lookup(revision))? {
        Lookup::Found(definition, last_written) => Some(Ok(RevisionedDefinition {
            definition: definition.clone(),
            last_written,
        })),
        Lookup::Tombstone(_) => Some(Err(Error::NotFoundAtRevision {
            kind: D::KIND,
            name: name.to_string(),
            revision,
        })),
        Lookup::Absent => None,
    }
}

/// Replica-side half of lookup-many: returns the resolved definitions and
/// the names the replica cannot decide. Tombstoned names appear in neither.
fn lookup_replica<D: SchemaDefinition>(
    index: &RwLock<WatchIndex<D>>,
    revision: Revision,
    names: &[String],
) -> (Vec<RevisionedDefinition<D>>, Vec<String>) {
    let index = index.read();
    if !index.serves(revision) {
        return (Vec::new(), names.to_vec());
    }

    let mut resolved = Vec::new();
    let mut unresolved = Vec::new();
    for name in names {
        match index.entries.get(name).map(|list| list.lookup(revision)) {
            Some(Lookup::Found(definition, last_written)) => resolved.push(RevisionedDefinition {
                definition: definition.clone(),
                last_written,
            }),
            Some(Lookup::Tombstone(_)) => {}
            Some(Lookup::Absent) | None => unresolved.push(name.clone()),
        }
    }
    (resolved, unresolved)
}

enum WorkerExit {
    Closed,
    StreamFailed,
}

/// The stream-consuming worker: applies messages until the stream dies,
/// then flips to fallback and re-subscribes under backoff, forever (or
/// until cancelled).
async fn run_worker(inner: Arc<WatchingInner>, watch: SchemaWatch) {
    let mut watch = Some(watch);
    loop {
        let current = match watch.take() {
            Some(current) => current,
            None => match resubscribe(&inner).await {
                Some(current) => current,
                None => return,
            },
        };

        match consume(&inner, current).await {
            WorkerExit::Closed => return,
            WorkerExit::StreamFailed => {
                log::warn!("schema watch stream failed; falling back to direct store reads");
                inner.namespaces.write().enter_fallback();
                inner.caveats.write().enter_fallback();
            }
        }
    }
}

async fn consume(inner: &WatchingInner, mut watch: SchemaWatch) -> WorkerExit {
    let mut observed: VecDeque<(Instant, Revision)> = VecDeque::new();
    let mut retention = tokio::time::interval(retention_interval(inner.retention_horizon));
    retention.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    retention.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => return WorkerExit::Closed,

            state = watch.states.recv() => match state {
                Some(state) => {
                    let revision = state.revision;
                    if let Err(err) = apply_state(inner, state) {
                        log::warn!("schema change at revision {revision} could not be applied: {err}");
                        return WorkerExit::StreamFailed;
                    }
                    if inner.retention_horizon.is_some() {
                        observed.push_back((Instant::now(), revision));
                    }
                }
                None => return WorkerExit::StreamFailed,
            },

            result = &mut watch.errors => {
                match result {
                    Ok(err) => log::warn!("schema watch stream reported: {err}"),
                    Err(_) => log::warn!("schema watch error channel dropped"),
                }
                return WorkerExit::StreamFailed;
            }

            _ = retention.tick(), if inner.retention_horizon.is_some() => {
                apply_retention(inner, &mut observed);
            }
        }
    }
}

/// Applies one stream message. Each kind is updated atomically under its own
/// write lock; no ordering is guaranteed across kinds.
fn apply_state(inner: &WatchingInner, state: SchemaState) -> SchemaResult<()> {
    let SchemaState {
        revision,
        is_checkpoint: _,
        changed_namespaces,
        changed_caveats,
        deleted_namespaces,
        deleted_caveats,
    } = state;

    {
        let mut index = inner.namespaces.write();
        for definition in changed_namespaces {
            let name = definition.name().to_string();
            index.apply_change(revision, &name, Some(definition))?;
        }
        for name in deleted_namespaces {
            index.apply_change(revision, &name, None)?;
        }
        index.advance_checkpoint(revision);
    }
    {
        let mut index = inner.caveats.write();
        for definition in changed_caveats {
            let name = definition.name().to_string();
            index.apply_change(revision, &name, Some(definition))?;
        }
        for name in deleted_caveats {
            index.apply_change(revision, &name, None)?;
        }
        index.advance_checkpoint(revision);
    }
    Ok(())
}

fn retention_interval(horizon: Option<Duration>) -> Duration {
    match horizon {
        Some(horizon) => (horizon / 4).max(Duration::from_secs(1)),
        // Retention disabled; the branch is also guarded out of the select.
        None => Duration::from_secs(3600),
    }
}

/// Trims every list down to the newest revision observed before the
/// horizon, bounding replica growth under schema churn.
fn apply_retention(inner: &WatchingInner, observed: &mut VecDeque<(Instant, Revision)>) {
    let Some(horizon) = inner.retention_horizon else {
        return;
    };
    let mut trim_to = None;
    while let Some((at, revision)) = observed.front() {
        if at.elapsed() < horizon {
            break;
        }
        trim_to = Some(*revision);
        observed.pop_front();
    }
    if let Some(revision) = trim_to {
        log::debug!("trimming schema replica below revision {revision}");
        inner.namespaces.write().trim_before(revision);
        inner.caveats.write().trim_before(revision);
    }
}

/// Re-establishes the watch after a failure: fetch the head, subscribe from
/// it, and resume serving. Retries forever under jittered exponential
/// backoff; returns `None` once cancelled.
async fn resubscribe(inner: &Arc<WatchingInner>) -> Option<SchemaWatch> {
    let mut delay = inner.backoff.initial;
    loop {
        if inner.cancel.is_cancelled() {
            return None;
        }

        match try_subscribe(inner).await {
            Ok((head, watch)) => {
                inner.namespaces.write().resume_at(head);
                inner.caveats.write().resume_at(head);
                log::info!("schema watch re-established at revision {head}");
                return Some(watch);
            }
            Err(err) => {
                log::warn!("schema watch resubscription failed: {err}");
            }
        }

        let jittered = delay.mul_f64(0.5 + rand::random::<f64>() / 2.0);
        tokio::select! {
            _ = inner.cancel.cancelled() => return None,
            _ = tokio::time::sleep(jittered) => {}
        }
        delay = delay.mul_f64(inner.backoff.multiplier).min(inner.backoff.max);
    }
}

async fn try_subscribe(inner: &WatchingInner) -> SchemaResult<(Revision, SchemaWatch)> {
    let head = inner.store.head_revision().await?;
    let watch = inner.store.watch_schema(head).await?;
    Ok((head, watch))
}
