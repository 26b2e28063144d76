use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::cache::versioned::{Lookup, VersionedEntries};
use crate::error::{Error, SchemaResult};
use crate::revision::Revision;
use crate::schema::{CaveatDefinition, DefinitionKind, NamespaceDefinition, SchemaDefinition};
use crate::store::engine::{SchemaStore, SchemaTransaction, SchemaWatch, SnapshotReader};
use crate::store::{RevisionedDefinition, SchemaState};

/// Buffered messages per watch subscriber. A subscriber that falls this far
/// behind is cut off with a terminal stream error.
const WATCH_BUFFER: usize = 1024;

/// An in-memory schema store. Definitions live in per-name version
/// histories; nothing is persisted. Intended for tests and demos, but it
/// implements the full store contract including transactions and the
/// schema-change stream.
pub struct MemorySchemaStore {
    inner: Arc<Mutex<StoreInner>>,
}

struct StoreInner {
    namespaces: BTreeMap<String, VersionedEntries<NamespaceDefinition>>,
    caveats: BTreeMap<String, VersionedEntries<CaveatDefinition>>,
    head: Revision,
    next_seq: u64,
    watchers: Vec<Watcher>,
}

struct Watcher {
    states: mpsc::Sender<SchemaState>,
    errors: Option<oneshot::Sender<Error>>,
}

impl MemorySchemaStore {
    /// Creates an empty store with its head at [`Revision::zero`].
    pub fn new() -> Self {
        MemorySchemaStore {
            inner: Arc::new(Mutex::new(StoreInner {
                namespaces: BTreeMap::new(),
                caveats: BTreeMap::new(),
                head: Revision::zero(),
                next_seq: 0,
                watchers: Vec::new(),
            })),
        }
    }
}

impl Default for MemorySchemaStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreInner {
    /// Re-assembles the change messages for every commit above
    /// `from_revision`, in revision order, so late subscribers miss nothing.
    fn replay_after(&self, from_revision: Revision) -> Vec<SchemaState> {
        let mut by_revision: BTreeMap<Revision, SchemaState> = BTreeMap::new();

        for (name, list) in &self.namespaces {
            for (revision, definition) in list.iter_entries() {
                if revision <= from_revision {
                    continue;
                }
                let state =
                    by_revision.entry(revision).or_insert_with(|| SchemaState::changes(revision));
                match definition {
                    Some(def) => state.changed_namespaces.push(def.clone()),
                    None => state.deleted_namespaces.push(name.clone()),
                }
            }
        }
        for (name, list) in &self.caveats {
            for (revision, definition) in list.iter_entries() {
                if revision <= from_revision {
                    continue;
                }
                let state =
                    by_revision.entry(revision).or_insert_with(|| SchemaState::changes(revision));
                match definition {
                    Some(def) => state.changed_caveats.push(def.clone()),
                    None => state.deleted_caveats.push(name.clone()),
                }
            }
        }

        by_revision.into_values().collect()
    }

    /// Sends a message to every live watcher, cutting off any that cannot
    /// keep up.
    fn broadcast(&mut self, state: &SchemaState) {
        self.watchers.retain_mut(|watcher| {
            if watcher.states.try_send(state.clone()).is_ok() {
                return true;
            }
            log::warn!("dropping schema watcher that fell behind");
            if let Some(errors) = watcher.errors.take() {
                let _ = errors.send(Error::StoreUnavailable("schema watch lagged".to_string()));
            }
            false
        });
    }
}

#[async_trait]
impl SchemaStore for MemorySchemaStore {
    fn snapshot_reader(&self, revision: Revision) -> Box<dyn SnapshotReader> {
        Box::new(MemorySnapshotReader { inner: Arc::clone(&self.inner), revision })
    }

    async fn head_revision(&self) -> SchemaResult<Revision> {
        Ok(self.inner.lock().head)
    }

    async fn watch_schema(&self, from_revision: Revision) -> SchemaResult<SchemaWatch> {
        let (states_tx, states_rx) = mpsc::channel(WATCH_BUFFER);
        let (errors_tx, errors_rx) = oneshot::channel();

        let mut inner = self.inner.lock();
        for state in inner.replay_after(from_revision) {
            states_tx
                .try_send(state)
                .map_err(|_| Error::StoreUnavailable("schema watch replay overflow".to_string()))?;
        }
        let head = inner.head;
        if head > from_revision {
            let _ = states_tx.try_send(SchemaState::checkpoint(head));
        }
        inner.watchers.push(Watcher { states: states_tx, errors: Some(errors_tx) });

        Ok(SchemaWatch { states: states_rx, errors: errors_rx })
    }

    async fn begin_tx(&self) -> SchemaResult<Box<dyn SchemaTransaction>> {
        let mut inner = self.inner.lock();
        inner.next_seq += 1;
        let version = Revision::new(inner.next_seq);
        Ok(Box::new(MemoryTransaction {
            inner: Arc::clone(&self.inner),
            version,
            namespace_writes: HashMap::new(),
            caveat_writes: HashMap::new(),
        }))
    }
}

struct MemorySnapshotReader {
    inner: Arc<Mutex<StoreInner>>,
    revision: Revision,
}

/// Resolves one name in a kind's map at `revision`.
fn read_at<D: SchemaDefinition>(
    map: &BTreeMap<String, VersionedEntries<D>>,
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

fn lookup_at<D: SchemaDefinition>(
    map: &BTreeMap<String, VersionedEntries<D>>,
    revision: Revision,
    names: &[String],
) -> Vec<RevisionedDefinition<D>> {
    names
        .iter()
        .filter_map(|name| read_at(map, revision, name).ok())
        .collect()
}

#[async_trait]
impl SnapshotReader for MemorySnapshotReader {
    async fn read_namespace_by_name(
        &self,
        name: &str,
    ) -> SchemaResult<RevisionedDefinition<NamespaceDefinition>> {
        read_at(&self.inner.lock().namespaces, self.revision, name)
    }

    async fn read_caveat_by_name(
        &self,
        name: &str,
    ) -> SchemaResult<RevisionedDefinition<CaveatDefinition>> {
        read_at(&self.inner.lock().caveats, self.revision, name)
    }

    async fn lookup_namespaces_with_names(
        &self,
        names: &[String],
    ) -> SchemaResult<Vec<RevisionedDefinition<NamespaceDefinition>>> {
        Ok(lookup_at(&self.inner.lock().namespaces, self.revision, names))
    }

    async fn lookup_caveats_with_names(
        &self,
        names: &[String],
    ) -> SchemaResult<Vec<RevisionedDefinition<CaveatDefinition>>> {
        Ok(lookup_at(&self.inner.lock().caveats, self.revision, names))
    }
}

struct MemoryTransaction {
    inner: Arc<Mutex<StoreInner>>,
    version: Revision,
    namespace_writes: HashMap<String, Option<NamespaceDefinition>>,
    caveat_writes: HashMap<String, Option<CaveatDefinition>>,
}

#[async_trait]
impl SchemaTransaction for MemoryTransaction {
    fn revision(&self) -> Revision {
        self.version
    }

    async fn read_namespace_by_name(
        &mut self,
        name: &str,
    ) -> SchemaResult<RevisionedDefinition<NamespaceDefinition>> {
        match self.namespace_writes.get(name) {
            Some(Some(definition)) => Ok(RevisionedDefinition {
                definition: definition.clone(),
                last_written: self.version,
            }),
            Some(None) => Err(Error::NotFoundAtRevision {
                kind: DefinitionKind::Namespace,
                name: name.to_string(),
                revision: self.version,
            }),
            None => read_at(&self.inner.lock().namespaces, self.version, name),
        }
    }

    async fn read_caveat_by_name(
        &mut self,
        name: &str,
    ) -> SchemaResult<RevisionedDefinition<CaveatDefinition>> {
        match self.caveat_writes.get(name) {
            Some(Some(definition)) => Ok(RevisionedDefinition {
                definition: definition.clone(),
                last_written: self.version,
            }),
            Some(None) => Err(Error::NotFoundAtRevision {
                kind: DefinitionKind::Caveat,
                name: name.to_string(),
                revision: self.version,
            }),
            None => read_at(&self.inner.lock().caveats, self.version, name),
        }
    }

    async fn write_namespace(&mut self, definition: NamespaceDefinition) -> SchemaResult<()> {
        self.namespace_writes.insert(definition.name().to_string(), Some(definition));
        Ok(())
    }

    async fn write_caveat(&mut self, definition: CaveatDefinition) -> SchemaResult<()> {
        self.caveat_writes.insert(definition.name().to_string(), Some(definition));
        Ok(())
    }

    async fn delete_namespace(&mut self, name: &str) -> SchemaResult<()> {
        self.namespace_writes.insert(name.to_string(), None);
        Ok(())
    }

    async fn delete_caveat(&mut self, name: &str) -> SchemaResult<()> {
        self.caveat_writes.insert(name.to_string(), None);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> SchemaResult<Revision> {
        let MemoryTransaction { inner, version, namespace_writes, caveat_writes } = *self;
        let mut store = inner.lock();

        // Validate before mutating so a conflicting commit leaves no partial
        // state behind.
        for name in namespace_writes.keys() {
            if let Some(last) = store.namespaces.get(name).and_then(|l| l.last_revision()) {
                if version <= last {
                    return Err(Error::OrderingViolation { last, revision: version });
                }
            }
        }
        for name in caveat_writes.keys() {
            if let Some(last) = store.caveats.get(name).and_then(|l| l.last_revision()) {
                if version <= last {
                    return Err(Error::OrderingViolation { last, revision: version });
                }
            }
        }

        let mut state = SchemaState::changes(version);
        for (name, write) in namespace_writes {
            match &write {
                Some(def) => state.changed_namespaces.push(def.clone()),
                None => state.deleted_namespaces.push(name.clone()),
            }
            store.namespaces.entry(name).or_default().append(version, write)?;
        }
        for (name, write) in caveat_writes {
            match &write {
                Some(def) => state.changed_caveats.push(def.clone()),
                None => state.deleted_caveats.push(name.clone()),
            }
            store.caveats.entry(name).or_default().append(version, write)?;
        }

        store.head = store.head.max(version);
        if !state.is_empty() {
            store.broadcast(&state);
        }
        store.broadcast(&SchemaState::checkpoint(version));

        Ok(version)
    }

    async fn rollback(self: Box<Self>) -> SchemaResult<()> {
        Ok(())
    }
}
