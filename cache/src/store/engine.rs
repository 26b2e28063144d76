use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, SchemaResult};
use crate::revision::Revision;
use crate::schema::{CaveatDefinition, NamespaceDefinition};
use crate::store::{RevisionedDefinition, SchemaState};

/// The channel pair returned by [`SchemaStore::watch_schema`].
///
/// `states` yields schema-change and checkpoint messages in strictly
/// ascending revision order. `errors` yields at most one terminal error;
/// after it fires (or its sender is dropped) the stream must be considered
/// dead and re-established.
pub struct SchemaWatch {
    pub states: mpsc::Receiver<SchemaState>,
    pub errors: oneshot::Receiver<Error>,
}

/// A versioned schema store.
///
/// Every committed change is stamped with a monotonically advancing
/// [`Revision`]; reads are always issued against a specific revision via a
/// snapshot reader. The caching proxy owns exactly one store handle and
/// layers its caches on top of this seam.
#[async_trait]
pub trait SchemaStore: Send + Sync + 'static {
    /// Returns a cheap, stateless view of the store as of `revision`.
    fn snapshot_reader(&self, revision: Revision) -> Box<dyn SnapshotReader>;

    /// The most recent committed revision.
    async fn head_revision(&self) -> SchemaResult<Revision>;

    /// Subscribes to schema changes committed after `from_revision`.
    ///
    /// Changes already committed above `from_revision` at subscription time
    /// are replayed, so a subscriber starting from the head revision it just
    /// observed misses nothing.
    async fn watch_schema(&self, from_revision: Revision) -> SchemaResult<SchemaWatch>;

    /// Begins a read/write transaction. The transaction takes its revision
    /// when it begins; its writes become visible atomically at commit.
    async fn begin_tx(&self) -> SchemaResult<Box<dyn SchemaTransaction>>;
}

/// A point-read view of the store bound to one revision.
///
/// Readers are cheap values; a missing definition is reported as
/// [`Error::NotFound`] (or [`Error::NotFoundAtRevision`] when the store can
/// prove a deletion), never as an empty success.
#[async_trait]
pub trait SnapshotReader: Send + Sync {
    async fn read_namespace_by_name(
        &self,
        name: &str,
    ) -> SchemaResult<RevisionedDefinition<NamespaceDefinition>>;

    async fn read_caveat_by_name(
        &self,
        name: &str,
    ) -> SchemaResult<RevisionedDefinition<CaveatDefinition>>;

    /// Resolves the named namespaces, silently skipping those that do not
    /// exist at this revision.
    async fn lookup_namespaces_with_names(
        &self,
        names: &[String],
    ) -> SchemaResult<Vec<RevisionedDefinition<NamespaceDefinition>>>;

    /// Resolves the named caveats, silently skipping those that do not
    /// exist at this revision.
    async fn lookup_caveats_with_names(
        &self,
        names: &[String],
    ) -> SchemaResult<Vec<RevisionedDefinition<CaveatDefinition>>>;
}

/// A read/write transaction against the store.
///
/// Reads observe the committed state as of the transaction's revision plus
/// the transaction's own staged writes. The revision is assigned at begin
/// and doubles as the commit revision, following the usual
/// version-at-begin MVCC discipline.
#[async_trait]
pub trait SchemaTransaction: Send {
    /// The transaction's (provisional) commit revision.
    fn revision(&self) -> Revision;

    async fn read_namespace_by_name(
        &mut self,
        name: &str,
    ) -> SchemaResult<RevisionedDefinition<NamespaceDefinition>>;

    async fn read_caveat_by_name(
        &mut self,
        name: &str,
    ) -> SchemaResult<RevisionedDefinition<CaveatDefinition>>;

    async fn write_namespace(&mut self, definition: NamespaceDefinition) -> SchemaResult<()>;

    async fn write_caveat(&mut self, definition: CaveatDefinition) -> SchemaResult<()>;

    async fn delete_namespace(&mut self, name: &str) -> SchemaResult<()>;

    async fn delete_caveat(&mut self, name: &str) -> SchemaResult<()>;

    /// Commits the staged writes, returning the commit revision.
    async fn commit(self: Box<Self>) -> SchemaResult<Revision>;

    /// Discards the staged writes.
    async fn rollback(self: Box<Self>) -> SchemaResult<()>;
}
