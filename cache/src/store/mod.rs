//! The backing-store seam: shared value types and the traits the caching
//! proxy consumes. The store itself is an external collaborator; this crate
//! ships an in-memory implementation for tests and demos.

pub mod engine;
pub mod memory;

use crate::revision::Revision;
use crate::schema::{CaveatDefinition, NamespaceDefinition, SchemaDefinition};

/// A definition paired with the revision at which it was last written.
#[derive(Clone, Debug, PartialEq)]
pub struct RevisionedDefinition<D: SchemaDefinition> {
    pub definition: D,
    pub last_written: Revision,
}

/// One message on the schema-change stream.
///
/// A message either carries changes (definitions now present, names now
/// deleted) at its revision, or is a checkpoint: an assertion that nothing
/// at any revision at or below `revision` remains undelivered. Checkpoint
/// messages carry no changes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SchemaState {
    pub revision: Revision,
    pub is_checkpoint: bool,
    pub changed_namespaces: Vec<NamespaceDefinition>,
    pub changed_caveats: Vec<CaveatDefinition>,
    pub deleted_namespaces: Vec<String>,
    pub deleted_caveats: Vec<String>,
}

impl SchemaState {
    /// A checkpoint message at `revision`.
    pub fn checkpoint(revision: Revision) -> Self {
        SchemaState { revision, is_checkpoint: true, ..Default::default() }
    }

    /// An empty change message at `revision`, filled in with the builders
    /// below.
    pub fn changes(revision: Revision) -> Self {
        SchemaState { revision, ..Default::default() }
    }

    pub fn with_namespace(mut self, definition: NamespaceDefinition) -> Self {
        self.changed_namespaces.push(definition);
        self
    }

    pub fn with_caveat(mut self, definition: CaveatDefinition) -> Self {
        self.changed_caveats.push(definition);
        self
    }

    pub fn with_deleted_namespace(mut self, name: impl Into<String>) -> Self {
        self.deleted_namespaces.push(name.into());
        self
    }

    pub fn with_deleted_caveat(mut self, name: impl Into<String>) -> Self {
        self.deleted_caveats.push(name.into());
        self
    }

    /// Whether this message carries no definition changes.
    pub fn is_empty(&self) -> bool {
        self.changed_namespaces.is_empty()
            && self.changed_caveats.is_empty()
            && self.deleted_namespaces.is_empty()
            && self.deleted_caveats.is_empty()
    }
}
