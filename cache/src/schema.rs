//! Schema definition types.
//!
//! The store holds two kinds of definitions, namespaces and caveats. They
//! live in disjoint name spaces and are cached separately, but share the
//! same shape; the [`SchemaDefinition`] trait captures the capabilities the
//! caches need (a name, an opaque payload, a size estimate) and is
//! instantiated once per kind.

use std::fmt;
use std::mem::size_of;

use bytes::Bytes;
use serde_derive::{Deserialize, Serialize};

use crate::error::SchemaResult;

/// The two kinds of schema definitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DefinitionKind {
    Namespace,
    Caveat,
}

impl fmt::Display for DefinitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefinitionKind::Namespace => write!(f, "namespace"),
            DefinitionKind::Caveat => write!(f, "caveat"),
        }
    }
}

/// Capability surface shared by the two definition kinds.
pub trait SchemaDefinition: Clone + fmt::Debug + PartialEq + Send + Sync + 'static {
    /// The kind all values of this type belong to.
    const KIND: DefinitionKind;

    /// The definition's name, unique within its kind.
    fn name(&self) -> &str;

    /// The opaque serialized payload.
    fn payload(&self) -> &Bytes;

    /// Rough in-memory footprint, used by the snapshot cache's weigher.
    fn estimated_size(&self) -> usize {
        size_of::<Self>() + self.name().len() + self.payload().len()
    }
}

/// A namespace definition: an object type together with its relations and
/// permissions, carried as an opaque payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceDefinition {
    name: String,
    config: Bytes,
}

impl NamespaceDefinition {
    pub fn new(name: impl Into<String>, config: impl Into<Bytes>) -> Self {
        NamespaceDefinition { name: name.into(), config: config.into() }
    }
}

impl SchemaDefinition for NamespaceDefinition {
    const KIND: DefinitionKind = DefinitionKind::Namespace;

    fn name(&self) -> &str {
        &self.name
    }

    fn payload(&self) -> &Bytes {
        &self.config
    }
}

/// A caveat definition: a named conditional expression, carried opaquely.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaveatDefinition {
    name: String,
    expression: Bytes,
}

impl CaveatDefinition {
    pub fn new(name: impl Into<String>, expression: impl Into<Bytes>) -> Self {
        CaveatDefinition { name: name.into(), expression: expression.into() }
    }
}

impl SchemaDefinition for CaveatDefinition {
    const KIND: DefinitionKind = DefinitionKind::Caveat;

    fn name(&self) -> &str {
        &self.name
    }

    fn payload(&self) -> &Bytes {
        &self.expression
    }
}

/// Encodes a possibly-absent definition into its canonical wire form.
///
/// Absent definitions are first-class: `None` encodes and decodes without
/// error, so callers shuttling optional definitions through the codec never
/// need a sentinel value.
pub fn encode_definition<D>(definition: Option<&D>) -> SchemaResult<Vec<u8>>
where
    D: SchemaDefinition + serde::Serialize,
{
    Ok(bincode::serialize(&definition)?)
}

/// Decodes the canonical wire form produced by [`encode_definition`].
pub fn decode_definition<D>(bytes: &[u8]) -> SchemaResult<Option<D>>
where
    D: SchemaDefinition + serde::de::DeserializeOwned,
{
    Ok(bincode::deserialize(bytes)?)
}
