//! `schema-cache` is a revision-aware caching proxy that sits between a
//! permissions engine and a versioned schema store. The store holds
//! namespace and caveat definitions rewritten at monotonically advancing
//! revisions; the engine reads them "as of" a revision millions of times a
//! second and must not pay the store's latency for every read.
//!
//! Two cache layers answer those reads:
//!
//! - the **snapshot cache** memoizes single `(revision, name)` fetches in a
//!   byte-budgeted map and coalesces concurrent misses into one store read;
//! - the **watching cache** replays the store's schema-change stream into a
//!   revision-indexed in-memory replica and serves any read at or below its
//!   checkpoint without touching the store, falling back to the snapshot
//!   cache (and, on stream failure, to the store itself) otherwise.
//!
//! ## Getting started
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use schema_cache::proxy::CachingProxy;
//! use schema_cache::schema::NamespaceDefinition;
//! use schema_cache::store::memory::MemorySchemaStore;
//! use schema_cache::ProxyConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), schema_cache::Error> {
//!     let store = Arc::new(MemorySchemaStore::new());
//!     let proxy = CachingProxy::new(store, ProxyConfig::default());
//!     proxy.start().await?;
//!
//!     let mut tx = proxy.read_write_tx().await?;
//!     tx.write_namespace(NamespaceDefinition::new("document", &b"relation viewer"[..]))
//!         .await?;
//!     let revision = tx.commit().await?;
//!
//!     let reader = proxy.snapshot_reader(revision);
//!     let namespace = reader.read_namespace_by_name("document").await?;
//!     println!("read {:?} at revision {}", namespace.definition, revision);
//!
//!     proxy.close().await;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod proxy;
pub mod revision;
pub mod schema;
pub mod store;

#[cfg(test)]
pub(crate) mod testutil;

pub use crate::config::{BackoffConfig, ProxyConfig};
pub use crate::error::{Error, SchemaResult};
pub use crate::proxy::{CachingProxy, ReadWriteTransaction, SchemaReader};
pub use crate::revision::Revision;
