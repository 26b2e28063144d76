use std::mem::size_of;
use std::sync::Arc;

use moka::future::Cache;

use crate::cache::singleflight::Group;
use crate::error::{Error, SchemaResult};
use crate::revision::Revision;
use crate::schema::{
    CaveatDefinition, DefinitionKind, NamespaceDefinition, SchemaDefinition,
};
use crate::store::engine::SchemaStore;
use crate::store::RevisionedDefinition;

/// Cache key for one definition at one revision.
///
/// The revision participates through its canonical fingerprint rather than
/// its identity, so independently constructed readers at the same revision
/// share entries.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct DefinitionCacheKey {
    fingerprint: Vec<u8>,
    kind: DefinitionKind,
    name: String,
}

impl DefinitionCacheKey {
    fn new(revision: Revision, kind: DefinitionKind, name: &str) -> SchemaResult<Self> {
        Ok(DefinitionCacheKey { fingerprint: revision.fingerprint()?, kind, name: name.to_string() })
    }

    fn weight(&self) -> usize {
        self.fingerprint.len() + self.name.len() + size_of::<DefinitionKind>()
    }
}

/// A cached definition together with the revision that last wrote it.
#[derive(Clone, Debug)]
pub(crate) enum CachedDefinition {
    Namespace(Arc<NamespaceDefinition>, Revision),
    Caveat(Arc<CaveatDefinition>, Revision),
}

impl CachedDefinition {
    fn estimated_size(&self) -> usize {
        let payload = match self {
            CachedDefinition::Namespace(def, _) => def.estimated_size(),
            CachedDefinition::Caveat(def, _) => def.estimated_size(),
        };
        payload + size_of::<Revision>()
    }

    fn into_namespace(self) -> SchemaResult<RevisionedDefinition<NamespaceDefinition>> {
        match self {
            CachedDefinition::Namespace(def, last_written) => {
                Ok(RevisionedDefinition { definition: (*def).clone(), last_written })
            }
            CachedDefinition::Caveat(..) => {
                Err(Error::Internal("namespace cache entry holds a caveat".to_string()))
            }
        }
    }

    fn into_caveat(self) -> SchemaResult<RevisionedDefinition<CaveatDefinition>> {
        match self {
            CachedDefinition::Caveat(def, last_written) => {
                Ok(RevisionedDefinition { definition: (*def).clone(), last_written })
            }
            CachedDefinition::Namespace(..) => {
                Err(Error::Internal("caveat cache entry holds a namespace".to_string()))
            }
        }
    }
}

/// The snapshot cache: a byte-budgeted map from `(revision, kind, name)` to
/// the definition read at that revision, with single-flight coalescing of
/// concurrent misses.
///
/// Hits never touch the backing store. Misses issue exactly one snapshot
/// read no matter how many callers race on the same key; the result is
/// cached on success and shared with every waiter. Not-found and store
/// errors propagate to the caller and are never cached here.
pub struct SnapshotCache {
    store: Arc<dyn SchemaStore>,
    cache: Cache<DefinitionCacheKey, CachedDefinition>,
    group: Group<DefinitionCacheKey, CachedDefinition>,
}

impl SnapshotCache {
    /// Creates a cache bounded to roughly `max_bytes` of definitions; the
    /// eviction policy approximates LFU.
    pub fn new(store: Arc<dyn SchemaStore>, max_bytes: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_bytes)
            .weigher(|key: &DefinitionCacheKey, value: &CachedDefinition| {
                (key.weight() + value.estimated_size()).min(u32::MAX as usize) as u32
            })
            .build();
        SnapshotCache { store, cache, group: Group::new() }
    }

    pub async fn read_namespace(
        &self,
        revision: Revision,
        name: &str,
    ) -> SchemaResult<RevisionedDefinition<NamespaceDefinition>> {
        let key = DefinitionCacheKey::new(revision, DefinitionKind::Namespace, name)?;
        if let Some(hit) = self.cache.get(&key).await {
            return hit.into_namespace();
        }

        let store = Arc::clone(&self.store);
        let cache = self.cache.clone();
        let insert_key = key.clone();
        let name = name.to_string();
        let (result, _shared) = self
            .group
            .execute(key, async move {
                let reader = store.snapshot_reader(revision);
                let found = reader.read_namespace_by_name(&name).await?;
                let value =
                    CachedDefinition::Namespace(Arc::new(found.definition), found.last_written);
                cache.insert(insert_key, value.clone()).await;
                Ok(value)
            })
            .await;
        result?.into_namespace()
    }

    pub async fn read_caveat(
        &self,
        revision: Revision,
        name: &str,
    ) -> SchemaResult<RevisionedDefinition<CaveatDefinition>> {
        let key = DefinitionCacheKey::new(revision, DefinitionKind::Caveat, name)?;
        if let Some(hit) = self.cache.get(&key).await {
            return hit.into_caveat();
        }

        let store = Arc::clone(&self.store);
        let cache = self.cache.clone();
        let insert_key = key.clone();
        let name = name.to_string();
        let (result, _shared) = self
            .group
            .execute(key, async move {
                let reader = store.snapshot_reader(revision);
                let found = reader.read_caveat_by_name(&name).await?;
                let value = CachedDefinition::Caveat(Arc::new(found.definition), found.last_written);
                cache.insert(insert_key, value.clone()).await;
                Ok(value)
            })
            .await;
        result?.into_caveat()
    }

    /// Resolves the named namespaces at `revision`, serving per-name cache
    /// hits and issuing a single batched store lookup for the rest.
    pub async fn lookup_namespaces(
        &self,
        revision: Revision,
        names: &[String],
    ) -> SchemaResult<Vec<RevisionedDefinition<NamespaceDefinition>>> {
        let mut found = Vec::with_capacity(names.len());
        let mut missing = Vec::new();
        for name in names {
            let key = DefinitionCacheKey::new(revision, DefinitionKind::Namespace, name)?;
            match self.cache.get(&key).await {
                Some(hit) => found.push(hit.into_namespace()?),
                None => missing.push(name.clone()),
            }
        }

        if !missing.is_empty() {
            let reader = self.store.snapshot_reader(revision);
            for resolved in reader.lookup_namespaces_with_names(&missing).await? {
                let key = DefinitionCacheKey::new(
                    revision,
                    DefinitionKind::Namespace,
                    resolved.definition.name(),
                )?;
                let value = CachedDefinition::Namespace(
                    Arc::new(resolved.definition.clone()),
                    resolved.last_written,
                );
                self.cache.insert(key, value).await;
                found.push(resolved);
            }
        }
        Ok(found)
    }

    /// Resolves the named caveats at `revision`; see [`Self::lookup_namespaces`].
    pub async fn lookup_caveats(
        &self,
        revision: Revision,
        names: &[String],
    ) -> SchemaResult<Vec<RevisionedDefinition<CaveatDefinition>>> {
        let mut found = Vec::with_capacity(names.len());
        let mut missing = Vec::new();
        for name in names {
            let key = DefinitionCacheKey::new(revision, DefinitionKind::Caveat, name)?;
            match self.cache.get(&key).await {
                Some(hit) => found.push(hit.into_caveat()?),
                None => missing.push(name.clone()),
            }
        }

        if !missing.is_empty() {
            let reader = self.store.snapshot_reader(revision);
            for resolved in reader.lookup_caveats_with_names(&missing).await? {
                let key = DefinitionCacheKey::new(
                    revision,
                    DefinitionKind::Caveat,
                    resolved.definition.name(),
                )?;
                let value = CachedDefinition::Caveat(
                    Arc::new(resolved.definition.clone()),
                    resolved.last_written,
                );
                self.cache.insert(key, value).await;
                found.push(resolved);
            }
        }
        Ok(found)
    }
}
