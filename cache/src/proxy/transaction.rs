use std::collections::HashMap;

use crate::error::{Error, SchemaResult};
use crate::revision::Revision;
use crate::schema::{CaveatDefinition, DefinitionKind, NamespaceDefinition, SchemaDefinition};
use crate::store::engine::SchemaTransaction;
use crate::store::RevisionedDefinition;

/// A read/write transaction with a transaction-local definition cache.
///
/// Within one transaction, re-reading a name returns the first read's
/// result without touching the store's transactional reader; found and
/// not-found results are both cached. Writes and deletes update the local
/// cache in place, so a read after a write observes the write at the
/// transaction's provisional revision. The cache dies with the
/// transaction, committed or not.
pub struct ReadWriteTransaction {
    tx: Box<dyn SchemaTransaction>,
    namespaces: HashMap<String, Option<RevisionedDefinition<NamespaceDefinition>>>,
    caveats: HashMap<String, Option<RevisionedDefinition<CaveatDefinition>>>,
}

impl ReadWriteTransaction {
    pub(crate) fn new(tx: Box<dyn SchemaTransaction>) -> Self {
        ReadWriteTransaction { tx, namespaces: HashMap::new(), caveats: HashMap::new() }
    }

    /// The transaction's provisional commit revision.
    pub fn revision(&self) -> Revision {
        self.tx.revision()
    }

    pub async fn read_namespace_by_name(
        &mut self,
        name: &str,
    ) -> SchemaResult<RevisionedDefinition<NamespaceDefinition>> {
        if let Some(cached) = self.namespaces.get(name) {
            return match cached {
                Some(found) => Ok(found.clone()),
                None => Err(Error::NotFound {
                    kind: DefinitionKind::Namespace,
                    name: name.to_string(),
                }),
            };
        }

        match self.tx.read_namespace_by_name(name).await {
            Ok(found) => {
                self.namespaces.insert(name.to_string(), Some(found.clone()));
                Ok(found)
            }
            Err(err) if err.is_not_found() => {
                self.namespaces.insert(name.to_string(), None);
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn read_caveat_by_name(
        &mut self,
        name: &str,
    ) -> SchemaResult<RevisionedDefinition<CaveatDefinition>> {
        if let Some(cached) = self.caveats.get(name) {
            return match cached {
                Some(found) => Ok(found.clone()),
                None => Err(Error::NotFound {
                    kind: DefinitionKind::Caveat,
                    name: name.to_string(),
                }),
            };
        }

        match self.tx.read_caveat_by_name(name).await {
            Ok(found) => {
                self.caveats.insert(name.to_string(), Some(found.clone()));
                Ok(found)
            }
            Err(err) if err.is_not_found() => {
                self.caveats.insert(name.to_string(), None);
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn write_namespace(&mut self, definition: NamespaceDefinition) -> SchemaResult<()> {
        self.tx.write_namespace(definition.clone()).await?;
        self.namespaces.insert(
            definition.name().to_string(),
            Some(RevisionedDefinition { definition, last_written: self.tx.revision() }),
        );
        Ok(())
    }

    pub async fn write_caveat(&mut self, definition: CaveatDefinition) -> SchemaResult<()> {
        self.tx.write_caveat(definition.clone()).await?;
        self.caveats.insert(
            definition.name().to_string(),
            Some(RevisionedDefinition { definition, last_written: self.tx.revision() }),
        );
        Ok(())
    }

    pub async fn delete_namespace(&mut self, name: &str) -> SchemaResult<()> {
        self.tx.delete_namespace(name).await?;
        self.namespaces.insert(name.to_string(), None);
        Ok(())
    }

    pub async fn delete_caveat(&mut self, name: &str) -> SchemaResult<()> {
        self.tx.delete_caveat(name).await?;
        self.caveats.insert(name.to_string(), None);
        Ok(())
    }

    /// Commits the transaction, returning its commit revision.
    pub async fn commit(self) -> SchemaResult<Revision> {
        self.tx.commit().await
    }

    /// Discards the transaction's writes.
    pub async fn rollback(self) -> SchemaResult<()> {
        self.tx.rollback().await
    }
}
