use crate::error::{Error, SchemaResult};
use crate::revision::Revision;

/// Outcome of a [`VersionedEntries::lookup`].
#[derive(Debug, PartialEq)]
pub(crate) enum Lookup<'a, D> {
    /// No entry exists at or below the requested revision.
    Absent,
    /// The name was deleted; the revision is the tombstone's.
    Tombstone(Revision),
    /// A live definition and the revision that last wrote it.
    Found(&'a D, Revision),
}

/// Append-only version history for a single name.
///
/// Entries are kept in strictly increasing revision order; `None` payloads
/// are tombstones. Thread safety is the caller's responsibility, matching
/// its use under the watching cache's per-kind lock.
#[derive(Clone, Debug)]
pub(crate) struct VersionedEntries<D> {
    entries: Vec<VersionedEntry<D>>,
}

#[derive(Clone, Debug)]
struct VersionedEntry<D> {
    revision: Revision,
    definition: Option<D>,
}

impl<D> Default for VersionedEntries<D> {
    fn default() -> Self {
        VersionedEntries { entries: Vec::new() }
    }
}

impl<D> VersionedEntries<D> {
    /// The revision of the newest entry, if any.
    pub fn last_revision(&self) -> Option<Revision> {
        self.entries.last().map(|entry| entry.revision)
    }

    /// Appends a definition (or a tombstone, for `None`) at `revision`.
    ///
    /// The revision must be strictly greater than the last one appended;
    /// anything else is an ordering violation.
    pub fn append(&mut self, revision: Revision, definition: Option<D>) -> SchemaResult<()> {
        if let Some(last) = self.last_revision() {
            if revision <= last {
                return Err(Error::OrderingViolation { last, revision });
            }
        }
        self.entries.push(VersionedEntry { revision, definition });
        Ok(())
    }

    /// Overwrites the newest entry's payload in place. Used when a stream
    /// message re-delivers a definition at the revision already at the tail;
    /// a no-op on an empty list.
    pub fn replace_last(&mut self, definition: Option<D>) {
        if let Some(last) = self.entries.last_mut() {
            last.definition = definition;
        }
    }

    /// Finds the entry with the greatest revision at or below `revision`.
    pub fn lookup(&self, revision: Revision) -> Lookup<'_, D> {
        let idx = self.entries.partition_point(|entry| entry.revision <= revision);
        if idx == 0 {
            return Lookup::Absent;
        }
        let entry = &self.entries[idx - 1];
        match &entry.definition {
            Some(definition) => Lookup::Found(definition, entry.revision),
            None => Lookup::Tombstone(entry.revision),
        }
    }

    /// Drops all but the newest entry at or below `revision`, preserving the
    /// result of every lookup at revisions >= the retained one.
    pub fn trim_before(&mut self, revision: Revision) {
        let idx = self.entries.partition_point(|entry| entry.revision <= revision);
        if idx > 1 {
            self.entries.drain(..idx - 1);
        }
    }

    /// Iterates `(revision, definition-or-tombstone)` pairs, oldest first.
    pub fn iter_entries(&self) -> impl Iterator<Item = (Revision, Option<&D>)> + '_ {
        self.entries.iter().map(|entry| (entry.revision, entry.definition.as_ref()))
    }

    /// Whether the history has been reduced to a single tombstone. Such a
    /// list can be dropped wholesale once the tombstone ages out, since an
    /// absent name falls through to the backing store anyway.
    pub fn only_tombstone(&self) -> bool {
        self.entries.len() == 1 && self.entries[0].definition.is_none()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
