use std::fmt;

use serde_derive::{Deserialize, Serialize};

use crate::error::SchemaResult;

/// An opaque, totally ordered revision stamp assigned by the backing store to
/// each committed change.
///
/// The proxy never inspects a revision beyond comparing it with others; the
/// two components exist so a store can hand out stamps between consecutive
/// commits (a snapshot "at 3.5" sits between the commits at 3 and 4). The
/// derived ordering compares `seq` first and `logical` second, which is the
/// total order the cache relies on.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Revision {
    seq: u64,
    logical: u32,
}

impl Revision {
    /// The revision of an empty store, ordered before every commit.
    pub const fn zero() -> Self {
        Revision { seq: 0, logical: 0 }
    }

    /// A revision at a whole sequence number.
    pub const fn new(seq: u64) -> Self {
        Revision { seq, logical: 0 }
    }

    /// A revision between `new(seq)` and `new(seq + 1)`.
    pub const fn with_logical(seq: u64, logical: u32) -> Self {
        Revision { seq, logical }
    }

    /// The next whole revision, used by stores assigning commit stamps.
    pub fn next(&self) -> Self {
        Revision::new(self.seq + 1)
    }

    /// Canonical byte encoding of this revision.
    ///
    /// Equal revisions always produce equal fingerprints regardless of where
    /// they were constructed, so independently built readers at the same
    /// revision share snapshot-cache entries. Field order is fixed by the
    /// struct definition, making the encoding deterministic.
    pub fn fingerprint(&self) -> SchemaResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.logical == 0 {
            write!(f, "{}", self.seq)
        } else {
            write!(f, "{}.{}", self.seq, self.logical)
        }
    }
}
