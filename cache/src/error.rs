use serde_derive::{Deserialize, Serialize};
use thiserror::Error as ThisError;

use crate::revision::Revision;
use crate::schema::DefinitionKind;

/// Result alias used throughout the crate.
pub type SchemaResult<T> = std::result::Result<T, Error>;

/// Errors surfaced by the caching proxy and the backing store seam.
///
/// The enum is `Clone` so a single failure can be shared with every caller
/// coalesced behind one single-flight computation.
#[derive(Clone, Debug, PartialEq, Eq, ThisError, Serialize, Deserialize)]
pub enum Error {
    /// No definition exists under the given name.
    #[error("{kind} `{name}` was not found")]
    NotFound { kind: DefinitionKind, name: String },

    /// The definition was deleted at or before the given revision.
    #[error("{kind} `{name}` was not found at revision {revision}")]
    NotFoundAtRevision {
        kind: DefinitionKind,
        name: String,
        revision: Revision,
    },

    /// The operation observed cancellation before a result was available.
    #[error("operation was cancelled")]
    Cancelled,

    /// The backing store failed; propagated unchanged and never cached.
    #[error("schema store unavailable: {0}")]
    StoreUnavailable(String),

    /// A read was attempted after the proxy was closed.
    #[error("schema proxy has been closed")]
    ProxyClosed,

    /// A revision failed to advance past the last one observed.
    #[error("revision {revision} does not advance past {last}")]
    OrderingViolation { last: Revision, revision: Revision },

    /// An invariant the proxy relies on did not hold.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error is an authoritative negative for a definition,
    /// at any revision or a specific one.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::NotFound { .. } | Error::NotFoundAtRevision { .. }
        )
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Internal(err.to_string())
    }
}
