//! Reconciliation event stream payloads.

use crate::{
    engine::loader::LoadError,
    types::{QueryHash, Version},
};

/// Events published after each reconciliation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileEvent {
    /// A query's state was committed.
    Reconciled {
        /// Query hash.
        hash: QueryHash,
        /// Version after the commit.
        version: Version,
    },
    /// A query's refetch failed; its state stays at the last version.
    RefetchFailed {
        /// Query hash.
        hash: QueryHash,
        /// Loader failure.
        cause: LoadError,
    },
}
