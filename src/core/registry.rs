use hashbrown::HashMap;
use thiserror::Error;
use tracing::{debug, info, trace};

use crate::{
    query::QueryDescriptor,
    types::{Item, ItemKey, QueryHash, SyncMode, Version},
};

use super::state::QueryState;

/// Errors raised by [`QueryRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// No query with this hash is registered.
    #[error("query {0:#018x} is not registered")]
    NotFound(QueryHash),
    /// Another commit landed after the caller read the state.
    #[error("stale write to query {hash:#018x}: expected version {expected}, found {current}")]
    StaleWrite {
        /// Query hash.
        hash: QueryHash,
        /// Version the caller observed.
        expected: Version,
        /// Version currently stored.
        current: Version,
    },
}

#[derive(Debug)]
struct Entry {
    descriptor: QueryDescriptor,
    mode: SyncMode,
    state: QueryState,
}

/// Borrowed view of one registered query.
#[derive(Debug, Clone, Copy)]
pub struct ActiveQuery<'a> {
    /// Registry key.
    pub hash: QueryHash,
    /// Query identity.
    pub descriptor: &'a QueryDescriptor,
    /// Synchronization policy.
    pub mode: SyncMode,
    /// Materialized state.
    pub state: &'a QueryState,
}

/// Owner of every active query's descriptor and materialized state.
#[derive(Debug, Default)]
pub struct QueryRegistry {
    entries: HashMap<QueryHash, Entry>,
    order: Vec<QueryHash>,
}

impl QueryRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `descriptor` with `mode`. Idempotent by hash: an existing
    /// entry is returned untouched, including its mode.
    pub fn register(&mut self, descriptor: QueryDescriptor, mode: SyncMode) -> &QueryState {
        let hash = descriptor.hash();
        if !self.entries.contains_key(&hash) {
            debug!(hash, ?mode, "registering query");
            self.order.push(hash);
        }
        let entry = self.entries.entry(hash).or_insert_with(|| Entry {
            descriptor,
            mode,
            state: QueryState::default(),
        });
        &entry.state
    }

    /// Drops a query and its state.
    pub fn unregister(&mut self, hash: QueryHash) -> Result<QueryDescriptor, RegistryError> {
        let entry = self
            .entries
            .remove(&hash)
            .ok_or(RegistryError::NotFound(hash))?;
        if let Some(pos) = self.order.iter().position(|h| *h == hash) {
            self.order.remove(pos);
        }
        debug!(hash, "unregistered query");
        Ok(entry.descriptor)
    }

    /// Drops every query; returns how many were registered.
    pub fn teardown(&mut self) -> usize {
        let count = self.order.len();
        self.entries.clear();
        self.order.clear();
        info!(count, "registry torn down");
        count
    }

    /// Materialized state for `hash`.
    pub fn get(&self, hash: QueryHash) -> Result<&QueryState, RegistryError> {
        self.entry(hash).map(|e| &e.state)
    }

    /// Descriptor for `hash`.
    pub fn descriptor(&self, hash: QueryHash) -> Result<&QueryDescriptor, RegistryError> {
        self.entry(hash).map(|e| &e.descriptor)
    }

    /// Synchronization policy for `hash`.
    pub fn mode(&self, hash: QueryHash) -> Result<SyncMode, RegistryError> {
        self.entry(hash).map(|e| e.mode)
    }

    /// Changes the synchronization policy for `hash`.
    pub fn set_mode(&mut self, hash: QueryHash, mode: SyncMode) -> Result<(), RegistryError> {
        let entry = self
            .entries
            .get_mut(&hash)
            .ok_or(RegistryError::NotFound(hash))?;
        entry.mode = mode;
        Ok(())
    }

    /// Every registered query in registration order. Calling again restarts
    /// the walk.
    pub fn all_active(&self) -> impl Iterator<Item = ActiveQuery<'_>> + '_ {
        self.order.iter().filter_map(|hash| {
            self.entries.get(hash).map(|e| ActiveQuery {
                hash: *hash,
                descriptor: &e.descriptor,
                mode: e.mode,
                state: &e.state,
            })
        })
    }

    /// Number of registered queries.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Replaces the items of `hash` and bumps its version.
    ///
    /// `expected` is the version the caller read before computing `entries`;
    /// fails with [`RegistryError::StaleWrite`] if another commit landed since.
    pub fn commit(
        &mut self,
        hash: QueryHash,
        expected: Version,
        entries: Vec<(ItemKey, Item)>,
    ) -> Result<Version, RegistryError> {
        let entry = self
            .entries
            .get_mut(&hash)
            .ok_or(RegistryError::NotFound(hash))?;
        let current = entry.state.version();
        if current != expected {
            return Err(RegistryError::StaleWrite {
                hash,
                expected,
                current,
            });
        }

        let version = current + 1;
        entry.state = entry.state.successor(entries, version);
        trace!(hash, version, items = entry.state.len(), "committed query state");
        Ok(version)
    }

    fn entry(&self, hash: QueryHash) -> Result<&Entry, RegistryError> {
        self.entries.get(&hash).ok_or(RegistryError::NotFound(hash))
    }
}
