//! In-memory collection that evaluates load options locally.

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use hashbrown::HashMap;
use tracing::trace;

use crate::{
    engine::loader::{FieldIdentity, IdentityExtractor, LoadError, SubsetLoader},
    query::LoadSubsetOptions,
    types::{Item, ItemKey},
};

use super::{BackendError, BackendResult};

#[derive(Debug, Default)]
struct Inner {
    order: Vec<ItemKey>,
    records: HashMap<ItemKey, Item>,
    loads: Vec<LoadSubsetOptions>,
    failures: VecDeque<LoadError>,
    latency: Option<Duration>,
}

/// Collection held in memory. Records every load it serves and can inject
/// failures and latency.
#[derive(Debug)]
pub struct MemoryBackend<I = FieldIdentity> {
    identity: I,
    inner: Mutex<Inner>,
}

impl MemoryBackend<FieldIdentity> {
    /// Empty collection keyed by the `id` field.
    pub fn new() -> Self {
        Self::with_identity(FieldIdentity::default())
    }
}

impl Default for MemoryBackend<FieldIdentity> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: IdentityExtractor> MemoryBackend<I> {
    /// Empty collection keyed by `identity`.
    pub fn with_identity(identity: I) -> Self {
        Self {
            identity,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Inserts or overwrites `item`; an overwrite keeps the item's position.
    pub fn upsert(&self, item: Item) -> BackendResult<ItemKey> {
        let key = self
            .identity
            .key_of(&item)
            .ok_or_else(|| BackendError::MissingIdentity(self.identity.id_path().to_string()))?;
        let mut inner = self.lock();
        if inner.records.insert(key.clone(), item).is_none() {
            inner.order.push(key.clone());
        }
        Ok(key)
    }

    /// Upserts every item in order.
    pub fn extend(&self, items: impl IntoIterator<Item = Item>) -> BackendResult<()> {
        for item in items {
            self.upsert(item)?;
        }
        Ok(())
    }

    /// Removes and returns the item for `key`.
    pub fn remove(&self, key: &ItemKey) -> Option<Item> {
        let mut inner = self.lock();
        let removed = inner.records.remove(key)?;
        if let Some(pos) = inner.order.iter().position(|k| k == key) {
            inner.order.remove(pos);
        }
        Some(removed)
    }

    /// Current item for `key`.
    pub fn get(&self, key: &ItemKey) -> Option<Item> {
        self.lock().records.get(key).cloned()
    }

    /// Number of stored items.
    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.lock().order.is_empty()
    }

    /// Every load served so far, oldest first.
    pub fn loads(&self) -> Vec<LoadSubsetOptions> {
        self.lock().loads.clone()
    }

    /// Number of loads served so far.
    pub fn load_count(&self) -> usize {
        self.lock().loads.len()
    }

    /// Fails the next load with `err`. Queued failures are used in order.
    pub fn fail_next(&self, err: LoadError) {
        self.lock().failures.push_back(err);
    }

    /// Delays every subsequent load by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl<I: IdentityExtractor> SubsetLoader for MemoryBackend<I> {
    async fn load(&self, options: &LoadSubsetOptions) -> Result<Vec<Item>, LoadError> {
        let latency = {
            let mut inner = self.lock();
            inner.loads.push(options.clone());
            if let Some(err) = inner.failures.pop_front() {
                return Err(err);
            }
            inner.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let inner = self.lock();
        let items = options.apply(inner.order.iter().filter_map(|k| inner.records.get(k)));
        trace!(count = items.len(), "memory backend served load");
        Ok(items)
    }
}
