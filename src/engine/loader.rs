use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tracing::trace;

use crate::{
    expr::FieldPath,
    query::LoadSubsetOptions,
    types::{Item, ItemKey},
};

/// Failure reported by a [`SubsetLoader`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// Transport failed.
    #[error("network error: {0}")]
    Network(String),
    /// Backend rejected or failed the load.
    #[error("backend error: {0}")]
    Backend(String),
    /// The load did not finish in time.
    #[error("load timed out after {0:?}")]
    Timeout(Duration),
}

/// Backend collaborator that executes a subset load.
#[async_trait]
pub trait SubsetLoader: Send + Sync {
    /// Returns every item matching `options`, ordered and limited as asked.
    async fn load(&self, options: &LoadSubsetOptions) -> Result<Vec<Item>, LoadError>;
}

#[async_trait]
impl<T: SubsetLoader + ?Sized> SubsetLoader for Arc<T> {
    async fn load(&self, options: &LoadSubsetOptions) -> Result<Vec<Item>, LoadError> {
        (**self).load(options).await
    }
}

/// Maps an item to its stable identity.
pub trait IdentityExtractor: Send + Sync {
    /// Identity of `item`, if it carries one.
    fn key_of(&self, item: &Item) -> Option<ItemKey>;

    /// Field holding the identity; used to build membership predicates.
    fn id_path(&self) -> &FieldPath;
}

/// Identity read from a single field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldIdentity {
    path: FieldPath,
}

impl FieldIdentity {
    /// Identity stored at `path`.
    pub fn new(path: impl Into<FieldPath>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for FieldIdentity {
    fn default() -> Self {
        Self::new("id")
    }
}

impl IdentityExtractor for FieldIdentity {
    fn key_of(&self, item: &Item) -> Option<ItemKey> {
        self.path.resolve(item).and_then(ItemKey::from_value)
    }

    fn id_path(&self) -> &FieldPath {
        &self.path
    }
}

/// Runs `options` against `loader` under `timeout` and keys every returned
/// item. An item without identity fails the whole load.
pub async fn load_keyed<L, I>(
    loader: &L,
    identity: &I,
    options: &LoadSubsetOptions,
    timeout: Option<Duration>,
) -> Result<Vec<(ItemKey, Item)>, LoadError>
where
    L: SubsetLoader + ?Sized,
    I: IdentityExtractor + ?Sized,
{
    let items = match timeout {
        Some(limit) => tokio::time::timeout(limit, loader.load(options))
            .await
            .map_err(|_| LoadError::Timeout(limit))??,
        None => loader.load(options).await?,
    };
    trace!(count = items.len(), "subset loaded");

    items
        .into_iter()
        .map(|item| match identity.key_of(&item) {
            Some(key) => Ok((key, item)),
            None => Err(LoadError::Backend(format!(
                "loaded item has no identity at `{}`",
                identity.id_path()
            ))),
        })
        .collect()
}
