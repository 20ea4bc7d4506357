//! Query descriptors and subset-load options.

use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use xxhash_rust::xxh3::xxh3_64;

use crate::{
    expr::{compare_values, Expr, FieldPath},
    types::{Item, QueryHash},
};

/// Sort direction for one sort key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    /// Ascending; nulls last.
    Asc,
    /// Descending; nulls first.
    Desc,
}

/// One sort key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    /// Sorted field.
    pub field: FieldPath,
    /// Direction.
    pub direction: SortDirection,
}

impl SortSpec {
    /// Ascending sort on `field`.
    pub fn asc(field: impl Into<FieldPath>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    /// Descending sort on `field`.
    pub fn desc(field: impl Into<FieldPath>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }
}

/// Options passed to a [`crate::engine::loader::SubsetLoader`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LoadSubsetOptions {
    /// Row predicate.
    #[serde(rename = "where")]
    pub filter: Option<Expr>,
    /// Ordered sort keys.
    pub order_by: Option<Vec<SortSpec>>,
    /// Maximum number of rows.
    pub limit: Option<NonZeroUsize>,
}

impl LoadSubsetOptions {
    /// Filter-only load with no ordering or limit.
    pub fn targeted(filter: Expr) -> Self {
        Self {
            filter: Some(filter),
            order_by: None,
            limit: None,
        }
    }

    /// True when the load carries ordering or a limit.
    pub fn has_window(&self) -> bool {
        self.order_by.as_ref().is_some_and(|specs| !specs.is_empty()) || self.limit.is_some()
    }

    /// Evaluates these options over an in-memory collection: filter, stable
    /// sort, then limit.
    pub fn apply<'a>(&self, items: impl IntoIterator<Item = &'a Item>) -> Vec<Item> {
        let mut out: Vec<&Item> = items
            .into_iter()
            .filter(|item| self.filter.as_ref().is_none_or(|f| f.matches(item)))
            .collect();

        if let Some(specs) = self.order_by.as_deref().filter(|s| !s.is_empty()) {
            out.sort_by(|a, b| {
                for spec in specs {
                    let va = spec.field.resolve(a).unwrap_or(&serde_json::Value::Null);
                    let vb = spec.field.resolve(b).unwrap_or(&serde_json::Value::Null);
                    let ord = match spec.direction {
                        SortDirection::Asc => compare_values(va, vb),
                        SortDirection::Desc => compare_values(vb, va),
                    };
                    if ord.is_ne() {
                        return ord;
                    }
                }
                std::cmp::Ordering::Equal
            });
        }

        if let Some(limit) = self.limit {
            out.truncate(limit.get());
        }
        out.into_iter().cloned().collect()
    }
}

/// Errors raised while building a [`QueryDescriptor`].
#[derive(Debug, Error)]
pub enum DescriptorError {
    /// The descriptor could not be encoded for hashing.
    #[error("failed to encode query descriptor: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Immutable identity of one active query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryDescriptor {
    options: LoadSubsetOptions,
    hash: QueryHash,
}

impl QueryDescriptor {
    /// Builds a descriptor and derives its stable hash from the canonical JSON
    /// encoding of `options`.
    pub fn new(options: LoadSubsetOptions) -> Result<Self, DescriptorError> {
        let encoded = serde_json::to_vec(&options)?;
        Ok(Self {
            hash: xxh3_64(&encoded),
            options,
        })
    }

    /// Registry key.
    pub fn hash(&self) -> QueryHash {
        self.hash
    }

    /// The query's own load options.
    pub fn options(&self) -> &LoadSubsetOptions {
        &self.options
    }

    /// Row predicate, if any.
    pub fn filter(&self) -> Option<&Expr> {
        self.options.filter.as_ref()
    }

    /// Sort keys, if any.
    pub fn order_by(&self) -> Option<&[SortSpec]> {
        self.options.order_by.as_deref()
    }

    /// Row limit, if any.
    pub fn limit(&self) -> Option<NonZeroUsize> {
        self.options.limit
    }
}
