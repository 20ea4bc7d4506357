//! Mutation transaction model consumed by the refetch coordinator.

use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::types::{Item, ItemKey};

/// Errors raised by the mutation model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MutationError {
    /// A record violates the operation/payload contract.
    #[error("invalid transaction at key {key}: {reason}")]
    InvalidTransaction {
        /// Offending key.
        key: ItemKey,
        /// What was wrong.
        reason: String,
    },
    /// No record for the key in this transaction.
    #[error("no mutation for key {0}")]
    NotFound(ItemKey),
}

/// Row-level operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationOp {
    /// New item.
    Insert,
    /// Changed item.
    Update,
    /// Removed item.
    Delete,
}

/// One row-level change within a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationRecord {
    /// Stable item identity.
    pub key: ItemKey,
    /// Operation kind.
    pub operation: MutationOp,
    /// Item before the change; absent for inserts.
    pub original: Option<Item>,
    /// Item after the change; absent for deletes.
    pub modified: Option<Item>,
    /// Field-level diff; present for updates only.
    pub changes: Option<Map<String, Value>>,
}

impl MutationRecord {
    /// Insert of `modified`.
    pub fn insert(key: impl Into<ItemKey>, modified: Item) -> Self {
        Self {
            key: key.into(),
            operation: MutationOp::Insert,
            original: None,
            modified: Some(modified),
            changes: None,
        }
    }

    /// Update from `original` to `modified`; `changes` is derived from the
    /// top-level fields that differ.
    pub fn update(key: impl Into<ItemKey>, original: Item, modified: Item) -> Self {
        let changes = diff_fields(&original, &modified);
        Self {
            key: key.into(),
            operation: MutationOp::Update,
            original: Some(original),
            modified: Some(modified),
            changes: Some(changes),
        }
    }

    /// Delete of `original`.
    pub fn delete(key: impl Into<ItemKey>, original: Item) -> Self {
        Self {
            key: key.into(),
            operation: MutationOp::Delete,
            original: Some(original),
            modified: None,
            changes: None,
        }
    }

    fn validate(&self) -> Result<(), MutationError> {
        let reason = match self.operation {
            MutationOp::Insert if self.original.is_some() => "insert carries an original value",
            MutationOp::Insert if self.modified.is_none() => "insert is missing its modified value",
            MutationOp::Update if self.original.is_none() || self.modified.is_none() => {
                "update needs both original and modified values"
            }
            MutationOp::Update if self.changes.is_none() => "update is missing its changes",
            MutationOp::Delete if self.modified.is_some() => "delete carries a modified value",
            MutationOp::Delete if self.original.is_none() => "delete is missing its original value",
            MutationOp::Insert | MutationOp::Delete if self.changes.is_some() => {
                "changes are only allowed on updates"
            }
            _ => return Ok(()),
        };
        Err(MutationError::InvalidTransaction {
            key: self.key.clone(),
            reason: reason.to_string(),
        })
    }
}

/// Ordered records produced by one logical write.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MutationTransaction {
    records: Vec<MutationRecord>,
}

impl MutationTransaction {
    /// Validates and wraps `records`.
    ///
    /// A key may repeat only under the same operation.
    pub fn new(records: Vec<MutationRecord>) -> Result<Self, MutationError> {
        Self::check(&records)?;
        Ok(Self { records })
    }

    fn check(records: &[MutationRecord]) -> Result<(), MutationError> {
        let mut ops: HashMap<&ItemKey, MutationOp> = HashMap::new();
        for record in records {
            record.validate()?;
            match ops.insert(&record.key, record.operation) {
                Some(prev) if prev != record.operation => {
                    return Err(MutationError::InvalidTransaction {
                        key: record.key.clone(),
                        reason: format!(
                            "key appears as both {prev:?} and {:?}",
                            record.operation
                        ),
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Transaction with no records.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Records in commit order.
    pub fn records(&self) -> &[MutationRecord] {
        &self.records
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when there are no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Mutated keys in record order; duplicates are kept.
    pub fn keys(&self) -> impl Iterator<Item = &ItemKey> + '_ {
        self.records.iter().map(|r| &r.key)
    }

    /// Keys of records with operation `op`, in record order.
    pub fn keys_by_operation(&self, op: MutationOp) -> impl Iterator<Item = &ItemKey> + '_ {
        self.records
            .iter()
            .filter(move |r| r.operation == op)
            .map(|r| &r.key)
    }

    /// Latest record for `key`.
    pub fn record_for(&self, key: &ItemKey) -> Result<&MutationRecord, MutationError> {
        self.records
            .iter()
            .rev()
            .find(|r| &r.key == key)
            .ok_or_else(|| MutationError::NotFound(key.clone()))
    }

    /// Insert and update keys, first-seen order, deduplicated.
    pub fn touched_keys(&self) -> Vec<ItemKey> {
        self.distinct_keys(|op| op != MutationOp::Delete)
    }

    /// Delete keys, first-seen order, deduplicated.
    pub fn deleted_keys(&self) -> Vec<ItemKey> {
        self.distinct_keys(|op| op == MutationOp::Delete)
    }

    fn distinct_keys(&self, keep: impl Fn(MutationOp) -> bool) -> Vec<ItemKey> {
        let mut seen = HashSet::new();
        self.records
            .iter()
            .filter(|r| keep(r.operation) && seen.insert(&r.key))
            .map(|r| r.key.clone())
            .collect()
    }
}

/// Verdict returned by a mutation handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerOutcome {
    /// Whether the coordinator should reconcile after this write.
    pub should_sync: bool,
}

impl HandlerOutcome {
    /// Reconcile after the write.
    pub const fn sync() -> Self {
        Self { should_sync: true }
    }

    /// Skip reconciliation.
    pub const fn skip() -> Self {
        Self { should_sync: false }
    }
}

impl Default for HandlerOutcome {
    fn default() -> Self {
        Self::sync()
    }
}

// Removed fields are reported as null.
fn diff_fields(original: &Item, modified: &Item) -> Map<String, Value> {
    let (Some(before), Some(after)) = (original.as_object(), modified.as_object()) else {
        return Map::new();
    };

    let mut changes = Map::new();
    for (field, value) in after {
        if before.get(field) != Some(value) {
            changes.insert(field.clone(), value.clone());
        }
    }
    for field in before.keys() {
        if !after.contains_key(field) {
            changes.insert(field.clone(), Value::Null);
        }
    }
    changes
}
