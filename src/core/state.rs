use std::collections::VecDeque;

use hashbrown::{HashMap, HashSet};

use crate::types::{Item, ItemKey, Version};

/// Number of recent commits whose changed keys are remembered.
pub const CHANGE_LOG_DEPTH: usize = 64;

/// Materialized result set of one query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryState {
    order: Vec<ItemKey>,
    records: HashMap<ItemKey, Item>,
    version: Version,
    // (version, keys changed by that commit), oldest first.
    changes: VecDeque<(Version, Vec<ItemKey>)>,
}

impl QueryState {
    /// Builds a state from keyed entries. A repeated key keeps its first
    /// position and its last value.
    pub(crate) fn from_entries(entries: Vec<(ItemKey, Item)>, version: Version) -> Self {
        let mut order = Vec::with_capacity(entries.len());
        let mut records = HashMap::with_capacity(entries.len());
        for (key, item) in entries {
            if records.insert(key.clone(), item).is_none() {
                order.push(key);
            }
        }
        Self {
            order,
            records,
            version,
            changes: VecDeque::new(),
        }
    }

    /// State after committing `entries` at `version`, remembering which keys
    /// were inserted, overwritten with a different value or removed.
    pub(crate) fn successor(&self, entries: Vec<(ItemKey, Item)>, version: Version) -> Self {
        let mut next = Self::from_entries(entries, version);
        let mut changed: Vec<ItemKey> = next
            .iter()
            .filter(|(key, item)| self.get(key) != Some(*item))
            .map(|(key, _)| key.clone())
            .collect();
        changed.extend(self.order.iter().filter(|key| !next.contains(key)).cloned());

        next.changes = self.changes.clone();
        next.changes.push_back((version, changed));
        while next.changes.len() > CHANGE_LOG_DEPTH {
            next.changes.pop_front();
        }
        next
    }

    /// Version of the last successful commit; 0 before the first.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True when no items are materialized.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Item keys in materialized order.
    pub fn keys(&self) -> &[ItemKey] {
        &self.order
    }

    /// Item for `key`.
    pub fn get(&self, key: &ItemKey) -> Option<&Item> {
        self.records.get(key)
    }

    /// True when `key` is materialized.
    pub fn contains(&self, key: &ItemKey) -> bool {
        self.records.contains_key(key)
    }

    /// Keyed items in materialized order.
    pub fn iter(&self) -> impl Iterator<Item = (&ItemKey, &Item)> + '_ {
        self.order
            .iter()
            .filter_map(|key| self.records.get(key).map(|item| (key, item)))
    }

    /// Items in materialized order.
    pub fn items(&self) -> Vec<Item> {
        self.iter().map(|(_, item)| item.clone()).collect()
    }

    /// True when `entries` would materialize exactly this state.
    pub fn same_entries(&self, entries: &[(ItemKey, Item)]) -> bool {
        entries.len() == self.order.len()
            && self
                .iter()
                .zip(entries)
                .all(|((k, v), (ek, ev))| k == ek && v == ev)
    }

    /// True when a commit after version `since` may have changed any of
    /// `keys`. Also true once `since` has fallen out of the change log.
    pub fn changed_since(&self, since: Version, keys: &[ItemKey]) -> bool {
        if since >= self.version {
            return false;
        }
        match self.changes.front() {
            Some((oldest, _)) if *oldest <= since + 1 => {}
            _ => return true,
        }
        let keys: HashSet<&ItemKey> = keys.iter().collect();
        self.changes
            .iter()
            .filter(|(version, _)| *version > since)
            .any(|(_, changed)| changed.iter().any(|key| keys.contains(key)))
    }
}
