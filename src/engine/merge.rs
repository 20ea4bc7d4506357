use hashbrown::{HashMap, HashSet};

use crate::{
    core::state::QueryState,
    types::{Item, ItemKey},
};

/// How a loaded subset folds into a query's state.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOp {
    /// The loaded set supersedes the state wholesale.
    Replace {
        /// Loaded items in loader order.
        entries: Vec<(ItemKey, Item)>,
    },
    /// Only the listed keys change.
    Partial {
        /// Keys that were re-fetched.
        touched: Vec<ItemKey>,
        /// Authoritative current state of the touched keys.
        fetched: Vec<(ItemKey, Item)>,
        /// Keys confirmed deleted.
        deleted: Vec<ItemKey>,
    },
}

/// Result of folding a [`MergeOp`] into a state.
#[derive(Debug, Clone, PartialEq)]
pub struct Merged {
    /// Full item sequence to commit.
    pub entries: Vec<(ItemKey, Item)>,
    /// Items inserted or overwritten.
    pub upserted: usize,
    /// Items dropped.
    pub removed: usize,
}

/// Folds `op` into `state` without touching it.
///
/// A partial merge keeps every key outside `touched ∪ deleted` exactly as it
/// was and where it was. Touched keys present in `fetched` are overwritten in
/// place, or appended in touched order when new; touched keys missing from
/// `fetched` and all deleted keys are dropped.
pub fn merge(state: &QueryState, op: &MergeOp) -> Merged {
    match op {
        MergeOp::Replace { entries } => {
            let entries = distinct_entries(entries);
            let removed = {
                let incoming: HashSet<&ItemKey> = entries.iter().map(|(k, _)| k).collect();
                state.keys().iter().filter(|k| !incoming.contains(k)).count()
            };
            Merged {
                upserted: entries.len(),
                entries,
                removed,
            }
        }
        MergeOp::Partial {
            touched,
            fetched,
            deleted,
        } => merge_partial(state, touched, fetched, deleted),
    }
}

fn merge_partial(
    state: &QueryState,
    touched: &[ItemKey],
    fetched: &[(ItemKey, Item)],
    deleted: &[ItemKey],
) -> Merged {
    let touched_set: HashSet<&ItemKey> = touched.iter().collect();
    let deleted_set: HashSet<&ItemKey> = deleted.iter().collect();
    let fetched_by_key: HashMap<&ItemKey, &Item> = fetched
        .iter()
        .filter(|(k, _)| touched_set.contains(k))
        .map(|(k, v)| (k, v))
        .collect();

    let mut entries = Vec::with_capacity(state.len() + touched.len());
    let mut upserted = 0usize;
    let mut removed = 0usize;

    for (key, item) in state.iter() {
        if deleted_set.contains(key) {
            removed += 1;
            continue;
        }
        if touched_set.contains(key) {
            match fetched_by_key.get(key) {
                Some(fresh) => {
                    entries.push((key.clone(), (*fresh).clone()));
                    upserted += 1;
                }
                None => removed += 1,
            }
            continue;
        }
        entries.push((key.clone(), item.clone()));
    }

    let mut appended: HashSet<&ItemKey> = HashSet::new();
    for key in touched {
        if state.contains(key) || deleted_set.contains(key) || !appended.insert(key) {
            continue;
        }
        if let Some(fresh) = fetched_by_key.get(key) {
            entries.push((key.clone(), (*fresh).clone()));
            upserted += 1;
        }
    }

    Merged {
        entries,
        upserted,
        removed,
    }
}

// A repeated key keeps its first position and its last value.
fn distinct_entries(entries: &[(ItemKey, Item)]) -> Vec<(ItemKey, Item)> {
    let mut position: HashMap<&ItemKey, usize> = HashMap::with_capacity(entries.len());
    let mut out: Vec<(ItemKey, Item)> = Vec::with_capacity(entries.len());
    for (key, item) in entries {
        match position.get(key) {
            Some(&idx) => out[idx].1 = item.clone(),
            None => {
                position.insert(key, out.len());
                out.push((key.clone(), item.clone()));
            }
        }
    }
    out
}
