//! Refetch policy, subset loading and merging.

/// Per-query refetch planning and reconciliation.
pub mod coordinator;
/// Subset loader collaborator and identity extraction.
pub mod loader;
/// Folding loaded subsets into query state.
pub mod merge;
