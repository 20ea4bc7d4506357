//! In-memory query registry and materialized state.

/// Registry of active queries.
pub mod registry;
/// Per-query materialized state.
pub mod state;
