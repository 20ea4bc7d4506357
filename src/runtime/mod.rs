//! Async runtime and event stream APIs.

/// Event stream types emitted by the coordinator.
pub mod events;
/// Handle and command loop implementation.
pub mod handle;
