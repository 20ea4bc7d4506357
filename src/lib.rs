//! Query-scoped refetch and reconciliation for locally materialized
//! collection views.
//!
//! Each active query keeps its own materialized result set. After a mutation
//! commits, the [`engine::coordinator::RefetchCoordinator`] either reloads a
//! query in full (eager mode) or fetches only the mutated keys and folds them
//! into the cached state (on-demand mode), leaving every other cached item
//! untouched.
//!
//! # Examples
//!
//! Targeted reconciliation against an in-memory backend:
//! ```
//! use std::sync::{Arc, Mutex};
//!
//! use refetchd::{
//!     backend::memory::MemoryBackend,
//!     core::registry::QueryRegistry,
//!     engine::{
//!         coordinator::{CoordinatorConfig, RefetchCoordinator, RefetchOptions},
//!         loader::FieldIdentity,
//!     },
//!     mutation::{MutationRecord, MutationTransaction},
//!     query::{LoadSubsetOptions, QueryDescriptor},
//!     types::SyncMode,
//! };
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let backend = Arc::new(MemoryBackend::new());
//! backend.extend([json!({"id": 1, "v": 1}), json!({"id": 2, "v": 1})]).expect("seed");
//!
//! let registry = Arc::new(Mutex::new(QueryRegistry::new()));
//! let coordinator = RefetchCoordinator::new(
//!     registry,
//!     Arc::clone(&backend),
//!     FieldIdentity::new("id"),
//!     CoordinatorConfig::default(),
//! );
//! let query = QueryDescriptor::new(LoadSubsetOptions::default()).expect("descriptor");
//! let hash = coordinator.register(query, Some(SyncMode::OnDemand));
//! assert!(coordinator.refetch(Some(hash), RefetchOptions::default()).await.is_ok());
//!
//! backend.upsert(json!({"id": 2, "v": 2})).expect("server write");
//! let tx = MutationTransaction::new(vec![MutationRecord::update(
//!     2,
//!     json!({"id": 2, "v": 1}),
//!     json!({"id": 2, "v": 2}),
//! )])
//! .expect("valid transaction");
//! let report = coordinator.reconcile_transaction(&tx).await;
//! assert!(report.is_ok());
//!
//! let state = coordinator.state(hash).expect("registered");
//! assert_eq!(state.items(), vec![json!({"id": 1, "v": 1}), json!({"id": 2, "v": 2})]);
//! # }
//! ```
#![deny(missing_docs)]

/// Concrete subset-loader backends.
pub mod backend;
/// Query registry and materialized state.
pub mod core;
/// Refetch coordinator, loader contract and merger.
pub mod engine;
/// Predicate expression trees.
pub mod expr;
/// Mutation transaction model.
pub mod mutation;
/// Query descriptors and load options.
pub mod query;
/// Async runtime handle and events.
pub mod runtime;
/// Shared primitive types and enums.
pub mod types;
