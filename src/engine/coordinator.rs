use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures::future::join_all;
use hashbrown::HashSet;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::{
    core::{
        registry::{QueryRegistry, RegistryError},
        state::QueryState,
    },
    expr::{Expr, FieldPath},
    mutation::{HandlerOutcome, MutationTransaction},
    query::{LoadSubsetOptions, QueryDescriptor},
    runtime::events::ReconcileEvent,
    types::{Item, ItemKey, QueryHash, SyncMode, Version},
};

use super::{
    loader::{load_keyed, FieldIdentity, IdentityExtractor, LoadError, SubsetLoader},
    merge::{merge, MergeOp},
};

/// Tuning knobs for [`RefetchCoordinator`].
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Mode given to queries registered without one.
    pub default_mode: SyncMode,
    /// Extra commit attempts after a stale write before giving up.
    pub max_commit_retries: usize,
    /// Per-load deadline; `None` waits forever.
    pub load_timeout: Option<Duration>,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_mode: SyncMode::Eager,
            max_commit_retries: 3,
            load_timeout: Some(Duration::from_secs(30)),
            event_capacity: 1024,
        }
    }
}

/// What to load for one query and how to fold it in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefetchPlan {
    /// Reload with the query's own options and replace its state.
    Full {
        /// The query's original options.
        options: LoadSubsetOptions,
    },
    /// Reload only `touched` and fold the result in partially.
    Targeted {
        /// Membership load over `touched`; `None` when nothing needs fetching.
        options: Option<LoadSubsetOptions>,
        /// Inserted or updated keys.
        touched: Vec<ItemKey>,
        /// Keys removed without a fetch.
        deleted: Vec<ItemKey>,
    },
}

/// Decides how `descriptor` is refreshed after `transaction`.
///
/// Eager queries and empty transactions get a full reload. On-demand queries
/// fetch their inserted and updated keys by identity with no ordering or
/// limit; deleted keys are trusted and never fetched.
pub fn plan_refetch(
    descriptor: &QueryDescriptor,
    mode: SyncMode,
    transaction: &MutationTransaction,
    id_path: &FieldPath,
) -> RefetchPlan {
    if mode == SyncMode::Eager || transaction.is_empty() {
        return RefetchPlan::Full {
            options: descriptor.options().clone(),
        };
    }
    targeted_plan(transaction.touched_keys(), transaction.deleted_keys(), id_path)
}

fn targeted_plan(touched: Vec<ItemKey>, deleted: Vec<ItemKey>, id_path: &FieldPath) -> RefetchPlan {
    let options = (!touched.is_empty())
        .then(|| LoadSubsetOptions::targeted(Expr::membership(id_path, &touched)));
    RefetchPlan::Targeted {
        options,
        touched,
        deleted,
    }
}

/// Options for an explicit [`RefetchCoordinator::refetch`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefetchOptions {
    /// Forces a targeted reload of these keys regardless of mode.
    pub keys: Option<Vec<ItemKey>>,
}

impl RefetchOptions {
    /// Targeted reload of `keys`.
    pub fn keys<K: Into<ItemKey>>(keys: impl IntoIterator<Item = K>) -> Self {
        Self {
            keys: Some(keys.into_iter().map(Into::into).collect()),
        }
    }
}

/// Per-query reconciliation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    /// The loader failed; the state was left at its last version.
    #[error("refetch failed for query {hash:#018x}: {cause}")]
    RefetchFailed {
        /// Query hash.
        hash: QueryHash,
        /// Loader failure.
        #[source]
        cause: LoadError,
    },
    /// Every commit attempt hit a stale write.
    #[error("query {hash:#018x} still conflicted after {attempts} commit attempts")]
    ReconciliationConflict {
        /// Query hash.
        hash: QueryHash,
        /// Attempts made.
        attempts: usize,
    },
    /// Registry lookup or commit failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Successful reconciliation of one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    /// New state committed at `version`.
    Committed {
        /// Version after the commit.
        version: Version,
    },
    /// Nothing changed; no commit was made.
    Unchanged {
        /// Current version.
        version: Version,
    },
}

impl QueryOutcome {
    /// Version the query is at after reconciliation.
    pub fn version(self) -> Version {
        match self {
            Self::Committed { version } | Self::Unchanged { version } => version,
        }
    }
}

/// Outcome for one query in a [`ReconcileReport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResult {
    /// Query hash.
    pub hash: QueryHash,
    /// Its outcome.
    pub outcome: Result<QueryOutcome, ReconcileError>,
}

/// Per-query outcomes of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Outcomes in registration order.
    pub results: Vec<QueryResult>,
}

impl ReconcileReport {
    /// True when every query reconciled.
    pub fn is_ok(&self) -> bool {
        self.results.iter().all(|r| r.outcome.is_ok())
    }

    /// Outcome for `hash`, if it took part.
    pub fn outcome(&self, hash: QueryHash) -> Option<&Result<QueryOutcome, ReconcileError>> {
        self.results.iter().find(|r| r.hash == hash).map(|r| &r.outcome)
    }

    /// Failed queries.
    pub fn failures(&self) -> impl Iterator<Item = (QueryHash, &ReconcileError)> + '_ {
        self.results
            .iter()
            .filter_map(|r| r.outcome.as_ref().err().map(|e| (r.hash, e)))
    }
}

/// Policy engine that refreshes every active query after a mutation.
pub struct RefetchCoordinator<L, I = FieldIdentity> {
    registry: Arc<Mutex<QueryRegistry>>,
    loader: L,
    identity: I,
    config: CoordinatorConfig,
    events_tx: broadcast::Sender<ReconcileEvent>,
}

impl<L, I> RefetchCoordinator<L, I>
where
    L: SubsetLoader,
    I: IdentityExtractor,
{
    /// Builds a coordinator over a shared registry.
    pub fn new(
        registry: Arc<Mutex<QueryRegistry>>,
        loader: L,
        identity: I,
        config: CoordinatorConfig,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            registry,
            loader,
            identity,
            config,
            events_tx,
        }
    }

    /// Shared registry.
    pub fn registry(&self) -> &Arc<Mutex<QueryRegistry>> {
        &self.registry
    }

    /// Active configuration.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Underlying loader.
    pub fn loader(&self) -> &L {
        &self.loader
    }

    /// Subscribes to reconciliation events.
    pub fn subscribe(&self) -> broadcast::Receiver<ReconcileEvent> {
        self.events_tx.subscribe()
    }

    pub(crate) fn events_sender(&self) -> broadcast::Sender<ReconcileEvent> {
        self.events_tx.clone()
    }

    /// Registers `descriptor`; `mode` defaults to the configured one.
    pub fn register(&self, descriptor: QueryDescriptor, mode: Option<SyncMode>) -> QueryHash {
        let hash = descriptor.hash();
        self.lock_registry()
            .register(descriptor, mode.unwrap_or(self.config.default_mode));
        hash
    }

    /// Drops a query.
    pub fn unregister(&self, hash: QueryHash) -> Result<QueryDescriptor, RegistryError> {
        self.lock_registry().unregister(hash)
    }

    /// Snapshot of a query's state.
    pub fn state(&self, hash: QueryHash) -> Result<QueryState, RegistryError> {
        self.lock_registry().get(hash).cloned()
    }

    /// Plan the coordinator would run for `hash` after `transaction`.
    pub fn plan(
        &self,
        transaction: &MutationTransaction,
        hash: QueryHash,
    ) -> Result<RefetchPlan, RegistryError> {
        let registry = self.lock_registry();
        let descriptor = registry.descriptor(hash)?;
        let mode = registry.mode(hash)?;
        Ok(plan_refetch(descriptor, mode, transaction, self.identity.id_path()))
    }

    /// Entry point for the mutation layer: reconciles unless the handler
    /// opted out.
    pub async fn on_transaction_committed(
        &self,
        transaction: &MutationTransaction,
        outcome: HandlerOutcome,
    ) -> Option<ReconcileReport> {
        if !outcome.should_sync {
            debug!(records = transaction.len(), "handler opted out of reconciliation");
            return None;
        }
        Some(self.reconcile_transaction(transaction).await)
    }

    /// Reconciles every active query against `transaction`. Queries load
    /// concurrently and fail independently.
    pub async fn reconcile_transaction(&self, transaction: &MutationTransaction) -> ReconcileReport {
        let plans: Vec<_> = {
            let registry = self.lock_registry();
            registry
                .all_active()
                .map(|q| {
                    let plan =
                        plan_refetch(q.descriptor, q.mode, transaction, self.identity.id_path());
                    (q.hash, Ok(plan))
                })
                .collect()
        };
        debug!(
            queries = plans.len(),
            records = transaction.len(),
            "reconciling transaction"
        );
        self.run_plans(plans).await
    }

    /// Refreshes `query` (or every query). Without keys this is a full
    /// reload; with keys it is a targeted reload of exactly those keys.
    pub async fn refetch(&self, query: Option<QueryHash>, options: RefetchOptions) -> ReconcileReport {
        let keys = options.keys.map(dedup_keys);
        let plans: Vec<_> = {
            let registry = self.lock_registry();
            let hashes: Vec<QueryHash> = match query {
                Some(hash) => vec![hash],
                None => registry.all_active().map(|q| q.hash).collect(),
            };
            hashes
                .into_iter()
                .map(|hash| {
                    let plan = match &keys {
                        Some(keys) => registry.descriptor(hash).map(|_| {
                            targeted_plan(keys.clone(), Vec::new(), self.identity.id_path())
                        }),
                        None => registry.descriptor(hash).map(|d| RefetchPlan::Full {
                            options: d.options().clone(),
                        }),
                    };
                    (hash, plan)
                })
                .collect()
        };
        self.run_plans(plans).await
    }

    /// Runs one plan to completion, retrying stale commits.
    pub async fn execute(&self, hash: QueryHash, plan: RefetchPlan) -> Result<QueryOutcome, ReconcileError> {
        let attempts = self.config.max_commit_retries + 1;
        match plan {
            RefetchPlan::Full { options } => {
                for attempt in 1..=attempts {
                    let observed = self.observed_version(hash)?;
                    let entries = self.load(hash, &options).await?;
                    match self.fold(hash, observed, &MergeOp::Replace { entries }) {
                        Err(ReconcileError::Registry(RegistryError::StaleWrite { .. })) => {
                            debug!(hash, attempt, "full reload raced a commit, reloading");
                        }
                        other => return other,
                    }
                }
            }
            RefetchPlan::Targeted {
                options,
                touched,
                deleted,
            } => {
                let keys: Vec<ItemKey> = touched.iter().chain(&deleted).cloned().collect();
                let mut observed = self.observed_version(hash)?;
                let fetched = match &options {
                    Some(options) => self.load(hash, options).await?,
                    None => Vec::new(),
                };
                let mut op = MergeOp::Partial {
                    touched,
                    fetched,
                    deleted,
                };
                for attempt in 1..=attempts {
                    let current = match self.fold(hash, observed, &op) {
                        Err(ReconcileError::Registry(RegistryError::StaleWrite { current, .. })) => current,
                        other => return other,
                    };
                    let overlapped = self.lock_registry().get(hash)?.changed_since(observed, &keys);
                    observed = current;
                    if !overlapped {
                        debug!(hash, attempt, current, "partial merge raced a disjoint commit, re-merging");
                        continue;
                    }
                    if attempt == attempts {
                        break;
                    }
                    // The fetched subset may predate the interleaved commit;
                    // read every mutated key again, deletes included.
                    debug!(hash, attempt, current, "partial merge raced a commit on its keys, reloading");
                    let options =
                        LoadSubsetOptions::targeted(Expr::membership(self.identity.id_path(), &keys));
                    op = MergeOp::Partial {
                        touched: keys.clone(),
                        fetched: self.load(hash, &options).await?,
                        deleted: Vec::new(),
                    };
                }
            }
        }
        warn!(hash, attempts, "giving up on conflicted reconciliation");
        Err(ReconcileError::ReconciliationConflict { hash, attempts })
    }

    async fn run_plans(
        &self,
        plans: Vec<(QueryHash, Result<RefetchPlan, RegistryError>)>,
    ) -> ReconcileReport {
        let results = join_all(plans.into_iter().map(|(hash, plan)| async move {
            let outcome = match plan {
                Ok(plan) => self.execute(hash, plan).await,
                Err(err) => Err(err.into()),
            };
            QueryResult { hash, outcome }
        }))
        .await;
        ReconcileReport { results }
    }

    async fn load(
        &self,
        hash: QueryHash,
        options: &LoadSubsetOptions,
    ) -> Result<Vec<(ItemKey, Item)>, ReconcileError> {
        trace!(hash, windowed = options.has_window(), "loading subset");
        load_keyed(&self.loader, &self.identity, options, self.config.load_timeout)
            .await
            .map_err(|cause| {
                warn!(hash, error = %cause, "refetch failed");
                let _ = self.events_tx.send(ReconcileEvent::RefetchFailed {
                    hash,
                    cause: cause.clone(),
                });
                ReconcileError::RefetchFailed { hash, cause }
            })
    }

    // Merge and commit in one critical section.
    fn fold(&self, hash: QueryHash, observed: Version, op: &MergeOp) -> Result<QueryOutcome, ReconcileError> {
        let version = {
            let mut registry = self.lock_registry();
            let state = registry.get(hash)?;
            let merged = merge(state, op);
            if state.same_entries(&merged.entries) {
                trace!(hash, "merge produced no change");
                return Ok(QueryOutcome::Unchanged {
                    version: state.version(),
                });
            }
            let (upserted, removed) = (merged.upserted, merged.removed);
            let version = registry.commit(hash, observed, merged.entries)?;
            debug!(hash, version, upserted, removed, "query reconciled");
            version
        };
        let _ = self.events_tx.send(ReconcileEvent::Reconciled { hash, version });
        Ok(QueryOutcome::Committed { version })
    }

    fn observed_version(&self, hash: QueryHash) -> Result<Version, RegistryError> {
        let registry = self.lock_registry();
        Ok(registry.get(hash)?.version())
    }

    fn lock_registry(&self) -> MutexGuard<'_, QueryRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn dedup_keys(keys: Vec<ItemKey>) -> Vec<ItemKey> {
    let mut seen = HashSet::new();
    keys.into_iter().filter(|k| seen.insert(k.clone())).collect()
}
