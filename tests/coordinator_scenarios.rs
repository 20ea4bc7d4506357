use std::{
    collections::VecDeque,
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{json, Value};

use refetchd::{
    backend::memory::MemoryBackend,
    core::registry::{QueryRegistry, RegistryError},
    engine::{
        coordinator::{
            CoordinatorConfig, QueryOutcome, RefetchCoordinator, RefetchOptions, RefetchPlan,
            ReconcileError,
        },
        loader::{FieldIdentity, LoadError, SubsetLoader},
    },
    expr::{field, lit, Expr, FieldPath},
    mutation::{HandlerOutcome, MutationRecord, MutationTransaction},
    query::{LoadSubsetOptions, QueryDescriptor, SortSpec},
    runtime::events::ReconcileEvent,
    types::{Item, ItemKey, QueryHash, SyncMode},
};

type Coordinator<L = Arc<MemoryBackend>> = RefetchCoordinator<L, FieldIdentity>;

fn row(id: i64, v: u32) -> Value {
    json!({"id": id, "v": v, "createdAt": 100 - id})
}

fn window() -> QueryDescriptor {
    QueryDescriptor::new(LoadSubsetOptions {
        filter: None,
        order_by: Some(vec![SortSpec::desc("createdAt")]),
        limit: NonZeroUsize::new(10),
    })
    .expect("descriptor")
}

fn seeded_backend(ids: impl IntoIterator<Item = i64>) -> Arc<MemoryBackend> {
    let backend = Arc::new(MemoryBackend::new());
    backend
        .extend(ids.into_iter().map(|id| row(id, 1)))
        .expect("seed");
    backend
}

fn coordinator_with<L: SubsetLoader>(loader: L, config: CoordinatorConfig) -> Coordinator<L> {
    RefetchCoordinator::new(
        Arc::new(Mutex::new(QueryRegistry::new())),
        loader,
        FieldIdentity::new("id"),
        config,
    )
}

fn coordinator(backend: &Arc<MemoryBackend>) -> Coordinator {
    coordinator_with(Arc::clone(backend), CoordinatorConfig::default())
}

async fn primed(coordinator: &Coordinator, descriptor: QueryDescriptor, mode: SyncMode) -> QueryHash {
    let hash = coordinator.register(descriptor, Some(mode));
    let report = coordinator.refetch(Some(hash), RefetchOptions::default()).await;
    assert!(report.is_ok(), "priming failed: {report:?}");
    hash
}

fn ids(coordinator: &Coordinator<impl SubsetLoader>, hash: QueryHash) -> Vec<i64> {
    coordinator
        .state(hash)
        .expect("registered")
        .items()
        .iter()
        .filter_map(|item| item["id"].as_i64())
        .collect()
}

fn update(id: i64, from: u32, to: u32) -> MutationTransaction {
    MutationTransaction::new(vec![MutationRecord::update(id, row(id, from), row(id, to))])
        .expect("valid transaction")
}

fn membership(keys: &[i64]) -> LoadSubsetOptions {
    let keys: Vec<ItemKey> = keys.iter().copied().map(ItemKey::Int).collect();
    LoadSubsetOptions::targeted(Expr::membership(&FieldPath::parse("id"), &keys))
}

#[tokio::test]
async fn scenario_a_update_refreshes_one_item_in_a_window() {
    let backend = seeded_backend(1..=15);
    let coordinator = coordinator(&backend);
    let hash = primed(&coordinator, window(), SyncMode::OnDemand).await;
    let before = coordinator.state(hash).expect("state");
    assert_eq!(ids(&coordinator, hash), (1..=10).collect::<Vec<_>>());

    backend.upsert(row(5, 2)).expect("server write");
    let report = coordinator.reconcile_transaction(&update(5, 1, 2)).await;
    assert_eq!(
        report.outcome(hash),
        Some(&Ok(QueryOutcome::Committed { version: 2 }))
    );

    let after = coordinator.state(hash).expect("state");
    assert_eq!(after.keys(), before.keys());
    for (key, item) in before.iter() {
        let expected = if *key == ItemKey::Int(5) { row(5, 2) } else { item.clone() };
        assert_eq!(after.get(key), Some(&expected));
    }
    assert_eq!(backend.loads().last(), Some(&membership(&[5])));
}

#[tokio::test]
async fn scenario_b_rejected_insert_stays_out() {
    let backend = seeded_backend(1..=3);
    let coordinator = coordinator(&backend);
    let hash = primed(&coordinator, window(), SyncMode::OnDemand).await;

    let tx = MutationTransaction::new(vec![MutationRecord::insert(9, row(9, 1))])
        .expect("valid transaction");
    let report = coordinator.reconcile_transaction(&tx).await;

    assert_eq!(
        report.outcome(hash),
        Some(&Ok(QueryOutcome::Unchanged { version: 1 }))
    );
    assert_eq!(ids(&coordinator, hash), vec![1, 2, 3]);
}

#[tokio::test]
async fn scenario_b_accepted_insert_is_appended() {
    let backend = seeded_backend(1..=3);
    let coordinator = coordinator(&backend);
    let hash = primed(&coordinator, window(), SyncMode::OnDemand).await;

    backend.upsert(row(9, 1)).expect("server write");
    let tx = MutationTransaction::new(vec![MutationRecord::insert(9, row(9, 1))])
        .expect("valid transaction");
    assert!(coordinator.reconcile_transaction(&tx).await.is_ok());
    assert_eq!(ids(&coordinator, hash), vec![1, 2, 3, 9]);
}

#[tokio::test]
async fn scenario_c_delete_never_calls_the_loader() {
    let backend = seeded_backend(1..=5);
    let coordinator = coordinator(&backend);
    let hash = primed(&coordinator, window(), SyncMode::OnDemand).await;
    let loads_before = backend.load_count();

    let tx = MutationTransaction::new(vec![MutationRecord::delete(3, row(3, 1))])
        .expect("valid transaction");
    assert_eq!(
        coordinator.plan(&tx, hash),
        Ok(RefetchPlan::Targeted {
            options: None,
            touched: vec![],
            deleted: vec![ItemKey::Int(3)],
        })
    );
    let report = coordinator.reconcile_transaction(&tx).await;

    assert!(report.is_ok());
    assert_eq!(backend.load_count(), loads_before);
    assert_eq!(ids(&coordinator, hash), vec![1, 2, 4, 5]);
}

#[tokio::test]
async fn scenario_d_eager_query_reloads_with_its_own_options() {
    let backend = seeded_backend(1..=15);
    let coordinator = coordinator(&backend);
    let hash = primed(&coordinator, window(), SyncMode::Eager).await;

    backend.upsert(row(5, 2)).expect("server write");
    backend.remove(&ItemKey::Int(2));
    let report = coordinator.reconcile_transaction(&update(5, 1, 2)).await;

    assert!(report.is_ok());
    assert_eq!(backend.loads().last(), Some(window().options()));
    assert_eq!(ids(&coordinator, hash), vec![1, 3, 4, 5, 6, 7, 8, 9, 10, 11]);
    let state = coordinator.state(hash).expect("state");
    assert_eq!(state.get(&ItemKey::Int(5)), Some(&row(5, 2)));
}

#[tokio::test]
async fn scenario_e_concurrent_disjoint_transactions_both_apply() {
    let backend = seeded_backend(1..=6);
    let coordinator = coordinator(&backend);
    let hash = primed(&coordinator, window(), SyncMode::OnDemand).await;

    backend.upsert(row(2, 2)).expect("server write");
    backend.upsert(row(4, 2)).expect("server write");
    backend.set_latency(Some(Duration::from_millis(20)));

    let (tx_a, tx_b) = (update(2, 1, 2), update(4, 1, 2));
    let (first, second) = tokio::join!(
        coordinator.reconcile_transaction(&tx_a),
        coordinator.reconcile_transaction(&tx_b),
    );
    assert!(first.is_ok() && second.is_ok());

    let state = coordinator.state(hash).expect("state");
    assert_eq!(state.version(), 3);
    assert_eq!(ids(&coordinator, hash), vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(state.get(&ItemKey::Int(2)), Some(&row(2, 2)));
    assert_eq!(state.get(&ItemKey::Int(4)), Some(&row(4, 2)));
}

#[tokio::test]
async fn failing_query_does_not_block_its_siblings() {
    let backend = seeded_backend(1..=4);
    let coordinator = coordinator(&backend);
    let first = primed(&coordinator, window(), SyncMode::OnDemand).await;
    let open = QueryDescriptor::new(LoadSubsetOptions {
        filter: Some(Expr::gt(field("id"), lit(0))),
        ..LoadSubsetOptions::default()
    })
    .expect("descriptor");
    let second = primed(&coordinator, open, SyncMode::OnDemand).await;

    backend.upsert(row(2, 2)).expect("server write");
    backend.fail_next(LoadError::Network("connection reset".into()));
    let report = coordinator.reconcile_transaction(&update(2, 1, 2)).await;

    let failures: Vec<QueryHash> = report.failures().map(|(hash, _)| hash).collect();
    assert_eq!(failures, vec![first]);
    assert!(matches!(
        report.outcome(first),
        Some(Err(ReconcileError::RefetchFailed { cause: LoadError::Network(_), .. }))
    ));
    assert_eq!(coordinator.state(first).expect("state").version(), 1);
    assert_eq!(
        report.outcome(second),
        Some(&Ok(QueryOutcome::Committed { version: 2 }))
    );
}

#[tokio::test]
async fn slow_loads_time_out_and_leave_state_alone() {
    let backend = seeded_backend(1..=3);
    let config = CoordinatorConfig {
        load_timeout: Some(Duration::from_millis(20)),
        ..CoordinatorConfig::default()
    };
    let coordinator = coordinator_with(Arc::clone(&backend), config);
    let hash = coordinator.register(window(), Some(SyncMode::OnDemand));

    backend.set_latency(Some(Duration::from_millis(500)));
    let report = coordinator.refetch(Some(hash), RefetchOptions::default()).await;

    assert_eq!(
        report.outcome(hash),
        Some(&Err(ReconcileError::RefetchFailed {
            hash,
            cause: LoadError::Timeout(Duration::from_millis(20)),
        }))
    );
    assert_eq!(coordinator.state(hash).expect("state").version(), 0);
}

#[tokio::test]
async fn dropping_an_in_flight_reconciliation_commits_nothing() {
    let backend = seeded_backend(1..=3);
    let coordinator = coordinator(&backend);
    let hash = primed(&coordinator, window(), SyncMode::OnDemand).await;

    backend.upsert(row(1, 2)).expect("server write");
    backend.set_latency(Some(Duration::from_millis(100)));
    let tx = update(1, 1, 2);
    let cancelled = tokio::time::timeout(
        Duration::from_millis(10),
        coordinator.reconcile_transaction(&tx),
    )
    .await;
    assert!(cancelled.is_err());

    tokio::time::sleep(Duration::from_millis(150)).await;
    let state = coordinator.state(hash).expect("state");
    assert_eq!(state.version(), 1);
    assert_eq!(state.get(&ItemKey::Int(1)), Some(&row(1, 1)));
}

#[tokio::test]
async fn handler_opt_out_skips_reconciliation() {
    let backend = seeded_backend(1..=3);
    let coordinator = coordinator(&backend);
    primed(&coordinator, window(), SyncMode::OnDemand).await;
    let loads_before = backend.load_count();

    let skipped = coordinator
        .on_transaction_committed(&update(1, 1, 2), HandlerOutcome::skip())
        .await;
    assert!(skipped.is_none());
    assert_eq!(backend.load_count(), loads_before);

    let synced = coordinator
        .on_transaction_committed(&update(1, 1, 2), HandlerOutcome::sync())
        .await;
    assert!(synced.is_some());
}

#[tokio::test]
async fn forced_keys_refetch_is_targeted_even_for_eager_queries() {
    let backend = seeded_backend(1..=4);
    let coordinator = coordinator(&backend);
    let hash = primed(&coordinator, window(), SyncMode::Eager).await;

    backend.upsert(row(3, 7)).expect("server write");
    backend.remove(&ItemKey::Int(4));
    let report = coordinator
        .refetch(Some(hash), RefetchOptions::keys([3, 4, 3]))
        .await;

    assert!(report.is_ok());
    assert_eq!(backend.loads().last(), Some(&membership(&[3, 4])));
    assert_eq!(ids(&coordinator, hash), vec![1, 2, 3]);
    assert_eq!(
        coordinator.state(hash).expect("state").get(&ItemKey::Int(3)),
        Some(&row(3, 7))
    );
}

#[tokio::test]
async fn refetch_of_unknown_query_reports_not_found() {
    let backend = seeded_backend(1..=2);
    let coordinator = coordinator(&backend);
    let report = coordinator.refetch(Some(42), RefetchOptions::default()).await;
    assert_eq!(
        report.outcome(42),
        Some(&Err(ReconcileError::Registry(RegistryError::NotFound(42))))
    );
    assert_eq!(backend.load_count(), 0);
}

#[tokio::test]
async fn empty_transaction_falls_back_to_full_reload() {
    let backend = seeded_backend(1..=2);
    let coordinator = coordinator(&backend);
    let hash = primed(&coordinator, window(), SyncMode::OnDemand).await;
    assert_eq!(
        coordinator.plan(&MutationTransaction::empty(), hash),
        Ok(RefetchPlan::Full {
            options: window().options().clone()
        })
    );
}

#[tokio::test]
async fn events_follow_commits_and_failures() {
    let backend = seeded_backend(1..=3);
    let coordinator = coordinator(&backend);
    let mut events = coordinator.subscribe();
    let hash = primed(&coordinator, window(), SyncMode::OnDemand).await;

    backend.fail_next(LoadError::Backend("boom".into()));
    coordinator.refetch(Some(hash), RefetchOptions::default()).await;

    assert_eq!(
        events.recv().await.expect("event"),
        ReconcileEvent::Reconciled { hash, version: 1 }
    );
    assert_eq!(
        events.recv().await.expect("event"),
        ReconcileEvent::RefetchFailed {
            hash,
            cause: LoadError::Backend("boom".into()),
        }
    );
}

/// Loader that sneaks a competing commit into the registry while loading.
struct RacingLoader {
    registry: Arc<Mutex<QueryRegistry>>,
    hash: QueryHash,
    races: AtomicUsize,
    inner: MemoryBackend,
}

impl RacingLoader {
    fn race(&self) {
        let remaining = self.races.load(Ordering::SeqCst);
        if remaining == 0 {
            return;
        }
        self.races.store(remaining - 1, Ordering::SeqCst);

        let mut registry = self.registry.lock().expect("registry");
        let state = registry.get(self.hash).expect("registered").clone();
        let marker = format!("race-{remaining}");
        let mut entries: Vec<(ItemKey, Item)> =
            state.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        entries.push((ItemKey::Str(marker.clone()), json!({"id": marker})));
        registry
            .commit(self.hash, state.version(), entries)
            .expect("racing commit");
    }
}

#[async_trait]
impl SubsetLoader for RacingLoader {
    async fn load(&self, options: &LoadSubsetOptions) -> Result<Vec<Item>, LoadError> {
        self.race();
        self.inner.load(options).await
    }
}

fn racing_coordinator(races: usize, config: CoordinatorConfig) -> (Coordinator<RacingLoader>, QueryHash) {
    let registry = Arc::new(Mutex::new(QueryRegistry::new()));
    let descriptor = window();
    let hash = descriptor.hash();
    let inner = MemoryBackend::new();
    inner.extend((1..=3).map(|id| row(id, 1))).expect("seed");
    let loader = RacingLoader {
        registry: Arc::clone(&registry),
        hash,
        races: AtomicUsize::new(races),
        inner,
    };
    let coordinator = RefetchCoordinator::new(registry, loader, FieldIdentity::new("id"), config);
    coordinator.register(descriptor, Some(SyncMode::OnDemand));
    (coordinator, hash)
}

#[tokio::test]
async fn full_reload_gives_up_after_repeated_stale_writes() {
    let config = CoordinatorConfig {
        max_commit_retries: 1,
        ..CoordinatorConfig::default()
    };
    let (coordinator, hash) = racing_coordinator(usize::MAX, config);

    let report = coordinator.refetch(Some(hash), RefetchOptions::default()).await;
    assert_eq!(
        report.outcome(hash),
        Some(&Err(ReconcileError::ReconciliationConflict { hash, attempts: 2 }))
    );
    assert_eq!(coordinator.loader().inner.load_count(), 2);
}

#[tokio::test]
async fn full_reload_retries_past_a_single_race() {
    let (coordinator, hash) = racing_coordinator(1, CoordinatorConfig::default());

    let report = coordinator.refetch(Some(hash), RefetchOptions::default()).await;
    assert_eq!(
        report.outcome(hash),
        Some(&Ok(QueryOutcome::Committed { version: 2 }))
    );
    assert_eq!(coordinator.loader().inner.load_count(), 2);
    assert_eq!(ids(&coordinator, hash), vec![1, 2, 3]);
}

#[tokio::test]
async fn targeted_merge_re_merges_without_reloading() {
    let (coordinator, hash) = racing_coordinator(1, CoordinatorConfig::default());
    coordinator.loader().inner.upsert(row(2, 5)).expect("server write");

    let report = coordinator.reconcile_transaction(&update(2, 1, 5)).await;
    assert_eq!(
        report.outcome(hash),
        Some(&Ok(QueryOutcome::Committed { version: 2 }))
    );
    assert_eq!(coordinator.loader().inner.load_count(), 1);

    let state = coordinator.state(hash).expect("state");
    assert_eq!(
        state.keys(),
        &[ItemKey::Str("race-1".into()), ItemKey::Int(2)]
    );
}

/// Loader that reads the collection first and only then waits, so a slow
/// load returns a snapshot older than loads issued after it.
struct SnapshotLoader {
    inner: MemoryBackend,
    delays: Mutex<VecDeque<Duration>>,
}

impl SnapshotLoader {
    fn new(ids: impl IntoIterator<Item = i64>) -> Self {
        let inner = MemoryBackend::new();
        inner.extend(ids.into_iter().map(|id| row(id, 1))).expect("seed");
        Self {
            inner,
            delays: Mutex::new(VecDeque::new()),
        }
    }

    fn delay_next(&self, delay: Duration) {
        self.delays.lock().expect("delays").push_back(delay);
    }
}

#[async_trait]
impl SubsetLoader for SnapshotLoader {
    async fn load(&self, options: &LoadSubsetOptions) -> Result<Vec<Item>, LoadError> {
        let snapshot = self.inner.load(options).await?;
        let delay = self.delays.lock().expect("delays").pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(snapshot)
    }
}

#[tokio::test]
async fn overlapping_updates_of_one_key_keep_the_newest_server_state() {
    let coordinator = coordinator_with(SnapshotLoader::new(1..=3), CoordinatorConfig::default());
    let hash = coordinator.register(window(), Some(SyncMode::OnDemand));
    assert!(coordinator.refetch(Some(hash), RefetchOptions::default()).await.is_ok());
    let server = &coordinator.loader().inner;

    server.upsert(row(2, 2)).expect("server write");
    coordinator.loader().delay_next(Duration::from_millis(100));
    coordinator.loader().delay_next(Duration::ZERO);
    let (first, second) = (update(2, 1, 2), update(2, 2, 3));

    let slow = coordinator.reconcile_transaction(&first);
    let fast = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.upsert(row(2, 3)).expect("server write");
        coordinator.reconcile_transaction(&second).await
    };
    let (slow, fast) = tokio::join!(slow, fast);

    assert_eq!(
        fast.outcome(hash),
        Some(&Ok(QueryOutcome::Committed { version: 2 }))
    );
    assert!(slow.is_ok(), "slow reconcile failed: {slow:?}");
    let state = coordinator.state(hash).expect("state");
    assert_eq!(state.get(&ItemKey::Int(2)), Some(&row(2, 3)));
    assert_eq!(ids(&coordinator, hash), vec![1, 2, 3]);
    // Priming, both targeted loads and the slow one's re-read.
    assert_eq!(server.load_count(), 4);
}

#[tokio::test]
async fn overlapping_delete_is_not_undone_by_a_slow_update() {
    let coordinator = coordinator_with(SnapshotLoader::new(1..=3), CoordinatorConfig::default());
    let hash = coordinator.register(window(), Some(SyncMode::OnDemand));
    assert!(coordinator.refetch(Some(hash), RefetchOptions::default()).await.is_ok());
    let server = &coordinator.loader().inner;

    server.upsert(row(2, 2)).expect("server write");
    coordinator.loader().delay_next(Duration::from_millis(100));
    let edit = update(2, 1, 2);
    let removal = MutationTransaction::new(vec![MutationRecord::delete(2, row(2, 2))])
        .expect("valid transaction");

    let slow = coordinator.reconcile_transaction(&edit);
    let fast = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.remove(&ItemKey::Int(2));
        coordinator.reconcile_transaction(&removal).await
    };
    let (slow, fast) = tokio::join!(slow, fast);

    assert!(slow.is_ok() && fast.is_ok());
    assert_eq!(ids(&coordinator, hash), vec![1, 3]);
}

#[tokio::test]
async fn integral_float_ids_reconcile_by_identity() {
    let backend = Arc::new(MemoryBackend::new());
    backend
        .extend([json!({"id": 1.0, "v": 1}), json!({"id": 2, "v": 1})])
        .expect("seed");
    let coordinator = coordinator(&backend);
    let hash = primed(&coordinator, window(), SyncMode::OnDemand).await;

    backend.upsert(json!({"id": 1.0, "v": 2})).expect("server write");
    let tx = MutationTransaction::new(vec![MutationRecord::update(
        1,
        json!({"id": 1.0, "v": 1}),
        json!({"id": 1.0, "v": 2}),
    )])
    .expect("valid transaction");
    let report = coordinator.reconcile_transaction(&tx).await;

    assert!(report.is_ok(), "reconcile failed: {report:?}");
    let state = coordinator.state(hash).expect("state");
    assert_eq!(state.keys(), &[ItemKey::Int(1), ItemKey::Int(2)]);
    assert_eq!(state.get(&ItemKey::Int(1)), Some(&json!({"id": 1.0, "v": 2})));
}

/// Loader whose every result lists one item twice.
struct RepeatingLoader;

#[async_trait]
impl SubsetLoader for RepeatingLoader {
    async fn load(&self, _options: &LoadSubsetOptions) -> Result<Vec<Item>, LoadError> {
        Ok(vec![row(1, 0), row(2, 1), row(1, 1)])
    }
}

#[tokio::test]
async fn identical_full_reload_with_repeated_keys_is_unchanged() {
    let coordinator = coordinator_with(RepeatingLoader, CoordinatorConfig::default());
    let hash = coordinator.register(window(), Some(SyncMode::Eager));

    let first = coordinator.refetch(Some(hash), RefetchOptions::default()).await;
    assert_eq!(
        first.outcome(hash),
        Some(&Ok(QueryOutcome::Committed { version: 1 }))
    );
    let second = coordinator.refetch(Some(hash), RefetchOptions::default()).await;
    assert_eq!(
        second.outcome(hash),
        Some(&Ok(QueryOutcome::Unchanged { version: 1 }))
    );
    assert_eq!(ids(&coordinator, hash), vec![1, 2]);
}

