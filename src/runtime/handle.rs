use std::sync::Arc;

use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::JoinSet,
};
use tracing::{info, warn};

use crate::{
    engine::{
        coordinator::{RefetchCoordinator, RefetchOptions, ReconcileReport},
        loader::{IdentityExtractor, SubsetLoader},
    },
    mutation::{HandlerOutcome, MutationTransaction},
    types::QueryHash,
};

use super::events::ReconcileEvent;

/// Errors surfaced by [`ReconcilerHandle`].
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime task has stopped.
    #[error("reconciler runtime channel closed")]
    ChannelClosed,
}

/// Runtime tuning.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Bound of the command queue feeding the runtime task.
    pub command_queue_bound: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            command_queue_bound: 256,
        }
    }
}

/// Cloneable handle to a running reconciler.
pub struct ReconcilerHandle {
    cmd_tx: mpsc::Sender<Command>,
    events_tx: broadcast::Sender<ReconcileEvent>,
}

impl Clone for ReconcilerHandle {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            events_tx: self.events_tx.clone(),
        }
    }
}

enum Command {
    Committed {
        transaction: MutationTransaction,
        outcome: HandlerOutcome,
        resp: oneshot::Sender<Option<ReconcileReport>>,
    },
    Refetch {
        query: Option<QueryHash>,
        options: RefetchOptions,
        resp: oneshot::Sender<ReconcileReport>,
    },
    Shutdown {
        resp: oneshot::Sender<()>,
    },
}

/// Spawns the runtime task. Each committed transaction or refetch request
/// becomes its own job, so overlapping requests reconcile concurrently.
pub fn spawn_reconciler<L, I>(
    coordinator: Arc<RefetchCoordinator<L, I>>,
    config: RuntimeConfig,
) -> ReconcilerHandle
where
    L: SubsetLoader + 'static,
    I: IdentityExtractor + 'static,
{
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(config.command_queue_bound.max(1));
    let events_tx = coordinator.events_sender();

    tokio::spawn(async move {
        let mut jobs: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break; };
                    if let Some(resp) = dispatch(cmd, &coordinator, &mut jobs) {
                        drain(&mut jobs).await;
                        let _ = resp.send(());
                        break;
                    }
                }
                Some(joined) = jobs.join_next(), if !jobs.is_empty() => {
                    if let Err(err) = joined {
                        warn!(error = %err, "reconciliation job aborted");
                    }
                }
            }
        }
        info!("reconciler runtime stopped");
    });

    ReconcilerHandle { cmd_tx, events_tx }
}

// Returns the shutdown responder when the loop should stop.
fn dispatch<L, I>(
    cmd: Command,
    coordinator: &Arc<RefetchCoordinator<L, I>>,
    jobs: &mut JoinSet<()>,
) -> Option<oneshot::Sender<()>>
where
    L: SubsetLoader + 'static,
    I: IdentityExtractor + 'static,
{
    match cmd {
        Command::Committed {
            transaction,
            outcome,
            resp,
        } => {
            let coordinator = Arc::clone(coordinator);
            jobs.spawn(async move {
                let report = coordinator
                    .on_transaction_committed(&transaction, outcome)
                    .await;
                let _ = resp.send(report);
            });
        }
        Command::Refetch {
            query,
            options,
            resp,
        } => {
            let coordinator = Arc::clone(coordinator);
            jobs.spawn(async move {
                let report = coordinator.refetch(query, options).await;
                let _ = resp.send(report);
            });
        }
        Command::Shutdown { resp } => return Some(resp),
    }
    None
}

async fn drain(jobs: &mut JoinSet<()>) {
    while let Some(joined) = jobs.join_next().await {
        if let Err(err) = joined {
            warn!(error = %err, "reconciliation job aborted during shutdown");
        }
    }
}

impl ReconcilerHandle {
    /// Subscribes to reconciliation events.
    pub fn subscribe(&self) -> broadcast::Receiver<ReconcileEvent> {
        self.events_tx.subscribe()
    }

    /// Pushes a committed transaction and waits for its reconciliation.
    /// Returns `None` when the handler opted out.
    pub async fn transaction_committed(
        &self,
        transaction: MutationTransaction,
        outcome: HandlerOutcome,
    ) -> Result<Option<ReconcileReport>, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Committed {
                transaction,
                outcome,
                resp: tx,
            })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Refreshes one query, or all of them when `query` is `None`.
    pub async fn refetch(
        &self,
        query: Option<QueryHash>,
        options: RefetchOptions,
    ) -> Result<ReconcileReport, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Refetch {
                query,
                options,
                resp: tx,
            })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Waits for in-flight jobs and stops the runtime.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Shutdown { resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }
}
